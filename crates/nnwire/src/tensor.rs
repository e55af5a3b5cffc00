//! Host-side tensors used for graph inputs and outputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::spec::{OperandDescriptor, OperandType};

/// Dense host tensor: a descriptor plus little-endian element bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub desc: OperandDescriptor,
    pub data: Vec<u8>,
}

impl Tensor {
    pub fn new(desc: OperandDescriptor, data: Vec<u8>) -> Self {
        Self { desc, data }
    }

    pub fn from_f32(dimensions: impl Into<Vec<i32>>, values: &[f32]) -> Self {
        Self {
            desc: OperandDescriptor::float32(dimensions),
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    pub fn from_i32(dimensions: impl Into<Vec<i32>>, values: &[i32]) -> Self {
        Self {
            desc: OperandDescriptor::new(OperandType::Int32, dimensions),
            data: bytemuck::cast_slice(values).to_vec(),
        }
    }

    /// Returns `true` when `data` holds exactly as many bytes as the descriptor implies.
    pub fn is_consistent(&self) -> bool {
        self.desc.byte_len() == Some(self.data.len())
    }

    /// Copies the elements out as `f32`, or `None` for other element types.
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        if self.desc.ty != OperandType::Float32 || self.data.len() % 4 != 0 {
            return None;
        }
        Some(bytemuck::pod_collect_to_vec(&self.data))
    }

    pub fn to_i32(&self) -> Option<Vec<i32>> {
        if self.desc.ty != OperandType::Int32 || self.data.len() % 4 != 0 {
            return None;
        }
        Some(bytemuck::pod_collect_to_vec(&self.data))
    }
}

/// Named input tensors for one graph computation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedInputs {
    records: BTreeMap<String, Tensor>,
}

impl NamedInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets (or replaces) the tensor bound to `name`.
    pub fn set(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.records.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.records.get(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.records.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }
}

/// Named result tensors produced by one graph computation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedOutputs {
    records: BTreeMap<String, Tensor>,
}

impl NamedOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.records.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.records.get(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.records.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_tensor_reads_back_elements() {
        let tensor = Tensor::from_f32(vec![2, 2], &[1.0, -2.0, 3.5, 0.0]);
        assert!(tensor.is_consistent());
        assert_eq!(tensor.to_f32(), Some(vec![1.0, -2.0, 3.5, 0.0]));
        assert_eq!(tensor.to_i32(), None);
    }

    #[test]
    fn inconsistent_byte_length_is_detected() {
        let tensor = Tensor::new(OperandDescriptor::float32(vec![3]), vec![0u8; 8]);
        assert!(!tensor.is_consistent());
    }
}
