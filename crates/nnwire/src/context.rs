//! Backend selection plus the error-scope stack that collects validation and
//! build failures.
//!
//! Errors are offered to scopes from the innermost outwards. A scope whose
//! filter matches the error's type captures it (only the first error per scope
//! is kept) and stops propagation. `Unknown` and `ContextLost` errors are
//! captured by every scope on the way and always reach the root, where the
//! uncaptured-error callback (or the log) receives them.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::registry;
use crate::backend::spec::Backend;
use crate::graph::GraphBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorFilter {
    Validation,
    OutOfMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    NoError,
    Validation,
    OutOfMemory,
    Unknown,
    ContextLost,
}

/// An error delivered to a scope or to the uncaptured-error callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{ty:?}: {message}")]
pub struct ErrorReport {
    pub ty: ErrorType,
    pub message: String,
}

impl ErrorReport {
    pub fn new(ty: ErrorType, message: impl Into<String>) -> Self {
        Self {
            ty,
            message: message.into(),
        }
    }

    pub fn no_error() -> Self {
        Self::new(ErrorType::NoError, "")
    }

    pub fn is_error(&self) -> bool {
        self.ty != ErrorType::NoError
    }
}

pub type UncapturedErrorCallback = Box<dyn FnMut(&ErrorReport) + Send>;

struct ErrorScope {
    filter: ErrorFilter,
    captured: Option<ErrorReport>,
}

#[derive(Default)]
struct ErrorScopeStack {
    scopes: Vec<ErrorScope>,
    uncaptured: Option<UncapturedErrorCallback>,
}

impl ErrorScopeStack {
    /// Offers `report` to the scopes and returns it if it reaches the root.
    fn offer(&mut self, report: ErrorReport) -> Option<ErrorReport> {
        let consumable = match report.ty {
            ErrorType::NoError => return None,
            ErrorType::Validation => Some(ErrorFilter::Validation),
            ErrorType::OutOfMemory => Some(ErrorFilter::OutOfMemory),
            ErrorType::Unknown | ErrorType::ContextLost => None,
        };
        for scope in self.scopes.iter_mut().rev() {
            match consumable {
                Some(filter) if filter != scope.filter => continue,
                _ => {}
            }
            if scope.captured.is_none() {
                scope.captured = Some(report.clone());
            }
            if consumable.is_some() {
                return None;
            }
        }
        Some(report)
    }
}

struct ContextInner {
    backend: Option<Arc<dyn Backend>>,
    backend_name: String,
    scopes: Mutex<ErrorScopeStack>,
}

/// Shared handle to a backend plus its error-scope stack.
///
/// Cloning is cheap; clones refer to the same scopes.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("backend", &self.inner.backend_name)
            .field("available", &self.inner.backend.is_some())
            .finish()
    }
}

impl Context {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let backend_name = backend.backend_name().to_string();
        Self::from_parts(Some(backend), backend_name)
    }

    /// Creates a context for a backend registered under `name`.
    pub fn from_registry(name: &str) -> Option<Self> {
        registry::create_backend(name).map(Self::new)
    }

    /// A context whose backend could not be created. Graph builders created from it
    /// are error objects.
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self::from_parts(None, name.into())
    }

    fn from_parts(backend: Option<Arc<dyn Backend>>, backend_name: String) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                backend,
                backend_name,
                scopes: Mutex::new(ErrorScopeStack::default()),
            }),
        }
    }

    pub fn backend_name(&self) -> &str {
        &self.inner.backend_name
    }

    pub fn backend(&self) -> Option<&Arc<dyn Backend>> {
        self.inner.backend.as_ref()
    }

    pub fn is_available(&self) -> bool {
        self.inner.backend.is_some()
    }

    pub fn create_graph_builder(&self) -> GraphBuilder {
        if self.is_available() {
            GraphBuilder::new(self.clone())
        } else {
            let message = format!("backend `{}` is not available", self.backend_name());
            self.report_error(ErrorType::ContextLost, message.clone());
            GraphBuilder::new_error(self.clone(), message)
        }
    }

    pub fn push_error_scope(&self, filter: ErrorFilter) {
        self.lock().scopes.push(ErrorScope {
            filter,
            captured: None,
        });
    }

    /// Pops the innermost scope and returns what it captured, or a `NoError`
    /// report if it captured nothing. Returns `None` when no scope is pushed.
    pub fn pop_error_scope(&self) -> Option<ErrorReport> {
        let scope = self.lock().scopes.pop()?;
        Some(scope.captured.unwrap_or_else(ErrorReport::no_error))
    }

    pub fn error_scope_depth(&self) -> usize {
        self.lock().scopes.len()
    }

    pub fn set_uncaptured_error_callback<F>(&self, callback: F)
    where
        F: FnMut(&ErrorReport) + Send + 'static,
    {
        self.lock().uncaptured = Some(Box::new(callback));
    }

    /// Routes an error through the scope stack.
    pub fn report_error(&self, ty: ErrorType, message: impl Into<String>) {
        let report = ErrorReport::new(ty, message);
        let (uncaptured, mut callback) = {
            let mut stack = self.lock();
            let uncaptured = stack.offer(report);
            let callback = match uncaptured {
                Some(_) => stack.uncaptured.take(),
                None => None,
            };
            (uncaptured, callback)
        };
        let Some(report) = uncaptured else {
            return;
        };
        match callback.as_mut() {
            // The lock is released while the callback runs so it may report again.
            Some(callback) => callback(&report),
            None => tracing::warn!(
                backend = %self.inner.backend_name,
                error_type = ?report.ty,
                "uncaptured error: {}",
                report.message
            ),
        }
        if let Some(callback) = callback {
            let mut stack = self.lock();
            if stack.uncaptured.is_none() {
                stack.uncaptured = Some(callback);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ErrorScopeStack> {
        self.inner.scopes.lock().expect("error scope stack poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn context() -> Context {
        Context::unavailable("test")
    }

    #[test]
    fn innermost_matching_scope_captures_first_error() {
        let ctx = context();
        ctx.push_error_scope(ErrorFilter::Validation);
        ctx.push_error_scope(ErrorFilter::OutOfMemory);
        ctx.push_error_scope(ErrorFilter::Validation);
        ctx.report_error(ErrorType::Validation, "first");
        ctx.report_error(ErrorType::Validation, "second");

        assert_eq!(ctx.pop_error_scope(), Some(ErrorReport::new(ErrorType::Validation, "first")));
        assert_eq!(ctx.pop_error_scope(), Some(ErrorReport::no_error()));
        assert_eq!(ctx.pop_error_scope(), Some(ErrorReport::no_error()));
        assert_eq!(ctx.pop_error_scope(), None);
    }

    #[test]
    fn filter_mismatch_skips_to_outer_scope() {
        let ctx = context();
        ctx.push_error_scope(ErrorFilter::Validation);
        ctx.push_error_scope(ErrorFilter::OutOfMemory);
        ctx.report_error(ErrorType::Validation, "bad shape");
        assert_eq!(ctx.pop_error_scope().map(|r| r.ty), Some(ErrorType::NoError));
        assert_eq!(ctx.pop_error_scope().map(|r| r.ty), Some(ErrorType::Validation));
    }

    #[test]
    fn unknown_errors_bubble_to_the_root_callback() {
        let ctx = context();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.set_uncaptured_error_callback(move |report| {
            sink.lock().unwrap().push(report.clone());
        });
        ctx.push_error_scope(ErrorFilter::Validation);
        ctx.report_error(ErrorType::Unknown, "backend crashed");
        ctx.report_error(ErrorType::Validation, "captured");

        assert_eq!(
            ctx.pop_error_scope(),
            Some(ErrorReport::new(ErrorType::Unknown, "backend crashed"))
        );
        ctx.report_error(ErrorType::Validation, "uncaptured");
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].message, "backend crashed");
        assert_eq!(seen[1].message, "uncaptured");
    }

    #[test]
    fn unavailable_context_yields_error_builders() {
        let ctx = context();
        ctx.push_error_scope(ErrorFilter::Validation);
        let builder = ctx.create_graph_builder();
        assert!(builder.is_error());
        // ContextLost is recorded on its way to the root.
        assert_eq!(ctx.pop_error_scope().map(|r| r.ty), Some(ErrorType::ContextLost));
    }
}
