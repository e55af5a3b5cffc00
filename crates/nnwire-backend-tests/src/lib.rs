pub mod recording_backend;
pub mod smoke;

pub use recording_backend::{RecordedNode, RecordingBackend};

/// Instantiates the shared smoke scenarios for one backend constructor.
///
/// ```ignore
/// nnwire_backend_tests::define_backend_tests!(cpu, || Arc::new(CpuBackend::new()));
/// ```
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            use super::*;
            use $crate::smoke;

            macro_rules! smoke_test {
                ($name:ident) => {
                    #[test]
                    fn $name() -> ::anyhow::Result<()> {
                        let backend = ($backend_ctor)();
                        smoke::$name(&backend)
                    }
                };
            }

            smoke_test!(relu_clears_negative_values);
            smoke_test!(matmul_matches_expected);
            smoke_test!(conv2d_applies_bias_and_relu);
            smoke_test!(split_then_concat_reorders_halves);
            smoke_test!(reduce_mean_keeps_dimensions);
            smoke_test!(unused_branches_are_not_compiled);
        }
    };
}
