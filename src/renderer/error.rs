//! Renderer subsystem error handling
//!
//! Helpers that turn backend failures into `CullError` values so backend
//! code can use `?` instead of `unwrap()`.

use crate::error::{CullError, CullResult};

/// Helper trait for GPU backend error contexts
pub trait CullErrorContext<T> {
    fn cull_context(self, context: &str) -> CullResult<T>;
}

impl<T, E> CullErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn cull_context(self, context: &str) -> CullResult<T> {
        self.map_err(|e| gpu_operation_error(context, e))
    }
}

impl<T> CullErrorContext<T> for Option<T> {
    fn cull_context(self, context: &str) -> CullResult<T> {
        self.ok_or_else(|| gpu_operation_error(context, "missing value"))
    }
}

/// Create a GPU operation error
pub fn gpu_operation_error(operation: &str, error: impl std::fmt::Display) -> CullError {
    CullError::GpuOperationFailed {
        operation: operation.to_string(),
        error: error.to_string(),
    }
}

/// Create a buffer mapping error
pub fn buffer_mapping_error(buffer: &str) -> CullError {
    CullError::BufferMapping {
        buffer: buffer.to_string(),
    }
}
