/// Renderer-side culling subsystem
pub mod error;
pub mod gpu_culling;

pub use error::{buffer_mapping_error, gpu_operation_error, CullErrorContext};
pub use gpu_culling::{
    CommandList, CullContext, CullPass, CullPipeline, FrameSummary, GpuCullExecutor, ReferenceExecutor, Scene,
    SceneBuffers,
};
