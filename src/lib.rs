pub mod camera;
pub mod config;
pub mod constants;
pub mod error;
pub mod renderer;

pub use camera::CameraData;
pub use config::{CullConfig, CullLimits, CullToggles};
pub use error::{CullError, CullResult};
pub use renderer::gpu_culling::{
    BufferHandle, BufferSlice, CommandList, Consume, CullContext, CullPass, CullPipeline, DrawIndexedIndirect,
    FrameSummary, GpuCullExecutor, IndirectDrawSource, Mesh, ReferenceExecutor, ReferenceStats, ReferenceStorage,
    RenderObject, Scene, SceneBuffers, TextureDesc, TextureFormat, TextureHandle,
};
