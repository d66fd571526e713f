//! Recorded culling commands
//!
//! Stages never talk to a device directly. They append dispatches, barriers,
//! host writes and consumption markers to a `CommandList`; an executor
//! replays the list on wgpu or on the CPU reference device.

use std::ops::Range;

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::resources::{BufferHandle, BufferSlice, TextureHandle, TextureLayout};

bitflags! {
    /// Pipeline stages named by barriers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Stage: u32 {
        const HOST = 1 << 0;
        const TRANSFER = 1 << 1;
        const COMPUTE = 1 << 2;
        const DRAW_INDIRECT = 1 << 3;
        const VERTEX_INPUT = 1 << 4;
        const EARLY_FRAGMENT_TESTS = 1 << 5;
        const LATE_FRAGMENT_TESTS = 1 << 6;
    }
}

bitflags! {
    /// Memory access kinds named by barriers and bindings
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const UNIFORM_READ = 1 << 0;
        const SHADER_READ = 1 << 1;
        const SHADER_WRITE = 1 << 2;
        const INDIRECT_READ = 1 << 3;
        const INDEX_READ = 1 << 4;
        const DEPTH_ATTACHMENT_READ = 1 << 5;
        const DEPTH_ATTACHMENT_WRITE = 1 << 6;
        const TRANSFER_WRITE = 1 << 7;
        const HOST_WRITE = 1 << 8;
    }
}

impl Access {
    pub const READS: Access = Access::UNIFORM_READ
        .union(Access::SHADER_READ)
        .union(Access::INDIRECT_READ)
        .union(Access::INDEX_READ)
        .union(Access::DEPTH_ATTACHMENT_READ);

    pub const WRITES: Access = Access::SHADER_WRITE
        .union(Access::DEPTH_ATTACHMENT_WRITE)
        .union(Access::TRANSFER_WRITE)
        .union(Access::HOST_WRITE);

    pub fn is_read(&self) -> bool {
        self.intersects(Access::READS)
    }

    pub fn is_write(&self) -> bool {
        self.intersects(Access::WRITES)
    }
}

/// Kernel variant selector for the stages that run twice per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullPass {
    /// Against the pyramid carried over from the previous frame
    Normal,
    /// Against the pyramid rebuilt from this frame's first draw
    Reocclusion,
}

impl CullPass {
    pub fn index(self) -> u32 {
        match self {
            CullPass::Normal => 0,
            CullPass::Reocclusion => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CullPass::Normal => "normal",
            CullPass::Reocclusion => "reocclusion",
        }
    }
}

/// Every compute kernel of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// Depth image to pyramid mip 0
    DepthReduceSource,
    /// Pyramid mip i-1 to mip i
    DepthReduceMip,
    MeshCull(CullPass),
    MeshletCounterClear,
    MeshletCull(CullPass),
    PrepareBatchDispatch,
    BatchClear,
    TriangleCull(CullPass),
    BatchCountClear,
    BatchCompact,
}

/// WGSL sources; kernels of one module share their binding declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderModule {
    DepthReduce,
    MipReduce,
    SceneCull,
    DispatchPrep,
    BatchCompaction,
    TriangleCull,
}

impl Kernel {
    pub fn module(self) -> ShaderModule {
        match self {
            Kernel::DepthReduceSource => ShaderModule::DepthReduce,
            Kernel::DepthReduceMip => ShaderModule::MipReduce,
            Kernel::MeshCull(_) | Kernel::MeshletCull(_) => ShaderModule::SceneCull,
            Kernel::MeshletCounterClear | Kernel::PrepareBatchDispatch => ShaderModule::DispatchPrep,
            Kernel::BatchClear | Kernel::BatchCountClear | Kernel::BatchCompact => ShaderModule::BatchCompaction,
            Kernel::TriangleCull(_) => ShaderModule::TriangleCull,
        }
    }

    pub fn entry_point(self) -> &'static str {
        match self {
            Kernel::DepthReduceSource => "reduce_depth",
            Kernel::DepthReduceMip => "reduce_mip",
            Kernel::MeshCull(CullPass::Normal) => "mesh_cull",
            Kernel::MeshCull(CullPass::Reocclusion) => "mesh_cull_reocclusion",
            Kernel::MeshletCounterClear => "clear_meshlet_counter",
            Kernel::MeshletCull(CullPass::Normal) => "meshlet_cull",
            Kernel::MeshletCull(CullPass::Reocclusion) => "meshlet_cull_reocclusion",
            Kernel::PrepareBatchDispatch => "prepare_batch_dispatch",
            Kernel::BatchClear => "batch_clear",
            Kernel::TriangleCull(CullPass::Normal) => "triangle_cull",
            Kernel::TriangleCull(CullPass::Reocclusion) => "triangle_cull_reocclusion",
            Kernel::BatchCountClear => "batch_count_clear",
            Kernel::BatchCompact => "batch_compact",
        }
    }
}

/// Per-dispatch constants. Bound as a dynamic-offset uniform on wgpu.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct KernelParams {
    pub pass: u32,
    pub batch_index: u32,
    pub ring_slot: u32,
    pub mip_level: u32,
    /// Non-zero once the pyramid holds a real reduction
    pub pyramid_valid: u32,
    pub frame_slot: u32,
    pub _padding: [u32; 2],
}

impl KernelParams {
    pub fn pass(pass: CullPass) -> Self {
        Self {
            pass: pass.index(),
            ..Self::default()
        }
    }
}

/// Region of a resource an access applies to
#[derive(Debug, Clone, PartialEq)]
pub enum Region {
    Buffer(BufferSlice),
    Texture { texture: TextureHandle, mips: Range<u32> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Touch {
    pub region: Region,
    pub access: Access,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Uniform,
    StorageRead,
    StorageReadWrite,
    SampledTexture,
    StorageTexture,
}

/// What the backend binds
#[derive(Debug, Clone, PartialEq)]
pub enum BindTarget {
    /// Uniforms bind exactly this slice; storage buffers bind the whole
    /// buffer and kernels apply their own offsets
    Buffer(BufferSlice),
    Texture { texture: TextureHandle, mips: Range<u32> },
}

/// One kernel binding plus the regions it actually reads and writes
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub kind: BindingKind,
    pub target: BindTarget,
    pub touches: Vec<Touch>,
}

impl Binding {
    pub fn uniform(slice: BufferSlice) -> Self {
        Self {
            kind: BindingKind::Uniform,
            target: BindTarget::Buffer(slice),
            touches: vec![Touch {
                region: Region::Buffer(slice),
                access: Access::UNIFORM_READ,
            }],
        }
    }

    /// Read-only storage buffer touching the given slices
    pub fn storage_read(buffer: BufferSlice) -> Self {
        Self {
            kind: BindingKind::StorageRead,
            target: BindTarget::Buffer(buffer),
            touches: vec![Touch {
                region: Region::Buffer(buffer),
                access: Access::SHADER_READ,
            }],
        }
    }

    /// Read-write storage buffer; add touched regions with `reads`/`writes`
    pub fn storage_rw(buffer: BufferSlice) -> Self {
        Self {
            kind: BindingKind::StorageReadWrite,
            target: BindTarget::Buffer(buffer),
            touches: Vec::new(),
        }
    }

    pub fn reads(mut self, slice: BufferSlice) -> Self {
        self.touches.push(Touch {
            region: Region::Buffer(slice),
            access: Access::SHADER_READ,
        });
        self
    }

    pub fn writes(mut self, slice: BufferSlice) -> Self {
        self.touches.push(Touch {
            region: Region::Buffer(slice),
            access: Access::SHADER_WRITE,
        });
        self
    }

    pub fn read_writes(mut self, slice: BufferSlice) -> Self {
        self.touches.push(Touch {
            region: Region::Buffer(slice),
            access: Access::SHADER_READ | Access::SHADER_WRITE,
        });
        self
    }

    pub fn sampled(texture: TextureHandle, mips: Range<u32>) -> Self {
        Self {
            kind: BindingKind::SampledTexture,
            target: BindTarget::Texture {
                texture,
                mips: mips.clone(),
            },
            touches: vec![Touch {
                region: Region::Texture { texture, mips },
                access: Access::SHADER_READ,
            }],
        }
    }

    pub fn storage_texture(texture: TextureHandle, mip: u32) -> Self {
        Self {
            kind: BindingKind::StorageTexture,
            target: BindTarget::Texture {
                texture,
                mips: mip..mip + 1,
            },
            touches: vec![Touch {
                region: Region::Texture {
                    texture,
                    mips: mip..mip + 1,
                },
                access: Access::SHADER_WRITE,
            }],
        }
    }

    pub fn buffer(&self) -> Option<BufferHandle> {
        match &self.target {
            BindTarget::Buffer(slice) => Some(slice.buffer),
            BindTarget::Texture { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DispatchSize {
    Direct([u32; 3]),
    /// Workgroup counts read from the device at `offset`
    Indirect { buffer: BufferHandle, offset: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub label: String,
    pub kernel: Kernel,
    pub params: KernelParams,
    pub bindings: Vec<Binding>,
    pub size: DispatchSize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BarrierTarget {
    Buffer(BufferSlice),
    Texture {
        texture: TextureHandle,
        mips: Range<u32>,
        old_layout: TextureLayout,
        new_layout: TextureLayout,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Barrier {
    pub src_stage: Stage,
    pub src_access: Access,
    pub dst_stage: Stage,
    pub dst_access: Access,
    pub target: BarrierTarget,
}

/// Everything the rasterizer needs to draw one compacted batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndirectDrawSource {
    pub draws: BufferHandle,
    pub draw_offset: u64,
    pub draw_stride: u64,
    pub count_buffer: BufferHandle,
    pub count_offset: u64,
    pub max_count: u32,
    pub index_buffer: BufferSlice,
}

impl IndirectDrawSource {
    pub fn draw_slice(&self) -> BufferSlice {
        BufferSlice {
            buffer: self.draws,
            offset: self.draw_offset,
            size: self.draw_stride * self.max_count as u64,
        }
    }

    pub fn count_slice(&self) -> BufferSlice {
        BufferSlice {
            buffer: self.count_buffer,
            offset: self.count_offset,
            size: 4,
        }
    }
}

/// Marker where the external rasterizer consumes a batch
#[derive(Debug, Clone, PartialEq)]
pub struct Consume {
    pub pass: CullPass,
    pub batch_index: u32,
    pub ring_slot: u32,
    pub source: IndirectDrawSource,
    /// Depth target the rasterizer writes while drawing
    pub depth: Option<TextureHandle>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CullOp {
    /// Host to device copy, issued before the submission executes
    WriteBuffer { slice: BufferSlice, data: Vec<u8> },
    Dispatch(Dispatch),
    Barrier(Barrier),
    Consume(Consume),
}

#[derive(Debug, Default, Clone)]
pub struct CommandList {
    ops: Vec<CullOp>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[CullOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn write_buffer(&mut self, slice: BufferSlice, data: &[u8]) {
        assert_eq!(slice.size, data.len() as u64, "host write size mismatch");
        self.ops.push(CullOp::WriteBuffer {
            slice,
            data: data.to_vec(),
        });
    }

    pub fn dispatch(
        &mut self,
        label: impl Into<String>,
        kernel: Kernel,
        params: KernelParams,
        bindings: Vec<Binding>,
        size: DispatchSize,
    ) {
        self.ops.push(CullOp::Dispatch(Dispatch {
            label: label.into(),
            kernel,
            params,
            bindings,
            size,
        }));
    }

    pub fn barrier(&mut self, barrier: Barrier) {
        self.ops.push(CullOp::Barrier(barrier));
    }

    /// Compute write made visible to compute reads of the same slice
    pub fn compute_barrier(&mut self, slice: BufferSlice) {
        self.barrier(Barrier {
            src_stage: Stage::COMPUTE,
            src_access: Access::SHADER_WRITE,
            dst_stage: Stage::COMPUTE,
            dst_access: Access::SHADER_READ | Access::SHADER_WRITE,
            target: BarrierTarget::Buffer(slice),
        });
    }

    /// Compute write made visible to indirect-argument reads
    pub fn indirect_barrier(&mut self, slice: BufferSlice) {
        self.barrier(Barrier {
            src_stage: Stage::COMPUTE,
            src_access: Access::SHADER_WRITE,
            dst_stage: Stage::DRAW_INDIRECT | Stage::COMPUTE,
            dst_access: Access::INDIRECT_READ | Access::SHADER_READ,
            target: BarrierTarget::Buffer(slice),
        });
    }

    pub fn consume(&mut self, consume: Consume) {
        self.ops.push(CullOp::Consume(consume));
    }

    pub fn dispatch_count(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, CullOp::Dispatch(_))).count()
    }

    pub fn barrier_count(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, CullOp::Barrier(_))).count()
    }

    pub fn dispatches(&self) -> impl Iterator<Item = &Dispatch> {
        self.ops.iter().filter_map(|op| match op {
            CullOp::Dispatch(dispatch) => Some(dispatch),
            _ => None,
        })
    }
}
