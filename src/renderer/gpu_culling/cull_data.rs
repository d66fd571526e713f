/// Per-frame cull data buffers
///
/// Owns every device allocation the stages share: the multiply-buffered cull
/// uniforms, the visibility state that persists across frames, the
/// visible-meshlet counters, the compacted meshlet commands and the
/// dispatch argument buffers. Stages reach them through typed slices.
use super::batch_cull::BatchLayout;
use super::commands::{CommandList, CullPass};
use super::depth_pyramid::DepthPyramid;
use super::dispatch_args::DispatchArgsLayout;
use super::gpu_types::{GpuCullData, MeshletDrawCommand, CULL_DATA_STRIDE};
use super::resources::{BufferHandle, BufferSlice, BufferUsage, CullContext};
use crate::camera::{build_projection_matrix, build_view_matrix, extract_frustum_planes, projection_coefficients, CameraData};
use crate::config::{CullLimits, CullToggles};
use crate::error::CullResult;

/// Word layout of the shared visibility buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityLayout {
    pub mesh_words: u32,
    pub meshlet_base: u32,
    pub meshlet_words: u32,
    pub triangle_base: u32,
    pub triangle_words: u32,
}

impl VisibilityLayout {
    pub fn new(limits: &CullLimits) -> Self {
        let mesh_words = limits.max_objects;
        let meshlet_words = limits.max_meshlets;
        Self {
            mesh_words,
            meshlet_base: mesh_words,
            meshlet_words,
            triangle_base: mesh_words + meshlet_words,
            triangle_words: limits.max_meshlets * limits.triangle_groups_per_meshlet(),
        }
    }

    pub fn total_words(&self) -> u32 {
        self.triangle_base + self.triangle_words
    }
}

pub struct CullDataBuffers {
    limits: CullLimits,
    visibility_layout: VisibilityLayout,
    args_layout: DispatchArgsLayout,
    cull_data: BufferHandle,
    visibility: BufferHandle,
    meshlet_counters: BufferHandle,
    meshlet_commands: BufferHandle,
    dispatch_args: Vec<BufferHandle>,
}

impl CullDataBuffers {
    pub fn new(ctx: &mut CullContext, limits: &CullLimits) -> CullResult<Self> {
        limits.validate()?;
        let resources = &mut ctx.resources;
        let visibility_layout = VisibilityLayout::new(limits);
        let args_layout = DispatchArgsLayout::new(limits);

        let cull_data = resources.create_buffer(
            "cull data",
            CULL_DATA_STRIDE * limits.buffered_frames as u64,
            BufferUsage::UNIFORM | BufferUsage::COPY_DST,
        );
        let visibility = resources.create_buffer(
            "visibility",
            visibility_layout.total_words() as u64 * 4,
            BufferUsage::STORAGE | BufferUsage::COPY_SRC,
        );
        let meshlet_counters = resources.create_buffer(
            "visible meshlet counters",
            limits.buffered_frames as u64 * 4,
            BufferUsage::STORAGE | BufferUsage::COPY_SRC,
        );
        let meshlet_commands = resources.create_buffer(
            "meshlet commands",
            limits.max_command_count() as u64 * std::mem::size_of::<MeshletDrawCommand>() as u64,
            BufferUsage::STORAGE | BufferUsage::COPY_SRC,
        );
        let dispatch_args = (0..limits.buffered_frames)
            .map(|slot| {
                resources.create_buffer(
                    &format!("dispatch args {}", slot),
                    args_layout.region_bytes() * 2,
                    BufferUsage::STORAGE | BufferUsage::INDIRECT | BufferUsage::COPY_SRC,
                )
            })
            .collect();

        log::info!(
            "[CullDataBuffers] visibility {} words, {} command slots, {} frame slots",
            visibility_layout.total_words(),
            limits.max_command_count(),
            limits.buffered_frames
        );

        Ok(Self {
            limits: *limits,
            visibility_layout,
            args_layout,
            cull_data,
            visibility,
            meshlet_counters,
            meshlet_commands,
            dispatch_args,
        })
    }

    pub fn limits(&self) -> &CullLimits {
        &self.limits
    }

    pub fn args_layout(&self) -> &DispatchArgsLayout {
        &self.args_layout
    }

    pub fn visibility_layout(&self) -> &VisibilityLayout {
        &self.visibility_layout
    }

    pub fn frame_slot(&self, frame: u64) -> u32 {
        (frame % self.limits.buffered_frames as u64) as u32
    }

    pub fn cull_data(&self, slot: u32) -> BufferSlice {
        debug_assert!(slot < self.limits.buffered_frames);
        BufferSlice {
            buffer: self.cull_data,
            offset: slot as u64 * CULL_DATA_STRIDE,
            size: std::mem::size_of::<GpuCullData>() as u64,
        }
    }

    fn visibility_slice(&self, base: u32, words: u32) -> BufferSlice {
        BufferSlice {
            buffer: self.visibility,
            offset: base as u64 * 4,
            size: words as u64 * 4,
        }
    }

    pub fn visibility_buffer(&self) -> BufferHandle {
        self.visibility
    }

    pub fn mesh_visibility(&self) -> BufferSlice {
        self.visibility_slice(0, self.visibility_layout.mesh_words)
    }

    pub fn meshlet_visibility(&self) -> BufferSlice {
        let layout = &self.visibility_layout;
        self.visibility_slice(layout.meshlet_base, layout.meshlet_words)
    }

    pub fn triangle_visibility(&self) -> BufferSlice {
        let layout = &self.visibility_layout;
        self.visibility_slice(layout.triangle_base, layout.triangle_words)
    }

    pub fn visible_meshlet_count(&self, slot: u32) -> BufferSlice {
        debug_assert!(slot < self.limits.buffered_frames);
        BufferSlice {
            buffer: self.meshlet_counters,
            offset: slot as u64 * 4,
            size: 4,
        }
    }

    pub fn meshlet_commands(&self) -> BufferSlice {
        BufferSlice {
            buffer: self.meshlet_commands,
            offset: 0,
            size: self.limits.max_command_count() as u64 * std::mem::size_of::<MeshletDrawCommand>() as u64,
        }
    }

    /// Argument region of one pass in one frame slot
    pub fn dispatch_args(&self, slot: u32, pass: CullPass) -> BufferSlice {
        let bytes = self.args_layout.region_bytes();
        BufferSlice {
            buffer: self.dispatch_args[slot as usize],
            offset: pass.index() as u64 * bytes,
            size: bytes,
        }
    }

    /// Write this frame's cull data; the only host write of the frame path.
    /// Returns the frame slot written.
    pub fn update(
        &self,
        camera: &CameraData,
        pyramid: &DepthPyramid,
        toggles: &CullToggles,
        object_count: u32,
        frame: u64,
        list: &mut CommandList,
    ) -> u32 {
        let slot = self.frame_slot(frame);
        let view = build_view_matrix(camera);
        let view_proj = build_projection_matrix(camera) * view;
        let batch_layout = BatchLayout::new(&self.limits);
        let (pyramid_width, pyramid_height) = pyramid.size();

        let data = GpuCullData {
            view: view.into(),
            view_proj: view_proj.into(),
            frustum_planes: extract_frustum_planes(camera),
            camera_position: [camera.position[0], camera.position[1], camera.position[2], 1.0],
            projection: projection_coefficients(camera),
            pyramid_size: [pyramid_width as f32, pyramid_height as f32],
            pyramid_mips: pyramid.mip_levels(),
            flags: toggles.bits(),
            object_count,
            max_command_count: self.limits.max_command_count(),
            commands_per_batch: self.limits.max_commands_per_batch(),
            sub_batch_count: self.limits.sub_batch_count(),
            meshlet_visibility_base: self.visibility_layout.meshlet_base,
            triangle_visibility_base: self.visibility_layout.triangle_base,
            triangle_groups_per_meshlet: self.limits.triangle_groups_per_meshlet(),
            meshlet_max_triangles: self.limits.meshlet_max_triangles,
            batch_draw_stride: batch_layout.draw_stride_words,
            batch_index_stride: batch_layout.index_stride_words,
            dispatch_region_words: self.args_layout.region_words(),
            max_meshlets: self.limits.max_meshlets,
        };

        list.write_buffer(self.cull_data(slot), bytemuck::bytes_of(&data));
        log::trace!("[CullDataBuffers] frame {} -> slot {}", frame, slot);
        slot
    }

    pub fn destroy(self, ctx: &mut CullContext) {
        let resources = &mut ctx.resources;
        resources.destroy_buffer(self.cull_data);
        resources.destroy_buffer(self.visibility);
        resources.destroy_buffer(self.meshlet_counters);
        resources.destroy_buffer(self.meshlet_commands);
        for args in self.dispatch_args {
            resources.destroy_buffer(args);
        }
    }
}
