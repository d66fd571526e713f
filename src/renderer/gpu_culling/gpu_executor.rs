/// wgpu Executor
///
/// Replays a `CommandList` on a wgpu device. Buffers and textures are
/// allocated per registry handle on first use. Consecutive dispatches share
/// one compute pass; a barrier or a consumption marker ends the pass, which
/// is where wgpu places its own resource transitions. Host writes go through
/// the queue ahead of the submission.
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use super::commands::{BindTarget, BindingKind, CommandList, Consume, CullOp, Dispatch, DispatchSize, Kernel, KernelParams, ShaderModule};
use super::depth_pyramid::PyramidSampler;
use super::hazards::HazardTracker;
use super::resources::{BufferHandle, BufferSlice, BufferUsage, ResourceRegistry, TextureDesc, TextureFormat, TextureHandle};
use crate::error::{CullError, CullResult};
use crate::renderer::error::{buffer_mapping_error, gpu_operation_error, CullErrorContext};

/// Dynamic-offset stride of the per-dispatch parameter block
const PARAMS_STRIDE: u64 = 256;

/// Storage buffers the triangle cull binds at once
const REQUIRED_STORAGE_BUFFERS: u32 = 8;

const COMMON_SOURCE: &str = include_str!("shaders/common.wgsl");

fn module_source(module: ShaderModule) -> (&'static str, &'static str) {
    match module {
        ShaderModule::DepthReduce => ("Depth Reduce Shader", include_str!("shaders/depth_reduce.wgsl")),
        ShaderModule::MipReduce => ("Mip Reduce Shader", include_str!("shaders/mip_reduce.wgsl")),
        ShaderModule::SceneCull => ("Scene Cull Shader", include_str!("shaders/scene_cull.wgsl")),
        ShaderModule::DispatchPrep => ("Dispatch Prep Shader", include_str!("shaders/dispatch_prep.wgsl")),
        ShaderModule::BatchCompaction => ("Batch Compaction Shader", include_str!("shaders/batch_compaction.wgsl")),
        ShaderModule::TriangleCull => ("Triangle Cull Shader", include_str!("shaders/triangle_cull.wgsl")),
    }
}

fn buffer_usages(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut usages = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
    if usage.contains(BufferUsage::UNIFORM) {
        usages |= wgpu::BufferUsages::UNIFORM;
    }
    if usage.contains(BufferUsage::STORAGE) {
        usages |= wgpu::BufferUsages::STORAGE;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        usages |= wgpu::BufferUsages::INDIRECT;
    }
    if usage.contains(BufferUsage::INDEX) {
        usages |= wgpu::BufferUsages::INDEX;
    }
    usages
}

fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
    }
}

struct GpuTexture {
    texture: wgpu::Texture,
    width: u32,
    height: u32,
    mip_levels: u32,
    imported: bool,
}

impl GpuTexture {
    fn matches(&self, desc: &TextureDesc) -> bool {
        self.width == desc.width && self.height == desc.height && self.mip_levels == desc.mip_levels
    }
}

/// Device objects behind registry handles
#[derive(Default)]
pub struct GpuStorage {
    buffers: HashMap<BufferHandle, (u64, wgpu::Buffer)>,
    textures: HashMap<TextureHandle, GpuTexture>,
}

impl GpuStorage {
    pub fn buffer(&self, handle: BufferHandle) -> CullResult<&wgpu::Buffer> {
        self.buffers.get(&handle).map(|(_, b)| b).ok_or(CullError::StaleHandle {
            kind: "gpu buffer",
            index: handle.index(),
            generation: handle.generation(),
        })
    }

    pub fn texture(&self, handle: TextureHandle) -> CullResult<&wgpu::Texture> {
        self.textures.get(&handle).map(|t| &t.texture).ok_or(CullError::StaleHandle {
            kind: "gpu texture",
            index: handle.index(),
            generation: handle.generation(),
        })
    }

    /// View of a mip range; depth textures expose their depth aspect only
    pub fn view(&self, handle: TextureHandle, mips: std::ops::Range<u32>) -> CullResult<wgpu::TextureView> {
        let texture = self.texture(handle)?;
        let aspect = match texture.format() {
            wgpu::TextureFormat::Depth32Float => wgpu::TextureAspect::DepthOnly,
            _ => wgpu::TextureAspect::All,
        };
        Ok(texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Cull Texture View"),
            aspect,
            base_mip_level: mips.start,
            mip_level_count: Some(mips.end - mips.start),
            ..Default::default()
        }))
    }
}

struct KernelPipeline {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

pub struct GpuCullExecutor {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    storage: GpuStorage,
    modules: HashMap<ShaderModule, wgpu::ShaderModule>,
    pipelines: HashMap<Kernel, KernelPipeline>,
    params_buffer: Option<(u64, wgpu::Buffer)>,
    tracker: HazardTracker,
}

impl GpuCullExecutor {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> CullResult<Self> {
        let limits = device.limits();
        if limits.max_storage_buffers_per_shader_stage < REQUIRED_STORAGE_BUFFERS {
            return Err(CullError::InvalidLimits {
                reason: format!(
                    "device offers {} storage buffers per stage, the triangle cull needs {}",
                    limits.max_storage_buffers_per_shader_stage, REQUIRED_STORAGE_BUFFERS
                ),
            });
        }
        if (limits.min_uniform_buffer_offset_alignment as u64) > PARAMS_STRIDE {
            return Err(CullError::InvalidLimits {
                reason: format!(
                    "uniform offset alignment {} exceeds {}",
                    limits.min_uniform_buffer_offset_alignment, PARAMS_STRIDE
                ),
            });
        }

        log::info!(
            "[GpuCullExecutor] created (max texture {}, max storage binding {} bytes)",
            limits.max_texture_dimension_2d,
            limits.max_storage_buffer_binding_size
        );

        Ok(Self {
            device,
            queue,
            storage: GpuStorage::default(),
            modules: HashMap::new(),
            pipelines: HashMap::new(),
            params_buffer: None,
            tracker: HazardTracker::new(),
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn storage(&self) -> &GpuStorage {
        &self.storage
    }

    /// Largest pyramid extent the device can hold
    pub fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    /// Use a renderer-owned texture for `handle` instead of allocating one.
    /// Depth targets need `TEXTURE_BINDING` next to `RENDER_ATTACHMENT`.
    pub fn import_texture(&mut self, registry: &ResourceRegistry, handle: TextureHandle, texture: wgpu::Texture) -> CullResult<()> {
        let desc = registry.texture(handle)?;
        if !texture.usage().contains(wgpu::TextureUsages::TEXTURE_BINDING) {
            return Err(gpu_operation_error(&desc.label, "imported texture is not sampleable"));
        }
        self.storage.textures.insert(
            handle,
            GpuTexture {
                width: texture.width(),
                height: texture.height(),
                mip_levels: texture.mip_level_count(),
                texture,
                imported: true,
            },
        );
        Ok(())
    }

    pub fn create_sampler(&self, sampler: &PyramidSampler) -> wgpu::Sampler {
        let filter = if sampler.nearest {
            wgpu::FilterMode::Nearest
        } else {
            wgpu::FilterMode::Linear
        };
        let address = if sampler.clamp_to_edge {
            wgpu::AddressMode::ClampToEdge
        } else {
            wgpu::AddressMode::Repeat
        };
        self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Depth Pyramid Sampler"),
            address_mode_u: address,
            address_mode_v: address,
            address_mode_w: address,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        })
    }

    /// Allocate device objects for new handles and drop destroyed ones
    fn sync_resources(&mut self, registry: &ResourceRegistry) {
        self.storage
            .buffers
            .retain(|handle, (size, _)| registry.buffer(*handle).map(|d| d.size == *size).unwrap_or(false));
        for (handle, desc) in registry.buffers() {
            if self.storage.buffers.contains_key(&handle) {
                continue;
            }
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(desc.label.as_str()),
                size: desc.size,
                usage: buffer_usages(desc.usage),
                mapped_at_creation: false,
            });
            self.storage.buffers.insert(handle, (desc.size, buffer));
        }

        self.storage.textures.retain(|handle, texture| match registry.texture(*handle) {
            Ok(desc) => texture.imported || texture.matches(desc),
            Err(_) => false,
        });
        for (handle, desc) in registry.textures() {
            if self.storage.textures.contains_key(&handle) {
                continue;
            }
            let usage = match desc.format {
                TextureFormat::Depth32Float => {
                    wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
                }
                TextureFormat::R32Float => {
                    wgpu::TextureUsages::STORAGE_BINDING
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC
                }
            };
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(desc.label.as_str()),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: desc.mip_levels,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: texture_format(desc.format),
                usage,
                view_formats: &[],
            });
            self.storage.textures.insert(
                handle,
                GpuTexture {
                    texture,
                    width: desc.width,
                    height: desc.height,
                    mip_levels: desc.mip_levels,
                    imported: false,
                },
            );
        }
    }

    fn ensure_pipeline(&mut self, registry: &ResourceRegistry, dispatch: &Dispatch) -> CullResult<()> {
        if self.pipelines.contains_key(&dispatch.kernel) {
            return Ok(());
        }

        let module = dispatch.kernel.module();
        if !self.modules.contains_key(&module) {
            let (label, source) = module_source(module);
            let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(format!("{}\n{}", COMMON_SOURCE, source).into()),
            });
            self.modules.insert(module, shader);
        }

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: true,
                min_binding_size: NonZeroU64::new(std::mem::size_of::<KernelParams>() as u64),
            },
            count: None,
        }];
        for (index, binding) in dispatch.bindings.iter().enumerate() {
            let ty = match binding.kind {
                BindingKind::Uniform => wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                BindingKind::StorageRead => wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                BindingKind::StorageReadWrite => wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                BindingKind::SampledTexture => {
                    let BindTarget::Texture { texture, .. } = &binding.target else {
                        return Err(gpu_operation_error(&dispatch.label, "sampled binding without texture"));
                    };
                    let sample_type = match registry.texture(*texture)?.format {
                        TextureFormat::Depth32Float => wgpu::TextureSampleType::Depth,
                        TextureFormat::R32Float => wgpu::TextureSampleType::Float { filterable: false },
                    };
                    wgpu::BindingType::Texture {
                        sample_type,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    }
                }
                BindingKind::StorageTexture => wgpu::BindingType::StorageTexture {
                    access: wgpu::StorageTextureAccess::WriteOnly,
                    format: wgpu::TextureFormat::R32Float,
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
            };
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: index as u32 + 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty,
                count: None,
            });
        }

        let entry_point = dispatch.kernel.entry_point();
        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(entry_point),
            entries: &entries,
        });
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(entry_point),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let module = self.modules.get(&module).cull_context("shader module")?;
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry_point),
            layout: Some(&pipeline_layout),
            module,
            entry_point,
        });

        log::debug!("[GpuCullExecutor] built pipeline '{}'", entry_point);
        self.pipelines.insert(dispatch.kernel, KernelPipeline { layout, pipeline });
        Ok(())
    }

    fn ensure_params_buffer(&mut self, dispatch_count: usize) {
        let needed = (dispatch_count.max(1) as u64) * PARAMS_STRIDE;
        let too_small = self.params_buffer.as_ref().map_or(true, |(size, _)| *size < needed);
        if too_small {
            let size = needed.next_power_of_two();
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Kernel Params Buffer"),
                size,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            self.params_buffer = Some((size, buffer));
        }
    }

    fn create_bind_group(&self, params: &wgpu::Buffer, dispatch: &Dispatch) -> CullResult<wgpu::BindGroup> {
        let layout = &self
            .pipelines
            .get(&dispatch.kernel)
            .cull_context("kernel pipeline")?
            .layout;

        let views = dispatch
            .bindings
            .iter()
            .map(|binding| match &binding.target {
                BindTarget::Texture { texture, mips } => self.storage.view(*texture, mips.clone()).map(Some),
                BindTarget::Buffer(_) => Ok(None),
            })
            .collect::<CullResult<Vec<_>>>()?;

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: params,
                offset: 0,
                size: NonZeroU64::new(std::mem::size_of::<KernelParams>() as u64),
            }),
        }];
        for (index, (binding, view)) in dispatch.bindings.iter().zip(&views).enumerate() {
            let resource = match (&binding.target, view) {
                (BindTarget::Buffer(slice), _) if binding.kind == BindingKind::Uniform => {
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: self.storage.buffer(slice.buffer)?,
                        offset: slice.offset,
                        size: NonZeroU64::new(slice.size),
                    })
                }
                (BindTarget::Buffer(slice), _) => self.storage.buffer(slice.buffer)?.as_entire_binding(),
                (BindTarget::Texture { .. }, Some(view)) => wgpu::BindingResource::TextureView(view),
                (BindTarget::Texture { .. }, None) => {
                    return Err(gpu_operation_error(&dispatch.label, "missing texture view"));
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: index as u32 + 1,
                resource,
            });
        }

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(dispatch.label.as_str()),
            layout,
            entries: &entries,
        }))
    }

    /// Replay one list as one queue submission. `consumer` records the
    /// rasterizer's work for each compacted batch into the same encoder.
    pub fn submit<F>(&mut self, registry: &ResourceRegistry, list: &CommandList, mut consumer: F) -> CullResult<()>
    where
        F: FnMut(&mut wgpu::CommandEncoder, &Consume, &GpuStorage),
    {
        #[cfg(debug_assertions)]
        self.tracker.validate(registry, list.ops())?;

        self.sync_resources(registry);

        let dispatches: Vec<&Dispatch> = list.dispatches().collect();
        for dispatch in &dispatches {
            self.ensure_pipeline(registry, dispatch)?;
        }

        let mut params = vec![0u8; dispatches.len() * PARAMS_STRIDE as usize];
        for (index, dispatch) in dispatches.iter().enumerate() {
            let at = index * PARAMS_STRIDE as usize;
            params[at..at + std::mem::size_of::<KernelParams>()].copy_from_slice(bytemuck::bytes_of(&dispatch.params));
        }
        self.ensure_params_buffer(dispatches.len());
        let params_buffer = &self.params_buffer.as_ref().cull_context("params buffer")?.1;
        if !params.is_empty() {
            self.queue.write_buffer(params_buffer, 0, &params);
        }

        for op in list.ops() {
            if let CullOp::WriteBuffer { slice, data } = op {
                self.queue.write_buffer(self.storage.buffer(slice.buffer)?, slice.offset, data);
            }
        }

        let bind_groups = dispatches
            .iter()
            .map(|dispatch| self.create_bind_group(params_buffer, dispatch))
            .collect::<CullResult<Vec<_>>>()?;

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Cull Encoder"),
        });

        let ops = list.ops();
        let mut op_index = 0;
        let mut dispatch_index = 0;
        while op_index < ops.len() {
            match &ops[op_index] {
                CullOp::Dispatch(_) => {
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("Cull Pass"),
                        timestamp_writes: None,
                    });
                    while let Some(CullOp::Dispatch(dispatch)) = ops.get(op_index) {
                        let pipeline = &self.pipelines.get(&dispatch.kernel).cull_context("kernel pipeline")?.pipeline;
                        pass.set_pipeline(pipeline);
                        pass.set_bind_group(0, &bind_groups[dispatch_index], &[(dispatch_index as u64 * PARAMS_STRIDE) as u32]);
                        match dispatch.size {
                            DispatchSize::Direct([x, y, z]) => {
                                if x > 0 && y > 0 && z > 0 {
                                    pass.dispatch_workgroups(x, y, z);
                                }
                            }
                            DispatchSize::Indirect { buffer, offset } => {
                                pass.dispatch_workgroups_indirect(self.storage.buffer(buffer)?, offset);
                            }
                        }
                        dispatch_index += 1;
                        op_index += 1;
                    }
                }
                CullOp::Consume(consume) => {
                    consumer(&mut encoder, consume, &self.storage);
                    op_index += 1;
                }
                CullOp::WriteBuffer { .. } | CullOp::Barrier(_) => op_index += 1,
            }
        }

        self.queue.submit(Some(encoder.finish()));
        log::trace!("[GpuCullExecutor] submitted {} dispatches", dispatches.len());
        Ok(())
    }

    /// Copy a slice back to the host
    pub async fn read_buffer(&self, slice: BufferSlice) -> CullResult<Vec<u8>> {
        let source = self.storage.buffer(slice.buffer)?;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Cull Readback Buffer"),
            size: slice.size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Cull Readback Encoder"),
        });
        encoder.copy_buffer_to_buffer(source, slice.offset, &staging, 0, slice.size);
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            sender.send(result).ok();
        });
        self.device.poll(wgpu::Maintain::Wait);

        receiver
            .await
            .map_err(|_| buffer_mapping_error("readback channel closed"))?
            .map_err(|e| gpu_operation_error("map readback", e))?;

        let data = buffer_slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }

    /// Blocking typed readback
    pub fn read<T: bytemuck::Pod>(&self, slice: BufferSlice) -> CullResult<Vec<T>> {
        let bytes = pollster::block_on(self.read_buffer(slice))?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }
}
