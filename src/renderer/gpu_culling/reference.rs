/// CPU Reference Executor
///
/// Executes a recorded `CommandList` on the CPU with a rendition of every
/// kernel, after validating its barrier discipline. Buffers are word arrays
/// and textures per-mip float arrays, allocated zeroed on first use like
/// fresh device memory. Consumption markers call back into the caller, which
/// plays the rasterizer.
use std::collections::HashMap;

use cgmath::{Matrix4, Vector4};

use super::commands::{BindTarget, CommandList, Consume, CullOp, CullPass, Dispatch, DispatchSize, Kernel};
use super::cull_math::{self, PyramidView, TriangleFate};
use super::depth_pyramid::reduce_footprint;
use super::dispatch_args::batch_command_count;
use super::gpu_types::{
    DrawIndexedIndirect, GpuCullData, GpuMesh, GpuMeshlet, GpuObject, MeshletDrawCommand, DISPATCH_ARGS_PER_BATCH,
    WORDS_PER_BATCH_COUNTERS, WORDS_PER_DISPATCH_ARGS, WORDS_PER_DISPATCH_HEADER, WORDS_PER_DRAW,
    WORDS_PER_MESHLET_COMMAND,
};
use super::hazards::HazardTracker;
use super::resources::{BufferHandle, BufferSlice, ResourceRegistry, TextureHandle};
use super::scene::SceneBuffers;
use crate::config::CullLimits;
use crate::constants::{flags, meshlet, workgroup};
use crate::error::{CullError, CullResult};
use crate::renderer::error::gpu_operation_error;

/// Work counters accumulated across submissions, indexed by `CullPass::index`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReferenceStats {
    pub dispatches: u64,
    pub barriers: u64,
    pub host_writes: u64,
    pub mesh_tests: [u64; 2],
    pub meshes_visible: [u64; 2],
    pub meshlet_tests: [u64; 2],
    pub meshlets_emitted: [u64; 2],
    pub triangles_tested: [u64; 2],
    pub triangles_emitted: [u64; 2],
    /// Non-empty commands before compaction
    pub commands_with_triangles: [u64; 2],
    pub batches_consumed: [u64; 2],
    pub draws_consumed: [u64; 2],
}

/// Zero-initialized CPU memory behind every handle
#[derive(Default)]
pub struct ReferenceStorage {
    buffers: HashMap<BufferHandle, Vec<u32>>,
    textures: HashMap<TextureHandle, Vec<Vec<f32>>>,
}

fn word_range(slice: &BufferSlice) -> std::ops::Range<usize> {
    debug_assert!(slice.offset % 4 == 0 && slice.size % 4 == 0, "unaligned slice");
    (slice.offset / 4) as usize..(slice.end() / 4) as usize
}

impl ReferenceStorage {
    fn ensure_buffer(&mut self, registry: &ResourceRegistry, handle: BufferHandle) -> CullResult<&mut Vec<u32>> {
        let words = (registry.buffer(handle)?.size / 4) as usize;
        let buffer = self.buffers.entry(handle).or_default();
        if buffer.len() != words {
            buffer.resize(words, 0);
        }
        Ok(buffer)
    }

    fn ensure_texture(&mut self, registry: &ResourceRegistry, handle: TextureHandle) -> CullResult<()> {
        let desc = registry.texture(handle)?;
        let sizes: Vec<usize> = (0..desc.mip_levels)
            .map(|level| {
                let (w, h) = desc.mip_size(level);
                (w * h) as usize
            })
            .collect();
        let mips = self.textures.entry(handle).or_default();
        let matches = mips.len() == sizes.len() && mips.iter().zip(&sizes).all(|(m, s)| m.len() == *s);
        if !matches {
            *mips = sizes.into_iter().map(|s| vec![0.0; s]).collect();
        }
        Ok(())
    }

    fn take(&mut self, registry: &ResourceRegistry, handle: BufferHandle) -> CullResult<Vec<u32>> {
        self.ensure_buffer(registry, handle)?;
        Ok(self.buffers.remove(&handle).unwrap_or_default())
    }

    fn put(&mut self, handle: BufferHandle, words: Vec<u32>) {
        self.buffers.insert(handle, words);
    }

    fn words_of(&self, handle: BufferHandle) -> &[u32] {
        self.buffers.get(&handle).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Copy typed elements out of a slice; unwritten memory reads as zero
    pub fn read<T: bytemuck::Pod>(&self, slice: BufferSlice) -> Vec<T> {
        let range = word_range(&slice);
        let mut words = vec![0u32; range.len()];
        if let Some(buffer) = self.buffers.get(&slice.buffer) {
            let end = range.end.min(buffer.len());
            if range.start < end {
                words[..end - range.start].copy_from_slice(&buffer[range.start..end]);
            }
        }
        bytemuck::pod_collect_to_vec(&words)
    }

    pub fn read_u32(&self, slice: BufferSlice) -> u32 {
        self.read::<u32>(slice.sub(0, 4))[0]
    }

    pub fn write_bytes(&mut self, registry: &ResourceRegistry, slice: BufferSlice, data: &[u8]) -> CullResult<()> {
        let buffer = self.ensure_buffer(registry, slice.buffer)?;
        let range = word_range(&slice);
        if range.end > buffer.len() || data.len() != range.len() * 4 {
            return Err(CullError::CapacityExceeded {
                resource: registry.buffer(slice.buffer)?.label.clone(),
                requested: slice.end(),
                capacity: buffer.len() as u64 * 4,
            });
        }
        bytemuck::cast_slice_mut::<u32, u8>(&mut buffer[range]).copy_from_slice(data);
        Ok(())
    }

    pub fn mip(&self, texture: TextureHandle, level: u32) -> Option<&[f32]> {
        self.textures.get(&texture)?.get(level as usize).map(Vec::as_slice)
    }

    pub fn mip_mut(&mut self, registry: &ResourceRegistry, texture: TextureHandle, level: u32) -> CullResult<&mut [f32]> {
        self.ensure_texture(registry, texture)?;
        self.textures
            .get_mut(&texture)
            .and_then(|mips| mips.get_mut(level as usize))
            .map(Vec::as_mut_slice)
            .ok_or_else(|| gpu_operation_error("texture mip", format!("mip {} out of range", level)))
    }

    /// Final draws of a consumed batch, up to its device-side count
    pub fn consumed_draws(&self, consume: &Consume) -> Vec<DrawIndexedIndirect> {
        let source = &consume.source;
        let count = self.read_u32(source.count_slice()).min(source.max_count) as usize;
        let mut draws: Vec<DrawIndexedIndirect> = self.read(source.draw_slice());
        draws.truncate(count);
        draws
    }

    /// Rasterize a consumed batch into its depth target: reverse-Z, depth
    /// test greater, counter-clockwise front faces. Returns drawn triangles.
    pub fn rasterize(
        &mut self,
        registry: &ResourceRegistry,
        consume: &Consume,
        scene: &SceneBuffers,
        view_proj: Matrix4<f32>,
    ) -> CullResult<u32> {
        let Some(depth) = consume.depth else {
            return Ok(0);
        };
        let (width, height) = registry.texture(depth)?.mip_size(0);
        let draws = self.consumed_draws(consume);
        let indices: Vec<u32> = self.read(BufferSlice {
            buffer: consume.source.index_buffer.buffer,
            offset: 0,
            size: registry.buffer(consume.source.index_buffer.buffer)?.size,
        });
        let objects: Vec<GpuObject> = self.read(registry.whole(scene.objects)?);
        let vertices: Vec<[f32; 4]> = self.read(registry.whole(scene.vertices)?);

        let target = self.mip_mut(registry, depth, 0)?;
        let mut drawn = 0;
        for draw in draws {
            let object = &objects[draw.first_instance as usize];
            let mvp = view_proj * Matrix4::from(object.model);
            let first = draw.first_index as usize;
            for tri in indices[first..first + draw.index_count as usize].chunks_exact(3) {
                let clip = [0, 1, 2].map(|i| {
                    let p = vertices[tri[i] as usize];
                    mvp * Vector4::new(p[0], p[1], p[2], 1.0)
                });
                if rasterize_triangle(target, width, height, clip) {
                    drawn += 1;
                }
            }
        }
        Ok(drawn)
    }

    /// Reset a depth target to the far plane (0.0 in reverse-Z)
    pub fn clear_depth(&mut self, registry: &ResourceRegistry, depth: TextureHandle) -> CullResult<()> {
        self.mip_mut(registry, depth, 0)?.fill(0.0);
        Ok(())
    }
}

fn rasterize_triangle(target: &mut [f32], width: u32, height: u32, clip: [Vector4<f32>; 3]) -> bool {
    if clip.iter().any(|v| v.w <= 1e-6) {
        return false;
    }
    let screen = clip.map(|v| {
        let ndc = v.truncate() / v.w;
        [(ndc.x * 0.5 + 0.5) * width as f32, (0.5 - ndc.y * 0.5) * height as f32, ndc.z]
    });
    let [a, b, c] = screen;
    // Screen y points down, so counter-clockwise in NDC is negative here
    let area = (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0]);
    if area >= 0.0 {
        return false;
    }

    let min_x = a[0].min(b[0]).min(c[0]).floor().max(0.0) as u32;
    let max_x = a[0].max(b[0]).max(c[0]).ceil().min(width as f32) as u32;
    let min_y = a[1].min(b[1]).min(c[1]).floor().max(0.0) as u32;
    let max_y = a[1].max(b[1]).max(c[1]).ceil().min(height as f32) as u32;

    let edge = |p: [f32; 3], q: [f32; 3], x: f32, y: f32| (q[0] - p[0]) * (y - p[1]) - (q[1] - p[1]) * (x - p[0]);
    for y in min_y..max_y {
        for x in min_x..max_x {
            let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
            let w0 = edge(b, c, px, py) / area;
            let w1 = edge(c, a, px, py) / area;
            let w2 = edge(a, b, px, py) / area;
            if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                continue;
            }
            let z = w0 * a[2] + w1 * b[2] + w2 * c[2];
            let texel = &mut target[(y * width + x) as usize];
            if z > *texel {
                *texel = z;
            }
        }
    }
    true
}

/// Scene and state views resolved from a dispatch's bindings
fn buffer_binding(dispatch: &Dispatch, index: usize) -> CullResult<BufferSlice> {
    match dispatch.bindings.get(index).map(|b| &b.target) {
        Some(BindTarget::Buffer(slice)) => Ok(*slice),
        _ => Err(gpu_operation_error(&dispatch.label, format!("binding {} is not a buffer", index))),
    }
}

fn texture_binding(dispatch: &Dispatch, index: usize) -> CullResult<(TextureHandle, u32)> {
    match dispatch.bindings.get(index).map(|b| &b.target) {
        Some(BindTarget::Texture { texture, mips }) => Ok((*texture, mips.start)),
        _ => Err(gpu_operation_error(&dispatch.label, format!("binding {} is not a texture", index))),
    }
}

/// Whole elements of `T` stored in `words`, at most `limit`
fn cast<T: bytemuck::Pod>(words: &[u32], limit: usize) -> &[T] {
    let size = std::mem::size_of::<T>() / 4;
    let count = (words.len() / size).min(limit);
    bytemuck::cast_slice(&words[..count * size])
}

pub struct ReferenceExecutor {
    storage: ReferenceStorage,
    tracker: HazardTracker,
    stats: ReferenceStats,
}

impl Default for ReferenceExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceExecutor {
    pub fn new() -> Self {
        Self {
            storage: ReferenceStorage::default(),
            tracker: HazardTracker::new(),
            stats: ReferenceStats::default(),
        }
    }

    pub fn storage(&self) -> &ReferenceStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut ReferenceStorage {
        &mut self.storage
    }

    pub fn stats(&self) -> &ReferenceStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ReferenceStats::default();
    }

    /// Validate then execute one submission. Nothing executes when the
    /// list has a hazard.
    pub fn submit<F>(&mut self, registry: &ResourceRegistry, list: &CommandList, mut consumer: F) -> CullResult<()>
    where
        F: FnMut(&mut ReferenceStorage, &Consume),
    {
        self.tracker.validate(registry, list.ops())?;

        for op in list.ops() {
            match op {
                CullOp::WriteBuffer { slice, data } => {
                    self.storage.write_bytes(registry, *slice, data)?;
                    self.stats.host_writes += 1;
                }
                CullOp::Barrier(_) => self.stats.barriers += 1,
                CullOp::Dispatch(dispatch) => {
                    let groups = self.resolve_groups(registry, dispatch)?;
                    self.stats.dispatches += 1;
                    if groups.iter().all(|&g| g > 0) {
                        self.run(registry, dispatch, groups)?;
                    }
                }
                CullOp::Consume(consume) => {
                    let pass = consume.pass.index() as usize;
                    self.stats.batches_consumed[pass] += 1;
                    self.stats.draws_consumed[pass] += self.storage.consumed_draws(consume).len() as u64;
                    consumer(&mut self.storage, consume);
                }
            }
        }
        Ok(())
    }

    fn resolve_groups(&mut self, registry: &ResourceRegistry, dispatch: &Dispatch) -> CullResult<[u32; 3]> {
        match dispatch.size {
            DispatchSize::Direct(groups) => Ok(groups),
            DispatchSize::Indirect { buffer, offset } => {
                self.storage.ensure_buffer(registry, buffer)?;
                let args: Vec<u32> = self.storage.read(BufferSlice { buffer, offset, size: 12 });
                Ok([args[0], args[1], args[2]])
            }
        }
    }

    fn run(&mut self, registry: &ResourceRegistry, dispatch: &Dispatch, groups: [u32; 3]) -> CullResult<()> {
        // Every bound buffer exists before kernels borrow them
        for binding in &dispatch.bindings {
            match &binding.target {
                BindTarget::Buffer(slice) => {
                    self.storage.ensure_buffer(registry, slice.buffer)?;
                }
                BindTarget::Texture { texture, .. } => self.storage.ensure_texture(registry, *texture)?,
            }
        }

        match dispatch.kernel {
            Kernel::DepthReduceSource | Kernel::DepthReduceMip => self.reduce_depth(registry, dispatch),
            Kernel::MeshCull(pass) => self.mesh_cull(registry, dispatch, pass),
            Kernel::MeshletCounterClear => {
                let counters = buffer_binding(dispatch, 1)?;
                let words = self.storage.ensure_buffer(registry, counters.buffer)?;
                words[dispatch.params.frame_slot as usize] = 0;
                Ok(())
            }
            Kernel::MeshletCull(pass) => self.meshlet_cull(registry, dispatch, pass),
            Kernel::PrepareBatchDispatch => self.prepare_batch_dispatch(registry, dispatch),
            Kernel::BatchClear => self.batch_clear(registry, dispatch, groups),
            Kernel::TriangleCull(pass) => self.triangle_cull(registry, dispatch, pass, groups),
            Kernel::BatchCountClear => {
                let data = self.cull_data(dispatch)?;
                let draws = buffer_binding(dispatch, 2)?;
                let words = self.storage.ensure_buffer(registry, draws.buffer)?;
                words[(dispatch.params.ring_slot * data.batch_draw_stride) as usize] = 0;
                Ok(())
            }
            Kernel::BatchCompact => self.batch_compact(registry, dispatch, groups),
        }
    }

    fn cull_data(&self, dispatch: &Dispatch) -> CullResult<GpuCullData> {
        let slice = buffer_binding(dispatch, 0)?;
        Ok(self.storage.read::<GpuCullData>(slice)[0])
    }

    fn pyramid_valid(dispatch: &Dispatch) -> bool {
        dispatch.params.pyramid_valid != 0
    }

    fn reduce_depth(&mut self, registry: &ResourceRegistry, dispatch: &Dispatch) -> CullResult<()> {
        let (source, source_mip) = texture_binding(dispatch, 0)?;
        let (target, target_mip) = texture_binding(dispatch, 1)?;
        let (src_w, src_h) = registry.texture(source)?.mip_size(source_mip);
        let (dst_w, dst_h) = registry.texture(target)?.mip_size(target_mip);

        let input: Vec<f32> = self
            .storage
            .mip(source, source_mip)
            .map(<[f32]>::to_vec)
            .unwrap_or_else(|| vec![0.0; (src_w * src_h) as usize]);
        let output = self.storage.mip_mut(registry, target, target_mip)?;

        for y in 0..dst_h {
            let (y0, y1) = reduce_footprint(y, src_h, dst_h);
            for x in 0..dst_w {
                let (x0, x1) = reduce_footprint(x, src_w, dst_w);
                let mut depth = f32::MAX;
                for sy in y0..y1 {
                    for sx in x0..x1 {
                        depth = depth.min(input[(sy * src_w + sx) as usize]);
                    }
                }
                output[(y * dst_w + x) as usize] = depth;
            }
        }
        Ok(())
    }

    fn pyramid<'a>(&'a self, registry: &ResourceRegistry, dispatch: &Dispatch, index: usize) -> CullResult<Option<PyramidView<'a>>> {
        if !Self::pyramid_valid(dispatch) {
            return Ok(None);
        }
        let (texture, _) = texture_binding(dispatch, index)?;
        let desc = registry.texture(texture)?;
        Ok(self.storage.textures.get(&texture).map(|mips| PyramidView {
            width: desc.width,
            height: desc.height,
            mips: mips.as_slice(),
        }))
    }

    fn mesh_cull(&mut self, registry: &ResourceRegistry, dispatch: &Dispatch, pass: CullPass) -> CullResult<()> {
        let data = self.cull_data(dispatch)?;
        let visibility = buffer_binding(dispatch, 3)?.buffer;
        let mut vis = self.storage.take(registry, visibility)?;

        let objects_handle = buffer_binding(dispatch, 1)?.buffer;
        let meshes_handle = buffer_binding(dispatch, 2)?.buffer;
        let object_count = data.object_count as usize;
        let mut tests = 0;
        let mut visible_count = 0;
        {
            let objects: &[GpuObject] = cast(self.storage.words_of(objects_handle), object_count);
            let meshes: &[GpuMesh] = cast(self.storage.words_of(meshes_handle), usize::MAX);
            let pyramid = self.pyramid(registry, dispatch, 4)?;

            for (index, object) in objects.iter().enumerate() {
                if pass == CullPass::Reocclusion && vis[index] != 0 {
                    continue;
                }
                tests += 1;
                let mesh = &meshes[object.mesh as usize];
                let (center, radius) = cull_math::world_sphere(object, mesh.bounding_sphere);
                let visible = cull_math::sphere_visible(&data, pyramid.as_ref(), center, radius);
                vis[index] = match (pass, visible) {
                    (_, false) => 0,
                    (CullPass::Normal, true) => flags::MESH_VISIBLE,
                    (CullPass::Reocclusion, true) => flags::MESH_VISIBLE | flags::MESH_RECOVERED,
                };
                visible_count += visible as u64;
            }
        }
        self.storage.put(visibility, vis);

        let pass = pass.index() as usize;
        self.stats.mesh_tests[pass] += tests;
        self.stats.meshes_visible[pass] += visible_count;
        Ok(())
    }

    fn meshlet_cull(&mut self, registry: &ResourceRegistry, dispatch: &Dispatch, pass: CullPass) -> CullResult<()> {
        let data = self.cull_data(dispatch)?;
        let visibility = buffer_binding(dispatch, 3)?.buffer;
        let commands_handle = buffer_binding(dispatch, 6)?.buffer;
        let counters_handle = buffer_binding(dispatch, 7)?.buffer;
        let mut vis = self.storage.take(registry, visibility)?;
        let mut commands = self.storage.take(registry, commands_handle)?;
        let mut counters = self.storage.take(registry, counters_handle)?;

        let objects_handle = buffer_binding(dispatch, 1)?.buffer;
        let meshes_handle = buffer_binding(dispatch, 2)?.buffer;
        let meshlets_handle = buffer_binding(dispatch, 5)?.buffer;
        let slot = dispatch.params.frame_slot as usize;
        let meshlet_base = data.meshlet_visibility_base as usize;
        let triangle_base = data.triangle_visibility_base as usize;
        let groups_per_meshlet = data.triangle_groups_per_meshlet as usize;

        let mut tests = 0;
        let mut overflow = false;
        {
            let objects: &[GpuObject] = cast(self.storage.words_of(objects_handle), data.object_count as usize);
            let meshes: &[GpuMesh] = cast(self.storage.words_of(meshes_handle), usize::MAX);
            let meshlets: &[GpuMeshlet] = cast(self.storage.words_of(meshlets_handle), usize::MAX);
            let pyramid = self.pyramid(registry, dispatch, 4)?;

            for (object_index, object) in objects.iter().enumerate() {
                let mesh_flags = vis[object_index];
                let recovered = mesh_flags & flags::MESH_RECOVERED != 0;
                let skip_object = match pass {
                    CullPass::Normal => mesh_flags & flags::MESH_VISIBLE == 0,
                    CullPass::Reocclusion => mesh_flags == 0,
                };
                if skip_object {
                    continue;
                }

                let mesh = &meshes[object.mesh as usize];
                for local in 0..mesh.meshlet_count {
                    let meshlet_index = mesh.meshlet_offset + local;
                    let meshlet = &meshlets[meshlet_index as usize];
                    let instance = (object.meshlet_instance_offset + local) as usize;

                    let mut command_flags = 0;
                    if pass == CullPass::Reocclusion && !recovered && vis[meshlet_base + instance] != 0 {
                        let words = &vis[triangle_base + instance * groups_per_meshlet..];
                        if triangles_resolved(words, meshlet.triangle_count) {
                            continue;
                        }
                        command_flags = flags::COMMAND_RETEST;
                    }

                    tests += 1;
                    let visible = meshlet_visible(&data, pyramid.as_ref(), object, meshlet);
                    if command_flags == 0 {
                        vis[meshlet_base + instance] = visible as u32;
                    }
                    if !visible {
                        continue;
                    }

                    let index = counters[slot];
                    counters[slot] += 1;
                    if index >= data.max_command_count {
                        overflow = true;
                        continue;
                    }
                    let command = MeshletDrawCommand {
                        index_count: meshlet.triangle_count * 3,
                        instance_count: 1,
                        first_index: 0,
                        base_vertex: 0,
                        first_instance: object_index as u32,
                        meshlet_index,
                        instance_index: instance as u32,
                        flags: command_flags,
                    };
                    let at = index as usize * WORDS_PER_MESHLET_COMMAND as usize;
                    commands[at..at + WORDS_PER_MESHLET_COMMAND as usize]
                        .copy_from_slice(bytemuck::cast_slice(bytemuck::bytes_of(&command)));
                }
            }
        }

        let emitted = counters[slot];
        self.storage.put(visibility, vis);
        self.storage.put(commands_handle, commands);
        self.storage.put(counters_handle, counters);

        let pass = pass.index() as usize;
        self.stats.meshlet_tests[pass] += tests;
        self.stats.meshlets_emitted[pass] += emitted as u64;

        if overflow {
            return Err(CullError::CapacityExceeded {
                resource: "meshlet commands".to_string(),
                requested: emitted as u64,
                capacity: data.max_command_count as u64,
            });
        }
        Ok(())
    }

    fn prepare_batch_dispatch(&mut self, registry: &ResourceRegistry, dispatch: &Dispatch) -> CullResult<()> {
        let data = self.cull_data(dispatch)?;
        let counter = self.storage.words_of(buffer_binding(dispatch, 1)?.buffer)[dispatch.params.frame_slot as usize];
        let limits = limits_from(&data);
        let clamped = counter.min(data.max_command_count);

        let args = buffer_binding(dispatch, 2)?.buffer;
        let words = self.storage.ensure_buffer(registry, args)?;
        let base = (dispatch.params.pass * data.dispatch_region_words) as usize;

        words[base] = clamped;
        words[base + 1] = clamped.div_ceil(data.commands_per_batch);
        words[base + 2] = 0;
        words[base + 3] = 0;
        for batch in 0..data.sub_batch_count {
            let commands = batch_command_count(counter, batch, &limits);
            let linear = commands.div_ceil(workgroup::LINEAR);
            let at = base
                + (WORDS_PER_DISPATCH_HEADER + batch * DISPATCH_ARGS_PER_BATCH * WORDS_PER_DISPATCH_ARGS) as usize;
            words[at..at + 9].copy_from_slice(&[linear, 1, 1, commands, 1, 1, linear, 1, 1]);
        }
        Ok(())
    }

    /// Commands of this dispatch's batch, from the argument header
    fn batch_commands(&self, dispatch: &Dispatch, data: &GpuCullData) -> CullResult<u32> {
        let header = buffer_binding(dispatch, 1)?;
        let clamped = self.storage.read_u32(header);
        Ok(batch_command_count(clamped, dispatch.params.batch_index, &limits_from(data)))
    }

    fn batch_clear(&mut self, registry: &ResourceRegistry, dispatch: &Dispatch, groups: [u32; 3]) -> CullResult<()> {
        let data = self.cull_data(dispatch)?;
        let commands = self.batch_commands(dispatch, &data)?;
        let draws = self.storage.ensure_buffer(registry, buffer_binding(dispatch, 2)?.buffer)?;
        let base = (dispatch.params.ring_slot * data.batch_draw_stride) as usize;

        draws[base] = 0;
        draws[base + 1] = 0;
        let invocations = groups[0] * workgroup::LINEAR;
        for i in 0..invocations.min(commands) {
            let at = base + (WORDS_PER_BATCH_COUNTERS + i * WORDS_PER_DRAW) as usize;
            draws[at..at + WORDS_PER_DRAW as usize].fill(0);
        }
        Ok(())
    }

    fn triangle_cull(
        &mut self,
        registry: &ResourceRegistry,
        dispatch: &Dispatch,
        pass: CullPass,
        groups: [u32; 3],
    ) -> CullResult<()> {
        let data = self.cull_data(dispatch)?;
        let visibility = buffer_binding(dispatch, 6)?.buffer;
        let draws_handle = buffer_binding(dispatch, 7)?.buffer;
        let indices_handle = buffer_binding(dispatch, 8)?.buffer;
        let mut vis = self.storage.take(registry, visibility)?;
        let mut draws = self.storage.take(registry, draws_handle)?;
        let mut indices = self.storage.take(registry, indices_handle)?;

        let objects_handle = buffer_binding(dispatch, 1)?.buffer;
        let meshlets_handle = buffer_binding(dispatch, 2)?.buffer;
        let vertices_handle = buffer_binding(dispatch, 3)?.buffer;
        let data_handle = buffer_binding(dispatch, 4)?.buffer;
        let commands_handle = buffer_binding(dispatch, 5)?.buffer;

        let ring_slot = dispatch.params.ring_slot as usize;
        let draw_base = ring_slot * data.batch_draw_stride as usize;
        let index_base = ring_slot * data.batch_index_stride as usize;
        let triangle_base = data.triangle_visibility_base as usize;
        let groups_per_meshlet = data.triangle_groups_per_meshlet as usize;
        let group_size = meshlet::TRIANGLE_GROUP_SIZE;

        let mut tested = 0;
        let mut emitted_total = 0;
        let mut non_empty = 0;
        {
            let objects: &[GpuObject] = cast(self.storage.words_of(objects_handle), data.object_count as usize);
            let meshlets: &[GpuMeshlet] = cast(self.storage.words_of(meshlets_handle), usize::MAX);
            let vertices: &[[f32; 4]] = cast(self.storage.words_of(vertices_handle), usize::MAX);
            let meshlet_data = self.storage.words_of(data_handle);
            let commands: &[MeshletDrawCommand] = cast(self.storage.words_of(commands_handle), usize::MAX);
            let pyramid = self.pyramid(registry, dispatch, 9)?;
            let view_proj = Matrix4::from(data.view_proj);

            for workgroup_id in 0..groups[0] {
                let command_index = (dispatch.params.batch_index * data.commands_per_batch + workgroup_id) as usize;
                let command = commands[command_index];
                let object = &objects[command.first_instance as usize];
                let meshlet = &meshlets[command.meshlet_index as usize];
                let retest = pass == CullPass::Reocclusion && command.flags & flags::COMMAND_RETEST != 0;
                let mvp = view_proj * Matrix4::from(object.model);

                let vertex_offset = meshlet.data_offset as usize;
                let triangle_offset = vertex_offset + meshlet.vertex_count as usize;
                let position = |local: u32| {
                    let global = meshlet_data[vertex_offset + local as usize];
                    let p = vertices[global as usize];
                    (global, mvp * Vector4::new(p[0], p[1], p[2], 1.0))
                };

                let mut survivors: Vec<u32> = Vec::new();
                for group in 0..meshlet.triangle_count.div_ceil(group_size) {
                    let word = triangle_base + command.instance_index as usize * groups_per_meshlet + group as usize;
                    let previous = vis[word];
                    let mut resolved = 0u32;

                    for lane in 0..group_size {
                        let triangle = group * group_size + lane;
                        if triangle >= meshlet.triangle_count {
                            break;
                        }
                        let bit = 1u32 << lane;
                        if retest && previous & bit != 0 {
                            continue;
                        }
                        tested += 1;

                        let packed = meshlet_data[triangle_offset + triangle as usize];
                        let (a, ca) = position(packed & 0xff);
                        let (b, cb) = position((packed >> 8) & 0xff);
                        let (c, cc) = position((packed >> 16) & 0xff);

                        let fate = cull_math::triangle_fate(&data, pyramid.as_ref(), [ca, cb, cc]);
                        if fate.is_resolved() {
                            resolved |= bit;
                        }
                        if fate == TriangleFate::Drawn {
                            survivors.extend_from_slice(&[a, b, c]);
                        }
                    }
                    vis[word] = if retest { previous | resolved } else { resolved };
                }

                let cursor = draws[draw_base + 1];
                draws[draw_base + 1] += survivors.len() as u32;
                let start = index_base + cursor as usize;
                indices[start..start + survivors.len()].copy_from_slice(&survivors);

                let draw = DrawIndexedIndirect {
                    index_count: survivors.len() as u32,
                    instance_count: 1,
                    first_index: (index_base + cursor as usize) as u32,
                    base_vertex: 0,
                    first_instance: command.first_instance,
                };
                let at = draw_base + (WORDS_PER_BATCH_COUNTERS + workgroup_id * WORDS_PER_DRAW) as usize;
                draws[at..at + WORDS_PER_DRAW as usize].copy_from_slice(bytemuck::cast_slice(bytemuck::bytes_of(&draw)));
                if !survivors.is_empty() {
                    draws[draw_base] += 1;
                    non_empty += 1;
                }
                emitted_total += survivors.len() as u64 / 3;
            }
        }

        self.storage.put(visibility, vis);
        self.storage.put(draws_handle, draws);
        self.storage.put(indices_handle, indices);

        let pass = pass.index() as usize;
        self.stats.triangles_tested[pass] += tested;
        self.stats.triangles_emitted[pass] += emitted_total;
        self.stats.commands_with_triangles[pass] += non_empty;
        Ok(())
    }

    fn batch_compact(&mut self, registry: &ResourceRegistry, dispatch: &Dispatch, groups: [u32; 3]) -> CullResult<()> {
        let data = self.cull_data(dispatch)?;
        let commands = self.batch_commands(dispatch, &data)?;
        let draws = self.storage.ensure_buffer(registry, buffer_binding(dispatch, 2)?.buffer)?;
        let base = (dispatch.params.ring_slot * data.batch_draw_stride) as usize;
        let scratch = base + WORDS_PER_BATCH_COUNTERS as usize;
        let final_draws = scratch + (data.commands_per_batch * WORDS_PER_DRAW) as usize;
        let stride = WORDS_PER_DRAW as usize;

        let invocations = groups[0] * workgroup::LINEAR;
        for i in 0..invocations.min(commands) as usize {
            let at = scratch + i * stride;
            if draws[at] == 0 {
                continue;
            }
            let target = final_draws + draws[base] as usize * stride;
            draws[base] += 1;
            draws.copy_within(at..at + stride, target);
        }
        Ok(())
    }
}

fn meshlet_visible(data: &GpuCullData, pyramid: Option<&PyramidView>, object: &GpuObject, meshlet: &GpuMeshlet) -> bool {
    let (center, radius) = cull_math::world_sphere(object, meshlet.bounding_sphere);
    if data.flags & flags::CULL_CONE != 0 && cull_math::cone_culled(data, object, meshlet.cone_axis_cutoff, center, radius) {
        return false;
    }
    cull_math::sphere_visible(data, pyramid, center, radius)
}

/// Whether every triangle of a meshlet has its visibility bit set
fn triangles_resolved(words: &[u32], triangle_count: u32) -> bool {
    let group_size = meshlet::TRIANGLE_GROUP_SIZE;
    (0..triangle_count.div_ceil(group_size)).all(|group| {
        let remaining = triangle_count - group * group_size;
        let mask = if remaining >= group_size { u32::MAX } else { (1 << remaining) - 1 };
        words[group as usize] & mask == mask
    })
}

/// Limits as the kernels see them through the cull data
fn limits_from(data: &GpuCullData) -> CullLimits {
    CullLimits {
        max_draw_indirect_calls: data.commands_per_batch,
        ..CullLimits::default()
    }
}
