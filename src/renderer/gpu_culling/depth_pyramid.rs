/// Hierarchical Depth Pyramid
///
/// Reduces the rasterized depth buffer into a power-of-two mip chain where
/// every texel holds the farthest (reverse-Z: minimum) depth of its
/// footprint. Occlusion tests in the cull kernels compare a bound's nearest
/// depth against it.
use super::commands::{Access, Barrier, BarrierTarget, Binding, CommandList, DispatchSize, Kernel, KernelParams, Stage};
use super::resources::{CullContext, TextureDesc, TextureFormat, TextureHandle, TextureLayout};
use crate::constants::workgroup;
use crate::error::CullResult;

/// Sampling state the occlusion kernels assume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyramidSampler {
    /// Point sampling: reductions are exact per texel
    pub nearest: bool,
    pub clamp_to_edge: bool,
}

/// Largest power of two not above `value`
pub fn previous_pow2(value: u32) -> u32 {
    if value == 0 {
        0
    } else {
        1 << (31 - value.leading_zeros())
    }
}

/// Pyramid extent for a depth target: each axis rounded down to a power of
/// two, then clamped to the device limit
pub fn pyramid_dimensions(depth_width: u32, depth_height: u32, max_dimension: u32) -> (u32, u32, u32) {
    let width = previous_pow2(depth_width.max(1));
    let height = previous_pow2(depth_height.max(1));
    let limit = previous_pow2(max_dimension.max(1));

    let clamped_width = width.min(limit);
    let clamped_height = height.min(limit);
    if clamped_width != width || clamped_height != height {
        log::warn!(
            "[DepthPyramid] pyramid dimensions clamped from {}x{} to {}x{} due to GPU limits (max: {})",
            width,
            height,
            clamped_width,
            clamped_height,
            max_dimension
        );
    }

    let mip_levels = 32 - clamped_width.max(clamped_height).leading_zeros();
    (clamped_width, clamped_height, mip_levels)
}

/// Source texel range `[start, end)` reduced into destination texel `dst`
pub fn reduce_footprint(dst: u32, src_size: u32, dst_size: u32) -> (u32, u32) {
    let start = (dst as u64 * src_size as u64) / dst_size as u64;
    let end = ((dst as u64 + 1) * src_size as u64).div_ceil(dst_size as u64);
    (start as u32, (end as u32).max(start as u32 + 1).min(src_size))
}

pub struct DepthPyramid {
    texture: TextureHandle,
    depth: TextureHandle,
    /// Depth target extent the pyramid was derived from
    depth_size: (u32, u32),
    width: u32,
    height: u32,
    mip_levels: u32,
    max_dimension: u32,
    /// Layout has left `Undefined`
    initialized: bool,
    /// Holds a real reduction
    built: bool,
}

impl DepthPyramid {
    pub fn new(ctx: &mut CullContext, depth: TextureHandle, max_dimension: u32) -> CullResult<Self> {
        let depth_desc = ctx.resources.texture(depth)?;
        let depth_size = (depth_desc.width, depth_desc.height);
        let (width, height, mip_levels) = pyramid_dimensions(depth_size.0, depth_size.1, max_dimension);

        let texture = ctx.resources.create_texture(TextureDesc {
            label: "depth pyramid".to_string(),
            width,
            height,
            mip_levels,
            format: TextureFormat::R32Float,
            imported: false,
        });

        log::info!("[DepthPyramid] {}x{} with {} mips", width, height, mip_levels);
        Ok(Self {
            texture,
            depth,
            depth_size,
            width,
            height,
            mip_levels,
            max_dimension,
            initialized: false,
            built: false,
        })
    }

    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    pub fn sampler(&self) -> PyramidSampler {
        PyramidSampler {
            nearest: true,
            clamp_to_edge: true,
        }
    }

    pub fn depth(&self) -> TextureHandle {
        self.depth
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// Whether occlusion tests may sample the pyramid
    pub fn is_ready(&self) -> bool {
        self.built
    }

    /// Record the first-use transition so cull kernels can bind the pyramid
    /// before anything was reduced into it. Returns whether it holds data.
    pub fn prepare(&mut self, list: &mut CommandList) -> bool {
        if !self.initialized {
            log::debug!("[DepthPyramid] initializing layout");
            list.barrier(Barrier {
                src_stage: Stage::HOST,
                src_access: Access::empty(),
                dst_stage: Stage::COMPUTE,
                dst_access: Access::SHADER_READ,
                target: BarrierTarget::Texture {
                    texture: self.texture,
                    mips: 0..self.mip_levels,
                    old_layout: TextureLayout::Undefined,
                    new_layout: TextureLayout::ShaderReadOnly,
                },
            });
            self.initialized = true;
        }
        self.built
    }

    /// Record the reduction of the depth target into every mip
    pub fn build(&mut self, ctx: &CullContext, list: &mut CommandList) -> CullResult<()> {
        debug_assert!(self.initialized, "pyramid built before prepare");
        ctx.resources.texture(self.depth)?;

        list.barrier(Barrier {
            src_stage: Stage::LATE_FRAGMENT_TESTS,
            src_access: Access::DEPTH_ATTACHMENT_WRITE,
            dst_stage: Stage::COMPUTE,
            dst_access: Access::SHADER_READ,
            target: BarrierTarget::Texture {
                texture: self.depth,
                mips: 0..1,
                old_layout: TextureLayout::DepthAttachment,
                new_layout: TextureLayout::ShaderReadOnly,
            },
        });
        list.barrier(Barrier {
            src_stage: Stage::COMPUTE,
            src_access: Access::SHADER_READ,
            dst_stage: Stage::COMPUTE,
            dst_access: Access::SHADER_WRITE,
            target: BarrierTarget::Texture {
                texture: self.texture,
                mips: 0..self.mip_levels,
                old_layout: TextureLayout::ShaderReadOnly,
                new_layout: TextureLayout::General,
            },
        });

        for level in 0..self.mip_levels {
            let (kernel, source) = if level == 0 {
                (Kernel::DepthReduceSource, Binding::sampled(self.depth, 0..1))
            } else {
                (Kernel::DepthReduceMip, Binding::sampled(self.texture, level - 1..level))
            };
            let mip_width = (self.width >> level).max(1);
            let mip_height = (self.height >> level).max(1);

            list.dispatch(
                format!("depth pyramid mip {}", level),
                kernel,
                KernelParams {
                    mip_level: level,
                    ..KernelParams::default()
                },
                vec![source, Binding::storage_texture(self.texture, level)],
                DispatchSize::Direct([
                    mip_width.div_ceil(workgroup::REDUCE_TILE),
                    mip_height.div_ceil(workgroup::REDUCE_TILE),
                    1,
                ]),
            );
            list.barrier(Barrier {
                src_stage: Stage::COMPUTE,
                src_access: Access::SHADER_WRITE,
                dst_stage: Stage::COMPUTE,
                dst_access: Access::SHADER_READ,
                target: BarrierTarget::Texture {
                    texture: self.texture,
                    mips: level..level + 1,
                    old_layout: TextureLayout::General,
                    new_layout: TextureLayout::ShaderReadOnly,
                },
            });
        }

        list.barrier(Barrier {
            src_stage: Stage::COMPUTE,
            src_access: Access::SHADER_READ,
            dst_stage: Stage::EARLY_FRAGMENT_TESTS | Stage::LATE_FRAGMENT_TESTS,
            dst_access: Access::DEPTH_ATTACHMENT_READ | Access::DEPTH_ATTACHMENT_WRITE,
            target: BarrierTarget::Texture {
                texture: self.depth,
                mips: 0..1,
                old_layout: TextureLayout::ShaderReadOnly,
                new_layout: TextureLayout::DepthAttachment,
            },
        });

        log::debug!("[DepthPyramid] recorded {} reductions", self.mip_levels);
        self.built = true;
        Ok(())
    }

    /// Re-derive the pyramid after the depth target's owner resized it.
    /// Returns whether the pyramid was reallocated.
    pub fn resize(&mut self, ctx: &mut CullContext) -> CullResult<bool> {
        let depth = ctx.resources.texture(self.depth)?;
        let depth_size = (depth.width, depth.height);
        if depth_size == self.depth_size {
            return Ok(false);
        }

        let (width, height, mip_levels) = pyramid_dimensions(depth_size.0, depth_size.1, self.max_dimension);
        ctx.resources.destroy_texture(self.texture);
        self.texture = ctx.resources.create_texture(TextureDesc {
            label: "depth pyramid".to_string(),
            width,
            height,
            mip_levels,
            format: TextureFormat::R32Float,
            imported: false,
        });
        self.depth_size = depth_size;
        self.width = width;
        self.height = height;
        self.mip_levels = mip_levels;
        self.initialized = false;
        self.built = false;
        log::info!("[DepthPyramid] resized to {}x{} with {} mips", width, height, mip_levels);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_round_down_to_powers_of_two() {
        assert_eq!(pyramid_dimensions(1920, 1080, 8192), (1024, 1024, 11));
        assert_eq!(pyramid_dimensions(1280, 720, 8192), (1024, 512, 11));
        assert_eq!(pyramid_dimensions(1, 1, 8192), (1, 1, 1));
        assert_eq!(pyramid_dimensions(300, 17, 8192), (256, 16, 9));
    }

    #[test]
    fn dimensions_clamp_to_device_limit() {
        assert_eq!(pyramid_dimensions(16384, 4096, 2048), (2048, 2048, 12));
    }

    #[test]
    fn footprints_cover_source_without_gaps() {
        for (src, dst) in [(1920u32, 1024u32), (1080, 512), (7, 4), (2, 1), (1, 1)] {
            let mut covered = 0;
            for x in 0..dst {
                let (start, end) = reduce_footprint(x, src, dst);
                assert!(start <= covered, "gap before texel {}", x);
                assert!(end > start);
                covered = covered.max(end);
            }
            assert_eq!(covered, src);
        }
        assert_eq!(reduce_footprint(3, 8, 4), (6, 8));
    }

    #[test]
    fn build_records_one_reduction_per_mip() {
        let mut ctx = CullContext::new();
        let depth = ctx.resources.create_texture(TextureDesc {
            label: "depth".into(),
            width: 640,
            height: 480,
            mip_levels: 1,
            format: TextureFormat::Depth32Float,
            imported: true,
        });
        let mut pyramid = DepthPyramid::new(&mut ctx, depth, 8192).unwrap();
        assert_eq!(pyramid.size(), (512, 256));

        let mut list = CommandList::new();
        assert!(!pyramid.prepare(&mut list));
        pyramid.build(&ctx, &mut list).unwrap();

        assert_eq!(list.dispatch_count(), pyramid.mip_levels() as usize);
        // init transition, depth in, pyramid to general, one per mip, depth out
        assert_eq!(list.barrier_count(), 4 + pyramid.mip_levels() as usize);
        assert!(pyramid.is_ready());
    }

    #[test]
    fn resize_follows_the_owner_of_the_depth_target() {
        let mut ctx = CullContext::new();
        let depth = ctx.resources.create_texture(TextureDesc {
            label: "depth".into(),
            width: 640,
            height: 480,
            mip_levels: 1,
            format: TextureFormat::Depth32Float,
            imported: true,
        });
        let mut pyramid = DepthPyramid::new(&mut ctx, depth, 8192).unwrap();
        let mut list = CommandList::new();
        pyramid.prepare(&mut list);
        pyramid.build(&ctx, &mut list).unwrap();
        let old = pyramid.texture();

        // Unchanged target: nothing happens, and the target is left alone
        assert!(!pyramid.resize(&mut ctx).unwrap());
        assert_eq!(pyramid.texture(), old);
        let desc = ctx.resources.texture(depth).unwrap();
        assert_eq!((desc.width, desc.height), (640, 480));

        ctx.resources.resize_texture(depth, 300, 17).unwrap();
        assert!(pyramid.resize(&mut ctx).unwrap());
        assert_eq!(pyramid.size(), (256, 16));
        assert_eq!(pyramid.mip_levels(), 9);
        assert!(!pyramid.is_ready());
        assert!(ctx.resources.texture(old).is_err());

        let desc = ctx.resources.texture(pyramid.texture()).unwrap();
        assert_eq!((desc.width, desc.height, desc.mip_levels), (256, 16, 9));
        let desc = ctx.resources.texture(depth).unwrap();
        assert_eq!((desc.width, desc.height, desc.mip_levels), (300, 17, 1));
        assert!(desc.imported);

        // The new pyramid starts over from its first-use transition
        let mut list = CommandList::new();
        assert!(!pyramid.prepare(&mut list));
        assert_eq!(list.barrier_count(), 1);
    }
}
