/// Frame orchestration of the culling stages
///
/// Per frame: host update, then the normal pass against the pyramid carried
/// over from the previous frame, then the pyramid rebuild from the depth the
/// normal pass produced, then the reocclusion pass against the fresh
/// pyramid. Each pass is mesh cull, meshlet cull, dispatch preparation and
/// the batched triangle cull, every batch followed by its consumer.
use super::batch_cull::SceneBatchCull;
use super::commands::{CommandList, CullPass};
use super::cull_data::CullDataBuffers;
use super::depth_pyramid::DepthPyramid;
use super::dispatch_args::DispatchArgsPrep;
use super::mesh_cull::MeshCull;
use super::meshlet_cull::MeshletCull;
use super::resources::{CullContext, TextureHandle};
use super::scene::SceneBuffers;
use crate::camera::CameraData;
use crate::config::CullConfig;
use crate::error::CullResult;

/// What one recorded frame contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSummary {
    pub frame_slot: u32,
    /// Batches recorded for the normal and reocclusion passes
    pub batches: [u32; 2],
    pub reocclusion: bool,
    /// The normal pass tested occlusion against a built pyramid
    pub pyramid_valid: bool,
}

pub struct CullPipeline {
    config: CullConfig,
    scene: SceneBuffers,
    pyramid: DepthPyramid,
    cull_data: CullDataBuffers,
    mesh_cull: MeshCull,
    batch_cull: SceneBatchCull,
}

impl CullPipeline {
    /// Allocate every buffer from the configured limits. `depth` is the
    /// renderer's depth target; `max_texture_dimension` the device limit.
    pub fn new(
        ctx: &mut CullContext,
        config: &CullConfig,
        scene: SceneBuffers,
        depth: TextureHandle,
        max_texture_dimension: u32,
    ) -> CullResult<Self> {
        config.limits.validate()?;
        let pyramid = DepthPyramid::new(ctx, depth, max_texture_dimension)?;
        let cull_data = CullDataBuffers::new(ctx, &config.limits)?;
        let batch_cull = SceneBatchCull::new(ctx, &config.limits)?;

        log::info!(
            "[CullPipeline] initialized: {} objects, {} meshlet instances, toggles {:?}",
            scene.object_count,
            scene.meshlet_instances,
            config.toggles
        );

        Ok(Self {
            config: config.clone(),
            scene,
            pyramid,
            cull_data,
            mesh_cull: MeshCull::new(),
            batch_cull,
        })
    }

    pub fn config(&self) -> &CullConfig {
        &self.config
    }

    pub fn scene(&self) -> &SceneBuffers {
        &self.scene
    }

    pub fn pyramid(&self) -> &DepthPyramid {
        &self.pyramid
    }

    /// Follow a depth target its owner resized. Occlusion restarts once the
    /// new pyramid has been built.
    pub fn resize(&mut self, ctx: &mut CullContext) -> CullResult<bool> {
        let resized = self.pyramid.resize(ctx)?;
        if resized {
            let (width, height) = self.pyramid.size();
            log::info!("[CullPipeline] depth pyramid now {}x{}", width, height);
        }
        Ok(resized)
    }

    pub fn cull_data(&self) -> &CullDataBuffers {
        &self.cull_data
    }

    pub fn batch_cull(&self) -> &SceneBatchCull {
        &self.batch_cull
    }

    /// Toggles take effect with the next recorded frame; limits are fixed
    pub fn set_toggles(&mut self, toggles: crate::config::CullToggles) {
        self.config.toggles = toggles;
    }

    pub fn record_frame(
        &mut self,
        ctx: &CullContext,
        frame: u64,
        camera: &CameraData,
        list: &mut CommandList,
    ) -> CullResult<FrameSummary> {
        let toggles = self.config.toggles;
        let slot = self.cull_data.update(
            camera,
            &self.pyramid,
            &toggles,
            self.scene.object_count,
            frame,
            list,
        );
        self.batch_cull.reset_sub_batches();

        let pyramid_valid = self.pyramid.prepare(list);
        let normal_batches = self.record_pass(ctx, slot, CullPass::Normal, pyramid_valid, list)?;

        self.pyramid.build(ctx, list)?;

        let reocclusion = toggles.reocclusion && toggles.occlusion;
        let reocclusion_batches = if reocclusion {
            self.record_pass(ctx, slot, CullPass::Reocclusion, true, list)?
        } else {
            0
        };

        log::debug!(
            "[CullPipeline] frame {} slot {}: {} + {} batches",
            frame,
            slot,
            normal_batches,
            reocclusion_batches
        );

        Ok(FrameSummary {
            frame_slot: slot,
            batches: [normal_batches, reocclusion_batches],
            reocclusion,
            pyramid_valid,
        })
    }

    fn record_pass(
        &mut self,
        ctx: &CullContext,
        slot: u32,
        pass: CullPass,
        pyramid_valid: bool,
        list: &mut CommandList,
    ) -> CullResult<u32> {
        self.mesh_cull.record(
            ctx,
            &self.cull_data,
            &self.scene,
            &self.pyramid,
            slot,
            pass,
            pyramid_valid,
            list,
        )?;
        MeshletCull::record(
            ctx,
            &self.cull_data,
            &self.scene,
            &self.pyramid,
            slot,
            pass,
            pyramid_valid,
            list,
        )?;
        DispatchArgsPrep::record(&self.cull_data, slot, pass, list);

        let batch_count = self
            .batch_cull
            .read_back_batch_count(self.scene.potential_meshlet_count());
        self.batch_cull.record_pass(
            ctx,
            &self.cull_data,
            &self.scene,
            &self.pyramid,
            slot,
            pass,
            pyramid_valid,
            batch_count,
            list,
        )?;
        Ok(batch_count)
    }

    /// Release every allocation except the scene and the imported depth target
    pub fn destroy(self, ctx: &mut CullContext) {
        ctx.resources.destroy_texture(self.pyramid.texture());
        self.cull_data.destroy(ctx);
        self.batch_cull.destroy(ctx);
        log::info!("[CullPipeline] destroyed");
    }
}
