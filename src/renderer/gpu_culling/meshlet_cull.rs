/// Meshlet-level cull stage
///
/// One workgroup per render object walks the object's meshlets when the
/// mesh is visible, tests each against the frustum, its normal cone and the
/// depth pyramid, and atomically appends a draw command per survivor. The
/// append order is unspecified.
///
/// The reocclusion variant tests meshlets of recovered objects in full;
/// for objects already visible it revisits meshlets the normal pass
/// rejected, and re-emits drawn meshlets whose triangles were not all
/// resolved with `COMMAND_RETEST` so only the missing triangles are tested.
use super::commands::{Binding, CommandList, CullPass, DispatchSize, Kernel, KernelParams};
use super::cull_data::CullDataBuffers;
use super::depth_pyramid::DepthPyramid;
use super::resources::CullContext;
use super::scene::SceneBuffers;
use crate::error::CullResult;

pub struct MeshletCull;

impl MeshletCull {
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        ctx: &CullContext,
        cull_data: &CullDataBuffers,
        scene: &SceneBuffers,
        pyramid: &DepthPyramid,
        slot: u32,
        pass: CullPass,
        pyramid_valid: bool,
        list: &mut CommandList,
    ) -> CullResult<()> {
        let counter = cull_data.visible_meshlet_count(slot);
        let counters = ctx.resources.whole(counter.buffer)?;
        let commands = cull_data.meshlet_commands();
        let params = KernelParams {
            frame_slot: slot,
            pyramid_valid: pyramid_valid as u32,
            ..KernelParams::pass(pass)
        };

        list.dispatch(
            format!("clear meshlet counter ({})", pass.label()),
            Kernel::MeshletCounterClear,
            params,
            vec![
                Binding::uniform(cull_data.cull_data(slot)),
                Binding::storage_rw(counters).writes(counter),
            ],
            DispatchSize::Direct([1, 1, 1]),
        );
        list.compute_barrier(counter);
        // Previous triangle cull reads of the command buffer
        list.compute_barrier(commands);

        let visibility = Binding::storage_rw(ctx.resources.whole(cull_data.visibility_buffer())?)
            .reads(cull_data.mesh_visibility())
            .read_writes(cull_data.meshlet_visibility());
        let visibility = match pass {
            CullPass::Normal => visibility,
            CullPass::Reocclusion => visibility.reads(cull_data.triangle_visibility()),
        };

        list.dispatch(
            format!("meshlet cull ({})", pass.label()),
            Kernel::MeshletCull(pass),
            params,
            vec![
                Binding::uniform(cull_data.cull_data(slot)),
                Binding::storage_read(ctx.resources.whole(scene.objects)?),
                Binding::storage_read(ctx.resources.whole(scene.meshes)?),
                visibility,
                Binding::sampled(pyramid.texture(), 0..pyramid.mip_levels()),
                Binding::storage_read(ctx.resources.whole(scene.meshlets)?),
                Binding::storage_rw(ctx.resources.whole(commands.buffer)?).writes(commands),
                Binding::storage_rw(counters).read_writes(counter),
            ],
            DispatchSize::Direct([scene.object_count, 1, 1]),
        );

        list.compute_barrier(cull_data.mesh_visibility());
        list.compute_barrier(cull_data.meshlet_visibility());
        list.compute_barrier(cull_data.triangle_visibility());
        list.compute_barrier(commands);
        list.compute_barrier(counter);

        log::debug!("[MeshletCull] {} objects ({})", scene.object_count, pass.label());
        Ok(())
    }
}
