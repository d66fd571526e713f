/// Mesh-level cull stage
///
/// One invocation per render object tests its world bounding sphere against
/// the frustum and the depth pyramid and writes the object's visibility
/// flags. The reocclusion variant only revisits objects the normal pass
/// left invisible.
use super::commands::{Binding, CommandList, CullPass, DispatchSize, Kernel, KernelParams};
use super::cull_data::CullDataBuffers;
use super::depth_pyramid::DepthPyramid;
use super::resources::CullContext;
use super::scene::SceneBuffers;
use crate::constants::workgroup;
use crate::error::{CullError, CullResult};

/// Last pass recorded. Reocclusion reads the flags the normal pass of the
/// same frame slot wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MeshCullState {
    Idle,
    Recorded { slot: u32, pass: CullPass },
}

pub struct MeshCull {
    state: MeshCullState,
}

impl Default for MeshCull {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshCull {
    pub fn new() -> Self {
        Self {
            state: MeshCullState::Idle,
        }
    }

    fn advance(&mut self, slot: u32, pass: CullPass, op_index: usize) -> CullResult<()> {
        let after_normal = matches!(
            self.state,
            MeshCullState::Recorded { slot: last, pass: CullPass::Normal } if last == slot
        );
        if pass == CullPass::Reocclusion && !after_normal {
            return Err(CullError::hazard(
                op_index,
                "mesh cull (reocclusion)",
                format!("no normal pass recorded for frame slot {} (last: {:?})", slot, self.state),
            ));
        }
        self.state = MeshCullState::Recorded { slot, pass };
        Ok(())
    }

    pub fn workgroups(object_count: u32) -> u32 {
        object_count.div_ceil(workgroup::LINEAR)
    }

    /// Dispatch, then the write-to-read barrier on the mesh flags
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        ctx: &CullContext,
        cull_data: &CullDataBuffers,
        scene: &SceneBuffers,
        pyramid: &DepthPyramid,
        slot: u32,
        pass: CullPass,
        pyramid_valid: bool,
        list: &mut CommandList,
    ) -> CullResult<()> {
        self.advance(slot, pass, list.ops().len())?;
        let mesh_visibility = cull_data.mesh_visibility();

        let visibility = Binding::storage_rw(ctx.resources.whole(cull_data.visibility_buffer())?);
        let visibility = match pass {
            CullPass::Normal => visibility.writes(mesh_visibility),
            CullPass::Reocclusion => visibility.read_writes(mesh_visibility),
        };

        list.dispatch(
            format!("mesh cull ({})", pass.label()),
            Kernel::MeshCull(pass),
            KernelParams {
                frame_slot: slot,
                pyramid_valid: pyramid_valid as u32,
                ..KernelParams::pass(pass)
            },
            vec![
                Binding::uniform(cull_data.cull_data(slot)),
                Binding::storage_read(ctx.resources.whole(scene.objects)?),
                Binding::storage_read(ctx.resources.whole(scene.meshes)?),
                visibility,
                Binding::sampled(pyramid.texture(), 0..pyramid.mip_levels()),
            ],
            DispatchSize::Direct([Self::workgroups(scene.object_count), 1, 1]),
        );
        list.compute_barrier(mesh_visibility);

        log::debug!("[MeshCull] {} objects ({})", scene.object_count, pass.label());
        Ok(())
    }
}
