//! Barrier discipline validation
//!
//! Replays a command list against a model of pending memory accesses and
//! image layouts. A read of data written by an earlier op is legal only
//! after a barrier whose source scope covers the write and whose
//! destination scope covers the reader; a write after an earlier read needs
//! at least an execution dependency. Layout-sensitive accesses must find the
//! image in the layout they expect.
//!
//! Pending accesses are scoped to one submission. Layouts persist.

use std::collections::HashMap;
use std::ops::Range;

use super::commands::{Access, Barrier, BarrierTarget, CullOp, Region, Stage, Touch};
use super::resources::{BufferHandle, ResourceRegistry, TextureHandle, TextureLayout};
use crate::error::{CullError, CullResult};

#[derive(Debug, Clone)]
struct Pending {
    range: Range<u64>,
    op: usize,
    stage: Stage,
    access: Access,
    visible_stages: Stage,
    visible_access: Access,
}

impl Pending {
    fn overlaps(&self, range: &Range<u64>) -> bool {
        self.range.start < range.end && range.start < self.range.end
    }

    fn within(&self, range: &Range<u64>) -> bool {
        range.start <= self.range.start && self.range.end <= range.end
    }
}

#[derive(Debug)]
struct MipState {
    layout: TextureLayout,
    pending: Vec<Pending>,
}

#[derive(Default)]
pub struct HazardTracker {
    buffers: HashMap<BufferHandle, Vec<Pending>>,
    mips: HashMap<(TextureHandle, u32), MipState>,
    device_work_recorded: bool,
    checked_ops: usize,
}

/// Whole-mip accesses are modelled as one range
const MIP_RANGE: Range<u64> = 0..1;

impl HazardTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current layout of a texture mip, as the tracker believes it
    pub fn layout(&self, texture: TextureHandle, mip: u32) -> Option<TextureLayout> {
        self.mips.get(&(texture, mip)).map(|state| state.layout)
    }

    pub fn checked_ops(&self) -> usize {
        self.checked_ops
    }

    /// Check every op of a submission, then drop the pending accesses
    pub fn validate(&mut self, registry: &ResourceRegistry, ops: &[CullOp]) -> CullResult<()> {
        for (index, op) in ops.iter().enumerate() {
            self.check_op(registry, index, op)?;
        }
        self.end_submission();
        Ok(())
    }

    pub fn end_submission(&mut self) {
        self.buffers.clear();
        for state in self.mips.values_mut() {
            state.pending.clear();
        }
        self.device_work_recorded = false;
    }

    pub fn check_op(&mut self, registry: &ResourceRegistry, index: usize, op: &CullOp) -> CullResult<()> {
        self.checked_ops += 1;
        match op {
            CullOp::WriteBuffer { slice, .. } => {
                if self.device_work_recorded {
                    let label = registry.buffer(slice.buffer)?.label.clone();
                    return Err(CullError::hazard(
                        index,
                        &label,
                        "host write recorded after device work in the same submission",
                    ));
                }
                Ok(())
            }
            CullOp::Dispatch(dispatch) => {
                self.device_work_recorded = true;
                let mut accesses: Vec<(Stage, Touch)> = dispatch
                    .bindings
                    .iter()
                    .flat_map(|binding| binding.touches.iter().cloned())
                    .map(|touch| (Stage::COMPUTE, touch))
                    .collect();

                if let super::commands::DispatchSize::Indirect { buffer, offset } = dispatch.size {
                    accesses.push((
                        Stage::DRAW_INDIRECT,
                        Touch {
                            region: Region::Buffer(super::resources::BufferSlice {
                                buffer,
                                offset,
                                size: 12,
                            }),
                            access: Access::INDIRECT_READ,
                        },
                    ));
                }

                self.apply_accesses(registry, index, &dispatch.label, &accesses)
            }
            CullOp::Barrier(barrier) => self.apply_barrier(registry, index, barrier),
            CullOp::Consume(consume) => {
                self.device_work_recorded = true;
                let source = &consume.source;
                let mut accesses = vec![
                    (
                        Stage::DRAW_INDIRECT,
                        Touch {
                            region: Region::Buffer(source.draw_slice()),
                            access: Access::INDIRECT_READ,
                        },
                    ),
                    (
                        Stage::DRAW_INDIRECT,
                        Touch {
                            region: Region::Buffer(source.count_slice()),
                            access: Access::INDIRECT_READ,
                        },
                    ),
                    (
                        Stage::VERTEX_INPUT,
                        Touch {
                            region: Region::Buffer(source.index_buffer),
                            access: Access::INDEX_READ,
                        },
                    ),
                ];
                if let Some(depth) = consume.depth {
                    accesses.push((
                        Stage::LATE_FRAGMENT_TESTS,
                        Touch {
                            region: Region::Texture {
                                texture: depth,
                                mips: 0..1,
                            },
                            access: Access::DEPTH_ATTACHMENT_READ | Access::DEPTH_ATTACHMENT_WRITE,
                        },
                    ));
                }
                let label = format!("consume {} batch {}", consume.pass.label(), consume.batch_index);
                self.apply_accesses(registry, index, &label, &accesses)
            }
        }
    }

    fn apply_accesses(
        &mut self,
        registry: &ResourceRegistry,
        index: usize,
        label: &str,
        accesses: &[(Stage, Touch)],
    ) -> CullResult<()> {
        // Check everything first so touches of the same op never conflict
        for (stage, touch) in accesses {
            match &touch.region {
                Region::Buffer(slice) => {
                    let desc = registry.buffer(slice.buffer)?;
                    if slice.end() > desc.size {
                        return Err(CullError::hazard(
                            index,
                            label,
                            format!("access {}..{} past the end of '{}'", slice.offset, slice.end(), desc.label),
                        ));
                    }
                    let range = slice.offset..slice.end();
                    if let Some(pending) = self.buffers.get(&slice.buffer) {
                        check_pending(pending, &range, *stage, touch.access, index)
                            .map_err(|detail| CullError::hazard(index, label, format!("'{}': {}", desc.label, detail)))?;
                    }
                }
                Region::Texture { texture, mips } => {
                    let desc = registry.texture(*texture)?;
                    for mip in mips.clone() {
                        let state = self.mip_state(registry, *texture, mip)?;
                        if !layout_allows(state.layout, touch.access) {
                            return Err(CullError::hazard(
                                index,
                                label,
                                format!("'{}' mip {} in layout {:?} for {:?}", desc.label, mip, state.layout, touch.access),
                            ));
                        }
                        check_pending(&state.pending, &MIP_RANGE, *stage, touch.access, index).map_err(|detail| {
                            CullError::hazard(index, label, format!("'{}' mip {}: {}", desc.label, mip, detail))
                        })?;
                    }
                }
            }
        }

        for (stage, touch) in accesses {
            let entry = |range: Range<u64>| Pending {
                range,
                op: index,
                stage: *stage,
                access: touch.access,
                visible_stages: Stage::empty(),
                visible_access: Access::empty(),
            };
            match &touch.region {
                Region::Buffer(slice) => {
                    let range = slice.offset..slice.end();
                    let pending = self.buffers.entry(slice.buffer).or_default();
                    record(pending, entry(range));
                }
                Region::Texture { texture, mips } => {
                    for mip in mips.clone() {
                        let state = self.mip_state(registry, *texture, mip)?;
                        record(&mut state.pending, entry(MIP_RANGE));
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_barrier(&mut self, registry: &ResourceRegistry, index: usize, barrier: &Barrier) -> CullResult<()> {
        match &barrier.target {
            BarrierTarget::Buffer(slice) => {
                registry.buffer(slice.buffer)?;
                let range = slice.offset..slice.end();
                if let Some(pending) = self.buffers.get_mut(&slice.buffer) {
                    // Only the covered bytes of a partly covered access become visible
                    let mut split = Vec::with_capacity(pending.len());
                    for entry in pending.drain(..) {
                        if !entry.overlaps(&range) {
                            split.push(entry);
                            continue;
                        }
                        let start = entry.range.start.max(range.start);
                        let end = entry.range.end.min(range.end);
                        if entry.range.start < start {
                            split.push(Pending {
                                range: entry.range.start..start,
                                ..entry.clone()
                            });
                        }
                        if end < entry.range.end {
                            split.push(Pending {
                                range: end..entry.range.end,
                                ..entry.clone()
                            });
                        }
                        let mut covered = Pending { range: start..end, ..entry };
                        make_visible(&mut covered, barrier);
                        split.push(covered);
                    }
                    *pending = split;
                }
                Ok(())
            }
            BarrierTarget::Texture {
                texture,
                mips,
                old_layout,
                new_layout,
            } => {
                let label = registry.texture(*texture)?.label.clone();
                for mip in mips.clone() {
                    let state = self.mip_state(registry, *texture, mip)?;
                    if *old_layout != TextureLayout::Undefined && state.layout != *old_layout {
                        return Err(CullError::hazard(
                            index,
                            &label,
                            format!(
                                "transition of mip {} from {:?} but image is in {:?}",
                                mip, old_layout, state.layout
                            ),
                        ));
                    }
                    // A layout transition is itself a write: it must be ordered after prior work
                    if *old_layout != *new_layout {
                        if let Some(p) = state.pending.iter().find(|p| !covered_by_source(p, barrier)) {
                            return Err(CullError::hazard(
                                index,
                                &label,
                                format!("transition of mip {} not ordered after op {}", mip, p.op),
                            ));
                        }
                    }
                    for entry in state.pending.iter_mut() {
                        make_visible(entry, barrier);
                    }
                    state.layout = *new_layout;
                }
                Ok(())
            }
        }
    }

    fn mip_state(&mut self, registry: &ResourceRegistry, texture: TextureHandle, mip: u32) -> CullResult<&mut MipState> {
        let desc = registry.texture(texture)?;
        if mip >= desc.mip_levels {
            return Err(CullError::hazard(
                0,
                &desc.label,
                format!("mip {} out of range ({} levels)", mip, desc.mip_levels),
            ));
        }
        let initial = if desc.imported {
            TextureLayout::DepthAttachment
        } else {
            TextureLayout::Undefined
        };
        Ok(self.mips.entry((texture, mip)).or_insert_with(|| MipState {
            layout: initial,
            pending: Vec::new(),
        }))
    }
}

/// A barrier covers an access it names directly, or one an earlier barrier
/// already chained into its source stages
fn covered_by_source(pending: &Pending, barrier: &Barrier) -> bool {
    let chained = barrier.src_stage.intersects(pending.visible_stages);
    let stage_ok = barrier.src_stage.contains(pending.stage) || chained;
    if pending.access.is_write() {
        stage_ok && (barrier.src_access.contains(pending.access & Access::WRITES) || chained)
    } else {
        stage_ok
    }
}

fn make_visible(entry: &mut Pending, barrier: &Barrier) {
    if covered_by_source(entry, barrier) {
        entry.visible_stages |= barrier.dst_stage;
        entry.visible_access |= barrier.dst_access;
    }
}

fn check_pending(pending: &[Pending], range: &Range<u64>, stage: Stage, access: Access, op: usize) -> Result<(), String> {
    for p in pending.iter().filter(|p| p.op != op && p.overlaps(range)) {
        if is_depth_test(p.stage, p.access) && is_depth_test(stage, access) {
            // Successive draws against one depth target are ordered by rasterization
            continue;
        }
        if p.access.is_write() {
            let needed = access & (Access::READS | Access::WRITES);
            if !p.visible_stages.contains(stage) || !p.visible_access.contains(needed) {
                let kind = if access.is_write() { "write-after-write" } else { "read-after-write" };
                return Err(format!(
                    "{} against op {} ({:?} {:?}) without a covering barrier",
                    kind, p.op, p.stage, p.access
                ));
            }
        } else if access.is_write() && !p.visible_stages.contains(stage) {
            return Err(format!(
                "write-after-read against op {} ({:?} {:?}) without an execution dependency",
                p.op, p.stage, p.access
            ));
        }
    }
    Ok(())
}

fn is_depth_test(stage: Stage, access: Access) -> bool {
    (Stage::EARLY_FRAGMENT_TESTS | Stage::LATE_FRAGMENT_TESTS).contains(stage)
        && (Access::DEPTH_ATTACHMENT_READ | Access::DEPTH_ATTACHMENT_WRITE).contains(access)
}

fn record(pending: &mut Vec<Pending>, entry: Pending) {
    if entry.access.is_write() {
        // A checked write supersedes everything it covers
        pending.retain(|p| !p.within(&entry.range));
    } else {
        pending.retain(|p| !(p.range == entry.range && !p.access.is_write() && p.stage == entry.stage));
    }
    pending.push(entry);
}

fn layout_allows(layout: TextureLayout, access: Access) -> bool {
    if access.intersects(Access::DEPTH_ATTACHMENT_READ | Access::DEPTH_ATTACHMENT_WRITE) {
        return layout == TextureLayout::DepthAttachment;
    }
    if access.contains(Access::SHADER_WRITE) {
        return layout == TextureLayout::General;
    }
    if access.contains(Access::SHADER_READ) {
        return matches!(layout, TextureLayout::ShaderReadOnly | TextureLayout::General);
    }
    true
}
