/// Batched triangle cull and compaction
///
/// The meshlet commands of a pass are processed in sub-batches of at most
/// `max_commands_per_batch`. Every sub-batch runs four steps on one slot of
/// a small ring of scratch batches:
///
/// 1. clear the slot's scratch commands and counters (indirect)
/// 2. triangle cull, one workgroup per command, appending surviving
///    indices to the slot's index slice (indirect)
/// 3. clear the draw counter (direct, one workgroup)
/// 4. compact non-empty scratch commands into the final draw slice (indirect)
///
/// and is then handed to the rasterizer. A slot is reused only after the
/// consumer of its previous occupant was recorded.
use super::commands::{
    Access, Barrier, BarrierTarget, Binding, CommandList, Consume, CullPass, DispatchSize, IndirectDrawSource, Kernel,
    KernelParams, Stage,
};
use super::cull_data::CullDataBuffers;
use super::depth_pyramid::DepthPyramid;
use super::gpu_types::{
    DrawIndexedIndirect, MeshletDrawCommand, WORDS_PER_BATCH_COUNTERS, WORDS_PER_DISPATCH_HEADER, WORDS_PER_DRAW,
};
use super::resources::{BufferHandle, BufferSlice, BufferUsage, CullContext};
use super::scene::SceneBuffers;
use crate::config::CullLimits;
use crate::error::{CullError, CullResult};

/// Word layout of the ring allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLayout {
    pub capacity: u32,
    pub overlap: u32,
    /// Counters, scratch commands, final commands
    pub draw_stride_words: u32,
    pub index_stride_words: u32,
}

impl BatchLayout {
    pub fn new(limits: &CullLimits) -> Self {
        let capacity = limits.max_commands_per_batch();
        Self {
            capacity,
            overlap: limits.batch_overlap,
            draw_stride_words: WORDS_PER_BATCH_COUNTERS + 2 * capacity * WORDS_PER_DRAW,
            index_stride_words: limits.max_triangles_per_batch() * 3,
        }
    }

    pub fn scratch_offset_words(&self) -> u32 {
        WORDS_PER_BATCH_COUNTERS
    }

    pub fn final_offset_words(&self) -> u32 {
        WORDS_PER_BATCH_COUNTERS + self.capacity * WORDS_PER_DRAW
    }
}

/// One ring slot: a private slice of the shared draw and index allocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CullDrawBatch {
    pub slot: u32,
    pub capacity: u32,
    /// Counters, scratch and final commands of this slot
    pub draws: BufferSlice,
    pub indices: BufferSlice,
}

impl CullDrawBatch {
    fn new(layout: &BatchLayout, slot: u32, draws: BufferHandle, indices: BufferHandle) -> Self {
        Self {
            slot,
            capacity: layout.capacity,
            draws: BufferSlice {
                buffer: draws,
                offset: slot as u64 * layout.draw_stride_words as u64 * 4,
                size: layout.draw_stride_words as u64 * 4,
            },
            indices: BufferSlice {
                buffer: indices,
                offset: slot as u64 * layout.index_stride_words as u64 * 4,
                size: layout.index_stride_words as u64 * 4,
            },
        }
    }

    pub fn counters(&self) -> BufferSlice {
        self.draws.sub(0, WORDS_PER_BATCH_COUNTERS as u64 * 4)
    }

    pub fn draw_count(&self) -> BufferSlice {
        self.draws.sub(0, 4)
    }

    fn draw_bytes(&self) -> u64 {
        self.capacity as u64 * std::mem::size_of::<DrawIndexedIndirect>() as u64
    }

    pub fn scratch(&self) -> BufferSlice {
        self.draws.sub(WORDS_PER_BATCH_COUNTERS as u64 * 4, self.draw_bytes())
    }

    pub fn final_draws(&self) -> BufferSlice {
        self.draws
            .sub(WORDS_PER_BATCH_COUNTERS as u64 * 4 + self.draw_bytes(), self.draw_bytes())
    }

    /// What the rasterizer binds for a multi-draw-indirect-count call
    pub fn indirect_source(&self) -> IndirectDrawSource {
        let final_draws = self.final_draws();
        IndirectDrawSource {
            draws: final_draws.buffer,
            draw_offset: final_draws.offset,
            draw_stride: std::mem::size_of::<DrawIndexedIndirect>() as u64,
            count_buffer: self.draws.buffer,
            count_offset: self.draw_count().offset,
            max_count: self.capacity,
            index_buffer: self.indices,
        }
    }
}

/// Claim on a ring slot, valid until released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchTicket {
    pub slot: u32,
    pub generation: u32,
}

/// Ring of batch slots with generational occupancy tracking
#[derive(Debug, Clone)]
pub struct BatchRing {
    next: u32,
    generations: Vec<u32>,
    in_flight: Vec<bool>,
    used_this_frame: Vec<bool>,
}

impl BatchRing {
    pub fn new(depth: u32) -> Self {
        assert!(depth > 0, "batch ring needs at least one slot");
        Self {
            next: 0,
            generations: vec![0; depth as usize],
            in_flight: vec![false; depth as usize],
            used_this_frame: vec![false; depth as usize],
        }
    }

    pub fn depth(&self) -> u32 {
        self.generations.len() as u32
    }

    /// Claim the next slot. The flag is set when the slot already served a
    /// batch since the last reset and needs a write-after-read barrier.
    pub fn try_next_sub_batch(&mut self) -> CullResult<(BatchTicket, bool)> {
        let slot = self.next;
        let index = slot as usize;
        if self.in_flight[index] {
            return Err(CullError::BatchSlotInFlight {
                slot,
                generation: self.generations[index],
            });
        }

        self.generations[index] = self.generations[index].wrapping_add(1);
        self.in_flight[index] = true;
        let reused = std::mem::replace(&mut self.used_this_frame[index], true);
        self.next = (slot + 1) % self.depth();

        Ok((
            BatchTicket {
                slot,
                generation: self.generations[index],
            },
            reused,
        ))
    }

    /// `try_next_sub_batch` for callers that release every ticket in order
    pub fn next_sub_batch(&mut self) -> (BatchTicket, bool) {
        match self.try_next_sub_batch() {
            Ok(claim) => claim,
            Err(err) => panic!("batch ring overrun: {}", err),
        }
    }

    /// Mark the slot free once its consumer has been recorded
    pub fn release(&mut self, ticket: BatchTicket) -> CullResult<()> {
        let index = ticket.slot as usize;
        match self.generations.get(index) {
            Some(&generation) if generation == ticket.generation && self.in_flight[index] => {
                self.in_flight[index] = false;
                Ok(())
            }
            _ => Err(CullError::StaleHandle {
                kind: "batch ticket",
                index: ticket.slot,
                generation: ticket.generation,
            }),
        }
    }

    pub fn is_in_flight(&self, slot: u32) -> bool {
        self.in_flight.get(slot as usize).copied().unwrap_or(false)
    }

    /// Start a new frame at slot 0
    pub fn reset_sub_batches(&mut self) {
        debug_assert!(
            self.in_flight.iter().all(|f| !f),
            "reset with batch slots still in flight"
        );
        self.next = 0;
        self.used_this_frame.iter_mut().for_each(|u| *u = false);
    }
}

pub struct SceneBatchCull {
    limits: CullLimits,
    layout: BatchLayout,
    ring: BatchRing,
    batches: Vec<CullDrawBatch>,
    batch_draws: BufferHandle,
    batch_indices: BufferHandle,
}

impl SceneBatchCull {
    pub fn new(ctx: &mut CullContext, limits: &CullLimits) -> CullResult<Self> {
        limits.validate()?;
        let layout = BatchLayout::new(limits);

        let batch_draws = ctx.resources.create_buffer(
            "batch draws",
            layout.draw_stride_words as u64 * 4 * layout.overlap as u64,
            BufferUsage::STORAGE | BufferUsage::INDIRECT | BufferUsage::COPY_SRC,
        );
        let batch_indices = ctx.resources.create_buffer(
            "batch indices",
            layout.index_stride_words as u64 * 4 * layout.overlap as u64,
            BufferUsage::STORAGE | BufferUsage::INDEX | BufferUsage::COPY_SRC,
        );
        let batches = (0..layout.overlap)
            .map(|slot| CullDrawBatch::new(&layout, slot, batch_draws, batch_indices))
            .collect();

        log::info!(
            "[SceneBatchCull] {} slots of {} commands / {} triangles",
            layout.overlap,
            layout.capacity,
            limits.max_triangles_per_batch()
        );

        Ok(Self {
            limits: *limits,
            layout,
            ring: BatchRing::new(layout.overlap),
            batches,
            batch_draws,
            batch_indices,
        })
    }

    pub fn layout(&self) -> &BatchLayout {
        &self.layout
    }

    pub fn batch(&self, slot: u32) -> &CullDrawBatch {
        &self.batches[slot as usize]
    }

    pub fn ring(&self) -> &BatchRing {
        &self.ring
    }

    pub fn reset_sub_batches(&mut self) {
        self.ring.reset_sub_batches();
    }

    /// Batches the host records for a pass, from host-known bounds only.
    /// Batches beyond the device-side count dispatch zero workgroups.
    pub fn read_back_batch_count(&self, potential_commands: u32) -> u32 {
        let clamped = potential_commands.min(self.limits.max_command_count());
        clamped
            .div_ceil(self.limits.max_commands_per_batch())
            .min(self.limits.sub_batch_count())
    }

    /// Record `batch_count` sub-batches of one pass, each followed by its consumer
    #[allow(clippy::too_many_arguments)]
    pub fn record_pass(
        &mut self,
        ctx: &CullContext,
        cull_data: &CullDataBuffers,
        scene: &SceneBuffers,
        pyramid: &DepthPyramid,
        slot: u32,
        pass: CullPass,
        pyramid_valid: bool,
        batch_count: u32,
        list: &mut CommandList,
    ) -> CullResult<()> {
        debug_assert!(batch_count <= self.limits.sub_batch_count());
        let args = cull_data.dispatch_args(slot, pass);
        let args_header = args.sub(0, WORDS_PER_DISPATCH_HEADER as u64 * 4);
        let args_layout = *cull_data.args_layout();
        let commands = cull_data.meshlet_commands();
        let command_bytes = std::mem::size_of::<MeshletDrawCommand>() as u64;
        let draws_whole = ctx.resources.whole(self.batch_draws)?;
        let indices_whole = ctx.resources.whole(self.batch_indices)?;
        let visibility_whole = ctx.resources.whole(cull_data.visibility_buffer())?;

        for batch_index in 0..batch_count {
            let (ticket, reused) = self.ring.next_sub_batch();
            let batch = self.batches[ticket.slot as usize];
            let params = KernelParams {
                batch_index,
                ring_slot: ticket.slot,
                frame_slot: slot,
                pyramid_valid: pyramid_valid as u32,
                ..KernelParams::pass(pass)
            };

            if reused {
                for target in [batch.draws, batch.indices] {
                    list.barrier(Barrier {
                        src_stage: Stage::DRAW_INDIRECT | Stage::VERTEX_INPUT,
                        src_access: Access::INDIRECT_READ | Access::INDEX_READ,
                        dst_stage: Stage::COMPUTE,
                        dst_access: Access::SHADER_READ | Access::SHADER_WRITE,
                        target: BarrierTarget::Buffer(target),
                    });
                }
            }

            // 1. clear
            list.dispatch(
                format!("batch clear {} ({})", batch_index, pass.label()),
                Kernel::BatchClear,
                params,
                vec![
                    Binding::uniform(cull_data.cull_data(slot)),
                    Binding::storage_read(args_header),
                    Binding::storage_rw(draws_whole)
                        .writes(batch.counters())
                        .writes(batch.scratch()),
                ],
                DispatchSize::Indirect {
                    buffer: args.buffer,
                    offset: args.offset + args_layout.clear_offset(batch_index),
                },
            );
            list.compute_barrier(batch.draws);

            // 2. triangle cull
            let first = batch_index as u64 * batch.capacity as u64 * command_bytes;
            let batch_commands = commands.sub(first, (batch.capacity as u64 * command_bytes).min(commands.size - first));
            list.dispatch(
                format!("triangle cull {} ({})", batch_index, pass.label()),
                Kernel::TriangleCull(pass),
                params,
                vec![
                    Binding::uniform(cull_data.cull_data(slot)),
                    Binding::storage_read(ctx.resources.whole(scene.objects)?),
                    Binding::storage_read(ctx.resources.whole(scene.meshlets)?),
                    Binding::storage_read(ctx.resources.whole(scene.vertices)?),
                    Binding::storage_read(ctx.resources.whole(scene.meshlet_data)?),
                    Binding::storage_read(batch_commands),
                    Binding::storage_rw(visibility_whole).read_writes(cull_data.triangle_visibility()),
                    Binding::storage_rw(draws_whole).read_writes(batch.draws),
                    Binding::storage_rw(indices_whole).writes(batch.indices),
                    Binding::sampled(pyramid.texture(), 0..pyramid.mip_levels()),
                ],
                DispatchSize::Indirect {
                    buffer: args.buffer,
                    offset: args.offset + args_layout.cull_offset(batch_index),
                },
            );
            list.compute_barrier(batch.draws);
            list.compute_barrier(cull_data.triangle_visibility());

            // 3. count clear
            list.dispatch(
                format!("batch count clear {} ({})", batch_index, pass.label()),
                Kernel::BatchCountClear,
                params,
                vec![
                    Binding::uniform(cull_data.cull_data(slot)),
                    Binding::storage_read(args_header),
                    Binding::storage_rw(draws_whole).writes(batch.draw_count()),
                ],
                DispatchSize::Direct([1, 1, 1]),
            );
            list.compute_barrier(batch.draws);

            // 4. compact
            list.dispatch(
                format!("batch compact {} ({})", batch_index, pass.label()),
                Kernel::BatchCompact,
                params,
                vec![
                    Binding::uniform(cull_data.cull_data(slot)),
                    Binding::storage_read(args_header),
                    Binding::storage_rw(draws_whole).read_writes(batch.draws),
                ],
                DispatchSize::Indirect {
                    buffer: args.buffer,
                    offset: args.offset + args_layout.compact_offset(batch_index),
                },
            );
            for target in [batch.draws, batch.indices] {
                list.barrier(Barrier {
                    src_stage: Stage::COMPUTE,
                    src_access: Access::SHADER_WRITE,
                    dst_stage: Stage::DRAW_INDIRECT | Stage::VERTEX_INPUT,
                    dst_access: Access::INDIRECT_READ | Access::INDEX_READ,
                    target: BarrierTarget::Buffer(target),
                });
            }

            list.consume(Consume {
                pass,
                batch_index,
                ring_slot: ticket.slot,
                source: batch.indirect_source(),
                depth: Some(pyramid.depth()),
            });
            self.ring.release(ticket)?;
            log::trace!(
                "[SceneBatchCull] batch {} on slot {} ({})",
                batch_index,
                ticket.slot,
                pass.label()
            );
        }

        log::debug!("[SceneBatchCull] {} batches ({})", batch_count, pass.label());
        Ok(())
    }

    pub fn destroy(self, ctx: &mut CullContext) {
        ctx.resources.destroy_buffer(self.batch_draws);
        ctx.resources.destroy_buffer(self.batch_indices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_refuses_slot_still_in_flight() {
        let mut ring = BatchRing::new(2);
        let (a, _) = ring.try_next_sub_batch().unwrap();
        let (b, _) = ring.try_next_sub_batch().unwrap();
        assert_eq!((a.slot, b.slot), (0, 1));

        let err = ring.try_next_sub_batch().unwrap_err();
        assert!(matches!(err, CullError::BatchSlotInFlight { slot: 0, .. }));

        ring.release(a).unwrap();
        let (c, reused) = ring.try_next_sub_batch().unwrap();
        assert_eq!(c.slot, 0);
        assert!(reused);
        assert_ne!(c.generation, a.generation);
    }

    #[test]
    fn stale_ticket_release_fails() {
        let mut ring = BatchRing::new(1);
        let (first, _) = ring.next_sub_batch();
        ring.release(first).unwrap();
        let (_second, _) = ring.next_sub_batch();
        assert!(ring.release(first).is_err());
    }

    #[test]
    fn reset_starts_a_fresh_frame() {
        let mut ring = BatchRing::new(2);
        let (t, _) = ring.next_sub_batch();
        ring.release(t).unwrap();
        ring.reset_sub_batches();
        let (t, reused) = ring.next_sub_batch();
        assert_eq!(t.slot, 0);
        assert!(!reused);
    }

    #[test]
    fn batch_count_bounded_by_host_quantities() {
        let limits = CullLimits {
            max_draw_indirect_calls: 8,
            ..CullLimits::default()
        };
        let cull = SceneBatchCull::new(&mut CullContext::new(), &limits).unwrap();
        assert_eq!(cull.read_back_batch_count(0), 0);
        assert_eq!(cull.read_back_batch_count(8), 1);
        assert_eq!(cull.read_back_batch_count(9), 2);
        assert_eq!(cull.read_back_batch_count(1000), 2);
    }

    #[test]
    fn slot_regions_do_not_overlap() {
        let limits = CullLimits {
            max_draw_indirect_calls: 8,
            batch_overlap: 3,
            ..CullLimits::default()
        };
        let cull = SceneBatchCull::new(&mut CullContext::new(), &limits).unwrap();
        for a in 0..3 {
            let batch = cull.batch(a);
            assert!(batch.scratch().offset >= batch.counters().end());
            assert!(batch.final_draws().offset >= batch.scratch().end());
            assert_eq!(batch.final_draws().end(), batch.draws.end());
            for b in (a + 1)..3 {
                assert!(!batch.draws.overlaps(&cull.batch(b).draws));
                assert!(!batch.indices.overlaps(&cull.batch(b).indices));
            }
        }
    }
}
