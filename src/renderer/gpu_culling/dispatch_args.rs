/// Indirect-dispatch-argument preparation
///
/// Turns the device-side visible meshlet count into the workgroup counts of
/// every sub-batch without a host readback. Each frame slot owns one
/// argument buffer with a region per pass:
///
/// ```text
/// [header: clamped count, batch count, 0, 0]
/// [batch 0: clear xyz, cull xyz, compact xyz]
/// [batch 1: ...]
/// ```
use super::commands::{Binding, CommandList, CullPass, DispatchSize, Kernel, KernelParams};
use super::cull_data::CullDataBuffers;
use super::gpu_types::{DISPATCH_ARGS_PER_BATCH, WORDS_PER_DISPATCH_ARGS, WORDS_PER_DISPATCH_HEADER};
use super::resources::BufferSlice;
use crate::config::CullLimits;
use crate::constants::workgroup;

/// Byte offsets inside one pass region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchArgsLayout {
    pub sub_batch_count: u32,
}

impl DispatchArgsLayout {
    pub fn new(limits: &CullLimits) -> Self {
        Self {
            sub_batch_count: limits.sub_batch_count(),
        }
    }

    pub fn region_words(&self) -> u32 {
        WORDS_PER_DISPATCH_HEADER + self.sub_batch_count * DISPATCH_ARGS_PER_BATCH * WORDS_PER_DISPATCH_ARGS
    }

    pub fn region_bytes(&self) -> u64 {
        self.region_words() as u64 * 4
    }

    fn batch_offset(&self, batch: u32, step: u32) -> u64 {
        debug_assert!(batch < self.sub_batch_count);
        let word = WORDS_PER_DISPATCH_HEADER + (batch * DISPATCH_ARGS_PER_BATCH + step) * WORDS_PER_DISPATCH_ARGS;
        word as u64 * 4
    }

    pub fn clear_offset(&self, batch: u32) -> u64 {
        self.batch_offset(batch, 0)
    }

    pub fn cull_offset(&self, batch: u32) -> u64 {
        self.batch_offset(batch, 1)
    }

    pub fn compact_offset(&self, batch: u32) -> u64 {
        self.batch_offset(batch, 2)
    }
}

/// Commands sub-batch `batch` holds for a visible count of `count`
pub fn batch_command_count(count: u32, batch: u32, limits: &CullLimits) -> u32 {
    let cap = limits.max_commands_per_batch();
    let clamped = count.min(limits.max_command_count());
    clamped.saturating_sub(batch * cap).min(cap)
}

/// Workgroup counts of the clear, cull and compact steps for `commands`
pub fn batch_workgroups(commands: u32) -> [u32; 3] {
    let linear = commands.div_ceil(workgroup::LINEAR);
    [linear, commands, linear]
}

pub struct DispatchArgsPrep;

impl DispatchArgsPrep {
    /// One workgroup; the argument region is guarded for indirect use afterwards
    pub fn record(cull_data: &CullDataBuffers, slot: u32, pass: CullPass, list: &mut CommandList) {
        let counter = cull_data.visible_meshlet_count(slot);
        let args: BufferSlice = cull_data.dispatch_args(slot, pass);

        list.dispatch(
            format!("prepare batch dispatch ({})", pass.label()),
            Kernel::PrepareBatchDispatch,
            KernelParams {
                frame_slot: slot,
                ..KernelParams::pass(pass)
            },
            vec![
                Binding::uniform(cull_data.cull_data(slot)),
                Binding::storage_rw(counter).reads(counter),
                Binding::storage_rw(args).writes(args),
            ],
            DispatchSize::Direct([1, 1, 1]),
        );
        list.indirect_barrier(args);
        // The next counter clear must wait for this read
        list.compute_barrier(counter);
        log::debug!("[DispatchArgsPrep] recorded for slot {} ({})", slot, pass.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limits() -> CullLimits {
        CullLimits {
            max_draw_indirect_calls: 8,
            ..CullLimits::default()
        }
    }

    #[test]
    fn commands_split_into_capped_batches() {
        let limits = small_limits();
        assert_eq!(limits.sub_batch_count(), 2);

        let split = |count| (0..2).map(|k| batch_command_count(count, k, &limits)).collect::<Vec<_>>();
        assert_eq!(split(0), vec![0, 0]);
        assert_eq!(split(5), vec![5, 0]);
        assert_eq!(split(8), vec![8, 0]);
        assert_eq!(split(9), vec![8, 1]);
        assert_eq!(split(16), vec![8, 8]);
        // Clamped to the command capacity
        assert_eq!(split(100), vec![8, 8]);
    }

    #[test]
    fn workgroups_per_step() {
        assert_eq!(batch_workgroups(0), [0, 0, 0]);
        assert_eq!(batch_workgroups(1), [1, 1, 1]);
        assert_eq!(batch_workgroups(65), [2, 65, 2]);
    }

    #[test]
    fn region_offsets_are_disjoint() {
        let layout = DispatchArgsLayout::new(&small_limits());
        assert_eq!(layout.region_words(), 4 + 2 * 9);
        assert_eq!(layout.clear_offset(0), 16);
        assert_eq!(layout.cull_offset(0), 28);
        assert_eq!(layout.compact_offset(0), 40);
        assert_eq!(layout.clear_offset(1), 52);
        assert_eq!(layout.compact_offset(1) + 12, layout.region_bytes());
    }
}
