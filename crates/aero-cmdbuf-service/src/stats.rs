use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of scheduler counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStatsSnapshot {
    pub passes: u64,
    pub commands_processed: u64,
    pub preemptions: u64,
    pub deferrals: u64,
    pub errors: u64,
}

/// Scheduler counters.
///
/// Updated on the scheduler thread; safe to read from any other thread.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    passes: AtomicU64,
    commands_processed: AtomicU64,
    preemptions: AtomicU64,
    deferrals: AtomicU64,
    errors: AtomicU64,
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_passes(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commands_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_preemptions(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deferrals(&self) {
        self.deferrals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            commands_processed: self.commands_processed.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            deferrals: self.deferrals.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let stats = SchedulerStats::new();
        assert_eq!(stats.snapshot(), SchedulerStatsSnapshot::default());

        stats.inc_passes();
        stats.inc_commands_processed();
        stats.inc_commands_processed();
        stats.inc_errors();

        let snap = stats.snapshot();
        assert_eq!(snap.passes, 1);
        assert_eq!(snap.commands_processed, 2);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.preemptions, 0);
    }
}
