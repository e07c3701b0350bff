use std::time::Duration;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Upper bound on commands processed per [`put_changed`](crate::GpuScheduler::put_changed)
    /// pass. `None` processes until the ring is empty.
    pub commands_per_slice: Option<usize>,
    /// How often [`run`](crate::GpuScheduler::run) retries a pass that was preempted or
    /// deferred. Lowering the preemption flag does not wake the service thread.
    pub preemption_poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            commands_per_slice: None,
            preemption_poll_interval: Duration::from_millis(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DecoderConfig {
    /// Largest size SetBucketSize may request.
    pub max_bucket_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_bucket_size: 16 * 1024 * 1024,
        }
    }
}
