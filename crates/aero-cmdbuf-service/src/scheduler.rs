//! Drives a [`CommandParser`] over the bound ring whenever the producer moves put.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aero_cmdbuf_protocol::ErrorCode;

use crate::config::SchedulerConfig;
use crate::parser::{AsyncApiHandler, CommandParser, CommandStatus};
use crate::service::CommandBufferService;
use crate::stats::SchedulerStats;

/// Shared flag another thread raises to make the scheduler yield between commands.
#[derive(Clone, Debug, Default)]
pub struct PreemptionFlag(Arc<AtomicBool>);

impl PreemptionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct GpuScheduler<H> {
    service: Arc<CommandBufferService>,
    handler: H,
    parser: CommandParser,
    config: SchedulerConfig,
    preemption_flag: Option<PreemptionFlag>,
    was_preempted: bool,
    scheduled: bool,
    set_get_buffer_count: u32,
    command_processed: Option<Box<dyn FnMut() + Send>>,
    stats: Arc<SchedulerStats>,
}

impl<H: AsyncApiHandler> GpuScheduler<H> {
    pub fn new(service: Arc<CommandBufferService>, handler: H, config: SchedulerConfig) -> Self {
        let set_get_buffer_count = service.control().set_get_buffer_count;
        let mut scheduler = Self {
            service,
            handler,
            parser: CommandParser::new(),
            config,
            preemption_flag: None,
            was_preempted: false,
            scheduled: true,
            set_get_buffer_count,
            command_processed: None,
            stats: Arc::new(SchedulerStats::new()),
        };
        // Pick up a ring bound before the scheduler existed.
        let ring_id = scheduler.service.control().ring_buffer_id;
        if ring_id > 0 {
            scheduler.set_get_buffer(ring_id);
        }
        scheduler
    }

    pub fn service(&self) -> &Arc<CommandBufferService> {
        &self.service
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn parser(&self) -> &CommandParser {
        &self.parser
    }

    pub fn stats(&self) -> &Arc<SchedulerStats> {
        &self.stats
    }

    pub fn set_preemption_flag(&mut self, flag: Option<PreemptionFlag>) {
        self.preemption_flag = flag;
        self.was_preempted = false;
    }

    /// Run `callback` after every successfully processed command.
    pub fn set_command_processed_callback(&mut self, callback: impl FnMut() + Send + 'static) {
        self.command_processed = Some(Box::new(callback));
    }

    pub fn set_scheduled(&mut self, scheduled: bool) {
        if self.scheduled != scheduled {
            tracing::trace!(scheduled, "scheduling changed");
        }
        self.scheduled = scheduled;
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    pub fn is_preempted(&mut self) -> bool {
        let Some(flag) = self.preemption_flag.as_ref() else {
            return false;
        };
        let preempted = flag.is_set();
        if preempted && !self.was_preempted {
            tracing::trace!("preempted");
            self.stats.inc_preemptions();
        }
        self.was_preempted = preempted;
        preempted
    }

    /// Commands are pending and the channel has not failed.
    pub fn has_more_work(&self) -> bool {
        !self.parser.is_empty() && !self.service.last_state().is_error()
    }

    /// Parse transfer buffer `id` as the ring, from get 0.
    pub fn set_get_buffer(&mut self, id: i32) -> bool {
        let Some(ring) = self.service.get_transfer_buffer(id) else {
            return false;
        };
        if let Err(err) = self.parser.set_buffer(&ring, 0, ring.size()) {
            tracing::warn!(id, error = %err, "cannot parse transfer buffer as a ring");
            return false;
        }
        self.set_get_offset(0)
    }

    pub fn set_get_offset(&mut self, offset: i32) -> bool {
        if !self.parser.set_get(offset) {
            return false;
        }
        self.service.set_get_offset(self.parser.get());
        true
    }

    pub fn get_offset(&self) -> i32 {
        self.parser.get()
    }

    fn sync_ring_binding(&mut self, ring_buffer_id: i32, set_get_buffer_count: u32) {
        if set_get_buffer_count == self.set_get_buffer_count {
            return;
        }
        self.set_get_buffer_count = set_get_buffer_count;
        if !self.set_get_buffer(ring_buffer_id) {
            self.parser.clear_buffer();
        }
    }

    /// Process commands up to the producer's latest put.
    pub fn put_changed(&mut self) {
        let control = self.service.control();
        self.sync_ring_binding(control.ring_buffer_id, control.set_get_buffer_count);
        if !self.parser.has_buffer() {
            return;
        }
        if !self.parser.set_put(control.put_offset) {
            tracing::warn!(put = control.put_offset, "put offset outside the parser's ring");
            return;
        }

        if self.service.last_state().is_error() || !self.scheduled {
            return;
        }

        self.stats.inc_passes();
        let mut processed = 0usize;
        let mut failed = false;
        while !self.parser.is_empty() {
            if self.is_preempted() || !self.scheduled {
                break;
            }
            if self
                .config
                .commands_per_slice
                .is_some_and(|limit| processed >= limit)
            {
                break;
            }

            let result = self.parser.process_command(&mut self.handler);
            if result == Ok(CommandStatus::DeferUntilLater) {
                self.stats.inc_deferrals();
                break;
            }
            processed += 1;
            self.service.set_get_offset(self.parser.get());

            if let Err(err) = result {
                self.stats.inc_errors();
                self.service
                    .set_context_lost_reason(self.handler.context_lost_reason());
                self.service.set_parse_error(err.code());
                failed = true;
                break;
            }
            self.stats.inc_commands_processed();
            if let Some(callback) = self.command_processed.as_mut() {
                callback();
            }
        }

        if !failed && self.handler.was_context_lost() {
            let reason = self.handler.context_lost_reason();
            tracing::warn!(?reason, "handler lost its context");
            self.service.set_context_lost_reason(reason);
            self.service.set_parse_error(ErrorCode::LostContext);
        }
    }

    /// Process flushes until the service shuts down.
    ///
    /// Sleeps on the service while nothing is runnable. A pass that made no progress
    /// (preempted or deferred) is retried every `preemption_poll_interval` or on the next
    /// flush, whichever comes first.
    pub fn run(&mut self) {
        let mut seen = 0;
        let mut stalled = false;
        loop {
            let control = if !self.has_more_work() || !self.scheduled {
                self.service.wait_for_flush(seen)
            } else if stalled || self.is_preempted() {
                self.service
                    .wait_for_flush_timeout(seen, self.config.preemption_poll_interval)
            } else {
                self.service.control()
            };
            if control.shut_down {
                break;
            }
            seen = control.change_count;

            let before = self.parser.get();
            self.put_changed();
            stalled = self.parser.get() == before;
        }
        tracing::debug!(get = self.parser.get(), "scheduler stopped");
    }
}
