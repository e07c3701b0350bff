//! Synchronous transport: the producer's flush runs the scheduler on the calling thread.

use std::sync::Arc;

use aero_cmdbuf_protocol::{in_range, Buffer, CommandBuffer, ContextLostReason, ErrorCode, State};

use crate::config::SchedulerConfig;
use crate::parser::AsyncApiHandler;
use crate::scheduler::GpuScheduler;
use crate::service::CommandBufferService;

pub struct DirectCommandBuffer<H> {
    service: Arc<CommandBufferService>,
    scheduler: GpuScheduler<H>,
}

impl<H: AsyncApiHandler> DirectCommandBuffer<H> {
    pub fn new(service: Arc<CommandBufferService>, handler: H, config: SchedulerConfig) -> Self {
        let scheduler = GpuScheduler::new(service.clone(), handler, config);
        Self { service, scheduler }
    }

    pub fn service(&self) -> &Arc<CommandBufferService> {
        &self.service
    }

    pub fn scheduler(&self) -> &GpuScheduler<H> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut GpuScheduler<H> {
        &mut self.scheduler
    }

    /// Run the scheduler until it runs out of work or stops making progress.
    fn pump(&mut self) {
        loop {
            let before = self.scheduler.get_offset();
            self.scheduler.put_changed();
            if !self.scheduler.has_more_work() || self.scheduler.get_offset() == before {
                return;
            }
        }
    }

    /// Nothing else can move this channel forward; fail it rather than block forever.
    fn lose_context(&self, what: &'static str) -> State {
        tracing::error!(what, get = self.scheduler.get_offset(), "wait cannot make progress");
        self.service.set_context_lost_reason(ContextLostReason::Unknown);
        self.service.set_parse_error(ErrorCode::LostContext);
        self.service.last_state()
    }
}

impl<H: AsyncApiHandler> CommandBuffer for DirectCommandBuffer<H> {
    fn get_last_state(&mut self) -> State {
        self.service.last_state()
    }

    fn flush(&mut self, put_offset: i32) {
        CommandBufferService::flush(&self.service, put_offset);
        self.pump();
    }

    fn wait_for_token_in_range(&mut self, start: i32, end: i32) -> State {
        self.pump();
        let state = self.service.last_state();
        if state.is_error() || in_range(start, end, state.token) {
            return state;
        }
        self.lose_context("token")
    }

    fn wait_for_get_offset_in_range(&mut self, start: i32, end: i32) -> State {
        self.pump();
        let state = self.service.last_state();
        if state.is_error() || in_range(start, end, state.get_offset) {
            return state;
        }
        self.lose_context("get offset")
    }

    fn set_get_buffer(&mut self, id: i32) {
        CommandBufferService::set_get_buffer(&self.service, id);
        self.scheduler.put_changed();
    }

    fn create_transfer_buffer(&mut self, size: usize) -> Option<(i32, Buffer)> {
        CommandBufferService::create_transfer_buffer(&self.service, size)
    }

    fn destroy_transfer_buffer(&mut self, id: i32) {
        CommandBufferService::destroy_transfer_buffer(&self.service, id);
    }
}
