//! Consumer side of the Aero command-buffer channel.
//!
//! A [`GpuScheduler`] watches the put offset a [`CommandBufferService`] receives from the
//! producer, walks the ring with a [`CommandParser`] and hands each command to an
//! [`AsyncApiHandler`] such as the [`CommonDecoder`]. Shared memory is looked up by id
//! through the [`TransferBufferManager`].
//!
//! [`DirectCommandBuffer`] runs all of this on the producer's thread; for a threaded setup,
//! hand a [`SharedCommandBuffer`] to the producer and call [`GpuScheduler::run`] on a
//! service thread.

mod common_decoder;
mod config;
mod direct;
mod parser;
mod scheduler;
mod service;
mod stats;
mod transfer_buffer_manager;

pub use common_decoder::{Bucket, CommandBufferEngine, CommonDecoder};
pub use config::{DecoderConfig, SchedulerConfig};
pub use direct::DirectCommandBuffer;
pub use parser::{AsyncApiHandler, CommandParser, CommandStatus, HandlerResult, ParserSetupError};
pub use scheduler::{GpuScheduler, PreemptionFlag};
pub use service::{CommandBufferService, ControlSnapshot, ServiceState, SharedCommandBuffer};
pub use stats::{SchedulerStats, SchedulerStatsSnapshot};
pub use transfer_buffer_manager::{TransferBufferManager, TransferBufferStats};
