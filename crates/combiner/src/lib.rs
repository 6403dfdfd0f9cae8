//! combiner: merges weighted input queues into a single output channel.
//!
//! A [`Combiner`] repeatedly picks one registered queue at random, weighted by
//! priority, polls it for up to that queue's timeout and forwards whatever it
//! gets to the output sink. Queues can be added and removed while the loop runs.

mod combiner;
mod config;
mod error;
pub mod logging;
pub mod queue;
pub mod registry;
mod slot;
mod stats;

pub use combiner::Combiner;
pub use config::CombinerConfig;
pub use error::CombinerError;
pub use queue::{ChannelQueue, InputQueue, Polled, QueueHandle, TimeUnit, same_queue};
pub use registry::{MAX_EMPTY_TIMEOUT, MAX_PRIORITY, SlotRegistry, pick_index};
pub use slot::{SelectedSlot, SlotId};
pub use stats::{CombinerStats, StatsSnapshot};
pub use tokio_util::sync::CancellationToken;
