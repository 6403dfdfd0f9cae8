//! Input queue capability and the bundled channel adapter.
//!
//! The combiner never owns queue storage. It only needs a handle that can be
//! polled with a bound and compared by identity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

/// Result of one bounded poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled<T> {
    Item(T),
    /// Nothing arrived before the timeout elapsed.
    TimedOut,
    /// The poll was cut short (source closed or cancelled). Handled like `TimedOut`.
    Interrupted,
}

impl<T> Polled<T> {
    pub fn is_item(&self) -> bool {
        matches!(self, Polled::Item(_))
    }

    pub fn into_item(self) -> Option<T> {
        match self {
            Polled::Item(item) => Some(item),
            Polled::TimedOut | Polled::Interrupted => None,
        }
    }
}

/// A FIFO source the combiner can poll.
#[async_trait]
pub trait InputQueue<T>: Send + Sync + 'static {
    /// Wait at most `timeout` for the next item.
    async fn poll(&self, timeout: Duration) -> Polled<T>;
}

/// Shared handle to an input queue. Identity is the allocation, not the contents.
pub type QueueHandle<T> = Arc<dyn InputQueue<T>>;

/// True when both handles point at the same queue allocation.
pub fn same_queue<T>(a: &QueueHandle<T>, b: &QueueHandle<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Unit in which a slot's empty-timeout is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn duration(self, value: u64) -> Duration {
        match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(value),
            TimeUnit::Microseconds => Duration::from_micros(value),
            TimeUnit::Milliseconds => Duration::from_millis(value),
            TimeUnit::Seconds => Duration::from_secs(value),
            TimeUnit::Minutes => Duration::from_secs(value.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(value.saturating_mul(3_600)),
            TimeUnit::Days => Duration::from_secs(value.saturating_mul(86_400)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Nanoseconds => "nanoseconds",
            TimeUnit::Microseconds => "microseconds",
            TimeUnit::Milliseconds => "milliseconds",
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
        }
    }
}

/// Input queue backed by a tokio mpsc receiver.
///
/// Once every sender is dropped and the buffer is drained, polls return
/// `Interrupted`, so the combiner retires the slot on its next visit.
pub struct ChannelQueue<T> {
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T: Send + 'static> ChannelQueue<T> {
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx: Mutex::new(rx) }
    }

    /// Create a bounded channel and return its sender plus a registrable handle.
    pub fn channel(capacity: usize) -> (mpsc::Sender<T>, QueueHandle<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Arc::new(Self::new(rx)))
    }
}

#[async_trait]
impl<T: Send + 'static> InputQueue<T> for ChannelQueue<T> {
    async fn poll(&self, timeout: Duration) -> Polled<T> {
        let recv = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        match tokio::time::timeout(timeout, recv).await {
            Ok(Some(item)) => Polled::Item(item),
            Ok(None) => Polled::Interrupted,
            Err(_) => Polled::TimedOut,
        }
    }
}
