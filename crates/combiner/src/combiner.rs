//! Combiner - merges weighted input queues into one output channel.
//!
//! Flow per iteration of the driver loop:
//! 1. Select a slot at random, weighted by priority, and mark it in flight
//! 2. Poll its queue for up to the slot's timeout (registry lock released)
//! 3. Remove the slot if the poll came back empty or a removal was deferred
//! 4. Forward a retrieved item to the output sink
//!
//! Stopping is cooperative: the loop checks its cancellation token before each
//! selection, never during a poll or a forward.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::CombinerConfig;
use crate::error::CombinerError;
use crate::queue::{QueueHandle, TimeUnit};
use crate::registry::{Removal, SlotRegistry};
use crate::stats::{CombinerStats, StatsSnapshot};

/// Weighted multiplexer over a dynamic set of input queues.
///
/// Registration calls may come from any thread while the loop runs. The loop
/// is started at most once; after `stop` the combiner cannot run again.
/// Dropping the combiner stops its loop.
pub struct Combiner<T> {
    registry: Arc<SlotRegistry<T>>,
    output: mpsc::Sender<T>,
    cancel: CancellationToken,
    started: AtomicBool,
    stats: Arc<CombinerStats>,
    config: CombinerConfig,
}

impl<T: Send + 'static> Combiner<T> {
    pub fn new(output: mpsc::Sender<T>) -> Self {
        Self::with_config(output, CombinerConfig::default())
    }

    pub fn with_config(output: mpsc::Sender<T>, config: CombinerConfig) -> Self {
        Self::from_registry(output, config, SlotRegistry::new())
    }

    /// Build a combiner whose selection draws come from `rng`.
    pub fn with_rng(
        output: mpsc::Sender<T>,
        config: CombinerConfig,
        rng: impl RngCore + Send + 'static,
    ) -> Self {
        Self::from_registry(output, config, SlotRegistry::with_rng(rng))
    }

    fn from_registry(
        output: mpsc::Sender<T>,
        config: CombinerConfig,
        registry: SlotRegistry<T>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            output,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            stats: Arc::new(CombinerStats::new()),
            config,
        }
    }

    /// Register `queue` with a selection weight and an empty-poll timeout.
    ///
    /// `priority` must lie in `]0, 100000]` and `empty_timeout` in
    /// `]0, 100000]`, the latter checked on the raw value whatever `unit` is.
    /// The same queue may be registered several times.
    pub fn add_input_queue(
        &self,
        queue: QueueHandle<T>,
        priority: f64,
        empty_timeout: u64,
        unit: TimeUnit,
    ) -> Result<(), CombinerError> {
        self.registry
            .add(queue, priority, empty_timeout, unit)
            .map(|_| ())
    }

    /// Unregister one registration of `queue`.
    ///
    /// If that registration is being polled right now it is retired as soon
    /// as the poll returns; until then its weight still counts in
    /// [`total_weight`](Self::total_weight).
    pub fn remove_input_queue(&self, queue: &QueueHandle<T>) -> Result<(), CombinerError> {
        match self.registry.remove(queue)? {
            Removal::Removed | Removal::Deferred => Ok(()),
        }
    }

    pub fn has_input_queue(&self, queue: &QueueHandle<T>) -> bool {
        self.registry.contains(queue)
    }

    /// Spawn the driver loop on the current tokio runtime.
    pub fn start(&self) -> Result<JoinHandle<()>, CombinerError> {
        let driver = self.claim_driver()?;
        Ok(tokio::spawn(driver.run()))
    }

    /// Drive the loop on the caller's task until [`stop`](Self::stop).
    pub async fn run(&self) -> Result<(), CombinerError> {
        let driver = self.claim_driver()?;
        driver.run().await;
        Ok(())
    }

    /// Request termination. Returns immediately; a poll already in flight
    /// finishes (or times out) before the loop exits.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn total_weight(&self) -> f64 {
        self.registry.total_weight()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    fn claim_driver(&self) -> Result<DriverLoop<T>, CombinerError> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CombinerError::AlreadyStarted);
        }
        Ok(DriverLoop {
            registry: Arc::clone(&self.registry),
            output: self.output.clone(),
            cancel: self.cancel.clone(),
            stats: Arc::clone(&self.stats),
            idle_backoff: self.config.idle_backoff,
        })
    }
}

impl<T> Drop for Combiner<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct DriverLoop<T> {
    registry: Arc<SlotRegistry<T>>,
    output: mpsc::Sender<T>,
    cancel: CancellationToken,
    stats: Arc<CombinerStats>,
    idle_backoff: Duration,
}

impl<T: Send + 'static> DriverLoop<T> {
    async fn run(self) {
        tracing::info!("Combiner loop started");

        while !self.cancel.is_cancelled() {
            let Some(selected) = self.registry.select_and_mark() else {
                self.wait_for_slot().await;
                continue;
            };

            let polled = selected.queue().poll(selected.timeout()).await;
            let resolution = self.registry.resolve(selected.id(), !polled.is_item());
            self.stats.record_poll(&polled, resolution);
            tracing::trace!(
                slot = %selected.id(),
                item = polled.is_item(),
                ?resolution,
                "Poll finished"
            );

            if let Some(item) = polled.into_item() {
                self.forward(item).await;
            }
        }

        tracing::info!("Combiner loop stopped");
    }

    async fn wait_for_slot(&self) {
        self.stats.record_idle_wait();
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.registry.slot_added() => {}
            _ = tokio::time::sleep(self.idle_backoff) => {}
        }
    }

    /// Best effort: an item the sink cannot take is dropped.
    async fn forward(&self, item: T) {
        match self.output.send(item).await {
            Ok(()) => self.stats.record_forwarded(),
            Err(_) => {
                self.stats.record_dropped();
                tracing::warn!("Output sink closed - dropping item");
            }
        }
    }
}
