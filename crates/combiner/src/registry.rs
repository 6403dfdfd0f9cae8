//! Slot registry with weighted selection and deferred deletion.
//!
//! Every read and write of the slot list, the cached total weight, the
//! in-flight marker and the deferred-delete flags happens under one mutex.
//! The lock is never held across an await: the driver loop selects and marks
//! under the lock, polls outside it, then resolves under the lock again.

use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::sync::Notify;

use crate::error::CombinerError;
use crate::queue::{QueueHandle, TimeUnit, same_queue};
use crate::slot::{InputSlot, SelectedSlot, SlotId};

pub const MAX_PRIORITY: f64 = 100_000.0;

/// Upper bound on the raw empty-timeout value, whatever its unit.
pub const MAX_EMPTY_TIMEOUT: u64 = 100_000;

/// Outcome of a removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// The slot is mid-poll; it leaves the registry when the poll resolves.
    Deferred,
}

/// What happened to the polled slot once its poll returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Kept,
    RemovedOnTimeout,
    RemovedDeferred,
}

/// Walk `priorities` subtracting each from `draw`; the first index that drives
/// the remainder negative wins.
///
/// With `draw` uniform in `[0, sum)` each index is chosen with probability
/// `priority / sum`. If float rounding leaves the draw unconsumed the last
/// index is returned, so a non-empty input always yields a selection.
pub fn pick_index<I>(priorities: I, draw: f64) -> Option<usize>
where
    I: IntoIterator<Item = f64>,
{
    let mut remaining = draw;
    let mut last = None;
    for (idx, priority) in priorities.into_iter().enumerate() {
        remaining -= priority;
        if remaining < 0.0 {
            return Some(idx);
        }
        last = Some(idx);
    }
    last
}

struct RegistryState<T> {
    slots: Vec<InputSlot<T>>,
    total_weight: f64,
    in_flight: Option<SlotId>,
    rng: Box<dyn RngCore + Send>,
}

impl<T: Send> RegistryState<T> {
    fn remove_at(&mut self, idx: usize) -> InputSlot<T> {
        let slot = self.slots.remove(idx);
        self.total_weight -= slot.priority;
        if self.slots.is_empty() {
            // Drop accumulated rounding error.
            self.total_weight = 0.0;
        }
        slot
    }
}

pub struct SlotRegistry<T> {
    state: StdMutex<RegistryState<T>>,
    slot_added: Notify,
}

impl<T: Send + 'static> SlotRegistry<T> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Use a caller-supplied random source for selection draws.
    pub fn with_rng(rng: impl RngCore + Send + 'static) -> Self {
        Self {
            state: StdMutex::new(RegistryState {
                slots: Vec::new(),
                total_weight: 0.0,
                in_flight: None,
                rng: Box::new(rng),
            }),
            slot_added: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Slot registry mutex poisoned - recovering state");
                poisoned.into_inner()
            }
        }
    }

    /// Validate and append a slot. Duplicate handles are accepted as distinct slots.
    pub fn add(
        &self,
        queue: QueueHandle<T>,
        priority: f64,
        empty_timeout: u64,
        unit: TimeUnit,
    ) -> Result<SlotId, CombinerError> {
        // Written so NaN fails the check too.
        if !(priority > 0.0 && priority <= MAX_PRIORITY) {
            return Err(CombinerError::invalid_argument(format!(
                "priority out of valid range ]0..{MAX_PRIORITY}]: {priority}"
            )));
        }
        // The bound ignores `unit`; a unit-aware range is not defined.
        if empty_timeout == 0 || empty_timeout > MAX_EMPTY_TIMEOUT {
            return Err(CombinerError::invalid_argument(format!(
                "empty timeout out of valid range ]0..{MAX_EMPTY_TIMEOUT}]: {empty_timeout}"
            )));
        }

        let slot = InputSlot::new(queue, priority, empty_timeout, unit);
        let id = slot.id;
        {
            let mut state = self.lock();
            state.total_weight += priority;
            state.slots.push(slot);
        }
        tracing::debug!(slot = %id, priority, empty_timeout, unit = unit.as_str(), "Input queue added");
        self.slot_added.notify_one();
        Ok(id)
    }

    /// Remove the first live slot wrapping `queue`.
    ///
    /// Slots already awaiting a deferred delete are skipped, so each call
    /// retires exactly one registration.
    pub fn remove(&self, queue: &QueueHandle<T>) -> Result<Removal, CombinerError> {
        let mut state = self.lock();
        let idx = state
            .slots
            .iter()
            .position(|slot| !slot.pending_delete && same_queue(&slot.queue, queue))
            .ok_or(CombinerError::NotFound)?;

        let id = state.slots[idx].id;
        if state.in_flight == Some(id) {
            state.slots[idx].pending_delete = true;
            tracing::debug!(slot = %id, "Input queue is being polled - deferring removal");
            return Ok(Removal::Deferred);
        }

        let slot = state.remove_at(idx);
        tracing::debug!(slot = %id, priority = slot.priority, "Input queue removed");
        Ok(Removal::Removed)
    }

    /// True if some live slot wraps `queue`.
    pub fn contains(&self, queue: &QueueHandle<T>) -> bool {
        self.lock()
            .slots
            .iter()
            .any(|slot| !slot.pending_delete && same_queue(&slot.queue, queue))
    }

    /// Sum of priorities of every slot in the registry, including one awaiting
    /// a deferred delete.
    pub fn total_weight(&self) -> f64 {
        self.lock().total_weight
    }

    /// Number of slots in the registry, including one awaiting a deferred delete.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    /// Slot currently being polled, if any.
    pub fn in_flight(&self) -> Option<SlotId> {
        self.lock().in_flight
    }

    /// Draw a weighted random slot and mark it as being polled, in one critical section.
    pub(crate) fn select_and_mark(&self) -> Option<SelectedSlot<T>> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(busy) = state.in_flight {
            debug_assert!(false, "select_and_mark while a slot is in flight");
            tracing::error!(slot = %busy, "Bug: selection requested while a slot is still being polled");
            return None;
        }
        if state.slots.is_empty() {
            return None;
        }

        let unit: f64 = state.rng.gen_range(0.0..1.0);
        let draw = unit * state.total_weight;
        let idx = pick_index(state.slots.iter().map(|slot| slot.priority), draw)?;

        let selected = state.slots[idx].selected();
        state.in_flight = Some(selected.id());
        Some(selected)
    }

    /// Settle the slot whose poll just returned and clear the in-flight marker.
    ///
    /// The slot is removed if the poll produced nothing or a removal was
    /// deferred while it was in flight.
    pub(crate) fn resolve(&self, id: SlotId, timed_out: bool) -> Resolution {
        let mut state = self.lock();

        if state.in_flight != Some(id) {
            debug_assert!(false, "resolve called for a slot that is not in flight");
            tracing::error!(slot = %id, "Bug: resolving a slot that was not marked in flight");
        }
        state.in_flight = None;

        let Some(idx) = state.slots.iter().position(|slot| slot.id == id) else {
            return Resolution::Kept;
        };

        let pending = state.slots[idx].pending_delete;
        if !timed_out && !pending {
            return Resolution::Kept;
        }

        let slot = state.remove_at(idx);
        if pending {
            tracing::debug!(slot = %id, priority = slot.priority, "Deferred removal applied");
            Resolution::RemovedDeferred
        } else {
            tracing::debug!(slot = %id, priority = slot.priority, "Input queue empty - removed");
            Resolution::RemovedOnTimeout
        }
    }

    /// Wait until a slot is added. A notification sent while nobody waits is kept for the next waiter.
    pub(crate) async fn slot_added(&self) {
        self.slot_added.notified().await;
    }
}

impl<T: Send + 'static> Default for SlotRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::queue::ChannelQueue;

    fn queue() -> QueueHandle<u32> {
        // Senders are dropped immediately; these handles are never polled here.
        ChannelQueue::channel(1).1
    }

    fn seeded() -> SlotRegistry<u32> {
        SlotRegistry::with_rng(StdRng::seed_from_u64(42))
    }

    #[test]
    fn pick_index_walks_cumulative_weights() {
        let weights = [1.0, 2.0, 0.5];
        assert_eq!(pick_index(weights, 0.0), Some(0));
        assert_eq!(pick_index(weights, 0.999), Some(0));
        assert_eq!(pick_index(weights, 1.0), Some(1));
        assert_eq!(pick_index(weights, 2.9), Some(1));
        assert_eq!(pick_index(weights, 3.0), Some(2));
        assert_eq!(pick_index(weights, 3.49), Some(2));
    }

    #[test]
    fn pick_index_empty_and_overshoot() {
        assert_eq!(pick_index(std::iter::empty(), 0.0), None);
        // Draw beyond the sum falls back to the last slot.
        assert_eq!(pick_index([1.0, 1.0], 2.0), Some(1));
    }

    #[test]
    fn add_and_contains() {
        let registry = seeded();
        let a = queue();
        let b = queue();

        registry.add(Arc::clone(&a), 1.0, 1, TimeUnit::Seconds).unwrap();

        assert!(registry.contains(&a));
        assert!(!registry.contains(&b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.total_weight(), 1.0);
    }

    #[test]
    fn remove_one_of_two() {
        let registry = seeded();
        let a = queue();
        let b = queue();
        registry.add(Arc::clone(&a), 1.5, 1, TimeUnit::Seconds).unwrap();
        registry.add(Arc::clone(&b), 2.25, 2, TimeUnit::Seconds).unwrap();

        assert_eq!(registry.remove(&a), Ok(Removal::Removed));

        assert!(!registry.contains(&a));
        assert!(registry.contains(&b));
        assert_eq!(registry.total_weight(), 2.25);
    }

    #[test]
    fn duplicate_registrations_count_independently() {
        let registry = seeded();
        let a = queue();
        registry.add(Arc::clone(&a), 1.0, 1, TimeUnit::Seconds).unwrap();
        registry.add(Arc::clone(&a), 4.0, 9, TimeUnit::Milliseconds).unwrap();
        assert_eq!(registry.len(), 2);

        registry.remove(&a).unwrap();
        assert!(registry.contains(&a));
        assert_eq!(registry.total_weight(), 4.0);

        registry.remove(&a).unwrap();
        assert!(!registry.contains(&a));
        assert_eq!(registry.remove(&a), Err(CombinerError::NotFound));
    }

    #[test]
    fn rejects_out_of_range_arguments_without_mutation() {
        let registry = seeded();
        let a = queue();
        registry.add(Arc::clone(&a), 3.0, 1, TimeUnit::Seconds).unwrap();

        let cases: [(f64, u64); 6] = [
            (0.0, 1),
            (-1.0, 1),
            (MAX_PRIORITY + 0.001, 1),
            (f64::NAN, 1),
            (1.0, 0),
            (1.0, MAX_EMPTY_TIMEOUT + 1),
        ];
        let b = queue();
        for (priority, timeout) in cases {
            let err = registry
                .add(Arc::clone(&b), priority, timeout, TimeUnit::Seconds)
                .unwrap_err();
            assert!(matches!(err, CombinerError::InvalidArgument { .. }), "{err}");
        }

        assert!(!registry.contains(&b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.total_weight(), 3.0);
    }

    #[test]
    fn accepts_range_bounds() {
        let registry = seeded();
        let a = queue();
        registry
            .add(Arc::clone(&a), MAX_PRIORITY, MAX_EMPTY_TIMEOUT, TimeUnit::Nanoseconds)
            .unwrap();
        registry.add(Arc::clone(&a), f64::MIN_POSITIVE, 1, TimeUnit::Days).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_unknown_is_not_found_without_mutation() {
        let registry = seeded();
        let a = queue();
        registry.add(Arc::clone(&a), 2.0, 1, TimeUnit::Seconds).unwrap();

        assert_eq!(registry.remove(&queue()), Err(CombinerError::NotFound));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.total_weight(), 2.0);
    }

    #[test]
    fn add_then_remove_round_trip() {
        let registry = seeded();
        let a = queue();
        let before = registry.total_weight();

        registry.add(Arc::clone(&a), 0.3, 5, TimeUnit::Seconds).unwrap();
        registry.remove(&a).unwrap();

        assert_eq!(registry.total_weight(), before);
        assert!(!registry.contains(&a));
        assert!(registry.is_empty());
    }

    #[test]
    fn select_on_empty_registry() {
        let registry = seeded();
        assert!(registry.select_and_mark().is_none());
        assert_eq!(registry.in_flight(), None);
    }

    #[test]
    fn select_marks_in_flight() {
        let registry = seeded();
        let a = queue();
        let id = registry.add(Arc::clone(&a), 1.0, 1, TimeUnit::Seconds).unwrap();

        let selected = registry.select_and_mark().unwrap();
        assert_eq!(selected.id(), id);
        assert_eq!(registry.in_flight(), Some(id));

        assert_eq!(registry.resolve(id, false), Resolution::Kept);
        assert_eq!(registry.in_flight(), None);
        assert!(registry.contains(&a));
    }

    #[test]
    fn timed_out_slot_is_removed() {
        let registry = seeded();
        let a = queue();
        registry.add(Arc::clone(&a), 2.0, 1, TimeUnit::Seconds).unwrap();

        let selected = registry.select_and_mark().unwrap();
        assert_eq!(
            registry.resolve(selected.id(), true),
            Resolution::RemovedOnTimeout
        );
        assert!(!registry.contains(&a));
        assert_eq!(registry.total_weight(), 0.0);
    }

    #[test]
    fn removing_polled_slot_is_deferred() {
        let registry = seeded();
        let a = queue();
        let b = queue();
        registry.add(Arc::clone(&a), 2.0, 1, TimeUnit::Seconds).unwrap();

        let selected = registry.select_and_mark().unwrap();
        assert_eq!(registry.remove(&a), Ok(Removal::Deferred));

        // Gone for callers, still weighted until the poll settles.
        assert!(!registry.contains(&a));
        assert_eq!(registry.remove(&a), Err(CombinerError::NotFound));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.total_weight(), 2.0);

        registry.add(Arc::clone(&b), 0.5, 1, TimeUnit::Seconds).unwrap();

        assert_eq!(
            registry.resolve(selected.id(), false),
            Resolution::RemovedDeferred
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.total_weight(), 0.5);
        assert_eq!(registry.in_flight(), None);
    }

    #[test]
    fn deferred_delete_with_timeout_subtracts_once() {
        let registry = seeded();
        let a = queue();
        registry.add(Arc::clone(&a), 2.0, 1, TimeUnit::Seconds).unwrap();

        let selected = registry.select_and_mark().unwrap();
        registry.remove(&a).unwrap();

        assert_eq!(
            registry.resolve(selected.id(), true),
            Resolution::RemovedDeferred
        );
        assert!(registry.is_empty());
        assert_eq!(registry.total_weight(), 0.0);
    }

    #[test]
    fn duplicate_handle_with_one_in_flight() {
        let registry = seeded();
        let a = queue();
        registry.add(Arc::clone(&a), 1.0, 1, TimeUnit::Seconds).unwrap();
        registry.add(Arc::clone(&a), 3.0, 1, TimeUnit::Seconds).unwrap();

        let selected = registry.select_and_mark().unwrap();

        registry.remove(&a).unwrap();
        assert!(registry.contains(&a));
        registry.remove(&a).unwrap();
        assert!(!registry.contains(&a));
        assert_eq!(registry.len(), 1);

        registry.resolve(selected.id(), false);
        assert!(registry.is_empty());
        assert_eq!(registry.total_weight(), 0.0);
    }

    #[test]
    fn selection_frequency_follows_weights() {
        let registry = seeded();
        let light = queue();
        let heavy = queue();
        registry.add(Arc::clone(&light), 1.0, 1, TimeUnit::Seconds).unwrap();
        registry.add(Arc::clone(&heavy), 2.0, 1, TimeUnit::Seconds).unwrap();

        let trials = 10_000;
        let mut heavy_hits = 0u32;
        for _ in 0..trials {
            let selected = registry.select_and_mark().unwrap();
            if same_queue(selected.queue(), &heavy) {
                heavy_hits += 1;
            }
            registry.resolve(selected.id(), false);
        }

        let light_hits = trials - heavy_hits;
        let ratio = f64::from(heavy_hits) / f64::from(light_hits);
        assert!((1.8..2.2).contains(&ratio), "ratio {ratio}");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn selection_frequency_three_way() {
        let registry = seeded();
        let handles: Vec<_> = (0..3).map(|_| queue()).collect();
        let weights = [1.0, 3.0, 6.0];
        for (handle, weight) in handles.iter().zip(weights) {
            registry.add(Arc::clone(handle), weight, 1, TimeUnit::Seconds).unwrap();
        }

        let trials = 20_000;
        let mut hits = [0u32; 3];
        for _ in 0..trials {
            let selected = registry.select_and_mark().unwrap();
            let idx = handles
                .iter()
                .position(|h| same_queue(h, selected.queue()))
                .unwrap();
            hits[idx] += 1;
            registry.resolve(selected.id(), false);
        }

        for (hit, weight) in hits.iter().zip(weights) {
            let freq = f64::from(*hit) / f64::from(trials);
            let expected = weight / 10.0;
            assert!((freq - expected).abs() < 0.02, "freq {freq} expected {expected}");
        }
    }
}
