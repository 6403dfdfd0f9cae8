//! InputSlot - one registered (queue, priority, timeout) triple.

use std::sync::Arc;
use std::time::Duration;

use crate::queue::{QueueHandle, TimeUnit};

/// Registry-internal identity of a slot.
///
/// Queue handles may be registered more than once, so the registry needs its
/// own id to find the exact slot a poll was issued against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(uuid::Uuid);

impl SlotId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) struct InputSlot<T> {
    pub id: SlotId,
    pub queue: QueueHandle<T>,
    pub priority: f64,
    pub empty_timeout: u64,
    pub unit: TimeUnit,
    /// Removal was requested while this slot was being polled.
    pub pending_delete: bool,
}

impl<T: Send> InputSlot<T> {
    pub fn new(queue: QueueHandle<T>, priority: f64, empty_timeout: u64, unit: TimeUnit) -> Self {
        Self {
            id: SlotId::new(),
            queue,
            priority,
            empty_timeout,
            unit,
            pending_delete: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.unit.duration(self.empty_timeout)
    }

    pub fn selected(&self) -> SelectedSlot<T> {
        SelectedSlot {
            id: self.id,
            queue: Arc::clone(&self.queue),
            timeout: self.timeout(),
        }
    }
}

/// The slot chosen for the next poll, detached from the registry lock.
///
/// Holds its own reference to the queue, so the poll can proceed even if the
/// slot is deleted from the registry in the meantime.
pub struct SelectedSlot<T> {
    id: SlotId,
    queue: QueueHandle<T>,
    timeout: Duration,
}

impl<T: Send> SelectedSlot<T> {
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn queue(&self) -> &QueueHandle<T> {
        &self.queue
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
