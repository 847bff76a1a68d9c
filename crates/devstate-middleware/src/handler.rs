//! [`HandlerTable`] – the sorted list of message handlers.
//!
//! Entries are kept ordered by message type (descending type id), then by
//! owner priority (descending). Handlers with equal keys stay in the order
//! they were registered. All handlers for one type therefore form a single
//! contiguous run, which is what the dispatcher walks.

use devstate_types::MessageKind;

use crate::bus::BusError;
use crate::registry::ModuleId;

/// One registered `(type, size) → module` route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    pub kind: MessageKind,
    /// Exact size a message must declare to be delivered here.
    pub size: u32,
    pub owner: ModuleId,
    pub priority: i32,
}

impl Handler {
    /// `true` when `self` must come before `other` in the table.
    fn precedes(&self, other: &Handler) -> bool {
        let (a, b) = (self.kind.type_id(), other.kind.type_id());
        a > b || (a == b && self.priority > other.priority)
    }
}

#[derive(Debug, Default)]
pub struct HandlerTable {
    entries: Vec<Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handler` at its sorted position, after any equal-keyed entry.
    ///
    /// # Errors
    ///
    /// [`BusError::OutOfMemory`] when the table cannot grow. The table is
    /// unchanged in that case.
    pub fn register(&mut self, handler: Handler) -> Result<(), BusError> {
        self.entries
            .try_reserve(1)
            .map_err(|e| BusError::OutOfMemory(format!("handler table: {e}")))?;
        let at = self.entries.partition_point(|e| !handler.precedes(e));
        self.entries.insert(at, handler);
        Ok(())
    }

    /// Drop every handler owned by `owner`. Returns how many were removed.
    pub fn unregister_all(&mut self, owner: ModuleId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|h| h.owner != owner);
        before - self.entries.len()
    }

    /// The contiguous run of handlers registered for `kind`, in dispatch order.
    pub fn matching(&self, kind: MessageKind) -> &[Handler] {
        let id = kind.type_id();
        let start = self.entries.partition_point(|h| h.kind.type_id() > id);
        let len = self.entries[start..].partition_point(|h| h.kind.type_id() == id);
        &self.entries[start..start + len]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Handler> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
