//! The per-thread posted-event list.
//!
//! Entries stay sorted by descending priority, equal priorities in arrival
//! order. Delivery never removes entries directly: it takes the event out and
//! leaves an empty slot, and the slots in front of `start_offset` are erased
//! once the outermost dispatch pass unwinds. That keeps indices stable for
//! every pass on the stack.
//!
//! A pass only looks at `[start_offset, insertion_offset)`. Events posted while
//! it runs land at or after `insertion_offset` and wait for the next pass.

use std::collections::HashSet;

use crate::event::{Event, EventKind, EventPriority, PostedEvent};
use crate::object::ObjectId;

#[derive(Debug, Default)]
pub(crate) struct PostEventList {
    entries: Vec<PostedEvent>,
    /// Depth of dispatch passes currently running on this list.
    pub(crate) recursion: u32,
    /// Cursor shared by unfiltered passes.
    pub(crate) start_offset: usize,
    /// End of the window of the pass that started last.
    pub(crate) insertion_offset: usize,
    /// Cleared when something is posted or skipped during a pass.
    pub(crate) can_wait: bool,
    next_sequence: u64,
}

impl PostEventList {
    pub(crate) fn new() -> Self {
        Self {
            can_wait: true,
            ..Self::default()
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of entries still carrying an event.
    pub(crate) fn pending(&self) -> usize {
        self.entries.iter().filter(|e| e.event.is_some()).count()
    }

    /// Insert a new event.
    pub(crate) fn add(&mut self, receiver: ObjectId, event: Event, priority: EventPriority) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.insert(PostedEvent {
            receiver,
            event: Some(event),
            priority,
            sequence,
        });
    }

    /// Re-insert an entry, keeping its priority and sequence number.
    pub(crate) fn insert(&mut self, posted: PostedEvent) {
        let append = match self.entries.last() {
            None => true,
            Some(last) => last.priority >= posted.priority,
        } || self.insertion_offset >= self.entries.len();

        if append {
            self.entries.push(posted);
            return;
        }

        // Upper bound on descending priority, never in front of the window
        // of a running pass.
        let from = self.insertion_offset;
        let pos = from
            + self.entries[from..].partition_point(|e| e.priority >= posted.priority);
        self.entries.insert(pos, posted);
    }

    pub(crate) fn receiver_at(&self, index: usize) -> Option<(ObjectId, Option<EventKind>)> {
        self.entries
            .get(index)
            .map(|e| (e.receiver, e.event.as_ref().map(Event::kind)))
    }

    pub(crate) fn deferred_level_at(&self, index: usize) -> Option<u32> {
        match self.entries.get(index)?.event {
            Some(Event::DeferredDelete { level }) => Some(level),
            _ => None,
        }
    }

    /// Take the event at `index`, leaving an empty slot.
    pub(crate) fn take(&mut self, index: usize) -> Option<(ObjectId, Event)> {
        let entry = self.entries.get_mut(index)?;
        entry.event.take().map(|event| (entry.receiver, event))
    }

    /// Move the entry at `index` to the back, behind the current window.
    pub(crate) fn repost(&mut self, index: usize) {
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        let Some(event) = entry.event.take() else {
            return;
        };
        let moved = PostedEvent {
            receiver: entry.receiver,
            event: Some(event),
            priority: entry.priority,
            sequence: entry.sequence,
        };
        self.insert(moved);
    }

    /// Whether an event of `kind` is pending for `receiver`.
    pub(crate) fn has_pending(&self, receiver: ObjectId, kind: EventKind) -> bool {
        self.entries[self.start_offset.min(self.entries.len())..]
            .iter()
            .any(|e| e.receiver == receiver && e.event.as_ref().is_some_and(|ev| ev.kind() == kind))
    }

    /// Shrink the window back to the shared cursor once no pass is running,
    /// so later posts are sorted against every pending entry.
    pub(crate) fn close_window(&mut self) {
        self.insertion_offset = self.start_offset.min(self.entries.len());
    }

    /// Erase delivered entries in front of the shared cursor.
    pub(crate) fn compact(&mut self) {
        let delivered = self.start_offset.min(self.entries.len());
        self.entries.drain(..delivered);
        self.insertion_offset = self.insertion_offset.saturating_sub(delivered);
        self.start_offset = 0;
    }

    /// Take every pending event matching the filter.
    ///
    /// Returned events must be dropped after the queue lock is released.
    pub(crate) fn remove_matching(
        &mut self,
        mut matches: impl FnMut(ObjectId, EventKind) -> bool,
    ) -> Vec<(ObjectId, Event)> {
        let mut removed = Vec::new();
        for entry in &mut self.entries {
            let hit = entry
                .event
                .as_ref()
                .is_some_and(|ev| matches(entry.receiver, ev.kind()));
            if hit {
                if let Some(event) = entry.event.take() {
                    removed.push((entry.receiver, event));
                }
            }
        }
        removed
    }

    /// Take every pending event addressed to one of `receivers`, in order.
    pub(crate) fn extract_for(&mut self, receivers: &HashSet<ObjectId>) -> Vec<PostedEvent> {
        let mut moved = Vec::new();
        for entry in &mut self.entries {
            if !receivers.contains(&entry.receiver) {
                continue;
            }
            if let Some(event) = entry.event.take() {
                moved.push(PostedEvent {
                    receiver: entry.receiver,
                    event: Some(event),
                    priority: entry.priority,
                    sequence: entry.sequence,
                });
            }
        }
        moved
    }

    /// Accept events moved in from another thread's queue.
    pub(crate) fn adopt(&mut self, moved: Vec<PostedEvent>) {
        for mut posted in moved {
            posted.sequence = self.next_sequence;
            self.next_sequence += 1;
            self.insert(posted);
        }
    }

    #[cfg(test)]
    fn order(&self) -> Vec<u32> {
        self.entries
            .iter()
            .filter_map(|e| match &e.event {
                Some(Event::User { kind, .. }) => Some(*kind),
                _ => None,
            })
            .collect()
    }
}
