//! Per-thread timers.
//!
//! Each thread keeps a [`TimerManager`] with a min-heap of fire times. Timers
//! belong to an object and fire on that object's thread as
//! [`Event::Timer`](crate::Event::Timer). Ids come from a process-wide
//! counter, so a timer keeps its id when its object migrates to another thread.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use crate::error::{Result, TetherError, TimerError};
use crate::logging::targets;
use crate::object::ObjectId;
use crate::runtime::Runtime;
use crate::thread_check::require_thread;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a running timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    fn next() -> Self {
        Self(NEXT_TIMER_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// The raw numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Whether a timer fires once or repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once after the interval.
    OneShot,
    /// Fires every interval until killed.
    Repeating,
}

#[derive(Debug, Clone)]
pub(crate) struct TimerData {
    object: ObjectId,
    next_fire: Instant,
    interval: Duration,
    kind: TimerKind,
}

#[derive(Debug, Clone, Copy)]
struct TimerQueueEntry {
    id: TimerId,
    fire_time: Instant,
}

impl PartialEq for TimerQueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_time == other.fire_time && self.id == other.id
    }
}

impl Eq for TimerQueueEntry {}

impl PartialOrd for TimerQueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerQueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other
            .fire_time
            .cmp(&self.fire_time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// The timers registered on one thread.
#[derive(Debug, Default)]
pub(crate) struct TimerManager {
    timers: HashMap<TimerId, TimerData>,
    queue: BinaryHeap<TimerQueueEntry>,
}

impl TimerManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn schedule(&mut self, id: TimerId, data: TimerData) {
        self.queue.push(TimerQueueEntry {
            id,
            fire_time: data.next_fire,
        });
        self.timers.insert(id, data);
    }

    pub(crate) fn register(
        &mut self,
        object: ObjectId,
        interval: Duration,
        kind: TimerKind,
    ) -> TimerId {
        let id = TimerId::next();
        let data = TimerData {
            object,
            next_fire: Instant::now() + interval,
            interval,
            kind,
        };
        self.schedule(id, data);
        id
    }

    pub(crate) fn owner(&self, id: TimerId) -> Option<ObjectId> {
        self.timers.get(&id).map(|t| t.object)
    }

    /// Remove a timer. Its heap entry goes stale and is skipped later.
    pub(crate) fn unregister(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    pub(crate) fn unregister_object(&mut self, object: ObjectId) -> usize {
        let before = self.timers.len();
        self.timers.retain(|_, t| t.object != object);
        before - self.timers.len()
    }

    pub(crate) fn timers_of(&self, object: ObjectId) -> Vec<TimerId> {
        let mut ids: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(_, t)| t.object == object)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn drop_stale(&mut self) {
        while let Some(entry) = self.queue.peek() {
            let live = self
                .timers
                .get(&entry.id)
                .is_some_and(|t| t.next_fire == entry.fire_time);
            if live {
                break;
            }
            self.queue.pop();
        }
    }

    /// Fire time of the earliest live timer.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_stale();
        self.queue.peek().map(|e| e.fire_time)
    }

    /// Pop every timer due at `now`, rescheduling repeating ones.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(TimerId, ObjectId)> {
        let mut fired = Vec::new();
        loop {
            self.drop_stale();
            let Some(entry) = self.queue.peek().copied() else {
                break;
            };
            if entry.fire_time > now {
                break;
            }
            self.queue.pop();
            let Some(timer) = self.timers.get_mut(&entry.id) else {
                continue;
            };
            fired.push((entry.id, timer.object));
            match timer.kind {
                TimerKind::OneShot => {
                    self.timers.remove(&entry.id);
                }
                TimerKind::Repeating => {
                    // Skip missed periods instead of firing a burst.
                    let mut next = timer.next_fire + timer.interval;
                    if next <= now {
                        next = now + timer.interval;
                    }
                    timer.next_fire = next;
                    self.queue.push(TimerQueueEntry {
                        id: entry.id,
                        fire_time: next,
                    });
                }
            }
        }
        fired
    }

    /// Remove the timers of `objects`, keeping their remaining time.
    pub(crate) fn extract_for(&mut self, objects: &HashSet<ObjectId>) -> Vec<(TimerId, TimerData)> {
        let ids: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(_, t)| objects.contains(&t.object))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.timers.remove(&id).map(|t| (id, t)))
            .collect()
    }

    pub(crate) fn adopt(&mut self, moved: Vec<(TimerId, TimerData)>) {
        for (id, data) in moved {
            self.schedule(id, data);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }
}

impl Runtime {
    /// Start a timer for `object`, firing [`Event::Timer`](crate::Event::Timer)
    /// on its thread.
    ///
    /// Must be called on the object's thread.
    pub fn start_timer(&self, object: ObjectId, interval: Duration, kind: TimerKind) -> Result<TimerId> {
        let node = self.node(object).ok_or(crate::object::ObjectError::InvalidObjectId)?;
        let thread = node.thread_data();
        require_thread("start_timer", thread.id)?;
        let id = thread.timers.lock().register(object, interval, kind);
        tracing::trace!(target: targets::TIMER, ?id, ?object, ?interval, ?kind, "timer started");
        thread.wake();
        Ok(id)
    }

    /// Stop a timer previously started for `object`.
    pub fn kill_timer(&self, object: ObjectId, id: TimerId) -> Result<()> {
        let node = self.node(object).ok_or(crate::object::ObjectError::InvalidObjectId)?;
        let thread = node.thread_data();
        require_thread("kill_timer", thread.id)?;
        let mut timers = thread.timers.lock();
        match timers.owner(id) {
            None => Err(TimerError::InvalidTimerId.into()),
            Some(owner) if owner != object => Err(TetherError::Timer(TimerError::WrongOwner)),
            Some(_) => {
                timers.unregister(id);
                tracing::trace!(target: targets::TIMER, ?id, "timer killed");
                Ok(())
            }
        }
    }

    /// Timers currently registered for `object`.
    pub fn timers_of(&self, object: ObjectId) -> Vec<TimerId> {
        self.node(object)
            .map(|node| node.thread_data().timers.lock().timers_of(object))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn object() -> ObjectId {
        let mut map: SlotMap<ObjectId, ()> = SlotMap::with_key();
        map.insert(())
    }

    #[test]
    fn test_one_shot_fires_once() {
        let obj = object();
        let mut timers = TimerManager::new();
        let id = timers.register(obj, Duration::from_millis(5), TimerKind::OneShot);

        assert!(timers.take_expired(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_millis(10);
        assert_eq!(timers.take_expired(later), vec![(id, obj)]);
        assert!(timers.take_expired(later + Duration::from_secs(1)).is_empty());
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn test_repeating_reschedules() {
        let obj = object();
        let mut timers = TimerManager::new();
        let id = timers.register(obj, Duration::from_millis(10), TimerKind::Repeating);

        let t1 = Instant::now() + Duration::from_millis(10);
        assert_eq!(timers.take_expired(t1).len(), 1);
        let next = timers.next_deadline().unwrap();
        assert!(next > t1);
        assert_eq!(timers.take_expired(next), vec![(id, obj)]);
    }

    #[test]
    fn test_unregister_leaves_stale_entry_ignored() {
        let obj = object();
        let mut timers = TimerManager::new();
        let id = timers.register(obj, Duration::from_millis(1), TimerKind::Repeating);
        assert!(timers.unregister(id));
        assert!(!timers.unregister(id));
        assert_eq!(timers.next_deadline(), None);
        assert!(timers.take_expired(Instant::now() + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_deadline_is_earliest() {
        let obj = object();
        let mut timers = TimerManager::new();
        timers.register(obj, Duration::from_secs(10), TimerKind::OneShot);
        timers.register(obj, Duration::from_millis(10), TimerKind::OneShot);
        let deadline = timers.next_deadline().unwrap();
        assert!(deadline <= Instant::now() + Duration::from_millis(10));
    }

    #[test]
    fn test_extract_keeps_ids() {
        let obj = object();
        let mut from = TimerManager::new();
        let id = from.register(obj, Duration::from_millis(1), TimerKind::OneShot);
        let moved = from.extract_for(&[obj].into_iter().collect());
        assert_eq!(from.len(), 0);

        let mut to = TimerManager::new();
        to.adopt(moved);
        assert_eq!(to.owner(id), Some(obj));
        let fired = to.take_expired(Instant::now() + Duration::from_millis(5));
        assert_eq!(fired, vec![(id, obj)]);
    }

    #[test]
    fn test_unregister_object() {
        let a = object();
        let mut timers = TimerManager::new();
        timers.register(a, Duration::from_secs(1), TimerKind::OneShot);
        timers.register(a, Duration::from_secs(2), TimerKind::Repeating);
        assert_eq!(timers.timers_of(a).len(), 2);
        assert_eq!(timers.unregister_object(a), 2);
        assert!(timers.timers_of(a).is_empty());
    }
}
