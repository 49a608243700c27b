// src/queue.rs

//! Per-connection ordered inbound storage.
//!
//! Entries are kept in `(priority desc, arrival asc)` order; peeking
//! without a priority floor returns the head of that order, and removal by
//! key is cheap so the receive path can unlink exactly the entry it
//! peeked.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::Slice;
use crate::reply::ReplyTracker;
use crate::types::{ConnectionId, HandleToken, NameId, Uid};

/// Stable identity of a queued entry within one queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntryKey {
    order: (Reverse<i64>, u64),
}

impl EntryKey {
    pub fn priority(&self) -> i64 {
        self.order.0 .0
    }
}

/// A pending inbound message.
pub struct QueueEntry {
    /// Slice in the receiver's pool holding the serialized message.
    pub slice: Slice,
    /// Sender id; `None` for kernel-origin messages.
    pub src: Option<ConnectionId>,
    pub cookie: u64,
    pub priority: i64,
    /// Name-id the message was addressed to, for activator migration.
    pub dst_name_id: Option<NameId>,
    /// Back-pointer to the reply tracker that authorized this message.
    /// Never owning; the tracker lives in the receiver's reply list.
    pub reply: Option<Arc<ReplyTracker>>,
    /// Transferable handles, installed at receive time.
    pub handles: Vec<HandleToken>,
    /// Sending user charged for this entry, once per-user accounting is
    /// active.
    pub charged_user: Option<Uid>,
}

/// Priority-ordered inbound queue.
pub struct Queue {
    entries: BTreeMap<EntryKey, QueueEntry>,
    arrival_seq: u64,
}

impl Queue {
    pub fn new() -> Self {
        Queue { entries: BTreeMap::new(), arrival_seq: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry, keyed by its priority and arrival order.
    pub fn add(&mut self, entry: QueueEntry) -> EntryKey {
        let key = EntryKey {
            order: (Reverse(entry.priority), self.arrival_seq),
        };
        self.arrival_seq += 1;
        self.entries.insert(key, entry);
        key
    }

    /// Return the key of the next entry without removing it.
    ///
    /// With `use_priority` unset this is the queue head. With it set, the
    /// head must additionally have priority >= `priority`.
    pub fn peek(&self, priority: i64, use_priority: bool) -> Result<EntryKey> {
        let (&key, _) = self.entries.iter().next().ok_or(Error::Empty)?;
        if use_priority && key.priority() < priority {
            return Err(Error::Empty);
        }
        Ok(key)
    }

    pub fn get(&self, key: EntryKey) -> Option<&QueueEntry> {
        self.entries.get(&key)
    }

    /// Unlink a specific entry.
    pub fn remove(&mut self, key: EntryKey) -> Option<QueueEntry> {
        self.entries.remove(&key)
    }

    /// Drain every entry, in queue order.
    pub fn drain(&mut self) -> impl Iterator<Item = QueueEntry> + '_ {
        let drained = std::mem::take(&mut self.entries);
        drained.into_values()
    }

    /// Remove the entries addressed to `name_id`, preserving their order.
    /// Used when traffic migrates between an activator and an implementor.
    pub fn extract_for_name(&mut self, name_id: NameId) -> Vec<QueueEntry> {
        let keys: Vec<EntryKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dst_name_id == Some(name_id))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect()
    }

    /// Iterate entries in delivery order.
    pub fn iter(&self) -> impl Iterator<Item = (EntryKey, &QueueEntry)> {
        self.entries.iter().map(|(k, e)| (*k, e))
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(priority: i64, cookie: u64) -> QueueEntry {
        QueueEntry {
            slice: crate::pool::Pool::new(64).unwrap().alloc(8).unwrap(),
            src: Some(ConnectionId::new(1)),
            cookie,
            priority,
            dst_name_id: None,
            reply: None,
            handles: Vec::new(),
            charged_user: None,
        }
    }

    #[test]
    fn peek_on_empty_queue_fails() {
        let q = Queue::new();
        assert_eq!(q.peek(0, false), Err(Error::Empty));
    }

    #[test]
    fn fifo_within_equal_priority() {
        let mut q = Queue::new();
        q.add(entry(0, 1));
        q.add(entry(0, 2));
        q.add(entry(0, 3));
        for expect in 1..=3 {
            let key = q.peek(0, false).unwrap();
            assert_eq!(q.remove(key).unwrap().cookie, expect);
        }
    }

    #[test]
    fn higher_priority_is_delivered_first() {
        let mut q = Queue::new();
        q.add(entry(0, 10));
        q.add(entry(5, 20));
        q.add(entry(-3, 30));
        let order: Vec<u64> = std::iter::from_fn(|| {
            let key = q.peek(0, false).ok()?;
            Some(q.remove(key).unwrap().cookie)
        })
        .collect();
        assert_eq!(order, vec![20, 10, 30]);
    }

    #[test]
    fn priority_floor_filters_head() {
        let mut q = Queue::new();
        q.add(entry(1, 1));
        assert!(q.peek(2, true).is_err());
        assert!(q.peek(1, true).is_ok());
        assert!(q.peek(0, true).is_ok());
    }

    #[test]
    fn extract_for_name_preserves_order() {
        let mut q = Queue::new();
        let nid = NameId::new(7);
        let mut tagged = entry(0, 1);
        tagged.dst_name_id = Some(nid);
        q.add(tagged);
        q.add(entry(0, 2));
        let mut tagged2 = entry(0, 3);
        tagged2.dst_name_id = Some(nid);
        q.add(tagged2);

        let moved = q.extract_for_name(nid);
        assert_eq!(moved.iter().map(|e| e.cookie).collect::<Vec<_>>(), [1, 3]);
        assert_eq!(q.len(), 1);
    }
}
