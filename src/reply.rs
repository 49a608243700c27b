// src/reply.rs

//! Reply trackers and the deadline reaper.
//!
//! A tracker records one expected reply. It is owned by the reply list of
//! the connection that received the request (the responder); the original
//! requester only ever holds a non-owning wait handle. Synchronous
//! requesters block on the tracker's condvar; asynchronous ones get a
//! timeout notification from the reaper.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::limits::MAX_REQUESTS_PENDING;
use crate::pool::Slice;
use crate::types::{ConnectionId, HandleToken, NameId};
use crate::util::monotonic_ns;

/// A queue entry delivered directly to a synchronous waiter, bypassing the
/// receive queue.
pub(crate) struct DirectEntry {
    pub slice: Slice,
    pub handles: Vec<HandleToken>,
}

pub(crate) struct ReplyState {
    pub waiting: bool,
    pub interrupted: bool,
    interrupt_requested: bool,
    pub deadline_ns: u64,
    pub done: Option<Result<()>>,
    pub entry: Option<DirectEntry>,
}

/// Sender-side bookkeeping for one in-flight request.
pub struct ReplyTracker {
    requester: Weak<Connection>,
    requester_id: ConnectionId,
    pub(crate) cookie: u64,
    pub(crate) name_id: Option<NameId>,
    pub(crate) sync: bool,
    state: Mutex<ReplyState>,
    cond: Condvar,
}

impl ReplyTracker {
    /// Arm a tracker on behalf of `requester`. Counts against its pending
    /// request quota.
    pub(crate) fn new(
        requester: &Arc<Connection>,
        cookie: u64,
        name_id: Option<NameId>,
        deadline_ns: u64,
        sync: bool,
    ) -> Result<Arc<Self>> {
        if requester.reply_count.fetch_add(1, Ordering::AcqRel) >= MAX_REQUESTS_PENDING {
            requester.reply_count.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Full);
        }
        Ok(Arc::new(ReplyTracker {
            requester: Arc::downgrade(requester),
            requester_id: requester.id(),
            cookie,
            name_id,
            sync,
            state: Mutex::new(ReplyState {
                waiting: sync,
                interrupted: false,
                interrupt_requested: false,
                deadline_ns,
                done: None,
                entry: None,
            }),
            cond: Condvar::new(),
        }))
    }

    pub fn requester_id(&self) -> ConnectionId {
        self.requester_id
    }

    pub(crate) fn deadline_ns(&self) -> u64 {
        self.state.lock().deadline_ns
    }

    /// Zero deadline marks a tracker whose peer died and whose
    /// notification is already out.
    pub(crate) fn clear_deadline(&self) {
        self.state.lock().deadline_ns = 0;
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.state.lock().waiting
    }

    pub(crate) fn resume_interrupted(&self) -> bool {
        let mut state = self.state.lock();
        if state.interrupted {
            state.interrupted = false;
            true
        } else {
            false
        }
    }

    /// Complete a synchronous wait: store the verdict (and, on success,
    /// the directly-delivered entry) and wake the requester.
    pub(crate) fn complete_sync(&self, verdict: Result<()>, entry: Option<DirectEntry>) {
        let mut state = self.state.lock();
        state.done = Some(verdict);
        state.entry = entry;
        state.waiting = false;
        self.cond.notify_all();
    }

    /// Ask a blocked waiter to return `Interrupted`, leaving the tracker
    /// linked for a later restart.
    pub(crate) fn request_interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupt_requested = true;
        self.cond.notify_all();
    }

    /// Wake the waiter without changing state, so it re-checks its
    /// requester's liveness.
    pub(crate) fn poke(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    /// Block until completion, interruption, requester shutdown or the
    /// absolute deadline. Returns the direct entry delivered by the
    /// responder.
    pub(crate) fn wait_sync(
        &self,
        deadline_ns: u64,
        still_active: impl Fn() -> bool,
    ) -> Result<Option<DirectEntry>> {
        let mut state = self.state.lock();
        loop {
            if let Some(verdict) = state.done.take() {
                verdict?;
                return Ok(state.entry.take());
            }
            if state.interrupt_requested {
                state.interrupt_requested = false;
                state.interrupted = true;
                return Err(Error::Interrupted);
            }
            if !still_active() {
                state.waiting = false;
                return Err(Error::ConnectionReset);
            }

            let now = monotonic_ns();
            if now >= deadline_ns {
                state.waiting = false;
                return Err(Error::TimedOut);
            }
            // bounded waits so a shutdown of the requester is noticed even
            // if nobody signals the condvar
            let chunk = (deadline_ns - now).min(10_000_000);
            self.cond
                .wait_for(&mut state, Duration::from_nanos(chunk));
        }
    }
}

impl Drop for ReplyTracker {
    fn drop(&mut self) {
        if let Some(requester) = self.requester.upgrade() {
            requester.reply_count.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Deadline reaper: one thread per bus, driving the per-connection reply
/// scans from a min-heap of `(deadline, connection)` pairs.
pub(crate) struct Reaper {
    shared: Arc<ReaperShared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

struct ReaperShared {
    heap: Mutex<ReaperQueue>,
    cond: Condvar,
}

struct ReaperQueue {
    deadlines: BinaryHeap<Reverse<(u64, ConnectionId)>>,
    stop: bool,
}

impl Reaper {
    pub fn new(bus: Weak<crate::bus::Bus>) -> Self {
        let shared = Arc::new(ReaperShared {
            heap: Mutex::new(ReaperQueue {
                deadlines: BinaryHeap::new(),
                stop: false,
            }),
            cond: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name("navette-reaper".into())
            .spawn(move || worker.run(bus))
            .ok();
        Reaper {
            shared,
            thread: Mutex::new(thread),
        }
    }

    /// Arm (or re-arm) the scan for `conn` at `deadline_ns`.
    pub fn schedule(&self, conn: ConnectionId, deadline_ns: u64) {
        let mut heap = self.shared.heap.lock();
        heap.deadlines.push(Reverse((deadline_ns, conn)));
        self.shared.cond.notify_one();
    }

    /// Stop the worker and wait for it to exit.
    pub fn shutdown(&self) {
        {
            let mut heap = self.shared.heap.lock();
            heap.stop = true;
            self.shared.cond.notify_one();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl ReaperShared {
    fn run(&self, bus: Weak<crate::bus::Bus>) {
        loop {
            let due: Option<ConnectionId> = {
                let mut heap = self.heap.lock();
                loop {
                    if heap.stop {
                        return;
                    }
                    match heap.deadlines.peek().copied() {
                        None => {
                            self.cond.wait(&mut heap);
                        }
                        Some(Reverse((deadline, conn))) => {
                            let now = monotonic_ns();
                            if deadline <= now {
                                heap.deadlines.pop();
                                break Some(conn);
                            }
                            self.cond.wait_for(
                                &mut heap,
                                Duration::from_nanos(deadline - now),
                            );
                        }
                    }
                }
            };

            let Some(conn_id) = due else { continue };
            let Some(bus) = bus.upgrade() else { return };
            if let Some(conn) = bus.find_conn_by_id(conn_id) {
                if let Some(next) = conn.reap_expired_replies(monotonic_ns()) {
                    let mut heap = self.heap.lock();
                    heap.deadlines.push(Reverse((next, conn_id)));
                }
            }
            bus.flush_notifications();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, BusCreateRequest};
    use crate::connection::{ConnectionFlags, HelloRequest};
    use crate::domain::Domain;
    use crate::endpoint::{Endpoint, EndpointAccess};
    use crate::error::Error;
    use crate::metadata::{AttachFlags, Credentials};
    use crate::pool::Pool;
    use crate::types::{BloomParameter, Gid, Uid};

    const UID: u32 = 800;

    fn bus() -> (Arc<Bus>, Arc<Endpoint>) {
        let domain = Domain::new();
        let bus = domain
            .create_bus(BusCreateRequest {
                name: format!("{UID}-replies"),
                flags: 0,
                bloom: BloomParameter { size: 8, n_hash: 1 },
                access: EndpointAccess { mode: 0o666, uid: Uid(UID), gid: Gid(UID) },
                cred: Credentials::for_user(UID),
            })
            .unwrap();
        let ep = bus.default_endpoint().unwrap();
        (bus, ep)
    }

    fn conn(ep: &Arc<Endpoint>) -> Arc<Connection> {
        ep.connect(HelloRequest {
            flags: ConnectionFlags::empty(),
            attach_flags: AttachFlags::empty(),
            pool_size: 4096,
            cred: Credentials::for_user(UID),
            items: Vec::new(),
        })
        .unwrap()
        .0
    }

    fn scratch_entry() -> DirectEntry {
        DirectEntry {
            slice: Pool::new(64).unwrap().alloc(8).unwrap(),
            handles: Vec::new(),
        }
    }

    #[test]
    fn pending_request_quota_is_enforced() {
        let (_bus, ep) = bus();
        let requester = conn(&ep);

        let mut held = Vec::new();
        for cookie in 0..MAX_REQUESTS_PENDING as u64 {
            held.push(
                ReplyTracker::new(&requester, cookie, None, u64::MAX, false).unwrap(),
            );
        }
        assert!(matches!(
            ReplyTracker::new(&requester, 999, None, u64::MAX, false),
            Err(Error::Full)
        ));

        // dropping a tracker frees its slot
        held.pop();
        assert!(ReplyTracker::new(&requester, 999, None, u64::MAX, false).is_ok());
    }

    #[test]
    fn completion_before_the_wait_returns_immediately() {
        let (_bus, ep) = bus();
        let requester = conn(&ep);
        let tracker =
            ReplyTracker::new(&requester, 1, None, u64::MAX, true).unwrap();

        tracker.complete_sync(Ok(()), Some(scratch_entry()));
        let direct = tracker.wait_sync(u64::MAX, || true).unwrap();
        assert_eq!(direct.unwrap().slice.len(), 8);
        assert!(!tracker.is_waiting());
    }

    #[test]
    fn wait_times_out_at_the_deadline() {
        let (_bus, ep) = bus();
        let requester = conn(&ep);
        let tracker =
            ReplyTracker::new(&requester, 2, None, monotonic_ns(), true).unwrap();

        assert!(matches!(
            tracker.wait_sync(monotonic_ns(), || true),
            Err(Error::TimedOut)
        ));
        assert!(!tracker.is_waiting());
    }

    #[test]
    fn interrupt_parks_the_tracker_for_restart() {
        let (_bus, ep) = bus();
        let requester = conn(&ep);
        let tracker =
            ReplyTracker::new(&requester, 3, None, u64::MAX, true).unwrap();

        tracker.request_interrupt();
        assert!(matches!(
            tracker.wait_sync(u64::MAX, || true),
            Err(Error::Interrupted)
        ));
        assert!(tracker.is_interrupted());
        // the restarted call claims it exactly once
        assert!(tracker.resume_interrupted());
        assert!(!tracker.resume_interrupted());
    }

    #[test]
    fn expired_async_trackers_notify_and_rearm_with_the_nearest_deadline() {
        let (bus, ep) = bus();
        let requester = conn(&ep);
        let responder = conn(&ep);

        let now = monotonic_ns();
        let far = now + 1_000_000_000;
        let expired =
            ReplyTracker::new(&requester, 10, None, now, false).unwrap();
        let pending =
            ReplyTracker::new(&requester, 11, None, far, false).unwrap();
        {
            let mut inner = responder.inner.lock();
            inner.replies.push(expired);
            inner.replies.push(pending);
        }

        assert_eq!(responder.reap_expired_replies(now + 1), Some(far));
        assert_eq!(responder.inner.lock().replies.len(), 1);

        bus.flush_notifications();
        let result = requester
            .recv(crate::connection::RecvCommand {
                offset: 0,
                priority: 0,
                flags: crate::connection::RecvFlags::empty(),
            })
            .unwrap();
        let record = crate::message::DeliveredMessage::decode(
            &requester.pool_read(result.offset).unwrap(),
        )
        .unwrap();
        assert_eq!(record.src, None);
        assert_eq!(record.cookie_reply, 10);
        assert!(record
            .items
            .iter()
            .any(|i| matches!(i, crate::item::Item::ReplyTimeout)));
    }

    #[test]
    fn sync_trackers_are_left_to_their_waiter() {
        let (_bus, ep) = bus();
        let requester = conn(&ep);
        let responder = conn(&ep);

        let now = monotonic_ns();
        let tracker = ReplyTracker::new(&requester, 12, None, now, true).unwrap();
        responder.inner.lock().replies.push(tracker);

        // an expired sync tracker is not reaped while uninterrupted
        assert_eq!(responder.reap_expired_replies(now + 1), None);
        assert_eq!(responder.inner.lock().replies.len(), 1);
    }
}
