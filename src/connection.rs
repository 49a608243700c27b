// src/connection.rs

//! Connection lifecycle, the active-reference barrier, and the receive
//! path.
//!
//! A connection moves through `New -> Active -> Disconnecting -> Dead`.
//! Command paths take an active reference first; disconnect flips the
//! barrier and waits for the last reference to drain before tearing the
//! queue, names and reply state down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::item::Item;
use crate::limits::{
    MAX_CONN_PER_USER, MAX_MSGS, MAX_MSGS_PER_USER, MAX_POOL_SIZE, MIN_POOL_SIZE,
};
use crate::match_db::MatchDb;
use crate::message::Envelope;
use crate::names::AcquireOutcome;
use crate::metadata::{AttachFlags, Credentials, Metadata};
use crate::names::NameFlags;
use crate::policy::PolicyOwner;
use crate::pool::Pool;
use crate::queue::{Queue, QueueEntry};
use crate::reply::ReplyTracker;
use crate::types::{ConnectionId, HandleToken, NameId, Uid};

/// Barrier bias added on disconnect; the disconnecting thread waits for
/// the counter to come back to exactly this value.
const ACTIVE_BIAS: i64 = i64::MIN + 1;

/// Credential fields snapshotted into a connection's metadata buffer at
/// registration.
const CREATION_META: AttachFlags = AttachFlags::CREDS
    .union(AttachFlags::PID_COMM)
    .union(AttachFlags::TID_COMM)
    .union(AttachFlags::EXE)
    .union(AttachFlags::CMDLINE)
    .union(AttachFlags::CGROUP)
    .union(AttachFlags::CAPS)
    .union(AttachFlags::SECLABEL)
    .union(AttachFlags::AUDIT);

bitflags! {
    /// Role and behavior flags fixed at registration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnectionFlags: u64 {
        /// Accept transferable handles in inbound messages.
        const ACCEPT_HANDLES = 1 << 0;
        /// Receive a copy of all bus traffic; cannot send.
        const MONITOR        = 1 << 1;
        /// Hold a name on behalf of an implementor to be started on
        /// demand.
        const ACTIVATOR      = 1 << 2;
        /// Own policy entries for names without implementing them.
        const POLICY_HOLDER  = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecvFlags: u64 {
        /// Discard the entry instead of delivering it.
        const DROP         = 1 << 0;
        /// Report the slice offset without consuming the entry.
        const PEEK         = 1 << 1;
        /// Only deliver entries at or above the given priority.
        const USE_PRIORITY = 1 << 2;
    }
}

/// Registration request, as decoded by the command transport.
pub struct HelloRequest {
    pub flags: ConnectionFlags,
    pub attach_flags: AttachFlags,
    pub pool_size: u64,
    /// Principal snapshot taken by the transport.
    pub cred: Credentials,
    /// Optional items: `Name` (activator/policy holder), `PolicyAccess`,
    /// `Creds`/`Seclabel` (privileged impersonation), `ConnDescription`.
    pub items: Vec<Item>,
}

/// What a successful registration reports back.
#[derive(Debug, Clone)]
pub struct HelloReply {
    pub id: ConnectionId,
    pub bus_id: crate::types::BusId,
    pub bus_flags: u64,
    pub bloom: crate::types::BloomParameter,
}

/// Receive command.
#[derive(Debug, Clone, Copy)]
pub struct RecvCommand {
    /// Must be zero on input; the published slice offset on success.
    pub offset: u64,
    pub priority: i64,
    pub flags: RecvFlags,
}

/// Receive result.
#[derive(Debug)]
pub struct RecvResult {
    pub offset: u64,
    /// Handles installed for the receiver; empty for PEEK and DROP.
    pub handles: Vec<HandleToken>,
}

/// Query for `ConnInfo`.
#[derive(Debug, Clone)]
pub struct InfoQuery {
    pub id: Option<ConnectionId>,
    pub name: Option<String>,
    pub attach_flags: AttachFlags,
}

pub(crate) struct ConnectionInner {
    pub pool: Pool,
    pub queue: Queue,
    /// Trackers for requests this connection received and still owes a
    /// reply to. The tracker is owned here; requesters hold wait handles.
    pub replies: Vec<Arc<ReplyTracker>>,
    /// Trackers threads of this connection are currently blocked on.
    pub sync_waits: Vec<Arc<ReplyTracker>>,
    /// Names owned right now, in acquisition order.
    pub names: Vec<(NameId, String)>,
    /// Lazy per-sending-user message counters.
    msg_users: Option<HashMap<u32, usize>>,
}

/// A registered bus participant.
pub struct Connection {
    id: ConnectionId,
    flags: ConnectionFlags,
    description: Option<String>,
    bus: Arc<Bus>,
    ep: Arc<Endpoint>,
    cred: Credentials,
    meta: Metadata,
    /// Impersonated identity installed by a privileged creator. When set,
    /// outbound metadata is restricted to this snapshot plus names and
    /// description.
    owner_meta: Option<Metadata>,
    attach_flags: AtomicU64,
    active: AtomicI64,
    barrier: Mutex<()>,
    barrier_cv: Condvar,
    pub(crate) reply_count: AtomicUsize,
    name_count: AtomicUsize,
    user: Arc<crate::domain::UserAccount>,
    match_db: MatchDb,
    pub(crate) inner: Mutex<ConnectionInner>,
    /// Signalled when the queue gains an entry; the transport's poll hook.
    wait: Condvar,
}

/// RAII active reference; releasing the last one wakes a pending
/// disconnect.
pub(crate) struct ActiveRef<'a> {
    conn: &'a Connection,
}

impl Drop for ActiveRef<'_> {
    fn drop(&mut self) {
        let v = self.conn.active.fetch_sub(1, Ordering::AcqRel) - 1;
        if v == ACTIVE_BIAS {
            let _guard = self.conn.barrier.lock();
            self.conn.barrier_cv.notify_all();
        }
    }
}

impl Connection {
    /// Register a new connection on `ep` per the Hello contract.
    pub(crate) fn new(ep: &Arc<Endpoint>, hello: HelloRequest) -> Result<(Arc<Self>, HelloReply)> {
        let bus = ep.bus().clone();

        let is_monitor = hello.flags.contains(ConnectionFlags::MONITOR);
        let is_activator = hello.flags.contains(ConnectionFlags::ACTIVATOR);
        let is_policy_holder = hello.flags.contains(ConnectionFlags::POLICY_HOLDER);

        if (is_monitor && (is_activator || is_policy_holder))
            || (is_activator && is_policy_holder)
        {
            return Err(Error::InvalidArgument);
        }
        if (is_monitor || is_activator || is_policy_holder)
            && !bus.cred_is_privileged(&hello.cred)
        {
            return Err(Error::PermissionDenied);
        }
        if hello.pool_size < MIN_POOL_SIZE
            || hello.pool_size > MAX_POOL_SIZE
            || hello.pool_size % 8 != 0
        {
            return Err(Error::InvalidArgument);
        }

        let mut name: Option<String> = None;
        let mut impersonated_creds: Option<Item> = None;
        let mut impersonated_label: Option<Item> = None;
        let mut description: Option<String> = None;
        for item in &hello.items {
            match item {
                Item::Name(n) => {
                    if !is_activator && !is_policy_holder {
                        return Err(Error::InvalidArgument);
                    }
                    if name.is_some() {
                        return Err(Error::InvalidArgument);
                    }
                    if !crate::util::name_is_valid(n, is_policy_holder) {
                        return Err(Error::InvalidArgument);
                    }
                    name = Some(n.clone());
                }
                Item::Creds(_) => {
                    if !bus.cred_is_privileged(&hello.cred) {
                        return Err(Error::PermissionDenied);
                    }
                    impersonated_creds = Some(item.clone());
                }
                Item::Seclabel(_) => {
                    if !bus.cred_is_privileged(&hello.cred) {
                        return Err(Error::PermissionDenied);
                    }
                    impersonated_label = Some(item.clone());
                }
                Item::ConnDescription(d) => {
                    if description.is_some() {
                        return Err(Error::InvalidArgument);
                    }
                    description = Some(d.clone());
                }
                Item::PolicyAccess(_) => {}
                _ => {}
            }
        }

        if (is_activator || is_policy_holder) && name.is_none() {
            return Err(Error::InvalidArgument);
        }

        let owner_meta = if impersonated_creds.is_some() || impersonated_label.is_some() {
            let mut meta = Metadata::new(&hello.cred);
            if let Some(item) = impersonated_creds {
                meta.append_item(item, AttachFlags::CREDS);
            }
            if let Some(item) = impersonated_label {
                meta.append_item(item, AttachFlags::SECLABEL);
            }
            Some(meta)
        } else {
            None
        };

        // credential snapshot; faked identities replace it entirely
        let meta = match &owner_meta {
            Some(m) => m.dup(),
            None => {
                let mut m = Metadata::new(&hello.cred);
                m.append(&hello.cred, &[], None, 0, CREATION_META);
                m
            }
        };

        let id = bus.next_conn_id();

        let user = match ep.anonymous_user() {
            Some(user) => user,
            None => bus.domain().get_user(Uid(hello.cred.fsuid.0)),
        };

        let conn = Arc::new(Connection {
            id,
            flags: hello.flags,
            description,
            bus: bus.clone(),
            ep: ep.clone(),
            cred: hello.cred,
            meta,
            owner_meta,
            attach_flags: AtomicU64::new(hello.attach_flags.bits()),
            active: AtomicI64::new(0),
            barrier: Mutex::new(()),
            barrier_cv: Condvar::new(),
            reply_count: AtomicUsize::new(0),
            name_count: AtomicUsize::new(0),
            user,
            match_db: MatchDb::new(),
            inner: Mutex::new(ConnectionInner {
                pool: Pool::new(hello.pool_size)?,
                queue: Queue::new(),
                replies: Vec::new(),
                sync_waits: Vec::new(),
                names: Vec::new(),
                msg_users: None,
            }),
            wait: Condvar::new(),
        });

        // policy holders may install entries; activators pin their name
        if is_policy_holder || is_activator {
            bus.policy_db().set(
                PolicyOwner::Connection(id),
                &hello.items,
                1,
                is_policy_holder,
            )?;
        }

        if is_activator {
            let activator_name = name.as_deref().unwrap_or_default();
            if let Err(e) =
                bus.registry()
                    .acquire(&bus, &conn, activator_name, NameFlags::ACTIVATOR)
            {
                bus.policy_db().remove_owner(PolicyOwner::Connection(id));
                return Err(e);
            }
        }

        let privileged = bus.cred_is_privileged(&conn.cred);
        if !privileged
            && conn.user.connections.fetch_add(1, Ordering::AcqRel) + 1 > MAX_CONN_PER_USER
        {
            conn.user.connections.fetch_sub(1, Ordering::AcqRel);
            bus.registry().remove_by_conn(&bus, &conn);
            bus.policy_db().remove_owner(PolicyOwner::Connection(id));
            return Err(Error::Full);
        }
        if privileged {
            conn.user.connections.fetch_add(1, Ordering::AcqRel);
        }

        if let Err(e) = bus.link_connection(&conn, is_monitor) {
            conn.user.connections.fetch_sub(1, Ordering::AcqRel);
            bus.registry().remove_by_conn(&bus, &conn);
            bus.policy_db().remove_owner(PolicyOwner::Connection(id));
            return Err(e);
        }

        bus.notify_id_add(conn.id, conn.role_bits());
        bus.flush_notifications();
        debug!(conn = %conn.id, flags = ?conn.flags, "connection registered");

        let reply = HelloReply {
            id,
            bus_id: bus.id128(),
            bus_flags: bus.bus_flags(),
            bloom: bus.bloom(),
        };
        Ok((conn, reply))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub(crate) fn ep(&self) -> &Arc<Endpoint> {
        &self.ep
    }

    pub(crate) fn cred(&self) -> &Credentials {
        &self.cred
    }

    pub(crate) fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub(crate) fn owner_meta(&self) -> Option<&Metadata> {
        self.owner_meta.as_ref()
    }

    pub fn is_ordinary(&self) -> bool {
        !self.flags.intersects(
            ConnectionFlags::MONITOR
                | ConnectionFlags::ACTIVATOR
                | ConnectionFlags::POLICY_HOLDER,
        )
    }

    pub fn is_monitor(&self) -> bool {
        self.flags.contains(ConnectionFlags::MONITOR)
    }

    pub fn is_activator(&self) -> bool {
        self.flags.contains(ConnectionFlags::ACTIVATOR)
    }

    pub fn is_policy_holder(&self) -> bool {
        self.flags.contains(ConnectionFlags::POLICY_HOLDER)
    }

    pub fn accepts_handles(&self) -> bool {
        self.flags.contains(ConnectionFlags::ACCEPT_HANDLES)
    }

    pub(crate) fn role_bits(&self) -> u64 {
        self.flags.bits()
    }

    pub(crate) fn attach_flags(&self) -> AttachFlags {
        AttachFlags::from_bits_truncate(self.attach_flags.load(Ordering::Acquire))
    }

    /// Connection has not entered disconnect yet. Without an active
    /// reference this is only a snapshot.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) >= 0
    }

    /// Take an active reference, failing once disconnect has begun.
    pub(crate) fn acquire_active(&self) -> Result<ActiveRef<'_>> {
        let ok = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v >= 0).then_some(v + 1)
            })
            .is_ok();
        if ok {
            Ok(ActiveRef { conn: self })
        } else {
            Err(Error::ConnectionReset)
        }
    }

    pub fn name_count(&self) -> usize {
        self.name_count.load(Ordering::Acquire)
    }

    /// Names currently owned, paired with their registry stamps.
    pub fn owned_names(&self) -> Vec<(NameId, String)> {
        self.inner.lock().names.clone()
    }

    pub(crate) fn owned_name_strings(&self) -> Vec<String> {
        self.inner
            .lock()
            .names
            .iter()
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn owns_name(&self, name: &str) -> bool {
        self.inner.lock().names.iter().any(|(_, n)| n == name)
    }

    pub(crate) fn note_name_gained(&self, name_id: NameId, name: &str) {
        self.inner.lock().names.push((name_id, name.to_owned()));
        self.name_count.fetch_add(1, Ordering::AcqRel);
        self.purge_policy_cache();
    }

    pub(crate) fn note_name_lost(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.names.iter().position(|(_, n)| n == name) {
            inner.names.remove(pos);
            drop(inner);
            self.name_count.fetch_sub(1, Ordering::AcqRel);
            self.purge_policy_cache();
        }
    }

    fn purge_policy_cache(&self) {
        self.bus.policy_db().purge_cache(self.id);
        if let Some(db) = self.ep.policy_db() {
            db.purge_cache(self.id);
        }
    }

    /// Block until the queue has an entry or `timeout` passes. This is
    /// the transport's opt-in suspension point for receive.
    pub fn wait_for_message(&self, timeout: std::time::Duration) -> bool {
        let mut inner = self.inner.lock();
        if !inner.queue.is_empty() {
            return true;
        }
        self.wait.wait_for(&mut inner, timeout);
        !inner.queue.is_empty()
    }

    /// Enqueue a serialized envelope, charging quotas. Runs under this
    /// connection's lock; the caller holds no other connection lock.
    pub(crate) fn enqueue(
        &self,
        src: Option<&Arc<Connection>>,
        env: &Envelope,
        reply: Option<Arc<ReplyTracker>>,
    ) -> Result<()> {
        let privileged = src
            .map(|s| self.bus.cred_is_privileged(s.cred()))
            .unwrap_or(true);

        let mut inner = self.inner.lock();

        if !privileged && inner.queue.len() >= MAX_MSGS {
            return Err(Error::Full);
        }
        if !self.is_active() {
            return Err(Error::ConnectionReset);
        }
        if env.handle_count() > 0 && !self.accepts_handles() {
            return Err(Error::Communication);
        }

        let charged_user = if privileged {
            None
        } else {
            charge_user(&mut inner, src, MAX_MSGS_PER_USER)?
        };

        let record = env.encode();
        let slice = inner.pool.alloc(record.len() as u64)?;
        if let Err(e) = inner.pool.copy(slice, 0, &record) {
            let _ = inner.pool.free(slice);
            return Err(e);
        }

        let entry = QueueEntry {
            slice,
            src: env.src,
            cookie: env.msg.cookie,
            priority: env.msg.priority,
            dst_name_id: env.dst_name_id,
            reply: reply.clone(),
            handles: env.msg.handles().collect(),
            charged_user,
        };
        inner.queue.add(entry);
        if let Some(tracker) = reply {
            let arm = (!tracker.sync).then(|| tracker.deadline_ns());
            inner.replies.push(tracker);
            if let Some(deadline_ns) = arm {
                self.bus.reaper().schedule(self.id, deadline_ns);
            }
        }
        drop(inner);

        self.wait.notify_all();
        Ok(())
    }

    /// Receive per the `Recv` contract.
    pub fn recv(self: &Arc<Self>, cmd: RecvCommand) -> Result<RecvResult> {
        let _active = self.acquire_active()?;
        if cmd.offset != 0 {
            return Err(Error::InvalidArgument);
        }

        let result = {
            let mut inner = self.inner.lock();
            let key = inner
                .queue
                .peek(cmd.priority, cmd.flags.contains(RecvFlags::USE_PRIORITY))?;

            if cmd.flags.contains(RecvFlags::DROP) {
                let entry = match inner.queue.remove(key) {
                    Some(e) => e,
                    None => return Err(Error::Empty),
                };
                self.resolve_dropped_reply(&mut inner, &entry);
                uncharge_user(&mut inner, &entry);
                let _ = inner.pool.free(entry.slice);
                RecvResult { offset: 0, handles: Vec::new() }
            } else if cmd.flags.contains(RecvFlags::PEEK) {
                let entry = inner.queue.get(key).ok_or(Error::Empty)?;
                let slice = entry.slice;
                inner.pool.flush(slice);
                RecvResult { offset: slice.offset(), handles: Vec::new() }
            } else {
                let entry = match inner.queue.remove(key) {
                    Some(e) => e,
                    None => return Err(Error::Empty),
                };
                uncharge_user(&mut inner, &entry);
                inner.pool.publish(entry.slice)?;
                inner.pool.flush(entry.slice);
                RecvResult {
                    offset: entry.slice.offset(),
                    handles: entry.handles,
                }
            }
        };

        self.bus.flush_notifications();
        Ok(result)
    }

    /// Release a received slice back to the pool.
    pub fn pool_release(&self, offset: u64) -> Result<()> {
        let _active = self.acquire_active()?;
        self.inner.lock().pool.release(offset)
    }

    /// Read a published or private slice; test and transport glue.
    pub fn pool_read(&self, offset: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let len = inner.pool.slice_len(offset).ok_or(Error::NotFound)?;
        Ok(inner.pool.read(offset, len)?.to_vec())
    }

    /// Queue length snapshot.
    pub fn queued_messages(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// A dropped entry that still carries a reply tracker resolves it:
    /// sync waiters learn the pipe broke, async requesters get a
    /// notification.
    fn resolve_dropped_reply(&self, inner: &mut ConnectionInner, entry: &QueueEntry) {
        let Some(tracker) = &entry.reply else { return };
        let Some(pos) = inner
            .replies
            .iter()
            .position(|r| Arc::ptr_eq(r, tracker))
        else {
            // already resolved by an incoming reply
            return;
        };
        let tracker = inner.replies.remove(pos);
        if tracker.sync {
            tracker.complete_sync(Err(Error::BrokenPipe), None);
        } else if let Some(src) = entry.src {
            self.bus.notify_reply_dead(src, entry.cookie);
        }
    }

    /// Find a pending tracker for (`requester`, `cookie`) in this
    /// connection's reply list.
    pub(crate) fn find_reply(
        &self,
        requester: ConnectionId,
        cookie: u64,
    ) -> Option<Arc<ReplyTracker>> {
        self.inner
            .lock()
            .replies
            .iter()
            .find(|r| r.requester_id() == requester && r.cookie == cookie)
            .cloned()
    }

    /// Unlink a tracker from the reply list, if still present.
    pub(crate) fn unlink_reply(&self, tracker: &Arc<ReplyTracker>) -> bool {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.replies.iter().position(|r| Arc::ptr_eq(r, tracker)) {
            inner.replies.remove(pos);
            true
        } else {
            false
        }
    }

    pub(crate) fn register_sync_wait(&self, tracker: &Arc<ReplyTracker>) {
        self.inner.lock().sync_waits.push(tracker.clone());
    }

    pub(crate) fn unregister_sync_wait(&self, tracker: &Arc<ReplyTracker>) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner
            .sync_waits
            .iter()
            .position(|t| Arc::ptr_eq(t, tracker))
        {
            inner.sync_waits.remove(pos);
        }
    }

    /// Evaluate this connection's match rules against a message.
    pub(crate) fn matches(&self, src: Option<&Arc<Connection>>, env: &Envelope) -> bool {
        let view = src.map(|s| s.as_ref() as &dyn crate::match_db::SenderView);
        self.match_db.matches(view, env)
    }

    /// Install a broadcast/notification subscription rule.
    pub fn match_add(self: &Arc<Self>, rule: crate::match_db::MatchRule) -> Result<()> {
        let _active = self.acquire_active()?;
        if !self.is_ordinary() && !self.is_monitor() {
            return Err(Error::PermissionDenied);
        }
        self.match_db.add(rule)
    }

    /// Drop the rules registered under `cookie`.
    pub fn match_remove(self: &Arc<Self>, cookie: u64) -> Result<()> {
        let _active = self.acquire_active()?;
        self.match_db.remove(cookie)
    }

    /// Acquire a well-known name (the `NameAcquire` command).
    pub fn name_acquire(
        self: &Arc<Self>,
        name: &str,
        flags: NameFlags,
    ) -> Result<AcquireOutcome> {
        let _active = self.acquire_active()?;
        if !self.is_ordinary() {
            return Err(Error::PermissionDenied);
        }
        if flags.contains(NameFlags::ACTIVATOR) {
            return Err(Error::InvalidArgument);
        }
        self.ep.policy_check_own_access(self, name)?;
        let outcome = self.bus.registry().acquire(&self.bus, self, name, flags)?;
        self.bus.flush_notifications();
        Ok(outcome)
    }

    /// Release a well-known name (the `NameRelease` command). Ownership
    /// transfers to the activator or the first queued waiter, if any.
    pub fn name_release(self: &Arc<Self>, name: &str) -> Result<()> {
        let _active = self.acquire_active()?;
        if !self.is_ordinary() {
            return Err(Error::PermissionDenied);
        }
        let result = self.bus.registry().release(&self.bus, self, name);
        self.bus.flush_notifications();
        result
    }

    /// Allocate a directly-delivered reply in this connection's pool and
    /// complete the tracker its waiter blocks on. The queue never sees
    /// this entry.
    pub(crate) fn deliver_direct_entry(
        &self,
        env: &Envelope,
        tracker: &Arc<ReplyTracker>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if !tracker.is_waiting() || !self.is_active() {
            return Err(Error::ConnectionReset);
        }
        let record = env.encode();
        let slice = inner.pool.alloc(record.len() as u64)?;
        if let Err(e) = inner.pool.copy(slice, 0, &record) {
            let _ = inner.pool.free(slice);
            return Err(e);
        }
        tracker.complete_sync(
            Ok(()),
            Some(crate::reply::DirectEntry {
                slice,
                handles: env.msg.handles().collect(),
            }),
        );
        Ok(())
    }

    /// Publish a directly-delivered slice to this (waiting) connection
    /// and hand back its offset.
    pub(crate) fn install_direct_entry(
        &self,
        entry: crate::reply::DirectEntry,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.pool.publish(entry.slice)?;
        inner.pool.flush(entry.slice);
        Ok(entry.slice.offset())
    }

    /// Transport hook: ask blocked synchronous sends to return
    /// `Interrupted`. With a cookie only that wait is interrupted.
    pub fn interrupt(&self, cookie: Option<u64>) {
        let inner = self.inner.lock();
        for tracker in &inner.sync_waits {
            if cookie.is_none() || cookie == Some(tracker.cookie) {
                tracker.request_interrupt();
            }
        }
    }

    /// Cancel a pending synchronous request by cookie: completes the
    /// matching tracker on whichever connection holds it.
    pub fn cancel(self: &Arc<Self>, cookie: u64) -> Result<()> {
        let _active = self.acquire_active()?;
        if self.reply_count.load(Ordering::Acquire) == 0 {
            return Err(Error::NotFound);
        }

        let mut found = false;
        for other in self.bus.connections_snapshot() {
            if Arc::ptr_eq(&other, self) {
                continue;
            }
            if let Some(tracker) = other.find_reply(self.id, cookie) {
                if tracker.sync && other.unlink_reply(&tracker) {
                    tracker.complete_sync(Err(Error::Cancelled), None);
                    found = true;
                }
            }
        }
        if found {
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    /// Adopt queued messages and reply trackers addressed to `name_id`
    /// from `src`. Used for activator handoffs in both directions.
    ///
    /// The payload bytes are lifted out of the source pool first, so the
    /// two connection locks are never held at the same time.
    pub(crate) fn adopt_messages_from(
        self: &Arc<Self>,
        src: &Arc<Connection>,
        name_id: NameId,
    ) -> Result<()> {
        let (entries, trackers) = {
            let mut src_inner = src.inner.lock();
            let extracted = src_inner.queue.extract_for_name(name_id);
            let mut entries = Vec::with_capacity(extracted.len());
            for entry in extracted {
                uncharge_user(&mut src_inner, &entry);
                let bytes = src_inner
                    .pool
                    .read(entry.slice.offset(), entry.slice.len())
                    .map(<[u8]>::to_vec);
                let _ = src_inner.pool.free(entry.slice);
                if let Ok(bytes) = bytes {
                    entries.push((entry, bytes));
                }
            }
            let (moved, kept): (Vec<_>, Vec<_>) = src_inner
                .replies
                .drain(..)
                .partition(|r| r.name_id == Some(name_id));
            src_inner.replies = kept;
            (entries, moved)
        };

        let mut inner = self.inner.lock();
        if !self.is_active() {
            // adopter died first; the traffic is dropped on the floor
            return Err(Error::ConnectionReset);
        }

        for (mut entry, bytes) in entries {
            let slice = match inner.pool.alloc(bytes.len() as u64) {
                Ok(s) => s,
                Err(e) => {
                    warn!(dst = %self.id, error = %e, "dropping message during name handoff");
                    continue;
                }
            };
            if inner.pool.copy(slice, 0, &bytes).is_err() {
                let _ = inner.pool.free(slice);
                continue;
            }
            entry.slice = slice;
            entry.charged_user = None;
            inner.queue.add(entry);
        }
        inner.replies.extend(trackers);
        drop(inner);

        self.wait.notify_all();
        Ok(())
    }

    /// Scan the reply list for expired trackers; returns the nearest
    /// remaining deadline.
    pub(crate) fn reap_expired_replies(&self, now: u64) -> Option<u64> {
        if !self.is_active() {
            return None;
        }
        let mut nearest: Option<u64> = None;
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        inner.replies.retain(|tracker| {
            if tracker.sync && !tracker.is_interrupted() {
                // handled by the waiter's own timed wait
                return true;
            }
            let deadline = tracker.deadline_ns();
            if deadline > now {
                nearest = Some(nearest.map_or(deadline, |n| n.min(deadline)));
                return true;
            }
            expired.push(tracker.clone());
            false
        });
        drop(inner);

        for tracker in expired {
            if tracker.deadline_ns() != 0 && !tracker.is_interrupted() {
                self.bus
                    .notify_reply_timeout(tracker.requester_id(), tracker.cookie);
            }
        }
        nearest
    }

    /// Update attach flags (ordinary/monitor) or policy entries (policy
    /// holder).
    pub fn update(self: &Arc<Self>, items: &[Item]) -> Result<()> {
        let _active = self.acquire_active()?;

        let mut new_attach: Option<u64> = None;
        let mut policy_touched = false;
        for item in items {
            match item {
                Item::AttachFlags(bits) => {
                    if !self.is_ordinary() && !self.is_monitor() {
                        return Err(Error::PermissionDenied);
                    }
                    new_attach = Some(*bits);
                }
                Item::Name(_) | Item::PolicyAccess(_) => {
                    if !self.is_policy_holder() {
                        return Err(Error::PermissionDenied);
                    }
                    policy_touched = true;
                }
                _ => return Err(Error::InvalidArgument),
            }
        }

        if policy_touched {
            self.bus.policy_db().set(
                PolicyOwner::Connection(self.id),
                items,
                0,
                true,
            )?;
        }
        if let Some(bits) = new_attach {
            self.attach_flags.store(bits, Ordering::Release);
        }
        Ok(())
    }

    /// `ConnInfo`: write a record about another connection into this
    /// connection's pool and return its offset.
    pub fn conn_info(self: &Arc<Self>, query: &InfoQuery) -> Result<u64> {
        let _active = self.acquire_active()?;

        let owner = match (&query.id, &query.name) {
            (Some(id), _) => {
                let owner = self
                    .bus
                    .find_conn_by_id(*id)
                    .ok_or(Error::NotFound)?;
                self.ep.policy_check_src_names(&owner, self)?;
                owner
            }
            (None, Some(name)) => {
                if !crate::util::name_is_valid(name, false) {
                    return Err(Error::InvalidArgument);
                }
                self.ep.policy_check_see_access(self, name)?;
                let (owner_id, _) = self
                    .bus
                    .registry()
                    .lookup(name)
                    .ok_or(Error::NotFound)?;
                self.bus
                    .find_conn_by_id(owner_id)
                    .ok_or(Error::NotFound)?
            }
            (None, None) => return Err(Error::InvalidArgument),
        };

        let mut items: Vec<Item> = Vec::new();
        if self.meta.ns_eq(owner.meta()) {
            items.extend(owner.meta().items().iter().cloned());
        }
        // names and description are live state, appended at query time
        let fresh_flags =
            query.attach_flags & (AttachFlags::NAMES | AttachFlags::CONN_DESCRIPTION);
        if !fresh_flags.is_empty() {
            let mut fresh = Metadata::new(owner.cred());
            fresh.append(
                owner.cred(),
                &owner.owned_names(),
                owner.description(),
                0,
                fresh_flags,
            );
            items.extend(fresh.items().iter().cloned());
        }

        let record = encode_info_record(owner.id().get(), owner.role_bits(), &items);
        self.write_record_to_pool(&record)
    }

    /// `NameList`: write the requested registry view into this
    /// connection's pool, honoring SEE policy per name.
    pub fn name_list(self: &Arc<Self>, flags: crate::names::NameListFlags) -> Result<u64> {
        use crate::names::NameListFlags;

        let _active = self.acquire_active()?;
        let mut items: Vec<Item> = Vec::new();

        if flags.contains(NameListFlags::UNIQUE) {
            for conn in self.bus.connections_snapshot() {
                items.push(Item::IdAdd(crate::item::IdFlags {
                    id: conn.id().get(),
                    flags: conn.role_bits(),
                }));
            }
        }

        for row in self.bus.registry().snapshot() {
            if self.ep.policy_check_see_access(self, &row.name).is_err() {
                continue;
            }
            let activator_held = row.flags.contains(NameFlags::ACTIVATOR);
            let wanted = if activator_held {
                NameListFlags::ACTIVATORS
            } else {
                NameListFlags::NAMES
            };
            if flags.contains(wanted) {
                items.push(Item::NameChange {
                    old: crate::item::IdFlags { id: 0, flags: 0 },
                    new: crate::item::IdFlags {
                        id: row.owner.get(),
                        flags: row.flags.bits(),
                    },
                    name: row.name.clone(),
                });
            }
            if flags.contains(NameListFlags::QUEUED) {
                for waiter in &row.queued {
                    items.push(Item::NameChange {
                        old: crate::item::IdFlags {
                            id: waiter.get(),
                            flags: (row.flags | NameFlags::IN_QUEUE).bits(),
                        },
                        new: crate::item::IdFlags {
                            id: row.owner.get(),
                            flags: row.flags.bits(),
                        },
                        name: row.name.clone(),
                    });
                }
            }
        }
        let record = encode_info_record(0, 0, &items);
        self.write_record_to_pool(&record)
    }

    /// Write an `{id, flags, items}` record into this connection's pool.
    pub(crate) fn write_info_record(
        &self,
        id: u64,
        flags: u64,
        items: &[Item],
    ) -> Result<u64> {
        let record = encode_info_record(id, flags, items);
        self.write_record_to_pool(&record)
    }

    fn write_record_to_pool(&self, record: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let slice = inner.pool.alloc(record.len() as u64)?;
        if let Err(e) = inner.pool.copy(slice, 0, record) {
            let _ = inner.pool.free(slice);
            return Err(e);
        }
        inner.pool.flush(slice);
        inner.pool.publish(slice)?;
        Ok(slice.offset())
    }

    /// Disconnect this connection.
    ///
    /// With `ensure_queue_empty`, refuses while inbound messages are
    /// still queued. Redundant calls report `AlreadyDone`.
    pub fn disconnect(self: &Arc<Self>, ensure_queue_empty: bool) -> Result<()> {
        {
            let inner = self.inner.lock();
            if !self.is_active() {
                return Err(Error::AlreadyDone);
            }
            if ensure_queue_empty && !inner.queue.is_empty() {
                return Err(Error::Busy);
            }
            self.active.fetch_add(ACTIVE_BIAS, Ordering::AcqRel);
        }

        // wake everything that might hold an active reference
        self.wait.notify_all();
        {
            let inner = self.inner.lock();
            for tracker in &inner.sync_waits {
                tracker.poke();
            }
        }

        // barrier: wait for the last active reference
        {
            let mut guard = self.barrier.lock();
            while self.active.load(Ordering::Acquire) != ACTIVE_BIAS {
                self.barrier_cv.wait(&mut guard);
            }
        }

        self.bus.unlink_connection(self);

        // release names; queued traffic moves back to activators
        self.bus.registry().remove_by_conn(&self.bus, self);

        // pending requests we received die with us
        let (dead_entries, trackers) = {
            let mut inner = self.inner.lock();
            let entries: Vec<QueueEntry> = inner.queue.drain().collect();
            for e in &entries {
                uncharge_user(&mut inner, e);
            }
            let trackers = std::mem::take(&mut inner.replies);
            for e in &entries {
                let _ = inner.pool.free(e.slice);
            }
            (entries, trackers)
        };
        for entry in &dead_entries {
            if entry.reply.is_some() {
                if let Some(src) = entry.src {
                    self.bus.notify_reply_dead(src, entry.cookie);
                }
            }
        }
        for tracker in trackers {
            if tracker.sync {
                tracker.complete_sync(Err(Error::BrokenPipe), None);
            } else {
                self.bus
                    .notify_reply_dead(tracker.requester_id(), tracker.cookie);
            }
        }

        // requests we sent and never saw answered: tell the responders
        for other in self.bus.connections_snapshot() {
            if Arc::ptr_eq(&other, self) {
                continue;
            }
            let mut stale = Vec::new();
            {
                let mut inner = other.inner.lock();
                inner.replies.retain(|r| {
                    if r.requester_id() == self.id {
                        stale.push(r.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            for tracker in stale {
                tracker.clear_deadline();
                self.bus.notify_reply_dead(other.id(), tracker.cookie);
            }
        }

        self.bus.notify_id_remove(self.id, self.role_bits());
        self.bus.flush_notifications();
        self.user.connections.fetch_sub(1, Ordering::AcqRel);
        self.bus.policy_db().remove_owner(PolicyOwner::Connection(self.id));
        self.purge_policy_cache();

        debug!(conn = %self.id, "connection disconnected");
        Ok(())
    }
}

impl crate::match_db::SenderView for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn owns_name(&self, name: &str) -> bool {
        Connection::owns_name(self, name)
    }
}

/// Charge the per-sending-user quota, activating lazy accounting once the
/// queue crosses the per-user mark.
fn charge_user(
    inner: &mut ConnectionInner,
    src: Option<&Arc<Connection>>,
    per_user_max: usize,
) -> Result<Option<Uid>> {
    let Some(src) = src else { return Ok(None) };
    if inner.queue.len() < per_user_max {
        return Ok(None);
    }

    let uid = src.cred().uid;
    let first_activation = inner.msg_users.is_none();
    let queue_len = inner.queue.len();
    let table = inner.msg_users.get_or_insert_with(HashMap::new);
    let count = table
        .entry(uid.0)
        .or_insert(if first_activation { queue_len } else { 0 });
    if *count >= per_user_max {
        return Err(Error::Full);
    }
    *count += 1;
    Ok(Some(uid))
}

fn uncharge_user(inner: &mut ConnectionInner, entry: &QueueEntry) {
    let Some(uid) = entry.charged_user else { return };
    if let Some(table) = inner.msg_users.as_mut() {
        if let Some(count) = table.get_mut(&uid.0) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Info records: `{size, id, flags}` header then an item stream.
fn encode_info_record(id: u64, flags: u64, items: &[Item]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in [0u64, id, flags] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    for item in items {
        item.encode_into(&mut out);
    }
    let size = (out.len() as u64).to_le_bytes();
    out[..8].copy_from_slice(&size);
    out
}

/// Parsed info record, for transports and tests.
#[derive(Debug)]
pub struct InfoRecord {
    pub id: u64,
    pub flags: u64,
    pub items: Vec<Item>,
}

impl InfoRecord {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 24 {
            return Err(Error::InvalidArgument);
        }
        let word = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let size = word(0) as usize;
        if size < 24 || size > buf.len() {
            return Err(Error::InvalidArgument);
        }
        let items = crate::item::iter_items(&buf[24..size]).collect::<Result<Vec<_>>>()?;
        Ok(InfoRecord { id: word(8), flags: word(16), items })
    }
}
