// src/names.rs

//! Bus-wide well-known-name ownership.
//!
//! Entries are owned by the registry; the owner/activator/waiter links to
//! connections never keep a connection alive on their own account — they
//! are dropped under the registry lock when the connection goes away.
//!
//! Every effective ownership transition restamps the entry with a fresh
//! bus-global name-id, after any queued traffic has migrated, so entries
//! stamped later always refer to the later owner.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::debug;

use crate::bus::Bus;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::item::IdFlags;
use crate::limits::MAX_NAMES_PER_CONN;
use crate::types::{ConnectionId, NameId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NameFlags: u64 {
        /// The owner tolerates being replaced by a later acquirer.
        const ALLOW_REPLACEMENT = 1 << 0;
        /// Take the name from a willing owner.
        const REPLACE_EXISTING  = 1 << 1;
        /// On conflict, wait in line instead of failing.
        const QUEUE             = 1 << 2;
        /// Reported back when the acquirer was queued.
        const IN_QUEUE          = 1 << 3;
        /// Entry is held by an activator. Only valid at connection
        /// creation.
        const ACTIVATOR         = 1 << 4;
    }
}

bitflags! {
    /// Which rows a name listing includes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NameListFlags: u64 {
        /// Unique connection ids.
        const UNIQUE     = 1 << 0;
        /// Well-known names with a live implementor.
        const NAMES      = 1 << 1;
        /// Names currently held by their activator.
        const ACTIVATORS = 1 << 2;
        /// Waiters queued behind current owners.
        const QUEUED     = 1 << 3;
    }
}

/// What an acquire call achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    InQueue,
    AlreadyOwner,
}

struct Waiter {
    conn: Arc<Connection>,
    flags: NameFlags,
}

struct NameEntry {
    name_id: NameId,
    flags: NameFlags,
    owner: Arc<Connection>,
    /// Present while an activator is registered for this name, whether or
    /// not it currently holds it.
    activator: Option<Arc<Connection>>,
    queue: VecDeque<Waiter>,
}

impl NameEntry {
    fn held_by_activator(&self) -> bool {
        match &self.activator {
            Some(a) => Arc::ptr_eq(a, &self.owner),
            None => false,
        }
    }
}

/// Summary row produced for name listings.
#[derive(Debug, Clone)]
pub struct NameListing {
    pub name: String,
    pub name_id: NameId,
    pub owner: ConnectionId,
    pub flags: NameFlags,
    pub queued: Vec<ConnectionId>,
}

struct RegistryInner {
    entries: HashMap<String, NameEntry>,
    name_seq_last: u64,
}

impl RegistryInner {
    fn stamp(&mut self) -> NameId {
        self.name_seq_last += 1;
        NameId::new(self.name_seq_last)
    }
}

/// The shared per-bus registry.
pub struct NameRegistry {
    inner: Mutex<RegistryInner>,
}

impl NameRegistry {
    pub fn new() -> Self {
        NameRegistry {
            inner: Mutex::new(RegistryInner {
                entries: HashMap::new(),
                name_seq_last: 0,
            }),
        }
    }

    /// Acquire `name` for `conn`.
    ///
    /// The caller has already passed the OWN policy check. `ACTIVATOR` is
    /// only accepted from the registration path.
    pub(crate) fn acquire(
        &self,
        bus: &Arc<Bus>,
        conn: &Arc<Connection>,
        name: &str,
        flags: NameFlags,
    ) -> Result<AcquireOutcome> {
        if !crate::util::name_is_valid(name, false) {
            return Err(Error::InvalidArgument);
        }
        if conn.name_count() >= MAX_NAMES_PER_CONN {
            return Err(Error::Full);
        }

        let mut reg = self.inner.lock();

        enum Plan {
            Create,
            UpdateFlags,
            ClaimFromActivator,
            Replace,
            Enqueue,
            Conflict,
        }

        let plan = match reg.entries.get(name) {
            None => Plan::Create,
            Some(e) if Arc::ptr_eq(&e.owner, conn) => Plan::UpdateFlags,
            Some(e) if e.held_by_activator() && !flags.contains(NameFlags::ACTIVATOR) => {
                Plan::ClaimFromActivator
            }
            Some(e)
                if e.flags.contains(NameFlags::ALLOW_REPLACEMENT)
                    && flags.contains(NameFlags::REPLACE_EXISTING) =>
            {
                Plan::Replace
            }
            Some(_) if flags.contains(NameFlags::QUEUE) => Plan::Enqueue,
            Some(_) => Plan::Conflict,
        };

        let outcome = match plan {
            Plan::Create => {
                let name_id = reg.stamp();
                let activator = flags
                    .contains(NameFlags::ACTIVATOR)
                    .then(|| conn.clone());
                reg.entries.insert(
                    name.to_owned(),
                    NameEntry {
                        name_id,
                        flags,
                        owner: conn.clone(),
                        activator,
                        queue: VecDeque::new(),
                    },
                );
                conn.note_name_gained(name_id, name);
                bus.notify_name_add(id_flags(conn), name);
                AcquireOutcome::Acquired
            }
            Plan::UpdateFlags => {
                if let Some(e) = reg.entries.get_mut(name) {
                    e.flags = flags;
                }
                AcquireOutcome::AlreadyOwner
            }
            Plan::ClaimFromActivator => {
                let name_id = reg.stamp();
                let entry = match reg.entries.get_mut(name) {
                    Some(e) => e,
                    None => return Err(Error::NotFound),
                };
                let activator = entry.owner.clone();
                let old = id_flags(&activator);
                let _ = conn.adopt_messages_from(&activator, entry.name_id);
                activator.note_name_lost(name);
                entry.owner = conn.clone();
                entry.flags = flags;
                entry.name_id = name_id;
                conn.note_name_gained(name_id, name);
                bus.notify_name_change(old, id_flags(conn), name);
                AcquireOutcome::Acquired
            }
            Plan::Replace => {
                let name_id = reg.stamp();
                let entry = match reg.entries.get_mut(name) {
                    Some(e) => e,
                    None => return Err(Error::NotFound),
                };
                let old_owner = entry.owner.clone();
                let old = id_flags(&old_owner);
                let old_flags = entry.flags;
                old_owner.note_name_lost(name);
                // a displaced owner that asked for queueing goes to the
                // head of the line
                if old_flags.contains(NameFlags::QUEUE) {
                    entry.queue.push_front(Waiter {
                        conn: old_owner,
                        flags: old_flags,
                    });
                }
                entry.owner = conn.clone();
                entry.flags = flags;
                entry.name_id = name_id;
                conn.note_name_gained(name_id, name);
                bus.notify_name_change(old, id_flags(conn), name);
                AcquireOutcome::Acquired
            }
            Plan::Enqueue => {
                let entry = match reg.entries.get_mut(name) {
                    Some(e) => e,
                    None => return Err(Error::NotFound),
                };
                if entry.queue.iter().any(|w| Arc::ptr_eq(&w.conn, conn)) {
                    return Err(Error::AlreadyExists);
                }
                entry.queue.push_back(Waiter {
                    conn: conn.clone(),
                    flags,
                });
                AcquireOutcome::InQueue
            }
            Plan::Conflict => return Err(Error::AlreadyExists),
        };

        debug!(name, conn = %conn.id(), ?outcome, "name acquire");
        Ok(outcome)
    }

    /// Release one name held (or waited for) by `conn`.
    pub(crate) fn release(
        &self,
        bus: &Arc<Bus>,
        conn: &Arc<Connection>,
        name: &str,
    ) -> Result<()> {
        let mut reg = self.inner.lock();
        let entry = reg.entries.get_mut(name).ok_or(Error::NotFound)?;

        if !Arc::ptr_eq(&entry.owner, conn) {
            // maybe it is just queued
            let before = entry.queue.len();
            entry.queue.retain(|w| !Arc::ptr_eq(&w.conn, conn));
            if entry.queue.len() == before {
                return Err(Error::PermissionDenied);
            }
            return Ok(());
        }

        release_owned(&mut reg, bus, name, conn);
        Ok(())
    }

    /// Look up the current owner of `name`.
    pub fn lookup(&self, name: &str) -> Option<(ConnectionId, NameId)> {
        let reg = self.inner.lock();
        reg.entries.get(name).map(|e| (e.owner.id(), e.name_id))
    }

    /// Release everything `conn` owns or waits for. Called on disconnect;
    /// queued traffic moves back to activators where one remains.
    pub(crate) fn remove_by_conn(&self, bus: &Arc<Bus>, conn: &Arc<Connection>) {
        let mut reg = self.inner.lock();

        let names: Vec<String> = reg.entries.keys().cloned().collect();
        for name in names {
            let Some(entry) = reg.entries.get_mut(&name) else {
                continue;
            };
            entry.queue.retain(|w| !Arc::ptr_eq(&w.conn, conn));

            let standby_activator_here = entry
                .activator
                .as_ref()
                .is_some_and(|a| Arc::ptr_eq(a, conn))
                && !entry.held_by_activator();
            if standby_activator_here {
                // a standby activator goes away quietly
                entry.activator = None;
            }

            if Arc::ptr_eq(&entry.owner, conn) {
                release_owned(&mut reg, bus, &name, conn);
            }
        }
    }

    /// Stable view of the registry for listings.
    pub(crate) fn snapshot(&self) -> Vec<NameListing> {
        let reg = self.inner.lock();
        let mut rows: Vec<NameListing> = reg
            .entries
            .iter()
            .map(|(name, e)| NameListing {
                name: name.clone(),
                name_id: e.name_id,
                owner: e.owner.id(),
                flags: e.flags,
                queued: e.queue.iter().map(|w| w.conn.id()).collect(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Resolve a send destination while the registry stays locked; the
    /// closure runs with the entry pinned so an activator handoff cannot
    /// race the enqueue.
    pub(crate) fn with_entry<R>(
        &self,
        name: &str,
        f: impl FnOnce(Option<ResolvedName<'_>>) -> R,
    ) -> R {
        let reg = self.inner.lock();
        let resolved = reg.entries.get(name).map(|e| ResolvedName {
            owner: &e.owner,
            name_id: e.name_id,
            activator_held: e.held_by_activator(),
        });
        f(resolved)
    }
}

impl Default for NameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Borrowed view of one entry during send resolution.
pub(crate) struct ResolvedName<'a> {
    pub owner: &'a Arc<Connection>,
    pub name_id: NameId,
    pub activator_held: bool,
}

/// Hand the entry past `conn`: back to its activator, on to the first
/// waiter, or away entirely.
fn release_owned(
    reg: &mut RegistryInner,
    bus: &Arc<Bus>,
    name: &str,
    conn: &Arc<Connection>,
) {
    let old = id_flags(conn);

    let (back_to_activator, old_name_id) = match reg.entries.get(name) {
        Some(entry) => (
            entry.activator.clone().filter(|a| !Arc::ptr_eq(a, conn)),
            entry.name_id,
        ),
        None => return,
    };
    conn.note_name_lost(name);

    if let Some(activator) = back_to_activator {
        let _ = activator.adopt_messages_from(conn, old_name_id);
        let name_id = reg.stamp();
        if let Some(entry) = reg.entries.get_mut(name) {
            entry.owner = activator.clone();
            entry.flags = NameFlags::ACTIVATOR;
            entry.name_id = name_id;
        }
        activator.note_name_gained(name_id, name);
        bus.notify_name_change(old, id_flags(&activator), name);
        debug!(name, "name fell back to activator");
        return;
    }

    let waiter = reg
        .entries
        .get_mut(name)
        .and_then(|entry| entry.queue.pop_front());
    if let Some(waiter) = waiter {
        let name_id = reg.stamp();
        if let Some(entry) = reg.entries.get_mut(name) {
            entry.owner = waiter.conn.clone();
            entry.flags = waiter.flags;
            entry.name_id = name_id;
        }
        waiter.conn.note_name_gained(name_id, name);
        bus.notify_name_change(old, id_flags(&waiter.conn), name);
        debug!(name, new_owner = %waiter.conn.id(), "name moved to waiter");
        return;
    }

    reg.entries.remove(name);
    bus.notify_name_remove(old, name);
    debug!(name, "name removed");
}

fn id_flags(conn: &Arc<Connection>) -> IdFlags {
    IdFlags {
        id: conn.id().get(),
        flags: conn.role_bits(),
    }
}
