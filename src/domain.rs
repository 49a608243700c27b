// src/domain.rs

//! Domain: the top-level namespace for buses, with per-user accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::bus::{Bus, BusCreateRequest};
use crate::error::{Error, Result};
use crate::types::Uid;

/// Resource accounting for one user on a domain.
pub struct UserAccount {
    pub uid: Uid,
    pub buses: AtomicUsize,
    pub connections: AtomicUsize,
}

impl UserAccount {
    fn new(uid: Uid) -> Arc<Self> {
        Arc::new(UserAccount {
            uid,
            buses: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
        })
    }
}

struct DomainState {
    disconnected: bool,
    buses: Vec<Arc<Bus>>,
    bus_seq_last: u64,
    users: HashMap<u32, Arc<UserAccount>>,
}

/// Top-level container. Holds the domain-global message sequence counter
/// every bus stamps its messages from.
pub struct Domain {
    msg_seq_last: AtomicU64,
    state: Mutex<DomainState>,
}

impl Domain {
    pub fn new() -> Arc<Self> {
        Arc::new(Domain {
            msg_seq_last: AtomicU64::new(0),
            state: Mutex::new(DomainState {
                disconnected: false,
                buses: Vec::new(),
                bus_seq_last: 0,
                users: HashMap::new(),
            }),
        })
    }

    /// Create a bus on this domain.
    pub fn create_bus(self: &Arc<Self>, req: BusCreateRequest) -> Result<Arc<Bus>> {
        Bus::new(self, req)
    }

    /// Monotonic message sequence across the whole domain.
    pub(crate) fn next_msg_seq(&self) -> u64 {
        self.msg_seq_last.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Accounting record for `uid`, created on first use.
    pub(crate) fn get_user(&self, uid: Uid) -> Arc<UserAccount> {
        let mut state = self.state.lock();
        state
            .users
            .entry(uid.0)
            .or_insert_with(|| UserAccount::new(uid))
            .clone()
    }

    /// Fresh account not tied to any uid; used by custom endpoints.
    pub(crate) fn anonymous_user(&self) -> Arc<UserAccount> {
        UserAccount::new(Uid(u32::MAX))
    }

    pub(crate) fn find_bus(&self, name: &str) -> Option<Arc<Bus>> {
        let state = self.state.lock();
        state.buses.iter().find(|b| b.name() == name).cloned()
    }

    pub(crate) fn link_bus(&self, bus: &Arc<Bus>) -> Result<u64> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(Error::Shutdown);
        }
        state.bus_seq_last += 1;
        state.buses.push(bus.clone());
        Ok(state.bus_seq_last)
    }

    pub(crate) fn unlink_bus(&self, bus: &Arc<Bus>) {
        let mut state = self.state.lock();
        state.buses.retain(|b| !Arc::ptr_eq(b, bus));
    }

    /// Disconnect the domain; buses detach first, cascading through their
    /// endpoints and connections. A second disconnect is a no-op.
    pub fn disconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
        }
        loop {
            let bus = {
                let state = self.state.lock();
                state.buses.first().cloned()
            };
            match bus {
                Some(bus) => bus.disconnect(),
                None => break,
            }
        }
        debug!("domain disconnected");
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_sequence_is_monotonic() {
        let domain = Domain::new();
        let a = domain.next_msg_seq();
        let b = domain.next_msg_seq();
        assert!(b > a);
    }

    #[test]
    fn user_accounts_are_shared_per_uid() {
        let domain = Domain::new();
        let a = domain.get_user(Uid(7));
        let b = domain.get_user(Uid(7));
        assert!(Arc::ptr_eq(&a, &b));
        let c = domain.get_user(Uid(8));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn double_disconnect_is_a_no_op() {
        let domain = Domain::new();
        domain.disconnect();
        domain.disconnect();
        assert!(domain.is_disconnected());
    }
}
