// src/endpoint.rs

//! Endpoints: access points to a bus, optionally carrying their own
//! policy.
//!
//! The default endpoint (named "bus") is created with the bus and has no
//! policy of its own. Custom endpoints carry an uploaded policy database
//! and rewrite permission denials to `NotFound` so they never leak which
//! names exist behind them.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::bus::Bus;
use crate::connection::{Connection, HelloReply, HelloRequest};
use crate::error::{Error, Result};
use crate::item::Item;
use crate::message::Envelope;
use crate::policy::{PolicyDb, PolicyOwner};
use crate::types::{Gid, Uid};

/// File-mode/uid/gid triple controlling external access to the endpoint
/// node. Opaque to the engine.
#[derive(Debug, Clone, Copy)]
pub struct EndpointAccess {
    pub mode: u32,
    pub uid: Uid,
    pub gid: Gid,
}

struct EndpointInner {
    disconnected: bool,
    connections: Vec<Weak<Connection>>,
}

/// An access point to a bus.
pub struct Endpoint {
    bus: Arc<Bus>,
    name: String,
    id: u64,
    access: EndpointAccess,
    /// Present only on custom endpoints.
    policy: Option<PolicyDb>,
    /// Custom endpoints account their connections against an anonymous
    /// user record instead of the caller's.
    anonymous_user: Option<Arc<crate::domain::UserAccount>>,
    inner: Mutex<EndpointInner>,
}

impl Endpoint {
    pub(crate) fn new(
        bus: Arc<Bus>,
        name: &str,
        access: EndpointAccess,
        with_policy: bool,
    ) -> Arc<Self> {
        let anonymous_user = with_policy.then(|| bus.domain().anonymous_user());
        Arc::new(Endpoint {
            id: bus.next_ep_id(),
            bus,
            name: name.to_owned(),
            access,
            policy: with_policy.then(PolicyDb::new),
            anonymous_user,
            inner: Mutex::new(EndpointInner {
                disconnected: false,
                connections: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn access(&self) -> EndpointAccess {
        self.access
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub(crate) fn policy_db(&self) -> Option<&PolicyDb> {
        self.policy.as_ref()
    }

    pub(crate) fn anonymous_user(&self) -> Option<Arc<crate::domain::UserAccount>> {
        self.anonymous_user.clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.lock().disconnected
    }

    /// Register a connection on this endpoint (the Hello command).
    pub fn connect(self: &Arc<Self>, hello: HelloRequest) -> Result<(Arc<Connection>, HelloReply)> {
        Connection::new(self, hello)
    }

    pub(crate) fn link_connection(&self, conn: &Arc<Connection>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.disconnected {
            return Err(Error::Shutdown);
        }
        inner.connections.push(Arc::downgrade(conn));
        Ok(())
    }

    pub(crate) fn unlink_connection(&self, conn: &Connection) {
        let mut inner = self.inner.lock();
        inner
            .connections
            .retain(|w| w.upgrade().is_none_or(|c| c.id() != conn.id()));
    }

    /// Replace this endpoint's uploaded policy. Only valid on custom
    /// endpoints.
    pub fn policy_set(&self, items: &[Item]) -> Result<()> {
        let db = self.policy.as_ref().ok_or(Error::InvalidArgument)?;
        db.set(PolicyOwner::Endpoint(self.id), items, 0, true)
    }

    /// Disconnect this endpoint and every connection on it.
    pub fn disconnect(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.disconnected {
                return;
            }
            inner.disconnected = true;
        }
        self.bus.unlink_endpoint(self);

        loop {
            let next = {
                let inner = self.inner.lock();
                inner.connections.iter().find_map(Weak::upgrade)
            };
            match next {
                Some(conn) => {
                    let _ = conn.disconnect(false);
                    self.unlink_connection(&conn);
                }
                None => break,
            }
        }
        debug!(ep = %self.name, "endpoint disconnected");
    }

    // --- composite policy evaluation ---

    /// May `conn` learn that `name` exists through this endpoint?
    ///
    /// Only custom endpoints restrict visibility; their denials read as
    /// `NotFound`.
    pub(crate) fn policy_check_see_access(
        &self,
        conn: &Arc<Connection>,
        name: &str,
    ) -> Result<()> {
        let Some(db) = &self.policy else { return Ok(()) };
        db.check_see_access(conn.cred(), name)
            .map_err(conceal_denial)
    }

    /// Gate kernel name notifications on SEE of the name they mention.
    pub(crate) fn policy_check_notification(
        &self,
        conn: &Arc<Connection>,
        env: &Envelope,
    ) -> Result<()> {
        if env.src.is_some() || self.policy.is_none() {
            return Ok(());
        }
        match env.notify_name() {
            Some(name) => self.policy_check_see_access(conn, name),
            None => Ok(()),
        }
    }

    /// May `conn_dst` see at least one of the names `conn_src` owns?
    pub(crate) fn policy_check_src_names(
        &self,
        conn_src: &Arc<Connection>,
        conn_dst: &Arc<Connection>,
    ) -> Result<()> {
        if self.policy.is_none() {
            return Ok(());
        }
        for name in conn_src.owned_name_strings() {
            if self.policy_check_see_access(conn_dst, &name).is_ok() {
                return Ok(());
            }
        }
        Err(Error::NotFound)
    }

    fn custom_talk_access(&self, src: &Arc<Connection>, dst: &Arc<Connection>) -> Result<()> {
        let Some(db) = &self.policy else { return Ok(()) };
        db.check_talk_access(
            src.cred(),
            src.id(),
            dst.id(),
            &dst.owned_name_strings(),
        )
        .map_err(conceal_denial)
    }

    fn implicit_talk_access(&self, src: &Arc<Connection>, dst: &Arc<Connection>) -> bool {
        self.bus.cred_is_privileged(src.cred()) || src.cred().fsuid == dst.cred().uid
    }

    /// May `src` unicast to `dst` through this endpoint?
    ///
    /// A custom-endpoint denial is fatal; otherwise privileged senders and
    /// senders owning the destination's uid pass implicitly, and the bus
    /// database decides the rest.
    pub(crate) fn policy_check_talk_access(
        &self,
        src: &Arc<Connection>,
        dst: &Arc<Connection>,
    ) -> Result<()> {
        self.custom_talk_access(src, dst)?;
        if self.implicit_talk_access(src, dst) {
            return Ok(());
        }
        self.bus.policy_db().check_talk_access(
            src.cred(),
            src.id(),
            dst.id(),
            &dst.owned_name_strings(),
        )
    }

    /// Broadcast TALK: like unicast TALK, except that a sender owning
    /// names may signal nameless receivers without a rule.
    pub(crate) fn policy_check_broadcast(
        &self,
        src: &Arc<Connection>,
        dst: &Arc<Connection>,
    ) -> Result<()> {
        self.custom_talk_access(src, dst)?;
        if self.implicit_talk_access(src, dst) {
            return Ok(());
        }
        if src.name_count() > 0 && dst.name_count() == 0 {
            return Ok(());
        }
        self.bus.policy_db().check_talk_access(
            src.cred(),
            src.id(),
            dst.id(),
            &dst.owned_name_strings(),
        )
    }

    /// May `conn` acquire `name` through this endpoint?
    pub(crate) fn policy_check_own_access(
        &self,
        conn: &Arc<Connection>,
        name: &str,
    ) -> Result<()> {
        if let Some(db) = &self.policy {
            db.check_own_access(conn.cred(), name)
                .map_err(conceal_denial)?;
        }
        if self.bus.cred_is_privileged(conn.cred()) {
            return Ok(());
        }
        self.bus.policy_db().check_own_access(conn.cred(), name)
    }
}

/// Custom endpoints never reveal which names exist behind them.
fn conceal_denial(e: Error) -> Error {
    if e == Error::PermissionDenied {
        Error::NotFound
    } else {
        e
    }
}
