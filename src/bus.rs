// src/bus.rs

//! Bus: a named container of endpoints and connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::connection::Connection;
use crate::domain::Domain;
use crate::endpoint::{Endpoint, EndpointAccess};
use crate::error::{Error, Result};
use crate::limits::MAX_BUSES_PER_USER;
use crate::metadata::{AttachFlags, Credentials, Metadata};
use crate::names::NameRegistry;
use crate::policy::PolicyDb;
use crate::reply::Reaper;
use crate::types::{BloomParameter, BusId, ConnectionId, Uid};

/// Everything needed to create a bus, as parsed from `MakeName` and
/// `BloomParameter` items by the transport.
pub struct BusCreateRequest {
    /// Must start with `"<uid>-"` for the creator's uid.
    pub name: String,
    pub flags: u64,
    pub bloom: BloomParameter,
    pub access: EndpointAccess,
    /// Creator snapshot; cached for `BusCreatorInfo`.
    pub cred: Credentials,
}

impl BusCreateRequest {
    /// Build a request from the make command's item stream: exactly one
    /// `MakeName` and one `BloomParameter`.
    pub fn from_items(
        items: &[crate::item::Item],
        flags: u64,
        access: EndpointAccess,
        cred: Credentials,
    ) -> Result<Self> {
        let mut name: Option<String> = None;
        let mut bloom: Option<BloomParameter> = None;
        for item in items {
            match item {
                crate::item::Item::MakeName(n) => {
                    if name.is_some() {
                        return Err(Error::AlreadyExists);
                    }
                    name = Some(n.clone());
                }
                crate::item::Item::BloomParameter(b) => {
                    if bloom.is_some() {
                        return Err(Error::AlreadyExists);
                    }
                    bloom = Some(*b);
                }
                _ => {}
            }
        }
        Ok(BusCreateRequest {
            name: name.ok_or(Error::InvalidArgument)?,
            flags,
            bloom: bloom.ok_or(Error::InvalidArgument)?,
            access,
            cred,
        })
    }
}

struct BusState {
    disconnected: bool,
    ep_list: Vec<Arc<Endpoint>>,
    default_ep: Option<Arc<Endpoint>>,
}

struct ConnTable {
    by_id: HashMap<u64, Arc<Connection>>,
    monitors: Vec<Arc<Connection>>,
}

/// A named message bus.
pub struct Bus {
    /// Random 128-bit identity reported to every connection.
    id128: BusId,
    name: String,
    bus_flags: u64,
    bloom: BloomParameter,
    uid_owner: Uid,
    creator_meta: Metadata,
    domain: Arc<Domain>,
    registry: NameRegistry,
    policy_db: PolicyDb,
    connections: RwLock<ConnTable>,
    pub(crate) notify_queue: Mutex<Vec<crate::message::Envelope>>,
    pub(crate) notify_flush: Mutex<()>,
    conn_seq_last: AtomicU64,
    ep_seq_last: AtomicU64,
    state: Mutex<BusState>,
    reaper: Reaper,
    user: Arc<crate::domain::UserAccount>,
}

impl Bus {
    /// Create a bus and its default endpoint, and link it into `domain`.
    pub fn new(domain: &Arc<Domain>, req: BusCreateRequest) -> Result<Arc<Self>> {
        if !crate::util::bus_name_has_uid_prefix(&req.name, req.cred.uid.0) {
            return Err(Error::InvalidArgument);
        }
        req.bloom.validate()?;
        if domain.find_bus(&req.name).is_some() {
            return Err(Error::AlreadyExists);
        }

        // cache the creator's identity for BusCreatorInfo
        let mut creator_meta = Metadata::new(&req.cred);
        creator_meta.append(
            &req.cred,
            &[],
            None,
            0,
            AttachFlags::CREDS
                | AttachFlags::PID_COMM
                | AttachFlags::TID_COMM
                | AttachFlags::EXE
                | AttachFlags::CMDLINE
                | AttachFlags::CGROUP
                | AttachFlags::CAPS
                | AttachFlags::SECLABEL
                | AttachFlags::AUDIT,
        );

        let user = domain.get_user(req.cred.uid);
        if !req.cred.ipc_owner()
            && user.buses.fetch_add(1, Ordering::AcqRel) + 1 > MAX_BUSES_PER_USER
        {
            user.buses.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Full);
        }
        if req.cred.ipc_owner() {
            user.buses.fetch_add(1, Ordering::AcqRel);
        }

        let bus = Arc::new_cyclic(|weak| Bus {
            id128: BusId::generate(),
            name: req.name.clone(),
            bus_flags: req.flags,
            bloom: req.bloom,
            uid_owner: req.cred.uid,
            creator_meta,
            domain: domain.clone(),
            registry: NameRegistry::new(),
            policy_db: PolicyDb::new(),
            connections: RwLock::new(ConnTable {
                by_id: HashMap::new(),
                monitors: Vec::new(),
            }),
            notify_queue: Mutex::new(Vec::new()),
            notify_flush: Mutex::new(()),
            conn_seq_last: AtomicU64::new(0),
            ep_seq_last: AtomicU64::new(0),
            state: Mutex::new(BusState {
                disconnected: false,
                ep_list: Vec::new(),
                default_ep: None,
            }),
            reaper: Reaper::new(weak.clone()),
            user,
        });

        let ep = Endpoint::new(bus.clone(), "bus", req.access, false);
        {
            let mut state = bus.state.lock();
            state.ep_list.push(ep.clone());
            state.default_ep = Some(ep);
        }

        if let Err(e) = domain.link_bus(&bus) {
            bus.teardown();
            return Err(e);
        }

        debug!(bus = %bus.name, id128 = %bus.id128, "bus created");
        Ok(bus)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id128(&self) -> BusId {
        self.id128
    }

    pub fn bus_flags(&self) -> u64 {
        self.bus_flags
    }

    pub fn bloom(&self) -> BloomParameter {
        self.bloom
    }

    pub fn domain(&self) -> &Arc<Domain> {
        &self.domain
    }

    pub fn registry(&self) -> &NameRegistry {
        &self.registry
    }

    pub(crate) fn policy_db(&self) -> &PolicyDb {
        &self.policy_db
    }

    pub(crate) fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// The endpoint created with the bus.
    pub fn default_endpoint(&self) -> Result<Arc<Endpoint>> {
        self.state
            .lock()
            .default_ep
            .clone()
            .ok_or(Error::Shutdown)
    }

    /// Privileged on this bus: IPC-owner capability, or same filesystem
    /// uid as the creator. Capabilities are always taken from the
    /// caller's snapshot, never remembered from older state.
    pub fn cred_is_privileged(&self, cred: &Credentials) -> bool {
        cred.ipc_owner() || cred.fsuid == self.uid_owner
    }

    pub(crate) fn next_conn_id(&self) -> ConnectionId {
        ConnectionId::new(self.conn_seq_last.fetch_add(1, Ordering::AcqRel) + 1)
    }

    pub(crate) fn next_ep_id(&self) -> u64 {
        self.ep_seq_last.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Create a custom endpoint with its own policy database.
    pub fn create_endpoint(
        self: &Arc<Self>,
        name: &str,
        access: EndpointAccess,
    ) -> Result<Arc<Endpoint>> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(Error::Shutdown);
        }
        if state.ep_list.iter().any(|e| e.name() == name) {
            return Err(Error::AlreadyExists);
        }
        let ep = Endpoint::new(self.clone(), name, access, true);
        state.ep_list.push(ep.clone());
        Ok(ep)
    }

    pub(crate) fn unlink_endpoint(&self, ep: &Arc<Endpoint>) {
        let mut state = self.state.lock();
        state.ep_list.retain(|e| !Arc::ptr_eq(e, ep));
    }

    pub fn find_conn_by_id(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().by_id.get(&id.get()).cloned()
    }

    /// All live connections, in no particular order.
    pub(crate) fn connections_snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().by_id.values().cloned().collect()
    }

    pub(crate) fn monitors_snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().monitors.clone()
    }

    pub(crate) fn link_connection(
        &self,
        conn: &Arc<Connection>,
        is_monitor: bool,
    ) -> Result<()> {
        let state = self.state.lock();
        if state.disconnected {
            return Err(Error::Shutdown);
        }
        conn.ep().link_connection(conn)?;
        let mut table = self.connections.write();
        table.by_id.insert(conn.id().get(), conn.clone());
        if is_monitor {
            table.monitors.push(conn.clone());
        }
        Ok(())
    }

    pub(crate) fn unlink_connection(&self, conn: &Arc<Connection>) {
        conn.ep().unlink_connection(conn);
        let mut table = self.connections.write();
        table.by_id.remove(&conn.id().get());
        table.monitors.retain(|m| !Arc::ptr_eq(m, conn));
    }

    /// `BusCreatorInfo`: write the creator record into the caller's pool.
    pub fn creator_info(self: &Arc<Self>, conn: &Arc<Connection>) -> Result<u64> {
        if !conn.meta().ns_eq(&self.creator_meta) {
            return Err(Error::PermissionDenied);
        }
        conn.write_info_record(0, self.bus_flags, self.creator_meta.items())
    }

    /// Disconnect the bus: no new endpoints or connections, and every
    /// existing endpoint cascades down.
    pub fn disconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
        }
        self.domain.unlink_bus(self);
        self.teardown();
        debug!(bus = %self.name, "bus disconnected");
    }

    fn teardown(&self) {
        loop {
            let ep = {
                let state = self.state.lock();
                state.ep_list.first().cloned()
            };
            match ep {
                Some(ep) => {
                    ep.disconnect();
                    // disconnect unlinks; guard against an endpoint that
                    // was already mid-teardown elsewhere
                    self.unlink_endpoint(&ep);
                }
                None => break,
            }
        }
        {
            let mut state = self.state.lock();
            state.default_ep = None;
        }
        self.reaper.shutdown();
        self.user.buses.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;

    fn access() -> EndpointAccess {
        EndpointAccess { mode: 0o666, uid: Uid(500), gid: crate::types::Gid(500) }
    }

    fn request(name: &str, uid: u32) -> BusCreateRequest {
        BusCreateRequest {
            name: name.to_owned(),
            flags: 0,
            bloom: BloomParameter { size: 8, n_hash: 1 },
            access: access(),
            cred: crate::metadata::Credentials::for_user(uid),
        }
    }

    #[test]
    fn bus_name_must_carry_creator_uid_prefix() {
        let domain = Domain::new();
        assert!(Bus::new(&domain, request("500-bus", 500)).is_ok());
        assert_eq!(
            Bus::new(&domain, request("501-bus", 500)).err(),
            Some(Error::InvalidArgument)
        );
        assert_eq!(
            Bus::new(&domain, request("500-", 500)).err(),
            Some(Error::InvalidArgument)
        );
    }

    #[test]
    fn duplicate_bus_names_are_refused() {
        let domain = Domain::new();
        let _bus = Bus::new(&domain, request("500-dup", 500)).unwrap();
        assert_eq!(
            Bus::new(&domain, request("500-dup", 500)).err(),
            Some(Error::AlreadyExists)
        );
    }

    #[test]
    fn make_items_are_parsed_exactly_once() {
        let items = vec![
            Item::MakeName("500-frombits".into()),
            Item::BloomParameter(BloomParameter { size: 16, n_hash: 2 }),
        ];
        let req = BusCreateRequest::from_items(
            &items,
            0,
            access(),
            crate::metadata::Credentials::for_user(500),
        )
        .unwrap();
        assert_eq!(req.name, "500-frombits");
        assert_eq!(req.bloom.size, 16);

        let mut dup = items.clone();
        dup.push(Item::MakeName("500-again".into()));
        assert_eq!(
            BusCreateRequest::from_items(
                &dup,
                0,
                access(),
                crate::metadata::Credentials::for_user(500)
            )
            .err(),
            Some(Error::AlreadyExists)
        );

        assert_eq!(
            BusCreateRequest::from_items(
                &[Item::MakeName("500-nobloom".into())],
                0,
                access(),
                crate::metadata::Credentials::for_user(500)
            )
            .err(),
            Some(Error::InvalidArgument)
        );
    }

    #[test]
    fn creator_uid_is_privileged_on_the_bus() {
        let domain = Domain::new();
        let bus = Bus::new(&domain, request("500-priv", 500)).unwrap();
        assert!(bus.cred_is_privileged(&crate::metadata::Credentials::for_user(500)));
        assert!(!bus.cred_is_privileged(&crate::metadata::Credentials::for_user(501)));
        let mut capable = crate::metadata::Credentials::for_user(501);
        capable.caps = crate::metadata::CAP_IPC_OWNER;
        assert!(bus.cred_is_privileged(&capable));
    }
}
