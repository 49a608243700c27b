// src/metadata.rs

//! Credential and identity snapshots.
//!
//! A [`Metadata`] buffer is an ordered item stream built from a
//! [`Credentials`] snapshot. Receivers opt into fields with
//! [`AttachFlags`]; a field is appended at most once, and once appended an
//! item is never rewritten, so a buffer that grows during broadcast
//! fan-out is only ever extended.

use bitflags::bitflags;

use crate::item::{Item, WireCreds};
use crate::types::{Gid, NameId, Uid};
use crate::util::monotonic_ns;

bitflags! {
    /// Metadata fields a receiver asks to have attached to inbound
    /// messages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttachFlags: u64 {
        const TIMESTAMP        = 1 << 0;
        const CREDS            = 1 << 1;
        const PID_COMM         = 1 << 2;
        const TID_COMM         = 1 << 3;
        const EXE              = 1 << 4;
        const CMDLINE          = 1 << 5;
        const CGROUP           = 1 << 6;
        const CAPS             = 1 << 7;
        const SECLABEL         = 1 << 8;
        const AUDIT            = 1 << 9;
        const NAMES            = 1 << 10;
        const CONN_DESCRIPTION = 1 << 11;
    }
}

/// Principal snapshot taken by the transport when a connection registers.
///
/// The engine never reaches into its host for credentials; whatever the
/// transport captured here is what metadata collection reports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub uid: Uid,
    /// Filesystem uid used for privilege and implicit-talk decisions.
    pub fsuid: Uid,
    pub gid: Gid,
    pub pid: u32,
    pub tid: u32,
    pub pid_comm: String,
    pub tid_comm: String,
    pub exe: String,
    pub cmdline: Vec<String>,
    pub cgroup: String,
    /// Capability mask; [`Credentials::ipc_owner`] reads the bit the
    /// engine cares about.
    pub caps: u64,
    pub seclabel: String,
    pub audit_loginuid: u32,
    pub audit_sessionid: u32,
    /// Opaque pid-namespace identity.
    pub pid_ns: u64,
    /// Opaque user-namespace identity.
    pub user_ns: u64,
}

/// Capability bit granting quota bypass and bus-wide privilege.
pub const CAP_IPC_OWNER: u64 = 1 << 0;

impl Credentials {
    /// Minimal snapshot for a plain user process.
    pub fn for_user(uid: u32) -> Self {
        Credentials {
            uid: Uid(uid),
            fsuid: Uid(uid),
            gid: Gid(uid),
            pid: 0,
            tid: 0,
            pid_comm: String::new(),
            tid_comm: String::new(),
            exe: String::new(),
            cmdline: Vec::new(),
            cgroup: String::new(),
            caps: 0,
            seclabel: String::new(),
            audit_loginuid: 0,
            audit_sessionid: 0,
            pid_ns: 1,
            user_ns: 1,
        }
    }

    pub fn ipc_owner(&self) -> bool {
        self.caps & CAP_IPC_OWNER != 0
    }
}

/// An immutable, append-only item stream of identity data.
#[derive(Clone, Debug)]
pub struct Metadata {
    attached: AttachFlags,
    pid_ns: u64,
    user_ns: u64,
    items: Vec<Item>,
}

impl Metadata {
    /// Create an empty buffer bound to the namespaces of `cred`.
    pub fn new(cred: &Credentials) -> Self {
        Metadata {
            attached: AttachFlags::empty(),
            pid_ns: cred.pid_ns,
            user_ns: cred.user_ns,
            items: Vec::new(),
        }
    }

    /// Duplicate, preserving namespace identity and attached fields.
    pub fn dup(&self) -> Self {
        self.clone()
    }

    pub fn attached(&self) -> AttachFlags {
        self.attached
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Two buffers are namespace-equal when their captured pid- and
    /// user-namespace identities coincide. Identity-bearing items are
    /// withheld from cross-namespace readers.
    pub fn ns_eq(&self, other: &Metadata) -> bool {
        self.pid_ns == other.pid_ns && self.user_ns == other.user_ns
    }

    /// Append a pre-built item and mark its field attached. Used for
    /// impersonated creds/seclabel installed at registration.
    pub fn append_item(&mut self, item: Item, flag: AttachFlags) {
        if self.attached.contains(flag) {
            return;
        }
        self.attached |= flag;
        self.items.push(item);
    }

    /// Append the fields in `which` that are not attached yet, reading
    /// from `cred` and the connection-level `names`/`description`.
    pub fn append(
        &mut self,
        cred: &Credentials,
        names: &[(NameId, String)],
        description: Option<&str>,
        seq: u64,
        which: AttachFlags,
    ) {
        let missing = which - self.attached;

        if missing.contains(AttachFlags::TIMESTAMP) {
            self.append_item(
                Item::Timestamp {
                    monotonic_ns: monotonic_ns(),
                    realtime_ns: std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_nanos() as u64)
                        .unwrap_or(0),
                    seq,
                },
                AttachFlags::TIMESTAMP,
            );
        }
        if missing.contains(AttachFlags::CREDS) {
            self.append_item(
                Item::Creds(WireCreds {
                    uid: cred.uid,
                    gid: cred.gid,
                    pid: cred.pid,
                    tid: cred.tid,
                }),
                AttachFlags::CREDS,
            );
        }
        if missing.contains(AttachFlags::PID_COMM) {
            self.append_item(Item::PidComm(cred.pid_comm.clone()), AttachFlags::PID_COMM);
        }
        if missing.contains(AttachFlags::TID_COMM) {
            self.append_item(Item::TidComm(cred.tid_comm.clone()), AttachFlags::TID_COMM);
        }
        if missing.contains(AttachFlags::EXE) {
            self.append_item(Item::Exe(cred.exe.clone()), AttachFlags::EXE);
        }
        if missing.contains(AttachFlags::CMDLINE) {
            self.append_item(Item::Cmdline(cred.cmdline.clone()), AttachFlags::CMDLINE);
        }
        if missing.contains(AttachFlags::CGROUP) {
            self.append_item(Item::Cgroup(cred.cgroup.clone()), AttachFlags::CGROUP);
        }
        if missing.contains(AttachFlags::CAPS) {
            self.append_item(Item::Caps(cred.caps), AttachFlags::CAPS);
        }
        if missing.contains(AttachFlags::SECLABEL) {
            self.append_item(Item::Seclabel(cred.seclabel.clone()), AttachFlags::SECLABEL);
        }
        if missing.contains(AttachFlags::AUDIT) {
            self.append_item(
                Item::Audit {
                    loginuid: cred.audit_loginuid,
                    sessionid: cred.audit_sessionid,
                },
                AttachFlags::AUDIT,
            );
        }
        if missing.contains(AttachFlags::NAMES) {
            for (name_id, name) in names {
                self.items.push(Item::OwnedName {
                    name_id: *name_id,
                    name: name.clone(),
                });
            }
            self.attached |= AttachFlags::NAMES;
        }
        if missing.contains(AttachFlags::CONN_DESCRIPTION) {
            if let Some(desc) = description {
                self.append_item(
                    Item::ConnDescription(desc.to_owned()),
                    AttachFlags::CONN_DESCRIPTION,
                );
            }
        }
    }

    /// Serialize the item stream.
    pub fn encode(&self, out: &mut Vec<u8>) {
        for item in &self.items {
            item.encode_into(out);
        }
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf.len()
    }
}
