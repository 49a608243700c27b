// src/policy.rs

//! SEE / TALK / OWN policy database.
//!
//! Rules are `(name, principal, access)` tuples installed by the bus
//! creator, by custom endpoints or by policy-holder connections. Names may
//! carry a trailing `.*` wildcard; the most specific matching entry
//! decides, and inside an entry a user rule beats a group rule beats a
//! world rule.
//!
//! TALK decisions are memoized per `(src, dst)` connection pair; the cache
//! is purged whenever a connection disconnects or its names change.

use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::item::Item;
use crate::metadata::Credentials;
use crate::types::{ConnectionId, Gid, Uid};

/// What a rule grants. Higher levels imply the lower ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    See = 0,
    Talk = 1,
    Own = 2,
}

impl Access {
    fn from_u64(v: u64) -> Result<Self> {
        Ok(match v {
            0 => Access::See,
            1 => Access::Talk,
            2 => Access::Own,
            _ => return Err(Error::InvalidArgument),
        })
    }
}

/// Who a rule applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Principal {
    World,
    User(Uid),
    Group(Gid),
}

/// One policy rule as it appears in an item stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PolicyAccess {
    pub principal: Principal,
    pub access: Access,
}

impl PolicyAccess {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let (kind, id) = match self.principal {
            Principal::World => (0u64, 0u64),
            Principal::User(uid) => (1, uid.0 as u64),
            Principal::Group(gid) => (2, gid.0 as u64),
        };
        out.extend_from_slice(&kind.to_le_bytes());
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(self.access as u64).to_le_bytes());
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 24 {
            return Err(Error::InvalidArgument);
        }
        let word = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let principal = match word(0) {
            0 => Principal::World,
            1 => Principal::User(Uid(word(8) as u32)),
            2 => Principal::Group(Gid(word(8) as u32)),
            _ => return Err(Error::InvalidArgument),
        };
        Ok(PolicyAccess { principal, access: Access::from_u64(word(16))? })
    }
}

/// Identifies who installed a set of entries, so they can be replaced or
/// dropped together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PolicyOwner {
    Endpoint(u64),
    Connection(ConnectionId),
}

struct DbEntry {
    owner: PolicyOwner,
    accesses: Vec<PolicyAccess>,
}

/// A policy database with a per-pair TALK cache.
pub struct PolicyDb {
    /// Exact names, and wildcard entries keyed by their prefix (the part
    /// before `.*`).
    entries: RwLock<Entries>,
    talk_cache: Mutex<HashSet<(ConnectionId, ConnectionId)>>,
}

#[derive(Default)]
struct Entries {
    exact: HashMap<String, DbEntry>,
    wildcard: HashMap<String, DbEntry>,
}

impl PolicyDb {
    pub fn new() -> Self {
        PolicyDb {
            entries: RwLock::new(Entries::default()),
            talk_cache: Mutex::new(HashSet::new()),
        }
    }

    /// True if no entries are installed.
    pub fn is_empty(&self) -> bool {
        let entries = self.entries.read();
        entries.exact.is_empty() && entries.wildcard.is_empty()
    }

    /// Install policy entries from an item stream: each `Name` item opens
    /// an entry, subsequent `PolicyAccess` items attach to it.
    ///
    /// Previous entries of the same owner are replaced. An entry already
    /// owned by somebody else is a conflict. `max_names` bounds how many
    /// names one call may install (0 means unbounded); wildcards are only
    /// accepted when `allow_wildcards` is set.
    pub fn set(
        &self,
        owner: PolicyOwner,
        items: &[Item],
        max_names: usize,
        allow_wildcards: bool,
    ) -> Result<()> {
        let mut parsed: Vec<(String, Vec<PolicyAccess>)> = Vec::new();
        for item in items {
            match item {
                Item::Name(name) => {
                    if !crate::util::name_is_valid(name, allow_wildcards) {
                        return Err(Error::InvalidArgument);
                    }
                    if max_names > 0 && parsed.len() == max_names {
                        return Err(Error::InvalidArgument);
                    }
                    parsed.push((name.clone(), Vec::new()));
                }
                Item::PolicyAccess(access) => {
                    let (_, accesses) =
                        parsed.last_mut().ok_or(Error::InvalidArgument)?;
                    accesses.push(*access);
                }
                _ => {}
            }
        }
        if parsed.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let mut entries = self.entries.write();

        // conflict check before any mutation
        for (name, _) in &parsed {
            let (map, key) = Entries::locate(name);
            let existing = match map {
                Slot::Exact => entries.exact.get(key),
                Slot::Wildcard => entries.wildcard.get(key),
            };
            if let Some(e) = existing {
                if e.owner != owner {
                    return Err(Error::AlreadyExists);
                }
            }
        }

        entries.exact.retain(|_, e| e.owner != owner);
        entries.wildcard.retain(|_, e| e.owner != owner);
        for (name, accesses) in parsed {
            let entry = DbEntry { owner, accesses };
            match Entries::locate(&name) {
                (Slot::Exact, key) => entries.exact.insert(key.to_owned(), entry),
                (Slot::Wildcard, key) => entries.wildcard.insert(key.to_owned(), entry),
            };
        }

        self.purge_cache_all();
        Ok(())
    }

    /// Drop every entry installed by `owner`.
    pub fn remove_owner(&self, owner: PolicyOwner) {
        let mut entries = self.entries.write();
        entries.exact.retain(|_, e| e.owner != owner);
        entries.wildcard.retain(|_, e| e.owner != owner);
        drop(entries);
        self.purge_cache_all();
    }

    /// May `cred` learn that `name` exists?
    pub fn check_see_access(&self, cred: &Credentials, name: &str) -> Result<()> {
        self.check_access(cred, name, Access::See)
    }

    /// May `cred` acquire `name`?
    pub fn check_own_access(&self, cred: &Credentials, name: &str) -> Result<()> {
        self.check_access(cred, name, Access::Own)
    }

    /// May the source talk to a destination owning `dst_names`?
    ///
    /// Grants are cached per connection pair.
    pub fn check_talk_access(
        &self,
        src_cred: &Credentials,
        src: ConnectionId,
        dst: ConnectionId,
        dst_names: &[String],
    ) -> Result<()> {
        if self.talk_cache.lock().contains(&(src, dst)) {
            return Ok(());
        }

        for name in dst_names {
            if self.check_access(src_cred, name, Access::Talk).is_ok() {
                self.talk_cache.lock().insert((src, dst));
                return Ok(());
            }
        }
        Err(Error::PermissionDenied)
    }

    /// Forget every cached decision that involves `id`. Called on
    /// disconnect and whenever `id`'s names change.
    pub fn purge_cache(&self, id: ConnectionId) {
        self.talk_cache
            .lock()
            .retain(|&(src, dst)| src != id && dst != id);
    }

    fn purge_cache_all(&self) {
        self.talk_cache.lock().clear();
    }

    fn check_access(&self, cred: &Credentials, name: &str, want: Access) -> Result<()> {
        let entries = self.entries.read();

        if let Some(entry) = entries.exact.get(name) {
            return entry.grants(cred, want);
        }

        // walk wildcard prefixes, longest first
        let mut prefix = name;
        while let Some(pos) = prefix.rfind('.') {
            prefix = &prefix[..pos];
            if let Some(entry) = entries.wildcard.get(prefix) {
                return entry.grants(cred, want);
            }
        }

        Err(Error::PermissionDenied)
    }
}

impl Default for PolicyDb {
    fn default() -> Self {
        Self::new()
    }
}

enum Slot {
    Exact,
    Wildcard,
}

impl Entries {
    fn locate(name: &str) -> (Slot, &str) {
        match name.strip_suffix(".*") {
            Some(prefix) => (Slot::Wildcard, prefix),
            None => (Slot::Exact, name),
        }
    }
}

impl DbEntry {
    /// Resolve the effective access for `cred`: a user rule wins over a
    /// group rule, a group rule wins over world.
    fn grants(&self, cred: &Credentials, want: Access) -> Result<()> {
        let mut user: Option<Access> = None;
        let mut group: Option<Access> = None;
        let mut world: Option<Access> = None;

        for rule in &self.accesses {
            match rule.principal {
                Principal::User(uid) if uid == cred.uid => {
                    user = Some(user.map_or(rule.access, |a| a.max(rule.access)));
                }
                Principal::Group(gid) if gid == cred.gid => {
                    group = Some(group.map_or(rule.access, |a| a.max(rule.access)));
                }
                Principal::World => {
                    world = Some(world.map_or(rule.access, |a| a.max(rule.access)));
                }
                _ => {}
            }
        }

        let effective = user.or(group).or(world).ok_or(Error::PermissionDenied)?;
        if effective >= want {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with(name: &str, accesses: &[PolicyAccess]) -> PolicyDb {
        let db = PolicyDb::new();
        let mut items = vec![Item::Name(name.into())];
        items.extend(accesses.iter().map(|a| Item::PolicyAccess(*a)));
        db.set(PolicyOwner::Endpoint(1), &items, 0, true).unwrap();
        db
    }

    fn world(access: Access) -> PolicyAccess {
        PolicyAccess { principal: Principal::World, access }
    }

    fn user(uid: u32, access: Access) -> PolicyAccess {
        PolicyAccess { principal: Principal::User(Uid(uid)), access }
    }

    #[test]
    fn own_implies_talk_and_see() {
        let db = db_with("com.example.Svc", &[world(Access::Own)]);
        let cred = Credentials::for_user(1000);
        assert!(db.check_see_access(&cred, "com.example.Svc").is_ok());
        assert!(db.check_own_access(&cred, "com.example.Svc").is_ok());
    }

    #[test]
    fn see_does_not_imply_own() {
        let db = db_with("com.example.Svc", &[world(Access::See)]);
        let cred = Credentials::for_user(1000);
        assert_eq!(
            db.check_own_access(&cred, "com.example.Svc"),
            Err(Error::PermissionDenied)
        );
    }

    #[test]
    fn user_rule_overrides_world() {
        let db = db_with(
            "com.example.Svc",
            &[world(Access::Own), user(1000, Access::See)],
        );
        // the more specific user rule demotes this caller
        let cred = Credentials::for_user(1000);
        assert_eq!(
            db.check_own_access(&cred, "com.example.Svc"),
            Err(Error::PermissionDenied)
        );
        // other users still get the world rule
        let other = Credentials::for_user(1001);
        assert!(db.check_own_access(&other, "com.example.Svc").is_ok());
    }

    #[test]
    fn wildcard_matches_any_depth_most_specific_first() {
        let db = PolicyDb::new();
        db.set(
            PolicyOwner::Endpoint(1),
            &[
                Item::Name("com.example.*".into()),
                Item::PolicyAccess(world(Access::Own)),
                Item::Name("com.*".into()),
                Item::PolicyAccess(world(Access::See)),
            ],
            0,
            true,
        )
        .unwrap();
        let cred = Credentials::for_user(1000);
        assert!(db.check_own_access(&cred, "com.example.a.b").is_ok());
        assert_eq!(
            db.check_own_access(&cred, "com.other"),
            Err(Error::PermissionDenied)
        );
        assert!(db.check_see_access(&cred, "com.other").is_ok());
    }

    #[test]
    fn no_entry_means_denied() {
        let db = PolicyDb::new();
        let cred = Credentials::for_user(1000);
        assert_eq!(
            db.check_see_access(&cred, "com.example.Svc"),
            Err(Error::PermissionDenied)
        );
    }

    #[test]
    fn entries_of_other_owners_conflict() {
        let db = db_with("com.example.Svc", &[world(Access::Talk)]);
        let again = db.set(
            PolicyOwner::Connection(ConnectionId::new(9)),
            &[Item::Name("com.example.Svc".into())],
            0,
            false,
        );
        assert_eq!(again, Err(Error::AlreadyExists));
    }

    #[test]
    fn talk_cache_is_purged_on_name_change() {
        let db = db_with("com.example.Svc", &[world(Access::Talk)]);
        let cred = Credentials::for_user(1000);
        let src = ConnectionId::new(1);
        let dst = ConnectionId::new(2);
        let names = vec!["com.example.Svc".to_owned()];
        assert!(db.check_talk_access(&cred, src, dst, &names).is_ok());

        // dst loses its name; the cached grant must not survive the purge
        db.purge_cache(dst);
        assert_eq!(
            db.check_talk_access(&cred, src, dst, &[]),
            Err(Error::PermissionDenied)
        );
    }

    #[test]
    fn policy_access_wire_roundtrip() {
        let a = PolicyAccess { principal: Principal::Group(Gid(5)), access: Access::Talk };
        let mut buf = Vec::new();
        a.encode(&mut buf);
        assert_eq!(PolicyAccess::decode(&buf).unwrap(), a);
    }
}
