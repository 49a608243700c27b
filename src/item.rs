// src/item.rs

//! Tagged-union wire items.
//!
//! Everything variable-sized that crosses the engine boundary travels as a
//! sequence of `{size, type, payload}` records, 8-byte aligned. The item
//! *types* are contracts; the byte layout below is what this engine speaks
//! and is only consumed by its own transport glue and tests.
//!
//! Unknown item types are skipped during iteration. Where a specific item
//! is required, its absence surfaces as `InvalidArgument`.

use crate::error::{Error, Result};
use crate::types::{BloomParameter, Gid, HandleToken, NameId, Uid};

const ITEM_HEADER: usize = 16;

/// Item type tags.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Name = 1,
    OwnedName = 2,
    Creds = 3,
    Seclabel = 4,
    ConnDescription = 5,
    AttachFlags = 6,
    MakeName = 7,
    BloomParameter = 8,
    BloomFilter = 9,
    PayloadVec = 10,
    PayloadMemfd = 11,
    Handles = 12,
    PolicyAccess = 13,
    Timestamp = 14,
    PidComm = 15,
    TidComm = 16,
    Exe = 17,
    Cmdline = 18,
    Cgroup = 19,
    Caps = 20,
    Audit = 21,
    NameAdd = 22,
    NameRemove = 23,
    NameChange = 24,
    IdAdd = 25,
    IdRemove = 26,
    ReplyTimeout = 27,
    ReplyDead = 28,
}

impl ItemKind {
    pub fn from_u64(v: u64) -> Option<Self> {
        Some(match v {
            1 => ItemKind::Name,
            2 => ItemKind::OwnedName,
            3 => ItemKind::Creds,
            4 => ItemKind::Seclabel,
            5 => ItemKind::ConnDescription,
            6 => ItemKind::AttachFlags,
            7 => ItemKind::MakeName,
            8 => ItemKind::BloomParameter,
            9 => ItemKind::BloomFilter,
            10 => ItemKind::PayloadVec,
            11 => ItemKind::PayloadMemfd,
            12 => ItemKind::Handles,
            13 => ItemKind::PolicyAccess,
            14 => ItemKind::Timestamp,
            15 => ItemKind::PidComm,
            16 => ItemKind::TidComm,
            17 => ItemKind::Exe,
            18 => ItemKind::Cmdline,
            19 => ItemKind::Cgroup,
            20 => ItemKind::Caps,
            21 => ItemKind::Audit,
            22 => ItemKind::NameAdd,
            23 => ItemKind::NameRemove,
            24 => ItemKind::NameChange,
            25 => ItemKind::IdAdd,
            26 => ItemKind::IdRemove,
            27 => ItemKind::ReplyTimeout,
            28 => ItemKind::ReplyDead,
            _ => return None,
        })
    }
}

/// Basic credentials carried in a `Creds` item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireCreds {
    pub uid: Uid,
    pub gid: Gid,
    pub pid: u32,
    pub tid: u32,
}

/// `(id, role-flags)` pair used by id/name notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdFlags {
    pub id: u64,
    pub flags: u64,
}

/// One decoded item.
#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    /// A well-known name (destination, hello registration, policy entry).
    Name(String),
    /// A name owned by a connection, as reported in metadata.
    OwnedName { name_id: NameId, name: String },
    Creds(WireCreds),
    Seclabel(String),
    ConnDescription(String),
    AttachFlags(u64),
    MakeName(String),
    BloomParameter(BloomParameter),
    BloomFilter(Vec<u8>),
    PayloadVec(Vec<u8>),
    /// A sealed-memory payload; the engine treats the handle as opaque.
    PayloadMemfd { size: u64, token: HandleToken },
    Handles(Vec<HandleToken>),
    PolicyAccess(crate::policy::PolicyAccess),
    Timestamp { monotonic_ns: u64, realtime_ns: u64, seq: u64 },
    PidComm(String),
    TidComm(String),
    Exe(String),
    Cmdline(Vec<String>),
    Cgroup(String),
    Caps(u64),
    Audit { loginuid: u32, sessionid: u32 },
    NameAdd { new: IdFlags, name: String },
    NameRemove { old: IdFlags, name: String },
    NameChange { old: IdFlags, new: IdFlags, name: String },
    IdAdd(IdFlags),
    IdRemove(IdFlags),
    ReplyTimeout,
    ReplyDead,
    /// An item this engine version does not understand; preserved so
    /// iteration can skip it.
    Unknown { ty: u64 },
}

impl Item {
    pub fn kind(&self) -> Option<ItemKind> {
        Some(match self {
            Item::Name(_) => ItemKind::Name,
            Item::OwnedName { .. } => ItemKind::OwnedName,
            Item::Creds(_) => ItemKind::Creds,
            Item::Seclabel(_) => ItemKind::Seclabel,
            Item::ConnDescription(_) => ItemKind::ConnDescription,
            Item::AttachFlags(_) => ItemKind::AttachFlags,
            Item::MakeName(_) => ItemKind::MakeName,
            Item::BloomParameter(_) => ItemKind::BloomParameter,
            Item::BloomFilter(_) => ItemKind::BloomFilter,
            Item::PayloadVec(_) => ItemKind::PayloadVec,
            Item::PayloadMemfd { .. } => ItemKind::PayloadMemfd,
            Item::Handles(_) => ItemKind::Handles,
            Item::PolicyAccess(_) => ItemKind::PolicyAccess,
            Item::Timestamp { .. } => ItemKind::Timestamp,
            Item::PidComm(_) => ItemKind::PidComm,
            Item::TidComm(_) => ItemKind::TidComm,
            Item::Exe(_) => ItemKind::Exe,
            Item::Cmdline(_) => ItemKind::Cmdline,
            Item::Cgroup(_) => ItemKind::Cgroup,
            Item::Caps(_) => ItemKind::Caps,
            Item::Audit { .. } => ItemKind::Audit,
            Item::NameAdd { .. } => ItemKind::NameAdd,
            Item::NameRemove { .. } => ItemKind::NameRemove,
            Item::NameChange { .. } => ItemKind::NameChange,
            Item::IdAdd(_) => ItemKind::IdAdd,
            Item::IdRemove(_) => ItemKind::IdRemove,
            Item::ReplyTimeout => ItemKind::ReplyTimeout,
            Item::ReplyDead => ItemKind::ReplyDead,
            Item::Unknown { .. } => return None,
        })
    }

    fn payload(&self) -> Vec<u8> {
        let mut p = Vec::new();
        match self {
            Item::Name(s)
            | Item::Seclabel(s)
            | Item::ConnDescription(s)
            | Item::MakeName(s)
            | Item::PidComm(s)
            | Item::TidComm(s)
            | Item::Exe(s)
            | Item::Cgroup(s) => p.extend_from_slice(s.as_bytes()),
            Item::OwnedName { name_id, name } => {
                put_u64(&mut p, name_id.get());
                p.extend_from_slice(name.as_bytes());
            }
            Item::Creds(c) => {
                put_u64(&mut p, c.uid.0 as u64);
                put_u64(&mut p, c.gid.0 as u64);
                put_u64(&mut p, c.pid as u64);
                put_u64(&mut p, c.tid as u64);
            }
            Item::AttachFlags(v) | Item::Caps(v) => put_u64(&mut p, *v),
            Item::BloomParameter(b) => {
                put_u64(&mut p, b.size as u64);
                put_u64(&mut p, b.n_hash as u64);
            }
            Item::BloomFilter(bytes) | Item::PayloadVec(bytes) => {
                p.extend_from_slice(bytes);
            }
            Item::PayloadMemfd { size, token } => {
                put_u64(&mut p, *size);
                put_u64(&mut p, token.0);
            }
            Item::Handles(tokens) => {
                for t in tokens {
                    put_u64(&mut p, t.0);
                }
            }
            Item::PolicyAccess(a) => a.encode(&mut p),
            Item::Timestamp { monotonic_ns, realtime_ns, seq } => {
                put_u64(&mut p, *monotonic_ns);
                put_u64(&mut p, *realtime_ns);
                put_u64(&mut p, *seq);
            }
            Item::Cmdline(args) => {
                // NUL-separated, like the /proc representation
                for a in args {
                    p.extend_from_slice(a.as_bytes());
                    p.push(0);
                }
            }
            Item::Audit { loginuid, sessionid } => {
                put_u64(&mut p, *loginuid as u64);
                put_u64(&mut p, *sessionid as u64);
            }
            Item::NameAdd { new, name } => {
                put_u64(&mut p, 0);
                put_u64(&mut p, 0);
                put_u64(&mut p, new.id);
                put_u64(&mut p, new.flags);
                p.extend_from_slice(name.as_bytes());
            }
            Item::NameRemove { old, name } => {
                put_u64(&mut p, old.id);
                put_u64(&mut p, old.flags);
                put_u64(&mut p, 0);
                put_u64(&mut p, 0);
                p.extend_from_slice(name.as_bytes());
            }
            Item::NameChange { old, new, name } => {
                put_u64(&mut p, old.id);
                put_u64(&mut p, old.flags);
                put_u64(&mut p, new.id);
                put_u64(&mut p, new.flags);
                p.extend_from_slice(name.as_bytes());
            }
            Item::IdAdd(v) | Item::IdRemove(v) => {
                put_u64(&mut p, v.id);
                put_u64(&mut p, v.flags);
            }
            Item::ReplyTimeout | Item::ReplyDead => {}
            Item::Unknown { .. } => {}
        }
        p
    }

    /// Append the serialized record, padded to 8 bytes.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let Some(kind) = self.kind() else { return };
        let payload = self.payload();
        put_u64(out, (ITEM_HEADER + payload.len()) as u64);
        put_u64(out, kind as u64);
        out.extend_from_slice(&payload);
        while out.len() % 8 != 0 {
            out.push(0);
        }
    }

    /// Decode one record; returns the item and the padded record length.
    pub fn decode(buf: &[u8]) -> Result<(Item, usize)> {
        if buf.len() < ITEM_HEADER {
            return Err(Error::InvalidArgument);
        }
        let size = get_u64(buf, 0) as usize;
        let ty = get_u64(buf, 8);
        if size < ITEM_HEADER || size > buf.len() {
            return Err(Error::InvalidArgument);
        }
        let payload = &buf[ITEM_HEADER..size];
        let advance = (size + 7) & !7;

        let Some(kind) = ItemKind::from_u64(ty) else {
            return Ok((Item::Unknown { ty }, advance.min(buf.len())));
        };

        let item = match kind {
            ItemKind::Name => Item::Name(utf8(payload)?),
            ItemKind::Seclabel => Item::Seclabel(utf8(payload)?),
            ItemKind::ConnDescription => Item::ConnDescription(utf8(payload)?),
            ItemKind::MakeName => Item::MakeName(utf8(payload)?),
            ItemKind::PidComm => Item::PidComm(utf8(payload)?),
            ItemKind::TidComm => Item::TidComm(utf8(payload)?),
            ItemKind::Exe => Item::Exe(utf8(payload)?),
            ItemKind::Cgroup => Item::Cgroup(utf8(payload)?),
            ItemKind::OwnedName => {
                let name_id = NameId::new(get_checked(payload, 0)?);
                Item::OwnedName { name_id, name: utf8(tail(payload, 8)?)? }
            }
            ItemKind::Creds => Item::Creds(WireCreds {
                uid: Uid(get_checked(payload, 0)? as u32),
                gid: Gid(get_checked(payload, 8)? as u32),
                pid: get_checked(payload, 16)? as u32,
                tid: get_checked(payload, 24)? as u32,
            }),
            ItemKind::AttachFlags => Item::AttachFlags(get_checked(payload, 0)?),
            ItemKind::Caps => Item::Caps(get_checked(payload, 0)?),
            ItemKind::BloomParameter => Item::BloomParameter(BloomParameter {
                size: get_checked(payload, 0)? as usize,
                n_hash: get_checked(payload, 8)? as u32,
            }),
            ItemKind::BloomFilter => Item::BloomFilter(payload.to_vec()),
            ItemKind::PayloadVec => Item::PayloadVec(payload.to_vec()),
            ItemKind::PayloadMemfd => Item::PayloadMemfd {
                size: get_checked(payload, 0)?,
                token: HandleToken(get_checked(payload, 8)?),
            },
            ItemKind::Handles => {
                if payload.len() % 8 != 0 {
                    return Err(Error::InvalidArgument);
                }
                Item::Handles(
                    payload
                        .chunks_exact(8)
                        .map(|c| HandleToken(u64::from_le_bytes(c.try_into().unwrap())))
                        .collect(),
                )
            }
            ItemKind::PolicyAccess => {
                Item::PolicyAccess(crate::policy::PolicyAccess::decode(payload)?)
            }
            ItemKind::Timestamp => Item::Timestamp {
                monotonic_ns: get_checked(payload, 0)?,
                realtime_ns: get_checked(payload, 8)?,
                seq: get_checked(payload, 16)?,
            },
            ItemKind::Cmdline => {
                let mut args = Vec::new();
                for part in payload.split(|&b| b == 0) {
                    if !part.is_empty() {
                        args.push(utf8(part)?);
                    }
                }
                Item::Cmdline(args)
            }
            ItemKind::Audit => Item::Audit {
                loginuid: get_checked(payload, 0)? as u32,
                sessionid: get_checked(payload, 8)? as u32,
            },
            ItemKind::NameAdd => Item::NameAdd {
                new: IdFlags { id: get_checked(payload, 16)?, flags: get_checked(payload, 24)? },
                name: utf8(tail(payload, 32)?)?,
            },
            ItemKind::NameRemove => Item::NameRemove {
                old: IdFlags { id: get_checked(payload, 0)?, flags: get_checked(payload, 8)? },
                name: utf8(tail(payload, 32)?)?,
            },
            ItemKind::NameChange => Item::NameChange {
                old: IdFlags { id: get_checked(payload, 0)?, flags: get_checked(payload, 8)? },
                new: IdFlags { id: get_checked(payload, 16)?, flags: get_checked(payload, 24)? },
                name: utf8(tail(payload, 32)?)?,
            },
            ItemKind::IdAdd => Item::IdAdd(IdFlags {
                id: get_checked(payload, 0)?,
                flags: get_checked(payload, 8)?,
            }),
            ItemKind::IdRemove => Item::IdRemove(IdFlags {
                id: get_checked(payload, 0)?,
                flags: get_checked(payload, 8)?,
            }),
            ItemKind::ReplyTimeout => Item::ReplyTimeout,
            ItemKind::ReplyDead => Item::ReplyDead,
        };

        Ok((item, advance.min(buf.len())))
    }
}

/// Iterate items in a serialized stream, skipping unknown types.
pub fn iter_items(mut buf: &[u8]) -> impl Iterator<Item = Result<Item>> + '_ {
    std::iter::from_fn(move || {
        if buf.len() < ITEM_HEADER {
            return None;
        }
        match Item::decode(buf) {
            Ok((item, advance)) => {
                buf = &buf[advance..];
                Some(Ok(item))
            }
            Err(e) => {
                buf = &[];
                Some(Err(e))
            }
        }
    })
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

fn get_checked(buf: &[u8], at: usize) -> Result<u64> {
    if buf.len() < at + 8 {
        return Err(Error::InvalidArgument);
    }
    Ok(get_u64(buf, at))
}

fn tail(buf: &[u8], at: usize) -> Result<&[u8]> {
    buf.get(at..).ok_or(Error::InvalidArgument)
}

fn utf8(bytes: &[u8]) -> Result<String> {
    // tolerate trailing NULs from fixed-width writers
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    std::str::from_utf8(&bytes[..end])
        .map(str::to_owned)
        .map_err(|_| Error::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(item: Item) -> Item {
        let mut buf = Vec::new();
        item.encode_into(&mut buf);
        let (decoded, advance) = Item::decode(&buf).unwrap();
        assert_eq!(advance, buf.len());
        decoded
    }

    #[test]
    fn name_roundtrip() {
        let item = Item::Name("com.example.Svc".into());
        assert_eq!(roundtrip(item.clone()), item);
    }

    #[test]
    fn creds_roundtrip() {
        let item = Item::Creds(WireCreds {
            uid: Uid(1000),
            gid: Gid(100),
            pid: 42,
            tid: 43,
        });
        assert_eq!(roundtrip(item.clone()), item);
    }

    #[test]
    fn name_change_roundtrip() {
        let item = Item::NameChange {
            old: IdFlags { id: 3, flags: 0 },
            new: IdFlags { id: 9, flags: 0 },
            name: "com.example.Svc".into(),
        };
        assert_eq!(roundtrip(item.clone()), item);
    }

    #[test]
    fn unknown_items_are_skipped_in_iteration() {
        let mut buf = Vec::new();
        Item::PayloadVec(b"hi".to_vec()).encode_into(&mut buf);
        // splice in a record with an unassigned type tag
        put_u64(&mut buf, 16);
        put_u64(&mut buf, 0xdead);
        Item::ReplyDead.encode_into(&mut buf);

        let items: Vec<_> = iter_items(&buf).collect::<Result<_>>().unwrap();
        assert_eq!(items.len(), 3);
        assert!(matches!(items[1], Item::Unknown { ty: 0xdead }));
        assert_eq!(items[2], Item::ReplyDead);
    }

    #[test]
    fn truncated_record_is_invalid() {
        let mut buf = Vec::new();
        Item::PayloadVec(b"payload".to_vec()).encode_into(&mut buf);
        assert!(Item::decode(&buf[..10]).is_err());
    }

    #[test]
    fn cmdline_roundtrip() {
        let item = Item::Cmdline(vec!["daemon".into(), "--verbose".into()]);
        assert_eq!(roundtrip(item.clone()), item);
    }
}
