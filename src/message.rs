// src/message.rs

//! Message model and the serialized delivery record.
//!
//! A [`Message`] is what a sender hands to the engine. During delivery it
//! is wrapped in an [`Envelope`] carrying routing state and the metadata
//! buffer, then serialized into the receiver's pool as a header followed
//! by the message items and the metadata items.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::item::{iter_items, Item, ItemKind};
use crate::metadata::Metadata;
use crate::types::{ConnectionId, HandleToken, NameId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u64 {
        /// The sender expects a reply; a reply tracker is armed.
        const EXPECT_REPLY  = 1 << 0;
        /// Block the sender until the reply arrives.
        const SYNC_REPLY    = 1 << 1;
        /// Fail instead of queueing to an activator.
        const NO_AUTO_START = 1 << 2;
    }
}

/// Where a message goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// A connection addressed by unique id.
    Id(ConnectionId),
    /// A well-known name; the optional id pins the expected owner.
    Name { name: String, id: Option<ConnectionId> },
    /// Every eligible connection on the bus.
    Broadcast,
}

/// A message as submitted by a sender.
#[derive(Clone, Debug)]
pub struct Message {
    pub dst: Destination,
    pub flags: MessageFlags,
    pub priority: i64,
    pub cookie: u64,
    /// Non-zero marks this message as the reply to that cookie.
    pub cookie_reply: u64,
    /// Absolute deadline (engine clock) for an expected reply.
    pub timeout_ns: u64,
    pub items: Vec<Item>,
}

impl Message {
    /// Plain unicast with a byte payload.
    pub fn to_id(dst: ConnectionId, cookie: u64, payload: &[u8]) -> Self {
        Message {
            dst: Destination::Id(dst),
            flags: MessageFlags::empty(),
            priority: 0,
            cookie,
            cookie_reply: 0,
            timeout_ns: 0,
            items: vec![Item::PayloadVec(payload.to_vec())],
        }
    }

    /// Unicast to a well-known name.
    pub fn to_name(name: &str, cookie: u64, payload: &[u8]) -> Self {
        Message {
            dst: Destination::Name { name: name.to_owned(), id: None },
            flags: MessageFlags::empty(),
            priority: 0,
            cookie,
            cookie_reply: 0,
            timeout_ns: 0,
            items: vec![Item::PayloadVec(payload.to_vec())],
        }
    }

    /// Broadcast carrying a bloom filter.
    pub fn broadcast(cookie: u64, bloom: Vec<u8>, payload: &[u8]) -> Self {
        Message {
            dst: Destination::Broadcast,
            flags: MessageFlags::empty(),
            priority: 0,
            cookie,
            cookie_reply: 0,
            timeout_ns: 0,
            items: vec![Item::BloomFilter(bloom), Item::PayloadVec(payload.to_vec())],
        }
    }

    /// Cross-field validation performed once at send time.
    pub(crate) fn validate(&self, bloom_size: usize) -> Result<()> {
        if self.flags.contains(MessageFlags::EXPECT_REPLY) {
            if self.cookie == 0 || self.timeout_ns == 0 {
                return Err(Error::InvalidArgument);
            }
            if self.cookie_reply != 0 {
                return Err(Error::InvalidArgument);
            }
        } else if self.flags.contains(MessageFlags::SYNC_REPLY) {
            return Err(Error::InvalidArgument);
        }

        let mut blooms = 0;
        for item in &self.items {
            match item {
                Item::BloomFilter(mask) => {
                    blooms += 1;
                    if mask.len() != bloom_size {
                        return Err(Error::InvalidArgument);
                    }
                }
                Item::PayloadVec(_) | Item::PayloadMemfd { .. } | Item::Handles(_) => {}
                _ => return Err(Error::InvalidArgument),
            }
        }

        match self.dst {
            Destination::Broadcast => {
                if blooms != 1 || self.flags.contains(MessageFlags::EXPECT_REPLY) {
                    return Err(Error::InvalidArgument);
                }
                if self.handles().next().is_some() {
                    return Err(Error::InvalidArgument);
                }
            }
            _ => {
                if blooms > 1 {
                    return Err(Error::InvalidArgument);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn bloom_filter(&self) -> Option<&[u8]> {
        self.items.iter().find_map(|i| match i {
            Item::BloomFilter(mask) => Some(mask.as_slice()),
            _ => None,
        })
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = HandleToken> + '_ {
        self.items
            .iter()
            .filter_map(|i| match i {
                Item::Handles(tokens) => Some(tokens.iter().copied()),
                _ => None,
            })
            .flatten()
    }
}

/// A message in flight: routing state plus the metadata attached so far.
pub(crate) struct Envelope {
    pub seq: u64,
    pub src: Option<ConnectionId>,
    pub msg: Message,
    pub meta: Option<Metadata>,
    /// Stamped when the destination was resolved through the registry.
    pub dst_name_id: Option<NameId>,
    /// For kernel notifications: the item kind that classifies them.
    pub notify_kind: Option<ItemKind>,
}

impl Envelope {
    pub fn new(src: Option<ConnectionId>, msg: Message) -> Self {
        Envelope {
            seq: 0,
            src,
            msg,
            meta: None,
            dst_name_id: None,
            notify_kind: None,
        }
    }

    /// The well-known name a name notification is about, if any. Custom
    /// endpoints check SEE on it before letting the notification through.
    pub fn notify_name(&self) -> Option<&str> {
        self.msg.items.iter().find_map(|i| match i {
            Item::NameAdd { name, .. }
            | Item::NameRemove { name, .. }
            | Item::NameChange { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn handle_count(&self) -> usize {
        self.msg.handles().count()
    }

    /// Serialize for delivery: fixed header, message items, then the
    /// metadata items attached for this receiver.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        let src_id = self.src.map_or(0, ConnectionId::get);
        let dst_id = match &self.msg.dst {
            Destination::Id(id) => id.get(),
            Destination::Name { id, .. } => id.map_or(0, ConnectionId::get),
            Destination::Broadcast => u64::MAX,
        };
        for v in [
            0, // patched below with the total size
            src_id,
            dst_id,
            self.msg.cookie,
            self.msg.cookie_reply,
            self.msg.priority as u64,
            self.msg.flags.bits(),
            self.seq,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for item in &self.msg.items {
            item.encode_into(&mut out);
        }
        if let Some(meta) = &self.meta {
            meta.encode(&mut out);
        }
        let size = (out.len() as u64).to_le_bytes();
        out[..8].copy_from_slice(&size);
        out
    }
}

/// A delivery record parsed back out of a pool slice.
#[derive(Debug)]
pub struct DeliveredMessage {
    /// `None` for kernel-origin messages.
    pub src: Option<ConnectionId>,
    pub cookie: u64,
    pub cookie_reply: u64,
    pub priority: i64,
    pub flags: MessageFlags,
    pub seq: u64,
    pub items: Vec<Item>,
}

impl DeliveredMessage {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 64 {
            return Err(Error::InvalidArgument);
        }
        let word = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let size = word(0) as usize;
        if size < 64 || size > buf.len() {
            return Err(Error::InvalidArgument);
        }
        let src = match word(8) {
            0 => None,
            id => Some(ConnectionId::new(id)),
        };
        let items = iter_items(&buf[64..size]).collect::<Result<Vec<_>>>()?;
        Ok(DeliveredMessage {
            src,
            cookie: word(24),
            cookie_reply: word(32),
            priority: word(40) as i64,
            flags: MessageFlags::from_bits_truncate(word(48)),
            seq: word(56),
            items,
        })
    }

    /// First byte payload, for the common single-vec case.
    pub fn payload(&self) -> Option<&[u8]> {
        self.items.iter().find_map(|i| match i {
            Item::PayloadVec(bytes) => Some(bytes.as_slice()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut env = Envelope::new(
            Some(ConnectionId::new(3)),
            Message::to_id(ConnectionId::new(4), 7, b"hi"),
        );
        env.seq = 11;
        let buf = env.encode();
        let parsed = DeliveredMessage::decode(&buf).unwrap();
        assert_eq!(parsed.src, Some(ConnectionId::new(3)));
        assert_eq!(parsed.cookie, 7);
        assert_eq!(parsed.seq, 11);
        assert_eq!(parsed.payload(), Some(&b"hi"[..]));
    }

    #[test]
    fn expect_reply_requires_cookie_and_deadline() {
        let mut msg = Message::to_id(ConnectionId::new(2), 0, b"x");
        msg.flags = MessageFlags::EXPECT_REPLY;
        assert_eq!(msg.validate(64), Err(Error::InvalidArgument));
        msg.cookie = 1;
        msg.timeout_ns = 100;
        assert!(msg.validate(64).is_ok());
    }

    #[test]
    fn sync_without_expect_reply_is_invalid() {
        let mut msg = Message::to_id(ConnectionId::new(2), 1, b"x");
        msg.flags = MessageFlags::SYNC_REPLY;
        assert_eq!(msg.validate(64), Err(Error::InvalidArgument));
    }

    #[test]
    fn broadcast_requires_exact_bloom() {
        let msg = Message::broadcast(1, vec![0; 64], b"x");
        assert!(msg.validate(64).is_ok());
        assert_eq!(msg.validate(32), Err(Error::InvalidArgument));

        let mut no_bloom = Message::to_id(ConnectionId::new(1), 1, b"x");
        no_bloom.dst = Destination::Broadcast;
        assert_eq!(no_bloom.validate(64), Err(Error::InvalidArgument));
    }

    #[test]
    fn negative_priority_survives_the_wire() {
        let mut msg = Message::to_id(ConnectionId::new(4), 9, b"p");
        msg.priority = -42;
        let env = Envelope::new(Some(ConnectionId::new(3)), msg);
        let parsed = DeliveredMessage::decode(&env.encode()).unwrap();
        assert_eq!(parsed.priority, -42);
    }
}
