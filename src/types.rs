// src/types.rs

use std::fmt;

/// Connection id, unique for the lifetime of a bus.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

/// Per-bus sequence number stamped on a name entry at every effective
/// ownership transition. Consumers compare these to detect handoffs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NameId(pub(crate) u64);

impl NameId {
    pub fn new(id: u64) -> Self {
        NameId(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// 128-bit bus identity, generated at bus creation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BusId(pub [u8; 16]);

impl BusId {
    pub(crate) fn generate() -> Self {
        BusId(rand::random())
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// An opaque, transferable handle token.
///
/// The engine never interprets these; the external transport maps them to
/// whatever its host's handle table holds. They are refused by receivers
/// that did not opt into handle passing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HandleToken(pub u64);

/// User id as seen by the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Uid(pub u32);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group id as seen by the engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Gid(pub u32);

/// Bloom filter geometry, fixed per bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BloomParameter {
    /// Filter size in bytes. Must be in `[8, MAX_BLOOM_SIZE]` and a
    /// multiple of 8.
    pub size: usize,
    /// Number of hash functions senders apply. Must be >= 1.
    pub n_hash: u32,
}

impl BloomParameter {
    pub(crate) fn validate(&self) -> crate::error::Result<()> {
        if self.size < 8
            || self.size > crate::limits::MAX_BLOOM_SIZE
            || self.size % 8 != 0
            || self.n_hash < 1
        {
            return Err(crate::error::Error::InvalidArgument);
        }
        Ok(())
    }
}
