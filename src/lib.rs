// src/lib.rs

//! navette: an in-process message-bus engine.
//!
//! Typed, structured messages between local participants, with well-known
//! name resolution, policy enforcement, synchronous and asynchronous
//! request/reply, and per-receiver zero-copy receive pools. The engine is
//! transport-agnostic: a device node, a socket, or a test harness drives
//! it through the command surface on [`Domain`], [`Bus`], [`Endpoint`]
//! and [`Connection`].

pub mod bus;
pub mod connection;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod item;
pub mod limits;
pub mod match_db;
pub mod message;
pub mod metadata;
pub mod names;
mod notify;
pub mod policy;
pub mod pool;
pub mod queue;
mod reply;
pub mod send;
pub mod types;
pub mod util;

pub use bus::{Bus, BusCreateRequest};
pub use connection::{
    Connection, ConnectionFlags, HelloReply, HelloRequest, InfoQuery, InfoRecord,
    RecvCommand, RecvFlags, RecvResult,
};
pub use domain::Domain;
pub use endpoint::{Endpoint, EndpointAccess};
pub use error::{Error, Result};
pub use item::{IdFlags, Item, ItemKind, WireCreds};
pub use match_db::{MatchItem, MatchRule, NotifyMatch};
pub use message::{DeliveredMessage, Destination, Message, MessageFlags};
pub use metadata::{AttachFlags, Credentials, Metadata, CAP_IPC_OWNER};
pub use names::{AcquireOutcome, NameFlags, NameListFlags};
pub use policy::{Access, PolicyAccess, Principal};
pub use send::{deadline_after, send, SendResult};
pub use types::{BloomParameter, BusId, ConnectionId, Gid, HandleToken, NameId, Uid};
