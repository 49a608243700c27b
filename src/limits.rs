// src/limits.rs

//! Engine-wide quotas and bounds.
//!
//! Privileged callers (see [`crate::bus::Bus::cred_is_privileged`]) bypass
//! the per-connection and per-user quotas but not the structural bounds.

/// Maximum number of messages queued on one connection.
pub const MAX_MSGS: usize = 256;

/// Maximum number of queued messages from one sending user, enforced only
/// once the queue has grown past this mark.
pub const MAX_MSGS_PER_USER: usize = 16;

/// Maximum number of outbound requests awaiting a reply per connection.
pub const MAX_REQUESTS_PENDING: usize = 128;

/// Maximum number of connections one user may hold on a domain.
pub const MAX_CONN_PER_USER: usize = 256;

/// Maximum number of buses one user may create on a domain.
pub const MAX_BUSES_PER_USER: usize = 16;

/// Maximum bloom filter size in bytes.
pub const MAX_BLOOM_SIZE: usize = 512;

/// Maximum names one connection may own or wait for.
pub const MAX_NAMES_PER_CONN: usize = 256;

/// Maximum well-known name length in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Smallest receive pool a connection may request.
pub const MIN_POOL_SIZE: u64 = 4096;

/// Largest receive pool a connection may request.
pub const MAX_POOL_SIZE: u64 = 16 * 1024 * 1024;
