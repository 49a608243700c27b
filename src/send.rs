// src/send.rs

//! The send pipeline: routing, policy, reply tracking, broadcast fan-out,
//! eavesdropping and the synchronous wait.
//!
//! Unicast failures propagate to the sender. Per-receiver failures during
//! broadcast and eavesdrop are swallowed; kernel-notification failures are
//! logged and never surface anywhere.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::message::{Destination, Envelope, Message, MessageFlags};
use crate::metadata::{AttachFlags, Metadata};
use crate::reply::ReplyTracker;
use crate::types::NameId;
use crate::util::monotonic_ns;

/// What a send call reports back.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SendResult {
    /// For synchronous sends: offset of the published reply slice in the
    /// sender's pool.
    pub reply_offset: Option<u64>,
}

enum UnicastOutcome {
    Queued,
    /// Sender must block on this tracker.
    Wait(Arc<ReplyTracker>),
}

/// Send `msg` from `src` through `ep`. Kernel-origin messages pass
/// `src = None` and skip policy and metadata handling.
pub fn send(
    ep: &Arc<Endpoint>,
    src: Option<&Arc<Connection>>,
    msg: Message,
) -> Result<SendResult> {
    let bus = ep.bus();
    let _active = src.map(|s| s.acquire_active()).transpose()?;
    if let Some(src) = src {
        if !src.is_ordinary() {
            return Err(Error::PermissionDenied);
        }
        msg.validate(bus.bloom().size)?;
    }

    let mut env = Envelope::new(src.map(|s| s.id()), msg);
    send_envelope(ep, src, &mut env)
}

/// The shared pipeline behind [`send`] and notification flushing.
pub(crate) fn send_envelope(
    ep: &Arc<Endpoint>,
    src: Option<&Arc<Connection>>,
    env: &mut Envelope,
) -> Result<SendResult> {
    let bus = ep.bus();
    env.seq = bus.domain().next_msg_seq();

    if let Some(src) = src {
        // impersonated identities are sealed at registration; nothing
        // fresher may be attached on their behalf
        env.meta = Some(match src.owner_meta() {
            Some(m) => m.dup(),
            None => Metadata::new(src.cred()),
        });
    }

    match env.msg.dst.clone() {
        Destination::Broadcast => {
            broadcast(ep, src, env);
            bus.flush_notifications_if(src.is_some());
            Ok(SendResult::default())
        }
        Destination::Id(id) => {
            let dst = bus.find_conn_by_id(id).ok_or(Error::NotFound)?;
            // special-purpose connections cannot be addressed by id
            if !dst.is_ordinary() {
                return Err(Error::NotFound);
            }
            let outcome = unicast(ep, src, &dst, None, env)?;
            finish(ep, src, &dst, env, outcome)
        }
        Destination::Name { name, id } => {
            // resolve and enqueue with the registry pinned, so an
            // activator handoff cannot lose the message
            let (dst, outcome) = bus.registry().with_entry(&name, |resolved| {
                let entry = resolved.ok_or(Error::NotFound)?;
                if let Some(want) = id {
                    if entry.owner.id() != want {
                        return Err(Error::IdNameMismatch);
                    }
                }
                if entry.activator_held
                    && env.msg.flags.contains(MessageFlags::NO_AUTO_START)
                {
                    return Err(Error::AddressNotAvailable);
                }
                let dst = entry.owner.clone();
                env.dst_name_id = Some(entry.name_id);
                let outcome = unicast(ep, src, &dst, Some(entry.name_id), env)?;
                Ok((dst, outcome))
            })?;
            finish(ep, src, &dst, env, outcome)
        }
    }
}

fn unicast(
    ep: &Arc<Endpoint>,
    src: Option<&Arc<Connection>>,
    dst: &Arc<Connection>,
    name_id: Option<NameId>,
    env: &mut Envelope,
) -> Result<UnicastOutcome> {
    let Some(src) = src else {
        // kernel message: no policy, no metadata, no reply tracking
        dst.enqueue(None, env, None)?;
        return Ok(UnicastOutcome::Queued);
    };

    let sync = env.msg.flags.contains(MessageFlags::SYNC_REPLY);

    // a restarted interrupted sync send finds its old tracker and goes
    // straight back to waiting
    if sync {
        if let Some(tracker) = dst.find_reply(src.id(), env.msg.cookie) {
            if tracker.resume_interrupted() {
                return Ok(UnicastOutcome::Wait(tracker));
            }
        }
    }

    attach_metadata(env, src, dst);

    let mut reply_wait: Option<Arc<ReplyTracker>> = None;
    let mut reply_wake: Option<Arc<ReplyTracker>> = None;

    if env.msg.flags.contains(MessageFlags::EXPECT_REPLY) {
        ep.policy_check_talk_access(src, dst)?;
        reply_wait = Some(ReplyTracker::new(
            src,
            env.msg.cookie,
            name_id,
            env.msg.timeout_ns,
            sync,
        )?);
    } else {
        // an armed tracker authorizes the reply in place of TALK
        let mut allowed = false;
        if env.msg.cookie_reply > 0 {
            if let Some(tracker) = src.find_reply(dst.id(), env.msg.cookie_reply) {
                if src.unlink_reply(&tracker) {
                    if tracker.sync {
                        reply_wake = Some(tracker);
                    }
                    allowed = true;
                }
            }
        }
        if !allowed {
            ep.policy_check_talk_access(src, dst)?;
        }
    }

    if let Some(tracker) = reply_wake {
        // deliver straight into the waiting requester, bypassing the queue
        deliver_direct(dst, env, &tracker)?;
        return Ok(UnicastOutcome::Queued);
    }

    dst.enqueue(Some(src), env, reply_wait.clone())?;

    match reply_wait {
        Some(tracker) if sync => Ok(UnicastOutcome::Wait(tracker)),
        _ => Ok(UnicastOutcome::Queued),
    }
}

/// Allocate the serialized reply in the requester's pool and complete its
/// tracker; the requester's queue never sees this entry.
fn deliver_direct(
    requester: &Arc<Connection>,
    env: &Envelope,
    tracker: &Arc<ReplyTracker>,
) -> Result<()> {
    let verdict = requester.deliver_direct_entry(env, tracker);
    if let Err(e) = verdict {
        tracker.complete_sync(Err(e), None);
        return Err(e);
    }
    Ok(())
}

fn finish(
    ep: &Arc<Endpoint>,
    src: Option<&Arc<Connection>>,
    dst: &Arc<Connection>,
    env: &mut Envelope,
    outcome: UnicastOutcome,
) -> Result<SendResult> {
    eavesdrop(ep, src, env);
    ep.bus().flush_notifications_if(src.is_some());

    let UnicastOutcome::Wait(tracker) = outcome else {
        return Ok(SendResult::default());
    };
    let Some(src) = src else {
        return Ok(SendResult::default());
    };

    wait_sync_reply(src, dst, env, &tracker)
}

fn wait_sync_reply(
    src: &Arc<Connection>,
    dst: &Arc<Connection>,
    env: &Envelope,
    tracker: &Arc<ReplyTracker>,
) -> Result<SendResult> {
    src.register_sync_wait(tracker);
    let outcome = tracker.wait_sync(env.msg.timeout_ns, || src.is_active());
    src.unregister_sync_wait(tracker);

    match outcome {
        Ok(direct) => {
            let offset = direct
                .map(|entry| src.install_direct_entry(entry))
                .transpose()?;
            dst.unlink_reply(tracker);
            Ok(SendResult { reply_offset: offset })
        }
        Err(Error::Interrupted) => {
            // tracker stays linked on the responder so a restart with the
            // same cookie can pick it up
            Err(Error::Interrupted)
        }
        Err(e) => {
            dst.unlink_reply(tracker);
            Err(e)
        }
    }
}

/// Fan a broadcast out to every eligible connection.
fn broadcast(ep: &Arc<Endpoint>, src: Option<&Arc<Connection>>, env: &mut Envelope) {
    let bus = ep.bus();
    for dst in bus.connections_snapshot() {
        if let Some(src) = src {
            if Arc::ptr_eq(&dst, src) {
                continue;
            }
        }
        if !dst.is_ordinary() && !dst.is_monitor() {
            continue;
        }

        // monitors tap the bus: no match rules, no policy
        if !dst.is_monitor() {
            if !dst.matches(src, env) {
                continue;
            }
            if ep.policy_check_notification(&dst, env).is_err() {
                continue;
            }
            if let Some(src) = src {
                if ep.policy_check_broadcast(src, &dst).is_err() {
                    continue;
                }
                if ep.policy_check_src_names(src, &dst).is_err() {
                    continue;
                }
            }
        }

        if let Some(src) = src {
            // the first receiver asking for a field makes it visible to
            // every receiver after it
            attach_metadata(env, src, &dst);
        }

        if let Err(e) = dst.enqueue(src, env, None) {
            debug!(dst = %dst.id(), error = %e, "broadcast receiver skipped");
        }
    }
}

/// Mirror a unicast to every monitor connection.
fn eavesdrop(ep: &Arc<Endpoint>, src: Option<&Arc<Connection>>, env: &mut Envelope) {
    let bus = ep.bus();
    for monitor in bus.monitors_snapshot() {
        if let Some(src) = src {
            attach_metadata(env, src, &monitor);
        }
        // monitor copies are quota-free and their failures stay here
        if let Err(e) = monitor.enqueue(None, env, None) {
            warn!(monitor = %monitor.id(), error = %e, "eavesdrop copy dropped");
        }
    }
}

/// Append the fields this receiver asked for to the envelope's metadata.
fn attach_metadata(env: &mut Envelope, src: &Arc<Connection>, dst: &Arc<Connection>) {
    let mut which = dst.attach_flags();
    if src.owner_meta().is_some() {
        which &= AttachFlags::NAMES | AttachFlags::CONN_DESCRIPTION;
    }
    let seq = env.seq;
    if let Some(meta) = env.meta.as_mut() {
        meta.append(
            src.cred(),
            &src.owned_names(),
            src.description(),
            seq,
            which,
        );
    }
}

/// Absolute deadline helper for transports that speak relative timeouts.
pub fn deadline_after(timeout: std::time::Duration) -> u64 {
    monotonic_ns() + timeout.as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, BusCreateRequest};
    use crate::connection::{ConnectionFlags, HelloRequest};
    use crate::domain::Domain;
    use crate::endpoint::EndpointAccess;
    use crate::item::Item;
    use crate::metadata::{AttachFlags, Credentials};
    use crate::names::NameFlags;
    use crate::types::{BloomParameter, ConnectionId, Gid, Uid};

    const UID: u32 = 900;

    fn bus() -> (Arc<Bus>, Arc<Endpoint>) {
        let domain = Domain::new();
        let bus = domain
            .create_bus(BusCreateRequest {
                name: format!("{UID}-send"),
                flags: 0,
                bloom: BloomParameter { size: 8, n_hash: 1 },
                access: EndpointAccess { mode: 0o666, uid: Uid(UID), gid: Gid(UID) },
                cred: Credentials::for_user(UID),
            })
            .unwrap();
        let ep = bus.default_endpoint().unwrap();
        (bus, ep)
    }

    fn hello(flags: ConnectionFlags, items: Vec<Item>) -> HelloRequest {
        HelloRequest {
            flags,
            attach_flags: AttachFlags::empty(),
            pool_size: 4096,
            cred: Credentials::for_user(UID),
            items,
        }
    }

    fn conn(ep: &Arc<Endpoint>) -> Arc<Connection> {
        ep.connect(hello(ConnectionFlags::empty(), Vec::new()))
            .unwrap()
            .0
    }

    #[test]
    fn unknown_destinations_are_not_found() {
        let (_bus, ep) = bus();
        let a = conn(&ep);

        let by_id = Message::to_id(ConnectionId::new(4096), 1, b"x");
        assert_eq!(send(&ep, Some(&a), by_id), Err(Error::NotFound));

        let by_name = Message::to_name("com.example.Nobody", 2, b"x");
        assert_eq!(send(&ep, Some(&a), by_name), Err(Error::NotFound));
    }

    #[test]
    fn special_purpose_connections_cannot_be_addressed_by_id() {
        let (_bus, ep) = bus();
        let a = conn(&ep);
        let monitor = ep
            .connect(hello(ConnectionFlags::MONITOR, Vec::new()))
            .unwrap()
            .0;

        let msg = Message::to_id(monitor.id(), 1, b"x");
        assert_eq!(send(&ep, Some(&a), msg), Err(Error::NotFound));
    }

    #[test]
    fn monitors_cannot_send() {
        let (_bus, ep) = bus();
        let a = conn(&ep);
        let monitor = ep
            .connect(hello(ConnectionFlags::MONITOR, Vec::new()))
            .unwrap()
            .0;

        let msg = Message::to_id(a.id(), 1, b"x");
        assert_eq!(send(&ep, Some(&monitor), msg), Err(Error::PermissionDenied));
    }

    #[test]
    fn pinned_id_must_match_the_name_owner() {
        let (_bus, ep) = bus();
        let owner = conn(&ep);
        let other = conn(&ep);
        let sender = conn(&ep);
        owner
            .name_acquire("com.example.Pinned", NameFlags::empty())
            .unwrap();

        let mut msg = Message::to_name("com.example.Pinned", 1, b"x");
        msg.dst = Destination::Name {
            name: "com.example.Pinned".into(),
            id: Some(other.id()),
        };
        assert_eq!(send(&ep, Some(&sender), msg), Err(Error::IdNameMismatch));

        let mut msg = Message::to_name("com.example.Pinned", 2, b"x");
        msg.dst = Destination::Name {
            name: "com.example.Pinned".into(),
            id: Some(owner.id()),
        };
        send(&ep, Some(&sender), msg).unwrap();
        assert_eq!(owner.queued_messages(), 1);
    }

    #[test]
    fn broadcast_bloom_must_match_bus_geometry() {
        let (_bus, ep) = bus();
        let a = conn(&ep);

        let wrong = Message::broadcast(1, vec![0; 16], b"x");
        assert_eq!(send(&ep, Some(&a), wrong), Err(Error::InvalidArgument));

        let right = Message::broadcast(2, vec![0; 8], b"x");
        send(&ep, Some(&a), right).unwrap();
    }

    #[test]
    fn expect_reply_requires_cookie_and_deadline() {
        let (_bus, ep) = bus();
        let a = conn(&ep);
        let b = conn(&ep);

        let mut msg = Message::to_id(b.id(), 0, b"x");
        msg.flags = MessageFlags::EXPECT_REPLY;
        assert_eq!(send(&ep, Some(&a), msg), Err(Error::InvalidArgument));

        let mut msg = Message::to_id(b.id(), 7, b"x");
        msg.flags = MessageFlags::EXPECT_REPLY;
        msg.timeout_ns = deadline_after(std::time::Duration::from_secs(1));
        send(&ep, Some(&a), msg).unwrap();
        assert_eq!(b.queued_messages(), 1);
    }

    #[test]
    fn unsolicited_reply_cookie_falls_back_to_policy() {
        let (_bus, ep) = bus();
        let a = conn(&ep);
        let b = conn(&ep);

        // nobody armed a tracker for this cookie; the creator-uid sender
        // still passes through the implicit policy
        let mut msg = Message::to_id(b.id(), 1, b"x");
        msg.cookie_reply = 1234;
        send(&ep, Some(&a), msg).unwrap();
        assert_eq!(b.queued_messages(), 1);
    }
}
