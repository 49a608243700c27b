// src/notify.rs

//! Kernel-origin notifications.
//!
//! The broker synthesizes `ID_ADD`/`ID_REMOVE`, `NAME_ADD`/`NAME_REMOVE`/
//! `NAME_CHANGE`, `REPLY_TIMEOUT` and `REPLY_DEAD` messages. They are
//! queued on the bus and flushed at well-defined points (after send,
//! receive and disconnect) so notification delivery never re-enters the
//! path that produced it.

use tracing::debug;

use crate::bus::Bus;
use crate::item::{IdFlags, Item, ItemKind};
use crate::message::{Destination, Envelope, Message, MessageFlags};
use crate::types::ConnectionId;

impl Bus {
    fn queue_notification(&self, dst: Destination, kind: ItemKind, item: Item) {
        let msg = Message {
            dst,
            flags: MessageFlags::empty(),
            priority: 0,
            cookie: 0,
            cookie_reply: 0,
            timeout_ns: 0,
            items: vec![item],
        };
        let mut env = Envelope::new(None, msg);
        env.notify_kind = Some(kind);
        self.notify_queue.lock().push(env);
    }

    /// A connection appeared on the bus.
    pub(crate) fn notify_id_add(&self, id: ConnectionId, flags: u64) {
        self.queue_notification(
            Destination::Broadcast,
            ItemKind::IdAdd,
            Item::IdAdd(IdFlags { id: id.get(), flags }),
        );
    }

    /// A connection left the bus.
    pub(crate) fn notify_id_remove(&self, id: ConnectionId, flags: u64) {
        self.queue_notification(
            Destination::Broadcast,
            ItemKind::IdRemove,
            Item::IdRemove(IdFlags { id: id.get(), flags }),
        );
    }

    pub(crate) fn notify_name_add(&self, new: IdFlags, name: &str) {
        self.queue_notification(
            Destination::Broadcast,
            ItemKind::NameAdd,
            Item::NameAdd { new, name: name.to_owned() },
        );
    }

    pub(crate) fn notify_name_remove(&self, old: IdFlags, name: &str) {
        self.queue_notification(
            Destination::Broadcast,
            ItemKind::NameRemove,
            Item::NameRemove { old, name: name.to_owned() },
        );
    }

    pub(crate) fn notify_name_change(&self, old: IdFlags, new: IdFlags, name: &str) {
        self.queue_notification(
            Destination::Broadcast,
            ItemKind::NameChange,
            Item::NameChange { old, new, name: name.to_owned() },
        );
    }

    /// Tell `dst` that its request under `cookie` expired unanswered.
    pub(crate) fn notify_reply_timeout(&self, dst: ConnectionId, cookie: u64) {
        let msg = Message {
            dst: Destination::Id(dst),
            flags: MessageFlags::empty(),
            priority: 0,
            cookie: 0,
            cookie_reply: cookie,
            timeout_ns: 0,
            items: vec![Item::ReplyTimeout],
        };
        let mut env = Envelope::new(None, msg);
        env.notify_kind = Some(ItemKind::ReplyTimeout);
        self.notify_queue.lock().push(env);
    }

    /// Tell `dst` that the reply it was promised under `cookie` can never
    /// arrive.
    pub(crate) fn notify_reply_dead(&self, dst: ConnectionId, cookie: u64) {
        let msg = Message {
            dst: Destination::Id(dst),
            flags: MessageFlags::empty(),
            priority: 0,
            cookie: 0,
            cookie_reply: cookie,
            timeout_ns: 0,
            items: vec![Item::ReplyDead],
        };
        let mut env = Envelope::new(None, msg);
        env.notify_kind = Some(ItemKind::ReplyDead);
        self.notify_queue.lock().push(env);
    }

    /// Flush queued notifications through the regular send pipeline.
    ///
    /// Failures are logged and dropped; a notification never fails the
    /// operation that triggered it.
    pub(crate) fn flush_notifications(&self) {
        let Some(ep) = self.state_default_ep() else { return };
        let _flush = self.notify_flush.lock();
        loop {
            let mut batch = {
                let mut queue = self.notify_queue.lock();
                std::mem::take(&mut *queue)
            };
            if batch.is_empty() {
                break;
            }
            for env in batch.iter_mut() {
                if let Err(e) = crate::send::send_envelope(&ep, None, env) {
                    debug!(error = %e, kind = ?env.notify_kind, "notification dropped");
                }
            }
        }
    }

    /// Flush unless the caller is itself the flush path.
    pub(crate) fn flush_notifications_if(&self, condition: bool) {
        if condition {
            self.flush_notifications();
        }
    }

    fn state_default_ep(&self) -> Option<std::sync::Arc<crate::endpoint::Endpoint>> {
        self.default_endpoint().ok()
    }
}
