// src/match_db.rs

//! Per-connection subscription rules for broadcasts and kernel
//! notifications.
//!
//! A rule is a conjunction: every item must hold for the rule to match.
//! Evaluation takes a read lock and short-circuits on the first matching
//! rule. Rules are keyed by a caller-chosen cookie for removal.

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::item::ItemKind;
use crate::message::Envelope;
use crate::types::ConnectionId;

/// Kernel notification classes a rule can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyMatch {
    IdAdd,
    IdRemove,
    NameAdd,
    NameRemove,
    NameChange,
    ReplyTimeout,
    ReplyDead,
}

impl NotifyMatch {
    pub(crate) fn for_kind(kind: ItemKind) -> Option<Self> {
        Some(match kind {
            ItemKind::IdAdd => NotifyMatch::IdAdd,
            ItemKind::IdRemove => NotifyMatch::IdRemove,
            ItemKind::NameAdd => NotifyMatch::NameAdd,
            ItemKind::NameRemove => NotifyMatch::NameRemove,
            ItemKind::NameChange => NotifyMatch::NameChange,
            ItemKind::ReplyTimeout => NotifyMatch::ReplyTimeout,
            ItemKind::ReplyDead => NotifyMatch::ReplyDead,
            _ => return None,
        })
    }
}

/// One conjunct of a match rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchItem {
    /// Sender addressed by unique id.
    SenderId(ConnectionId),
    /// Sender currently owning this well-known name.
    SenderName(String),
    /// `(filter AND mask) == mask` over the message's bloom filter.
    BloomMask(Vec<u8>),
    /// Kernel notification of the given class. Bloom and sender items do
    /// not apply to kernel messages.
    Kernel(NotifyMatch),
}

/// A subscription rule.
#[derive(Clone, Debug)]
pub struct MatchRule {
    pub cookie: u64,
    pub items: Vec<MatchItem>,
}

/// The per-connection rule set.
pub struct MatchDb {
    rules: RwLock<Vec<MatchRule>>,
}

/// How the evaluator sees the sender; keeps this module independent of the
/// connection type.
pub(crate) trait SenderView {
    fn id(&self) -> ConnectionId;
    fn owns_name(&self, name: &str) -> bool;
}

impl MatchDb {
    pub fn new() -> Self {
        MatchDb { rules: RwLock::new(Vec::new()) }
    }

    /// Install a rule. Rules with an empty item list match every message.
    pub fn add(&self, rule: MatchRule) -> Result<()> {
        for item in &rule.items {
            if let MatchItem::SenderName(name) = item {
                if !crate::util::name_is_valid(name, false) {
                    return Err(Error::InvalidArgument);
                }
            }
        }
        self.rules.write().push(rule);
        Ok(())
    }

    /// Drop every rule registered under `cookie`.
    pub fn remove(&self, cookie: u64) -> Result<()> {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.cookie != cookie);
        if rules.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Does any rule accept this message from this sender?
    pub(crate) fn matches(&self, src: Option<&dyn SenderView>, env: &Envelope) -> bool {
        let rules = self.rules.read();
        rules.iter().any(|rule| Self::rule_matches(rule, src, env))
    }

    fn rule_matches(rule: &MatchRule, src: Option<&dyn SenderView>, env: &Envelope) -> bool {
        let notify = env.notify_kind.and_then(NotifyMatch::for_kind);

        // kernel notifications only match rules that subscribed to that
        // notification class; sender and bloom items never apply to them
        if let Some(kind) = notify {
            return rule
                .items
                .iter()
                .any(|item| matches!(item, MatchItem::Kernel(k) if *k == kind));
        }

        rule.items.iter().all(|item| match item {
            MatchItem::Kernel(_) => false,
            MatchItem::SenderId(id) => src.map(|s| s.id()) == Some(*id),
            MatchItem::SenderName(name) => src.is_some_and(|s| s.owns_name(name)),
            MatchItem::BloomMask(mask) => match env.msg.bloom_filter() {
                Some(filter) => {
                    filter.len() == mask.len()
                        && filter.iter().zip(mask).all(|(f, m)| f & m == *m)
                }
                None => false,
            },
        })
    }
}

impl Default for MatchDb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;
    use crate::message::Message;

    struct FakeSender {
        id: ConnectionId,
        names: Vec<String>,
    }

    impl SenderView for FakeSender {
        fn id(&self) -> ConnectionId {
            self.id
        }
        fn owns_name(&self, name: &str) -> bool {
            self.names.iter().any(|n| n == name)
        }
    }

    fn broadcast_env(bloom: Vec<u8>) -> Envelope {
        Envelope::new(
            Some(ConnectionId::new(1)),
            Message::broadcast(1, bloom, b"x"),
        )
    }

    fn sender(id: u64, names: &[&str]) -> FakeSender {
        FakeSender {
            id: ConnectionId::new(id),
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn empty_rule_matches_everything() {
        let db = MatchDb::new();
        db.add(MatchRule { cookie: 1, items: vec![] }).unwrap();
        let src = sender(1, &[]);
        assert!(db.matches(Some(&src), &broadcast_env(vec![0; 8])));
    }

    #[test]
    fn bloom_mask_is_subset_test() {
        let db = MatchDb::new();
        db.add(MatchRule {
            cookie: 1,
            items: vec![MatchItem::BloomMask(vec![0b0011, 0, 0, 0, 0, 0, 0, 0])],
        })
        .unwrap();
        let src = sender(1, &[]);

        let hit = broadcast_env(vec![0b0111, 0, 0, 0, 0, 0, 0, 0]);
        assert!(db.matches(Some(&src), &hit));

        let miss = broadcast_env(vec![0b0001, 0, 0, 0, 0, 0, 0, 0]);
        assert!(!db.matches(Some(&src), &miss));
    }

    #[test]
    fn sender_id_and_name_conjunction() {
        let db = MatchDb::new();
        db.add(MatchRule {
            cookie: 1,
            items: vec![
                MatchItem::SenderId(ConnectionId::new(4)),
                MatchItem::SenderName("com.example.Svc".into()),
            ],
        })
        .unwrap();

        let right = sender(4, &["com.example.Svc"]);
        let wrong_id = sender(5, &["com.example.Svc"]);
        let nameless = sender(4, &[]);
        let env = broadcast_env(vec![0; 8]);

        assert!(db.matches(Some(&right), &env));
        assert!(!db.matches(Some(&wrong_id), &env));
        assert!(!db.matches(Some(&nameless), &env));
    }

    #[test]
    fn kernel_rules_ignore_bloom() {
        let db = MatchDb::new();
        db.add(MatchRule {
            cookie: 1,
            items: vec![MatchItem::Kernel(NotifyMatch::IdAdd)],
        })
        .unwrap();

        let mut env = Envelope::new(
            None,
            Message {
                dst: crate::message::Destination::Broadcast,
                flags: crate::message::MessageFlags::empty(),
                priority: 0,
                cookie: 0,
                cookie_reply: 0,
                timeout_ns: 0,
                items: vec![Item::IdAdd(crate::item::IdFlags { id: 9, flags: 0 })],
            },
        );
        env.notify_kind = Some(ItemKind::IdAdd);

        assert!(db.matches(None, &env));
        env.notify_kind = Some(ItemKind::IdRemove);
        assert!(!db.matches(None, &env));
    }

    #[test]
    fn adding_unrelated_rules_keeps_existing_matches() {
        let db = MatchDb::new();
        db.add(MatchRule {
            cookie: 1,
            items: vec![MatchItem::BloomMask(vec![1, 0, 0, 0, 0, 0, 0, 0])],
        })
        .unwrap();
        let src = sender(1, &[]);
        let env = broadcast_env(vec![1, 0, 0, 0, 0, 0, 0, 0]);
        assert!(db.matches(Some(&src), &env));

        db.add(MatchRule {
            cookie: 2,
            items: vec![MatchItem::SenderId(ConnectionId::new(77))],
        })
        .unwrap();
        assert!(db.matches(Some(&src), &env));
    }

    #[test]
    fn remove_by_cookie() {
        let db = MatchDb::new();
        db.add(MatchRule { cookie: 5, items: vec![] }).unwrap();
        db.add(MatchRule { cookie: 5, items: vec![] }).unwrap();
        assert_eq!(db.rule_count(), 2);
        db.remove(5).unwrap();
        assert_eq!(db.rule_count(), 0);
        assert_eq!(db.remove(5), Err(Error::NotFound));
    }
}
