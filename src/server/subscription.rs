//! Subscription bookkeeping.
//!
//! Subscriptions are keyed by `(client, selector)` and carry an active range
//! `[eff_from, eff_until)` of publish sequence numbers. Unsubscribing closes
//! the range rather than deleting the entry, so a publication admitted later
//! with a publish_seq inside the range still matches, while one at or past
//! the close point does not. Re-subscribing reopens the range.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::{ClientId, Selector, SeqNum};

#[derive(Clone, Copy, Debug)]
struct ActiveRange {
    eff_from: SeqNum,
    eff_until: Option<SeqNum>,
}

impl ActiveRange {
    fn contains(&self, publish_seq: SeqNum) -> bool {
        if publish_seq < self.eff_from {
            return false;
        }
        match self.eff_until {
            Some(until) => publish_seq < until,
            None => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: BTreeMap<(ClientId, Selector), ActiveRange>,
}

impl SubscriptionTable {
    pub fn new() -> SubscriptionTable {
        SubscriptionTable::default()
    }

    /// Enroll or reopen a subscription effective from `eff`.
    pub fn subscribe(&mut self, client: ClientId, selector: Selector, eff: SeqNum) {
        self.entries.insert(
            (client, selector),
            ActiveRange {
                eff_from: eff,
                eff_until: None,
            },
        );
    }

    /// Close the subscription's active range at `eff`. Unknown subscriptions
    /// are a no-op.
    pub fn unsubscribe(&mut self, client: ClientId, selector: &Selector, eff: SeqNum) {
        if let Some(range) = self.entries.get_mut(&(client, selector.clone())) {
            range.eff_until = Some(eff);
        }
    }

    /// Resolve the recipients of a publication on `channel` at `publish_seq`:
    /// the union of matching channel-specific and wildcard subscribers whose
    /// range contains `publish_seq`. Sorted ascending by client id.
    pub fn matches(&self, channel: &str, publish_seq: SeqNum) -> BTreeSet<ClientId> {
        self.entries
            .iter()
            .filter(|((_, selector), range)| {
                selector.matches(channel) && range.contains(publish_seq)
            })
            .map(|((client, _), _)| *client)
            .collect()
    }

    pub fn remove_client(&mut self, client: ClientId) {
        self.entries.retain(|(owner, _), _| *owner != client);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(v: f64) -> SeqNum {
        SeqNum::new(v).unwrap()
    }

    fn id(raw: u32) -> ClientId {
        ClientId::new(raw)
    }

    #[test]
    fn channel_and_wildcard_union_dedupes() {
        let mut table = SubscriptionTable::new();
        table.subscribe(id(1), Selector::Channel("x".to_string()), seq(0.0));
        table.subscribe(id(1), Selector::All, seq(0.0));
        table.subscribe(id(2), Selector::Channel("y".to_string()), seq(0.0));

        let recipients = table.matches("x", seq(1.0));
        assert_eq!(recipients.into_iter().collect::<Vec<_>>(), vec![id(1)]);
    }

    #[test]
    fn effective_from_gates_matching() {
        let mut table = SubscriptionTable::new();
        table.subscribe(id(1), Selector::Channel("x".to_string()), seq(5.0));
        assert!(table.matches("x", seq(4.0)).is_empty());
        assert!(!table.matches("x", seq(5.0)).is_empty());
    }

    #[test]
    fn unsubscribe_closes_the_range() {
        let mut table = SubscriptionTable::new();
        table.subscribe(id(1), Selector::Channel("x".to_string()), seq(0.0));
        table.unsubscribe(id(1), &Selector::Channel("x".to_string()), seq(3.0));

        // Publications inside the range still match; at or past the close
        // point they do not.
        assert!(!table.matches("x", seq(2.0)).is_empty());
        assert!(table.matches("x", seq(3.0)).is_empty());
    }

    #[test]
    fn resubscribe_reopens() {
        let mut table = SubscriptionTable::new();
        table.subscribe(id(1), Selector::All, seq(0.0));
        table.unsubscribe(id(1), &Selector::All, seq(2.0));
        table.subscribe(id(1), Selector::All, seq(4.0));
        assert!(table.matches("x", seq(3.0)).is_empty());
        assert!(!table.matches("x", seq(4.0)).is_empty());
    }

    #[test]
    fn remove_client_drops_all_entries() {
        let mut table = SubscriptionTable::new();
        table.subscribe(id(1), Selector::All, seq(0.0));
        table.subscribe(id(1), Selector::Channel("x".to_string()), seq(0.0));
        table.subscribe(id(2), Selector::All, seq(0.0));
        table.remove_client(id(1));
        assert_eq!(table.len(), 1);
        assert!(table.matches("x", seq(1.0)).contains(&id(2)));
    }
}
