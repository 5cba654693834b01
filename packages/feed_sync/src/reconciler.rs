//! Stream reconciler: one ordered, deduplicated collection fed by two producers.
//!
//! Live events are pushed at the front in arrival order. History events land
//! behind them, in the history section, ordered by `created_at` newest first;
//! equal timestamps keep page order. Older pages therefore append at the back
//! and a refetched page 1 puts its new events ahead of older pages. Identity is
//! the only dedup key: whichever producer delivers an id first wins, and every
//! later copy is discarded no matter which side it comes from.

use std::collections::{HashSet, VecDeque};
use tracing::trace;

use crate::event::{Event, EventId, FeedKind};
use crate::key::FeedKey;

/// Which live events a feed keeps.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedFilter {
    pub kind: FeedKind,
    /// For direct feeds, the other participant; events not involving them are
    /// someone else's conversation arriving on the shared chat socket.
    pub counterpart: Option<String>,
}

impl FeedFilter {
    pub fn for_key(key: &FeedKey) -> Self {
        Self {
            kind: key.kind(),
            counterpart: key.counterpart_id.clone(),
        }
    }

    pub fn kind(kind: FeedKind) -> Self {
        Self {
            kind,
            counterpart: None,
        }
    }

    pub fn accepts(&self, event: &Event) -> bool {
        if !self.kind.accepts(event.kind) {
            return false;
        }
        match &self.counterpart {
            Some(other) => event.involves(other),
            None => true,
        }
    }
}

/// What a merge did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.inserted > 0
    }
}

#[derive(Debug)]
pub struct Reconciler {
    filter: FeedFilter,
    events: VecDeque<Event>,
    ids: HashSet<EventId>,
    /// Events at the front that arrived live; history starts after them.
    live_len: usize,
}

impl Reconciler {
    pub fn new(filter: FeedFilter) -> Self {
        Self {
            filter,
            events: VecDeque::new(),
            ids: HashSet::new(),
            live_len: 0,
        }
    }

    pub fn filter(&self) -> &FeedFilter {
        &self.filter
    }

    /// Merge a fetched page into the history section.
    ///
    /// The page is deduplicated against held events and against itself. New
    /// events are slotted by `created_at` among held history and never ahead
    /// of live events.
    pub fn merge_history_page(&mut self, page: impl IntoIterator<Item = Event>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for event in page {
            if self.ids.contains(&event.id) {
                outcome.duplicates += 1;
                continue;
            }
            let at = self.history_slot(&event);
            self.ids.insert(event.id.clone());
            self.events.insert(at, event);
            outcome.inserted += 1;
        }
        trace!(?outcome, held = self.events.len(), "merged history page");
        outcome
    }

    /// Insert one live event at the front unless its kind is wrong or its id is held.
    pub fn merge_live_event(&mut self, event: Event) -> MergeOutcome {
        if !self.filter.accepts(&event) {
            trace!(id = %event.id, kind = ?event.kind, "discarding live event for another feed");
            return MergeOutcome {
                rejected: 1,
                ..Default::default()
            };
        }
        if self.ids.contains(&event.id) {
            trace!(id = %event.id, "discarding duplicate live event");
            return MergeOutcome {
                duplicates: 1,
                ..Default::default()
            };
        }
        self.ids.insert(event.id.clone());
        self.events.push_front(event);
        self.live_len += 1;
        MergeOutcome {
            inserted: 1,
            ..Default::default()
        }
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, index: usize) -> Option<&Event> {
        self.events.get(index)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Held events, most recent first.
    pub fn events(&self) -> impl ExactSizeIterator<Item = &Event> + '_ {
        self.events.iter()
    }

    pub fn to_vec(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }

    /// Index after the last history event at least as recent as `event`.
    fn history_slot(&self, event: &Event) -> usize {
        // Scanned from the back: older pages usually belong there.
        (self.live_len..self.events.len())
            .rev()
            .find(|&i| self.events[i].created_at >= event.created_at)
            .map_or(self.live_len, |i| i + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{chat_event, direct_event};

    fn ids(reconciler: &Reconciler) -> Vec<&str> {
        reconciler.events().map(|e| e.id.as_str()).collect()
    }

    fn help_feed() -> Reconciler {
        Reconciler::new(FeedFilter::kind(FeedKind::Help))
    }

    // ── ordering ────────────────────────────────────────────────────────

    #[test]
    fn pages_append_and_live_prepends() {
        let mut r = help_feed();
        r.merge_history_page(vec![chat_event("e5", 5), chat_event("e4", 4)]);
        r.merge_live_event(chat_event("e6", 6));
        r.merge_history_page(vec![chat_event("e3", 3), chat_event("e2", 2)]);
        r.merge_history_page(vec![chat_event("e1", 1)]);
        assert_eq!(ids(&r), vec!["e6", "e5", "e4", "e3", "e2", "e1"]);
    }

    #[test]
    fn live_events_stack_newest_first() {
        let mut r = help_feed();
        r.merge_history_page(vec![chat_event("h1", 10)]);
        r.merge_live_event(chat_event("l1", 11));
        r.merge_live_event(chat_event("l2", 11));
        assert_eq!(ids(&r), vec!["l2", "l1", "h1"]);
    }

    #[test]
    fn refetched_first_page_lands_ahead_of_older_pages() {
        let mut r = help_feed();
        r.merge_history_page(vec![chat_event("e4", 4), chat_event("e3", 3)]);
        r.merge_history_page(vec![chat_event("e2", 2), chat_event("e1", 1)]);
        r.merge_live_event(chat_event("l1", 9));

        let outcome = r.merge_history_page(vec![
            chat_event("e6", 6),
            chat_event("e5", 5),
            chat_event("e4", 4),
        ]);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(ids(&r), vec!["l1", "e6", "e5", "e4", "e3", "e2", "e1"]);
    }

    #[test]
    fn shifted_page_boundary_fills_in_place() {
        let mut r = help_feed();
        r.merge_history_page(vec![chat_event("e5", 5), chat_event("e3", 3)]);
        r.merge_history_page(vec![chat_event("e2", 2)]);
        r.merge_history_page(vec![chat_event("e5", 5), chat_event("e4", 4)]);
        assert_eq!(ids(&r), vec!["e5", "e4", "e3", "e2"]);
    }

    #[test]
    fn first_page_refetch_across_a_gap() {
        let mut r = help_feed();
        r.merge_history_page(vec![chat_event("e2", 2), chat_event("e1", 1)]);
        // Nothing in the refetched page is held yet.
        r.merge_history_page(vec![chat_event("e9", 9), chat_event("e8", 8)]);
        assert_eq!(ids(&r), vec!["e9", "e8", "e2", "e1"]);
    }

    #[test]
    fn history_never_moves_ahead_of_live_events() {
        let mut r = help_feed();
        r.merge_live_event(chat_event("l1", 1));
        r.merge_history_page(vec![chat_event("h5", 5)]);
        assert_eq!(ids(&r), vec!["l1", "h5"]);
    }

    #[test]
    fn empty_page_is_a_no_op() {
        let mut r = help_feed();
        r.merge_history_page(vec![chat_event("a", 1)]);
        let outcome = r.merge_history_page(Vec::new());
        assert_eq!(outcome, MergeOutcome::default());
        assert!(!outcome.changed());
        assert_eq!(r.len(), 1);
    }

    // ── dedup ───────────────────────────────────────────────────────────

    #[test]
    fn live_then_history_keeps_one_copy() {
        let mut r = help_feed();
        r.merge_live_event(chat_event("m1", 1));
        let outcome = r.merge_history_page(vec![chat_event("m1", 1), chat_event("m0", 0)]);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(ids(&r), vec!["m1", "m0"]);
    }

    #[test]
    fn history_then_live_keeps_one_copy() {
        let mut r = help_feed();
        r.merge_history_page(vec![chat_event("m1", 1)]);
        let outcome = r.merge_live_event(chat_event("m1", 1));
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn page_refetch_is_deduplicated() {
        let mut r = help_feed();
        r.merge_history_page(vec![chat_event("b", 2), chat_event("a", 1)]);
        r.merge_live_event(chat_event("c", 3));
        // Invalidation re-fetches page 1, which now contains the live event.
        let outcome = r.merge_history_page(vec![chat_event("c", 3), chat_event("b", 2)]);
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(ids(&r), vec!["c", "b", "a"]);
    }

    #[test]
    fn duplicate_inside_one_page() {
        let mut r = help_feed();
        let outcome = r.merge_history_page(vec![chat_event("x", 1), chat_event("x", 1)]);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 1);
    }

    #[test]
    fn duplicate_with_updated_fields_is_dropped() {
        let mut r = help_feed();
        r.merge_history_page(vec![chat_event("m1", 1)]);
        let mut seen_copy = chat_event("m1", 1);
        seen_copy.seen = true;
        r.merge_live_event(seen_copy);
        assert!(!r.get(0).unwrap().seen);
    }

    // ── filtering ───────────────────────────────────────────────────────

    #[test]
    fn wrong_kind_rejected_before_dedup() {
        let mut r = Reconciler::new(FeedFilter::kind(FeedKind::Direct));
        let outcome = r.merge_live_event(chat_event("h", 1));
        assert_eq!(outcome.rejected, 1);
        assert!(!r.contains(&"h".into()));
    }

    #[test]
    fn help_feed_keeps_replies() {
        let mut r = help_feed();
        let mut reply = chat_event("r1", 1);
        reply.kind = FeedKind::Reply;
        assert_eq!(r.merge_live_event(reply).inserted, 1);
    }

    #[test]
    fn direct_feed_ignores_other_conversations() {
        let key = FeedKey::direct_chat("me", "alice");
        let mut r = Reconciler::new(FeedFilter::for_key(&key));
        assert_eq!(r.merge_live_event(direct_event("1", "alice", "me", 1)).inserted, 1);
        assert_eq!(r.merge_live_event(direct_event("2", "me", "alice", 2)).inserted, 1);
        assert_eq!(r.merge_live_event(direct_event("3", "bob", "me", 3)).rejected, 1);
        assert_eq!(ids(&r), vec!["2", "1"]);
    }
}
