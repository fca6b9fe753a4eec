//! Append only scoring ledger and the derived leaderboard.
//!
//! Every event is stored under `<user len>:<user>/<nanos>/<event id>` so a prefix scan
//! returns one user's history in order, whatever characters the user id contains. Aggregates live in a single leaderboard record, rewritten
//! and re-ranked together with each appended event.
use std::sync::Arc;

use chrono::Utc;
use sled::Transactional;
use sled::transaction::TransactionalTree;
use tracing::{debug, info};

use crate::error::{Result, WorkflowError};
use crate::policy::{Action, Resource, authorize};
use crate::store::{self, Store, TxResult, tx_load, tx_save};
use crate::types::{Actor, Outcome, TimeStamp};
use crate::utils::{EVENT_HRP, new_id};

const LEADERBOARD_KEY: &str = "ranking";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ScoringEvent {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub user_id: String,
    #[n(2)]
    pub order_id: String,
    #[n(3)]
    pub action: Outcome,
    #[n(4)]
    pub points: i64,
    #[n(5)]
    pub description: String,
    #[n(6)]
    pub recorded_at: TimeStamp<Utc>,
}

impl ScoringEvent {
    pub fn new(
        user_id: &str,
        order_id: &str,
        action: Outcome,
        points: i64,
        description: &str,
    ) -> Result<Self> {
        Ok(Self {
            id: new_id(EVENT_HRP)?,
            user_id: user_id.to_string(),
            order_id: order_id.to_string(),
            action,
            points,
            description: description.to_string(),
            recorded_at: TimeStamp::new(),
        })
    }

    fn key(&self) -> String {
        let nanos = self
            .recorded_at
            .to_datetime_utc()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        format!("{}{:020}/{}", user_prefix(&self.user_id), nanos, self.id)
    }
}

// the length keeps "a" from matching the keys of "a/b"
fn user_prefix(user_id: &str) -> String {
    format!("{:04}:{user_id}/", user_id.len())
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct UserScore {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub total: i64,
    #[n(2)]
    pub correct: u32,
    #[n(3)]
    pub incorrect: u32,
    #[n(4)]
    pub rank: u32,
}

impl UserScore {
    fn zero(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            total: 0,
            correct: 0,
            incorrect: 0,
            rank: 0,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Default, PartialEq, Eq)]
pub struct Leaderboard {
    #[n(0)]
    pub entries: Vec<UserScore>,
}

impl Leaderboard {
    /// Fold one event into the matching aggregate, creating it at zero if needed.
    pub fn apply(&mut self, event: &ScoringEvent) {
        let index = match self.entries.iter().position(|s| s.user_id == event.user_id) {
            Some(index) => index,
            None => {
                self.entries.push(UserScore::zero(&event.user_id));
                self.entries.len() - 1
            }
        };

        let score = &mut self.entries[index];
        score.total += event.points;
        match event.action {
            Outcome::Correct => score.correct += 1,
            Outcome::Incorrect => score.incorrect += 1,
        }
    }

    /// Sort by total then correct count, both descending, and assign ranks 1..=n.
    pub fn recompute_ranking(&mut self) {
        self.entries.sort_by(|a, b| {
            b.total
                .cmp(&a.total)
                .then(b.correct.cmp(&a.correct))
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        for (position, score) in self.entries.iter_mut().enumerate() {
            score.rank = position as u32 + 1;
        }
    }
}

/// Points awarded per outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringPolicy {
    pub correct_points: i64,
    pub incorrect_points: i64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            correct_points: 10,
            incorrect_points: -5,
        }
    }
}

impl ScoringPolicy {
    pub fn points_for(&self, outcome: Outcome) -> i64 {
        match outcome {
            Outcome::Correct => self.correct_points,
            Outcome::Incorrect => self.incorrect_points,
        }
    }
}

/// Append `event` and re-rank inside the caller's transaction.
pub(crate) fn record_in_tx(
    events: &TransactionalTree,
    leaderboard: &TransactionalTree,
    event: &ScoringEvent,
) -> TxResult<()> {
    let key = event.key();
    if events.get(key.as_str())?.is_some() {
        return Err(WorkflowError::Conflict(format!("scoring event {} already recorded", event.id)).into());
    }
    tx_save(events, &key, event)?;

    let mut board: Leaderboard = tx_load(leaderboard, LEADERBOARD_KEY)?.unwrap_or_default();
    board.apply(event);
    board.recompute_ranking();
    tx_save(leaderboard, LEADERBOARD_KEY, &board)?;
    Ok(())
}

pub struct ScoringLedger {
    store: Arc<Store>,
}

impl ScoringLedger {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Manually record a point delta for a user.
    pub fn record_event(
        &self,
        actor: &Actor,
        user_id: &str,
        order_id: &str,
        action: Outcome,
        points: i64,
        description: &str,
    ) -> Result<ScoringEvent> {
        authorize(actor, Action::RecordScore, Resource::None)?;
        if user_id.trim().is_empty() {
            return Err(WorkflowError::field("user_id", "is required"));
        }

        let event = ScoringEvent::new(user_id, order_id, action, points, description)?;
        (&self.store.score_events, &self.store.leaderboard).transaction(
            |(events, leaderboard)| -> TxResult<()> { record_in_tx(events, leaderboard, &event) },
        )?;

        info!(user = user_id, order = order_id, points, ?action, "score recorded");
        Ok(event)
    }

    /// Ranked aggregates, best first.
    pub fn leaderboard(&self, actor: &Actor) -> Result<Vec<UserScore>> {
        authorize(actor, Action::Read, Resource::None)?;
        let board: Leaderboard =
            store::load(&self.store.leaderboard, LEADERBOARD_KEY)?.unwrap_or_default();
        Ok(board.entries)
    }

    pub fn score_for(&self, actor: &Actor, user_id: &str) -> Result<Option<UserScore>> {
        Ok(self
            .leaderboard(actor)?
            .into_iter()
            .find(|score| score.user_id == user_id))
    }

    /// A user's events, oldest first.
    pub fn events_for(&self, actor: &Actor, user_id: &str) -> Result<Vec<ScoringEvent>> {
        authorize(actor, Action::Read, Resource::None)?;

        let events = self
            .store
            .score_events
            .scan_prefix(user_prefix(user_id))
            .values()
            .map(|bytes| store::decode(&bytes?))
            .collect::<Result<Vec<ScoringEvent>>>()?;

        debug!(user = user_id, count = events.len(), "scoring events loaded");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(user: &str, action: Outcome, points: i64) -> ScoringEvent {
        ScoringEvent::new(user, "pd_1", action, points, "test").unwrap()
    }

    #[test]
    fn ranks_by_total_then_correct_count() {
        let mut board = Leaderboard::default();
        for e in [
            event("ana", Outcome::Correct, 10),
            event("bia", Outcome::Correct, 10),
            event("bia", Outcome::Incorrect, -5),
            event("bia", Outcome::Correct, 5),
            event("caio", Outcome::Incorrect, -5),
        ] {
            board.apply(&e);
            board.recompute_ranking();
        }

        let order: Vec<_> = board
            .entries
            .iter()
            .map(|s| (s.user_id.as_str(), s.total, s.rank))
            .collect();
        // ana and bia tie on 10 points, bia has two correct events
        assert_eq!(order, vec![("bia", 10, 1), ("ana", 10, 2), ("caio", -5, 3)]);
    }

    #[test]
    fn event_keys_do_not_share_user_prefixes() {
        let short = event("a", Outcome::Correct, 10);
        let long = event("a/b", Outcome::Correct, 10);

        assert!(short.key().starts_with(&user_prefix("a")));
        assert!(!long.key().starts_with(&user_prefix("a")));
        assert!(long.key().starts_with(&user_prefix("a/b")));
    }

    #[test]
    fn policy_points() {
        let policy = ScoringPolicy::default();
        assert_eq!(policy.points_for(Outcome::Correct), 10);
        assert_eq!(policy.points_for(Outcome::Incorrect), -5);
    }
}
