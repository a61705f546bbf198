//! Quorum Elector
//!
//! Runs one round of a `StoreOp` against every configured store:
//! - every store is called concurrently on its own task
//! - each call is bounded by the per-store timeout
//! - errors and timeouts are abstentions, they never abort the round
//! - the round ends when every store has answered or timed out
//!
//! A candidate wins only with a strict majority of the *configured* store
//! count, so abstentions count against everyone.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::{ElectionError, StoreError};
use crate::store::{LeaseStore, StoreAnswer, StoreOp};

/// `count` is a strict majority of `configured`.
pub fn has_majority(count: usize, configured: usize) -> bool {
    count > configured / 2
}

/// Count how many stores named each holder.
pub fn tally<'a, I>(holders: I) -> HashMap<String, usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut votes = HashMap::new();
    for holder in holders {
        *votes.entry(holder.to_string()).or_insert(0) += 1;
    }
    votes
}

/// The single holder with a strict majority, if any.
pub fn majority_winner(votes: &HashMap<String, usize>, configured: usize) -> Option<&str> {
    votes
        .iter()
        .find(|(_, count)| has_majority(**count, configured))
        .map(|(holder, _)| holder.as_str())
}

/// Aggregate of one round. Never leaves the facade.
#[derive(Debug, Clone, Default)]
pub struct RoundOutcome {
    pub configured: usize,
    pub votes: HashMap<String, usize>,
    /// Stores that answered "no holder".
    pub vacant: usize,
    /// Stores that confirmed a release.
    pub released: usize,
    /// Stores that answered a release with "not held by you".
    pub declined: usize,
    pub errors: Vec<(String, StoreError)>,
}

impl RoundOutcome {
    pub fn from_answers<I>(configured: usize, answers: I) -> Self
    where
        I: IntoIterator<Item = (String, Result<StoreAnswer, StoreError>)>,
    {
        let mut outcome = RoundOutcome {
            configured,
            ..Default::default()
        };
        let mut holders = Vec::new();
        for (store, answer) in answers {
            match answer {
                Ok(StoreAnswer::Holder(Some(holder))) => holders.push(holder),
                Ok(StoreAnswer::Holder(None)) => outcome.vacant += 1,
                Ok(StoreAnswer::Released(true)) => outcome.released += 1,
                Ok(StoreAnswer::Released(false)) => outcome.declined += 1,
                Err(e) => outcome.errors.push((store, e)),
            }
        }
        outcome.votes = tally(holders.iter().map(String::as_str));
        outcome
    }

    pub fn responded(&self) -> usize {
        self.configured.saturating_sub(self.errors.len())
    }

    pub fn winner(&self) -> Option<&str> {
        majority_winner(&self.votes, self.configured)
    }

    /// A majority of stores say nobody holds the key.
    pub fn vacancy_confirmed(&self) -> bool {
        has_majority(self.vacant, self.configured)
    }

    pub fn release_confirmed(&self) -> bool {
        has_majority(self.released, self.configured)
    }

    /// Enough stores answered to trust a negative result.
    pub fn quorum_answered(&self) -> bool {
        has_majority(self.responded(), self.configured)
    }

    /// Largest number of votes any single holder received.
    pub fn best(&self) -> usize {
        self.votes.values().copied().max().unwrap_or(0)
    }

    pub fn no_quorum(&self, resource: &str) -> ElectionError {
        ElectionError::NoQuorum {
            resource: resource.to_string(),
            configured: self.configured,
            responded: self.responded(),
            best: self.best(),
        }
    }
}

/// Fans one operation out to every store and tallies the answers.
#[derive(Debug, Clone)]
pub struct QuorumElector {
    stores: Vec<Arc<dyn LeaseStore>>,
    timeout: Duration,
}

impl QuorumElector {
    pub fn new(stores: Vec<Arc<dyn LeaseStore>>, timeout: Duration) -> Result<Self, ElectionError> {
        if stores.is_empty() {
            return Err(ElectionError::config("at least one lease store must be configured"));
        }
        if timeout.is_zero() {
            return Err(ElectionError::config("store timeout must be greater than zero"));
        }
        Ok(Self { stores, timeout })
    }

    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    /// Run `op` against every store and wait for all of them.
    ///
    /// Each store call runs on its own task, so a caller that abandons the
    /// round does not cancel calls already sent to the stores.
    pub async fn run_round(&self, op: &StoreOp) -> RoundOutcome {
        let span = info_span!("round", resource = op.resource(), op = op.kind());
        let timeout = self.timeout;

        let calls = self.stores.iter().map(|store| {
            let store = Arc::clone(store);
            let op = op.clone();
            let name = store.name().to_string();
            let handle = tokio::spawn(
                async move {
                    match tokio::time::timeout(timeout, op.apply(store.as_ref())).await {
                        Ok(answer) => answer,
                        Err(_) => Err(StoreError::Timeout(timeout)),
                    }
                }
                .instrument(span.clone()),
            );
            async move {
                let answer = handle
                    .await
                    .unwrap_or_else(|e| Err(StoreError::Unavailable(format!("store task failed: {}", e))));
                (name, answer)
            }
        });

        let answers = join_all(calls).await;
        let _enter = span.enter();
        for (store, answer) in &answers {
            match answer {
                Ok(answer) => debug!(store = %store, ?answer, "store answered"),
                Err(e) => warn!(store = %store, error = %e, "store abstained"),
            }
        }

        let outcome = RoundOutcome::from_answers(self.stores.len(), answers);
        debug!(
            votes = ?outcome.votes,
            vacant = outcome.vacant,
            released = outcome.released,
            abstained = outcome.errors.len(),
            "round complete"
        );
        outcome
    }
}
