//! Leader Election Facade
//!
//! Public operations over a set of lease stores:
//! - `elect` acquires or renews leadership of a resource
//! - `get_leader` reports the quorum-confirmed holder
//! - `release` gives leadership up
//!
//! Leadership is only ever entered through a quorum-confirmed round and can
//! be lost silently by expiry, so callers re-elect periodically.

use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{ClockDrift, LeaseCache};
use crate::config::{ElectionConfig, MAX_TTL_MS};
use crate::elector::QuorumElector;
use crate::error::{ElectionError, Result};
use crate::store::{self, LeaseStore, StoreOp};

const CANDIDATE_ID_LEN: usize = 16;

/// Random alphanumeric candidate id.
pub fn generate_candidate_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(CANDIDATE_ID_LEN)
        .map(char::from)
        .collect()
}

#[derive(Debug)]
pub struct LeaderElection {
    elector: QuorumElector,
    cache: LeaseCache,
    candidate_id: String,
    default_ttl: Duration,
    drift: ClockDrift,
    read_cache: Duration,
}

impl LeaderElection {
    /// Connect every configured store and build the facade.
    pub fn from_config(config: &ElectionConfig) -> Result<Self> {
        config.validate()?;
        let stores = store::connect_all(&config.stores, config.key_prefix.as_deref(), config.store_timeout())?;
        Self::with_stores(stores, config)
    }

    /// Build the facade over stores created by the caller. `config.stores`
    /// is ignored.
    pub fn with_stores(stores: Vec<Arc<dyn LeaseStore>>, config: &ElectionConfig) -> Result<Self> {
        config.validate_timing()?;
        let elector = QuorumElector::new(stores, config.store_timeout())?;
        let candidate_id = config
            .candidate_id
            .clone()
            .unwrap_or_else(generate_candidate_id);

        debug!(
            "Leader election over {} stores as {}",
            elector.store_count(),
            candidate_id
        );
        Ok(Self {
            elector,
            cache: LeaseCache::new(),
            candidate_id,
            default_ttl: config.ttl(),
            drift: ClockDrift {
                factor: config.clock_drift_factor,
                floor: config.clock_drift_floor(),
            },
            read_cache: config.read_cache(),
        })
    }

    pub fn candidate_id(&self) -> &str {
        &self.candidate_id
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn store_count(&self) -> usize {
        self.elector.store_count()
    }

    /// Bind this facade's own id and default TTL to one resource.
    pub fn candidacy(self: &Arc<Self>, resource: impl Into<String>) -> Candidacy {
        Candidacy {
            election: Arc::clone(self),
            resource: resource.into(),
            candidate: self.candidate_id.clone(),
            ttl: self.default_ttl,
        }
    }

    /// Whether the local cache believes `candidate` currently holds `resource`.
    pub fn is_leader(&self, resource: &str, candidate: &str) -> bool {
        self.cache.holds(resource, candidate)
    }

    /// Try to make `candidate` the leader of `resource` for `ttl`.
    ///
    /// Returns the quorum-confirmed holder, which may be someone else.
    pub async fn elect(&self, resource: &str, candidate: &str, ttl: Duration) -> Result<String> {
        check_resource(resource)?;
        if candidate.is_empty() {
            return Err(ElectionError::config("candidate id must not be empty"));
        }
        if ttl.is_zero() {
            return Err(ElectionError::config("ttl must be greater than zero"));
        }
        if ttl > Duration::from_millis(MAX_TTL_MS) {
            return Err(ElectionError::config(format!(
                "ttl must not exceed {}ms",
                MAX_TTL_MS
            )));
        }

        let started = Instant::now();
        let renewing = self.cache.holds(resource, candidate);
        let op = if renewing {
            StoreOp::Renew {
                resource: resource.to_string(),
                candidate: candidate.to_string(),
                ttl,
            }
        } else {
            StoreOp::AcquireOrRenew {
                resource: resource.to_string(),
                candidate: candidate.to_string(),
                ttl,
            }
        };

        let outcome = self.elector.run_round(&op).await;
        let Some(winner) = outcome.winner().map(String::from) else {
            self.cache.remove(resource);
            warn!(
                "No quorum electing {} for {} ({}/{} stores answered)",
                candidate,
                resource,
                outcome.responded(),
                outcome.configured
            );
            return Err(outcome.no_quorum(resource));
        };

        match self.drift.validity(ttl, started.elapsed()) {
            Some(valid) if winner == candidate => self.cache.insert(resource, &winner, valid),
            // the winner's own renewal already set a longer expiry
            Some(_) if self.cache.holder(resource).as_deref() == Some(winner.as_str()) => {}
            // another holder's lease may be older than ours, trust it briefly
            Some(valid) => self.cache.insert(resource, &winner, valid.min(self.read_cache)),
            None => {
                self.cache.remove(resource);
            }
        }

        if winner == candidate && !renewing {
            info!("{} became leader of {}", candidate, resource);
        } else if winner != candidate && renewing {
            warn!("{} lost leadership of {} to {}", candidate, resource, winner);
        } else {
            debug!("Leader of {} is {}", resource, winner);
        }
        Ok(winner)
    }

    /// Quorum-confirmed holder of `resource`, `None` when a majority of
    /// stores report it vacant.
    pub async fn get_leader(&self, resource: &str) -> Result<Option<String>> {
        check_resource(resource)?;
        if let Some(holder) = self.cache.holder(resource) {
            debug!("Leader of {} is {} (cached)", resource, holder);
            return Ok(Some(holder));
        }

        let outcome = self
            .elector
            .run_round(&StoreOp::Read {
                resource: resource.to_string(),
            })
            .await;

        if let Some(winner) = outcome.winner() {
            if !self.read_cache.is_zero() {
                self.cache.insert(resource, winner, self.read_cache);
            }
            return Ok(Some(winner.to_string()));
        }
        if outcome.vacancy_confirmed() {
            debug!("No leader of {}", resource);
            return Ok(None);
        }
        warn!(
            "No quorum reading leader of {} ({}/{} stores answered)",
            resource,
            outcome.responded(),
            outcome.configured
        );
        Err(outcome.no_quorum(resource))
    }

    /// Give up leadership of `resource`.
    ///
    /// `Ok(true)` when a majority of stores deleted the lease, `Ok(false)`
    /// when a majority answered but did not recognise `candidate` as holder.
    /// The cached belief is dropped either way.
    pub async fn release(&self, resource: &str, candidate: &str) -> Result<bool> {
        check_resource(resource)?;
        if !self.cache.holds(resource, candidate) {
            debug!("Releasing {} for {} without a cached lease", resource, candidate);
        }

        let outcome = self
            .elector
            .run_round(&StoreOp::ReleaseIfHeld {
                resource: resource.to_string(),
                candidate: candidate.to_string(),
            })
            .await;
        self.cache.remove(resource);

        if outcome.release_confirmed() {
            info!("{} released leadership of {}", candidate, resource);
            Ok(true)
        } else if outcome.quorum_answered() {
            if outcome.released > 0 {
                warn!(
                    "{} released {} on only {}/{} stores",
                    candidate, resource, outcome.released, outcome.configured
                );
            }
            Ok(false)
        } else {
            Err(outcome.no_quorum(resource))
        }
    }
}

fn check_resource(resource: &str) -> Result<()> {
    if resource.is_empty() {
        return Err(ElectionError::config("resource must not be empty"));
    }
    Ok(())
}

/// One resource contended for with the facade's own id and default TTL.
#[derive(Debug, Clone)]
pub struct Candidacy {
    election: Arc<LeaderElection>,
    resource: String,
    candidate: String,
    ttl: Duration,
}

impl Candidacy {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn candidate(&self) -> &str {
        &self.candidate
    }

    /// Elect or renew; true when this candidate is the leader.
    pub async fn elect(&self) -> Result<bool> {
        let holder = self.election.elect(&self.resource, &self.candidate, self.ttl).await?;
        Ok(holder == self.candidate)
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader(&self.resource, &self.candidate)
    }

    pub async fn leader(&self) -> Result<Option<String>> {
        self.election.get_leader(&self.resource).await
    }

    pub async fn release(&self) -> Result<bool> {
        self.election.release(&self.resource, &self.candidate).await
    }
}
