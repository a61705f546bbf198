//! CLI for nexa-election
//!
//! Provides command-line access to:
//! - Serving the REST API
//! - One-shot elect/get/release calls
//! - Running leader-gated tasks

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::api;
use crate::config::ElectionConfig;
use crate::election::LeaderElection;
use crate::error::Result;
use crate::runner::{self, TaskRunner};

#[derive(Parser, Debug)]
#[command(name = "nexa-election", author, version, about, long_about = None)]
pub struct Cli {
    /// Config file; well-known locations are searched when absent
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Store endpoint, repeat for every store (replaces configured stores)
    #[arg(long = "store", global = true)]
    pub stores: Vec<String>,

    /// Default lease TTL in milliseconds
    #[arg(long, global = true)]
    pub ttl_ms: Option<u64>,

    /// Candidate id of this node
    #[arg(long, global = true)]
    pub id: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the REST API
    Serve {
        /// Overrides server.bind_addr
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run one election round for a resource
    Elect {
        resource: String,
        /// TTL in milliseconds for this lease
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Print the current leader of a resource
    Get { resource: String },
    /// Release this node's lease on a resource
    Release { resource: String },
    /// Run leader-gated tasks from a YAML file
    Run { tasks: PathBuf },
}

impl Cli {
    /// Load the config and layer the command-line overrides on top.
    pub fn election_config(&self) -> Result<ElectionConfig> {
        let mut config = ElectionConfig::load(self.config.as_deref())?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut ElectionConfig) {
        if !self.stores.is_empty() {
            config.stores = self.stores.clone();
        }
        if let Some(ttl_ms) = self.ttl_ms {
            config.ttl_ms = ttl_ms;
        }
        if let Some(id) = &self.id {
            config.candidate_id = Some(id.clone());
        }
        if let Commands::Serve { bind: Some(bind) } = &self.command {
            config.server.bind_addr = bind.clone();
        }
    }
}

pub struct CliHandler {
    election: Arc<LeaderElection>,
    config: ElectionConfig,
}

impl CliHandler {
    pub fn new(config: ElectionConfig) -> Result<Self> {
        let election = Arc::new(LeaderElection::from_config(&config)?);
        Ok(Self { election, config })
    }

    pub fn election(&self) -> &Arc<LeaderElection> {
        &self.election
    }

    pub async fn handle(&self, command: &Commands) -> Result<()> {
        match command {
            Commands::Serve { .. } => api::serve(Arc::clone(&self.election), &self.config.server.bind_addr).await,
            Commands::Elect { resource, ttl } => {
                let ttl = ttl
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| self.election.default_ttl());
                let leader = self
                    .election
                    .elect(resource, self.election.candidate_id(), ttl)
                    .await?;
                print_json(json!({ "leader": leader }))
            }
            Commands::Get { resource } => {
                let leader = self.election.get_leader(resource).await?;
                print_json(json!({ "leader": leader }))
            }
            Commands::Release { resource } => {
                let released = self
                    .election
                    .release(resource, self.election.candidate_id())
                    .await?;
                print_json(json!({ "released": released }))
            }
            Commands::Run { tasks } => {
                let tasks = runner::load_tasks(tasks)?;
                let node_id = self.election.candidate_id().to_string();
                info!("Starting leader task runner with {} tasks", tasks.len());
                TaskRunner::new(Arc::clone(&self.election), node_id, tasks)
                    .run(async {
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            error!("Failed to listen for shutdown signal: {}", e);
                            std::future::pending::<()>().await;
                        }
                    })
                    .await;
                Ok(())
            }
        }
    }
}

fn print_json(value: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_options() {
        let cli = Cli::try_parse_from([
            "nexa-election",
            "elect",
            "svc",
            "--store",
            "memory://a",
            "--store",
            "memory://b",
            "--ttl",
            "1500",
            "--id",
            "node-1",
        ])
        .unwrap();

        assert_eq!(cli.stores, vec!["memory://a", "memory://b"]);
        assert_eq!(cli.id.as_deref(), Some("node-1"));
        match &cli.command {
            Commands::Elect { resource, ttl } => {
                assert_eq!(resource, "svc");
                assert_eq!(*ttl, Some(1500));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_overrides_replace_config() {
        let cli = Cli::try_parse_from([
            "nexa-election",
            "--store",
            "memory://x",
            "--ttl-ms",
            "700",
            "serve",
            "--bind",
            "0.0.0.0:6000",
        ])
        .unwrap();

        let mut config = ElectionConfig::default();
        config.stores = vec!["redis://10.0.0.1:6379/0".to_string()];
        cli.apply_overrides(&mut config);

        assert_eq!(config.stores, vec!["memory://x"]);
        assert_eq!(config.ttl_ms, 700);
        assert_eq!(config.server.bind_addr, "0.0.0.0:6000");
        assert!(config.candidate_id.is_none());
    }

    #[test]
    fn test_missing_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["nexa-election"]).is_err());
    }

    #[tokio::test]
    async fn test_one_shot_elect_and_release() {
        let mut config = ElectionConfig::default();
        config.stores = vec!["memory://a".to_string()];
        config.candidate_id = Some("node-1".to_string());
        let handler = CliHandler::new(config).unwrap();

        handler
            .handle(&Commands::Elect { resource: "svc".to_string(), ttl: None })
            .await
            .unwrap();
        assert!(handler.election().is_leader("svc", "node-1"));

        handler
            .handle(&Commands::Release { resource: "svc".to_string() })
            .await
            .unwrap();
        assert!(!handler.election().is_leader("svc", "node-1"));
    }
}
