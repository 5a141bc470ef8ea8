//! Command-line interface for orgsync
//!
//! CLI arguments and environment variable handling using clap. Every
//! command runs against a JSON snapshot loaded into [`MemoryStore`] (or
//! MongoDB with the `mongo` feature), prints its result as JSON, and
//! writes the snapshot back.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::Auditor;
use crate::config::Config;
use crate::entities::OrgType;
use crate::migrations::{
    ArchiveDescendants, MigrationJob, MigrationRunner, RepairDanglingParents, DEFAULT_PAGE_SIZE,
};
use crate::services::{CascadeChain, RepairCandidates, Services};
use crate::store::memory::DEFAULT_MAX_BATCH_OPS;
use crate::store::{DocumentStore, MemoryStore};
use crate::triggers::{TriggerEvent, TriggerRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// orgsync - keeps an organization hierarchy consistent
#[derive(Parser, Debug, Clone)]
#[command(name = "orgsync")]
#[command(about = "Reference repair, cascading archival and claims maintenance for org hierarchies")]
pub struct Args {
    /// TOML configuration file; defaults apply when omitted
    #[arg(long, env = "ORGSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// JSON snapshot to operate on
    #[arg(long, env = "ORGSYNC_SNAPSHOT")]
    pub snapshot: Option<PathBuf>,

    /// Where to write the resulting snapshot (default: in place)
    #[arg(long, env = "ORGSYNC_OUT")]
    pub out: Option<PathBuf>,

    /// Override the configured batch limit
    #[arg(long, env = "ORGSYNC_BATCH_LIMIT")]
    pub batch_limit: Option<usize>,

    /// Override the configured transaction attempt budget
    #[arg(long, env = "ORGSYNC_MAX_TRANSACTION_ATTEMPTS")]
    pub max_transaction_attempts: Option<u32>,

    /// Batch limit enforced by the snapshot store
    #[arg(long, env = "ORGSYNC_PROVIDER_BATCH_LIMIT", default_value_t = DEFAULT_MAX_BATCH_OPS)]
    pub provider_batch_limit: usize,

    /// MongoDB connection URI; replaces the snapshot store when set
    #[cfg(feature = "mongo")]
    #[arg(long, env = "MONGODB_URI")]
    pub mongodb_uri: Option<String>,

    #[cfg(feature = "mongo")]
    #[arg(long, env = "MONGODB_DB", default_value = "orgsync")]
    pub mongodb_db: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Dispatch trigger events from a JSON-lines file, in order
    Replay {
        #[arg(long)]
        events: PathBuf,
    },

    /// Run a resumable maintenance job
    Migrate {
        #[command(subcommand)]
        job: MigrateJob,

        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: usize,

        /// Discard saved progress and start from the beginning
        #[arg(long)]
        restart: bool,
    },

    /// Clear parent pointers that reference a detached or deleted org
    Repair {
        #[arg(long)]
        parent_id: String,

        #[arg(long)]
        parent_type: OrgType,

        /// Candidate child as `type:id`; repeatable
        #[arg(long = "candidate", value_parser = parse_candidate)]
        candidates: Vec<(OrgType, String)>,
    },

    /// Archive a chain root and all of its descendants
    Cascade {
        #[arg(long)]
        chain: String,

        #[arg(long)]
        root: String,
    },

    /// Invert a boolean claim on a user's claims record
    ToggleClaim {
        #[arg(long)]
        user: String,

        #[arg(long)]
        flag: String,
    },

    /// Report invariant violations without writing
    Audit {
        /// Exit non-zero when any issue is found
        #[arg(long)]
        fail_on_issues: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum MigrateJob {
    /// Repair org parent pointers naming missing or archived orgs
    RepairParents,
    /// Re-cascade every archived root of a chain
    ArchiveDescendants {
        #[arg(long)]
        chain: String,
    },
}

fn parse_candidate(raw: &str) -> std::result::Result<(OrgType, String), String> {
    let (org_type, id) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected type:id, got '{}'", raw))?;
    let org_type = org_type.parse::<OrgType>().map_err(|e| e.to_string())?;
    if id.trim().is_empty() {
        return Err(format!("candidate '{}' has an empty id", raw));
    }
    Ok((org_type, id.to_string()))
}

impl Args {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.provider_batch_limit == 0 {
            bail!("--provider-batch-limit must be at least 1");
        }
        if self.snapshot.is_none() && self.mongo_uri().is_none() {
            bail!("--snapshot is required");
        }
        Ok(())
    }

    /// File config (or defaults) with command-line overrides applied
    pub fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => Config::default(),
        };
        if let Some(limit) = self.batch_limit {
            config.batch_limit = limit;
        }
        if let Some(attempts) = self.max_transaction_attempts {
            config.max_transaction_attempts = attempts;
        }
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "mongo")]
    pub fn mongo_uri(&self) -> Option<&str> {
        self.mongodb_uri.as_deref()
    }

    #[cfg(not(feature = "mongo"))]
    pub fn mongo_uri(&self) -> Option<&str> {
        None
    }

    /// Snapshot destination; the input snapshot when `--out` is absent
    pub fn output_path(&self) -> Option<&Path> {
        self.out.as_deref().or(self.snapshot.as_deref())
    }
}

/// The store a command runs against
pub enum Backend {
    Memory(Arc<MemoryStore>),
    #[cfg(feature = "mongo")]
    Mongo(Arc<crate::store::MongoStore>),
}

impl Backend {
    pub async fn open(args: &Args) -> anyhow::Result<Self> {
        if let Some(uri) = args.mongo_uri() {
            return Self::open_mongo(args, uri).await;
        }

        let path = args
            .snapshot
            .as_ref()
            .context("--snapshot is required")?;
        let store = if path.exists() {
            MemoryStore::load_file(path, args.provider_batch_limit).await?
        } else {
            warn!(path = %path.display(), "Snapshot not found, starting empty");
            MemoryStore::with_batch_limit(args.provider_batch_limit)
        };
        Ok(Backend::Memory(Arc::new(store)))
    }

    #[cfg(feature = "mongo")]
    async fn open_mongo(args: &Args, uri: &str) -> anyhow::Result<Self> {
        let store =
            crate::store::MongoStore::connect(uri, &args.mongodb_db, args.provider_batch_limit)
                .await?;
        info!(db = %args.mongodb_db, "MongoDB store connected");
        Ok(Backend::Mongo(Arc::new(store)))
    }

    #[cfg(not(feature = "mongo"))]
    async fn open_mongo(_args: &Args, _uri: &str) -> anyhow::Result<Self> {
        bail!("built without the mongo feature")
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        match self {
            Backend::Memory(store) => store.clone(),
            #[cfg(feature = "mongo")]
            Backend::Mongo(store) => store.clone(),
        }
    }

    /// Write the snapshot back; MongoDB commits as it goes
    pub async fn persist(&self, path: Option<&Path>) -> anyhow::Result<()> {
        match self {
            Backend::Memory(store) => {
                if let Some(path) = path {
                    store.save_file(path).await?;
                }
                Ok(())
            }
            #[cfg(feature = "mongo")]
            Backend::Mongo(_) => Ok(()),
        }
    }
}

/// Result of one command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub json: Value,
    pub success: bool,
}

impl CommandOutput {
    fn ok(json: Value) -> Self {
        Self {
            json,
            success: true,
        }
    }
}

/// Run `command` against the wired services
pub async fn execute(command: &Command, services: Arc<Services>) -> anyhow::Result<CommandOutput> {
    match command {
        Command::Replay { events } => replay(events, services).await,

        Command::Migrate {
            job,
            page_size,
            restart,
        } => {
            let runner = MigrationRunner::new(services.store.clone()).with_page_size(*page_size);
            let report = match job {
                MigrateJob::RepairParents => {
                    let job = RepairDanglingParents::new(
                        services.store.clone(),
                        services.config.clone(),
                        services.repair.clone(),
                    );
                    if *restart {
                        runner.reset(RepairDanglingParents::NAME).await?;
                    }
                    runner.run(&job).await?
                }
                MigrateJob::ArchiveDescendants { chain } => {
                    let chain = CascadeChain::from_config(&services.config, chain)?;
                    let job = ArchiveDescendants::new(
                        chain,
                        services.config.archived_field(),
                        services.cascade.clone(),
                    );
                    if *restart {
                        runner.reset(job.name()).await?;
                    }
                    runner.run(&job).await?
                }
            };
            Ok(CommandOutput::ok(serde_json::to_value(report)?))
        }

        Command::Repair {
            parent_id,
            parent_type,
            candidates,
        } => {
            let mut grouped = RepairCandidates::new();
            for (org_type, id) in candidates {
                grouped.entry(*org_type).or_default().push(id.clone());
            }
            let applied = services
                .repair
                .repair_references(parent_id, *parent_type, &grouped)
                .await?;
            Ok(CommandOutput::ok(serde_json::to_value(applied)?))
        }

        Command::Cascade { chain, root } => {
            let result = services.cascade.cascade_archive_named(chain, root).await?;
            Ok(CommandOutput::ok(serde_json::to_value(result)?))
        }

        Command::ToggleClaim { user, flag } => {
            let outcome = services.claims.toggle_flag(user, flag).await?;
            Ok(CommandOutput::ok(serde_json::to_value(outcome)?))
        }

        Command::Audit { fail_on_issues } => {
            let report = Auditor::new(services.store.clone(), services.config.clone())
                .run()
                .await?;
            let success = !(*fail_on_issues && !report.is_clean());
            Ok(CommandOutput {
                json: serde_json::to_value(report)?,
                success,
            })
        }
    }
}

async fn replay(path: &Path, services: Arc<Services>) -> anyhow::Result<CommandOutput> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading events {}", path.display()))?;
    let router = TriggerRouter::new(services);

    let mut results = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let line_no = index + 1;
        let event: TriggerEvent = serde_json::from_str(line)
            .with_context(|| format!("parsing event on line {}", line_no))?;
        let outcomes = router
            .dispatch(&event)
            .await
            .with_context(|| format!("dispatching {} from line {}", event.path, line_no))?;
        results.push(json!({ "line": line_no, "path": event.path, "outcomes": outcomes }));
    }

    info!(events = results.len(), "Replay finished");
    Ok(CommandOutput::ok(Value::Array(results)))
}
