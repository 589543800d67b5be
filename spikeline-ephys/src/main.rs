//! spikeline - incremental electrophysiology pipeline over SQLite
//!
//! Subcommands follow the life of a dataset: `ingest` registers subjects
//! and recorded sessions, `paramset` and `tasks` set up spike sorting,
//! `curate` snapshots sorter output, and `run` computes everything
//! downstream that is still missing. `jobs` inspects the claims left by
//! concurrent `run --reserve-jobs` workers.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spikeline_core::jobs::JobQueue;
use spikeline_core::key::TIMESTAMP_FORMAT;
use spikeline_core::params::{ParamInsert, ParamStore};
use spikeline_core::{PopulateOptions, Restriction, Store};
use spikeline_ephys::schema::attr;
use spikeline_ephys::tables::clustering;
use spikeline_ephys::tables::curation::{self, CurationRequest};
use spikeline_ephys::{
    build_registry, ingest, paramset_spec, process, InsertionKey, SessionKey, TaskKey, TaskMode,
    WorkflowConfig,
};

#[derive(Parser, Debug)]
#[command(name = "spikeline")]
#[command(about = "Incremental electrophysiology pipeline over SQLite")]
#[command(version)]
struct Cli {
    /// Configuration file; overrides SPIKELINE_CONFIG and ./spikeline.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database schema and exit
    Init,
    /// Load subject and session manifests
    Ingest {
        /// CSV with one row per subject
        #[arg(long)]
        subjects: Option<PathBuf>,
        /// CSV with one row per recorded session directory
        #[arg(long)]
        sessions: Option<PathBuf>,
    },
    /// Register a clustering parameter set
    Paramset {
        /// Sorter name, e.g. kilosort2
        #[arg(long)]
        method: String,
        /// Index the parameter set will be addressed by
        #[arg(long)]
        idx: i64,
        #[arg(long, default_value = "")]
        desc: String,
        /// JSON file with the parameter payload
        #[arg(long)]
        params: PathBuf,
    },
    /// Create clustering tasks for populated recordings
    Tasks {
        #[arg(long)]
        paramset_idx: i64,
        /// Restrict to one subject
        #[arg(long)]
        subject: Option<String>,
        /// Explicit sorter output directory; the restriction must then
        /// match exactly one recording
        #[arg(long)]
        output_dir: Option<String>,
        /// "load" to read existing sorter output, "trigger" to request a run
        #[arg(long, default_value = "load")]
        mode: String,
    },
    /// Snapshot sorter output as a new curation
    Curate {
        #[arg(long)]
        subject: String,
        /// Session start, e.g. "2018-07-03 20:32:28"
        #[arg(long)]
        session_datetime: String,
        #[arg(long, default_value_t = 0)]
        insertion: i64,
        #[arg(long, default_value_t = 0)]
        paramset_idx: i64,
        /// Directory with the curated files; defaults to the sorter output
        #[arg(long)]
        output_dir: Option<String>,
        #[arg(long)]
        note: Option<String>,
        /// Mark the snapshot as quality controlled
        #[arg(long)]
        qc: bool,
        /// Mark the snapshot as manually curated
        #[arg(long)]
        manual: bool,
    },
    /// Compute missing downstream rows in dependency order
    Run {
        /// Populate a single entity instead of all of them
        #[arg(long)]
        entity: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        /// Stop after this many keys per entity
        #[arg(long)]
        limit: Option<usize>,
        /// Coordinate with concurrent workers through the jobs table
        #[arg(long)]
        reserve_jobs: bool,
        /// Stop at the first failure instead of recording it and moving on
        #[arg(long)]
        halt_on_error: bool,
        /// Suppress per-key progress logging
        #[arg(long)]
        quiet: bool,
    },
    /// Inspect or clear populate job claims
    Jobs {
        #[arg(long)]
        entity: Option<String>,
        /// Drop error claims so their keys become eligible again
        #[arg(long)]
        clear_errors: bool,
        /// List only reservations older than this many minutes
        #[arg(long)]
        stale_minutes: Option<i64>,
    },
}

fn subject_restriction(subject: Option<String>) -> Restriction {
    match subject {
        Some(s) => Restriction::all().with(attr::SUBJECT, s),
        None => Restriction::all(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = WorkflowConfig::load(cli.config.as_deref())?;
    let registry = build_registry(config.mode)?;
    let store = Store::open(registry, &config.store_config())
        .await
        .context("failed to open the workflow database")?;

    match cli.command {
        Command::Init => {
            info!(
                "Schema ready in {} ({} mode)",
                config.database.path.display(),
                config.mode
            );
        }

        Command::Ingest { subjects, sessions } => {
            if subjects.is_none() && sessions.is_none() {
                bail!("nothing to ingest: pass --subjects and/or --sessions");
            }
            if let Some(path) = subjects {
                ingest::ingest_subjects(&store, &path).await?;
            }
            if let Some(path) = sessions {
                ingest::ingest_sessions(&store, &config.data.root_dirs, &path).await?;
            }
        }

        Command::Paramset {
            method,
            idx,
            desc,
            params,
        } => {
            let text = std::fs::read_to_string(&params)
                .with_context(|| format!("failed to read {}", params.display()))?;
            let payload: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("{} is not valid JSON", params.display()))?;
            let param_store = ParamStore::new(store.clone(), paramset_spec())?;
            match param_store
                .insert_new_params(&method, idx, &desc, &payload)
                .await?
            {
                ParamInsert::Inserted => {}
                ParamInsert::AlreadyExists => {
                    info!(
                        paramset_idx = idx,
                        "Identical parameter set already registered, nothing to do"
                    );
                }
            }
        }

        Command::Tasks {
            paramset_idx,
            subject,
            output_dir,
            mode,
        } => {
            let mode = TaskMode::parse(&mode)?;
            let restriction = subject_restriction(subject);
            clustering::insert_tasks(
                &store,
                paramset_idx,
                &restriction,
                mode,
                output_dir.as_deref(),
            )
            .await?;
        }

        Command::Curate {
            subject,
            session_datetime,
            insertion,
            paramset_idx,
            output_dir,
            note,
            qc,
            manual,
        } => {
            let datetime = NaiveDateTime::parse_from_str(&session_datetime, TIMESTAMP_FORMAT)
                .with_context(|| {
                    format!(
                        "session datetime must look like 2018-07-03 20:32:28, got '{}'",
                        session_datetime
                    )
                })?;
            let task = TaskKey::new(
                InsertionKey::new(SessionKey::new(subject, datetime), insertion),
                paramset_idx,
            );
            let request = CurationRequest {
                output_dir,
                quality_control: qc,
                manual_curation: manual,
                note,
            };
            let id = curation::create(&store, &config.data.root_dirs, &task, &request).await?;
            println!("{}", id);
        }

        Command::Run {
            entity,
            subject,
            limit,
            reserve_jobs,
            halt_on_error,
            quiet,
        } => {
            let scheduler = process::build_scheduler(store, &config)?;
            let restriction = subject_restriction(subject);
            let options = PopulateOptions {
                display_progress: !quiet,
                reserve_jobs,
                suppress_errors: !halt_on_error,
                limit,
            };
            let reports = match entity {
                Some(name) => {
                    let report = scheduler.populate(&name, &restriction, &options).await?;
                    process::log_report(&report);
                    vec![report]
                }
                None => process::run(&scheduler, &restriction, &options).await?,
            };
            let failed: usize = reports.iter().map(|r| r.failed_count()).sum();
            if failed > 0 {
                bail!("{} keys failed; inspect the log or the jobs table", failed);
            }
        }

        Command::Jobs {
            entity,
            clear_errors,
            stale_minutes,
        } => {
            let queue = JobQueue::new(store.clone());
            if clear_errors {
                let entity =
                    entity.ok_or_else(|| anyhow::anyhow!("--clear-errors needs --entity"))?;
                let cleared = queue.clear_errors(&entity).await?;
                info!(entity = %entity, cleared, "Cleared error claims");
            } else {
                let records = match stale_minutes {
                    Some(minutes) => queue.stale(chrono::Duration::minutes(minutes)).await?,
                    None => queue.list(entity.as_deref()).await?,
                };
                if records.is_empty() {
                    println!("no job claims");
                }
                for job in records {
                    println!(
                        "{:<9} {:<20} {} {}",
                        job.status.as_str(),
                        job.entity,
                        job.key,
                        job.error_message.as_deref().unwrap_or("")
                    );
                }
            }
        }
    }

    Ok(())
}
