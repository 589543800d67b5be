//! # Spikeline Ephys
//!
//! Extracellular electrophysiology workflow on top of the spikeline
//! engine: Neuropixels sessions are ingested from disk, spike sorting
//! results are loaded and curated, and units, LFP traces, and peak
//! waveforms are computed incrementally as upstream rows appear.
//!
//! The workflow understands SpikeGLX and Open Ephys acquisition layouts
//! and Kilosort-family sorter output (`spike_times.npy`,
//! `spike_clusters.npy`, label TSVs).

pub mod config;
pub mod ingest;
pub mod keys;
pub mod paths;
pub mod process;
pub mod readers;
pub mod schema;
pub mod tables;

pub use config::WorkflowConfig;
pub use keys::{CurationKey, InsertionKey, SessionKey, TaskKey};
pub use schema::{build_registry, paramset_spec, EphysMode, TaskMode};
