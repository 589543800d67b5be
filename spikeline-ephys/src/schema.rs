//! The extracellular electrophysiology schema
//!
//! Entities follow the acquisition chain: subjects sit in sessions, probes
//! are inserted, recordings are imported from acquisition files, spike
//! sorting runs as clustering tasks, curation snapshots the sorter output,
//! and curated results fan out into units, LFP traces, and waveforms.
//!
//! The schema comes in two shapes, chosen once at startup: with a manual
//! curation step between clustering and curated results, or without one
//! (curated results read the sorter output directly).

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use spikeline_core::params::ParamTableSpec;
use spikeline_core::{AttrType, EdgeKind, EntityDef, Error, Registry, Result};

/// Entity names
pub mod entity {
    pub const SUBJECT: &str = "subject";
    pub const SESSION: &str = "session";
    pub const SESSION_DIRECTORY: &str = "session_directory";
    pub const PROBE: &str = "probe";
    pub const PROBE_INSERTION: &str = "probe_insertion";
    pub const CLUSTERING_METHOD: &str = "clustering_method";
    pub const CLUSTERING_PARAMSET: &str = "clustering_paramset";
    pub const EPHYS_RECORDING: &str = "ephys_recording";
    pub const EPHYS_FILE: &str = "ephys_file";
    pub const CLUSTERING_TASK: &str = "clustering_task";
    pub const CLUSTERING: &str = "clustering";
    pub const CURATION: &str = "curation";
    pub const CURATED_CLUSTERING: &str = "curated_clustering";
    pub const UNIT: &str = "unit";
    pub const LFP: &str = "lfp";
    pub const LFP_ELECTRODE: &str = "lfp_electrode";
    pub const WAVEFORM_SET: &str = "waveform_set";
    pub const PEAK_WAVEFORM: &str = "peak_waveform";
}

/// Attribute names shared across entities
pub mod attr {
    pub const SUBJECT: &str = "subject";
    pub const SESSION_DATETIME: &str = "session_datetime";
    pub const INSERTION_NUMBER: &str = "insertion_number";
    pub const PARAMSET_IDX: &str = "paramset_idx";
    pub const CURATION_ID: &str = "curation_id";
    pub const UNIT: &str = "unit";
    pub const ELECTRODE: &str = "electrode";
    pub const FILE_PATH: &str = "file_path";
    pub const SESSION_DIR: &str = "session_dir";
    pub const PROBE: &str = "probe";
    pub const CLUSTERING_METHOD: &str = "clustering_method";
    pub const TASK_MODE: &str = "task_mode";
    pub const CLUSTERING_OUTPUT_DIR: &str = "clustering_output_dir";
    pub const CURATION_OUTPUT_DIR: &str = "curation_output_dir";
    pub const ACQ_SOFTWARE: &str = "acq_software";
    pub const SAMPLING_RATE: &str = "sampling_rate";
}

/// Whether the pipeline carries a manual curation step between clustering
/// and curated results. Decided once when the registry is built; the two
/// shapes never mix within one schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EphysMode {
    /// clustering -> curation -> curated_clustering
    Curated,
    /// clustering -> curated_clustering
    NoCuration,
}

impl Default for EphysMode {
    fn default() -> Self {
        EphysMode::Curated
    }
}

impl EphysMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EphysMode::Curated => "curated",
            EphysMode::NoCuration => "no-curation",
        }
    }

    pub fn has_curation(&self) -> bool {
        matches!(self, EphysMode::Curated)
    }
}

impl fmt::Display for EphysMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EphysMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "curated" => Ok(EphysMode::Curated),
            "no-curation" => Ok(EphysMode::NoCuration),
            other => Err(Error::Config(format!(
                "unknown ephys mode '{}', expected 'curated' or 'no-curation'",
                other
            ))),
        }
    }
}

/// How a clustering task gets its results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// Results already exist on disk; validate and register them
    Load,
    /// Results should be computed by launching the sorter (not supported)
    Trigger,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::Load => "load",
            TaskMode::Trigger => "trigger",
        }
    }

    pub fn parse(s: &str) -> Result<TaskMode> {
        match s {
            "load" => Ok(TaskMode::Load),
            "trigger" => Ok(TaskMode::Trigger),
            other => Err(Error::InvalidInput(format!(
                "unknown task mode '{}', expected 'load' or 'trigger'",
                other
            ))),
        }
    }
}

fn session_key(def: EntityDef) -> EntityDef {
    def.key_attr(attr::SUBJECT, AttrType::Text)
        .key_attr(attr::SESSION_DATETIME, AttrType::Timestamp)
}

fn insertion_key(def: EntityDef) -> EntityDef {
    session_key(def).key_attr(attr::INSERTION_NUMBER, AttrType::Int)
}

fn task_key(def: EntityDef) -> EntityDef {
    insertion_key(def).key_attr(attr::PARAMSET_IDX, AttrType::Int)
}

fn curated_key(def: EntityDef, mode: EphysMode) -> EntityDef {
    let def = task_key(def);
    if mode.has_curation() {
        def.key_attr(attr::CURATION_ID, AttrType::Int)
    } else {
        def
    }
}

/// Build the full ephys registry for the chosen mode
pub fn build_registry(mode: EphysMode) -> Result<Registry> {
    let mut builder = Registry::builder()
        .entity(
            EntityDef::manual(entity::SUBJECT)
                .key_attr(attr::SUBJECT, AttrType::Text)
                .nullable_attr("sex", AttrType::Text)
                .nullable_attr("subject_birth_date", AttrType::Timestamp)
                .nullable_attr("subject_description", AttrType::Text),
        )
        .entity(
            session_key(EntityDef::manual(entity::SESSION))
                .parent(entity::SUBJECT, EdgeKind::Primary)
                .nullable_attr("experimenter", AttrType::Text)
                .nullable_attr("session_note", AttrType::Text),
        )
        .entity(
            session_key(EntityDef::part(entity::SESSION_DIRECTORY, entity::SESSION))
                .attr(attr::SESSION_DIR, AttrType::Text),
        )
        .entity(
            EntityDef::manual(entity::PROBE)
                .key_attr(attr::PROBE, AttrType::Text)
                .attr("probe_type", AttrType::Text)
                .nullable_attr("probe_comment", AttrType::Text),
        )
        .entity(
            insertion_key(EntityDef::manual(entity::PROBE_INSERTION))
                .parent(entity::SESSION, EdgeKind::Primary)
                .parent(entity::PROBE, EdgeKind::Secondary)
                .attr(attr::PROBE, AttrType::Text),
        )
        .entity(
            EntityDef::lookup(entity::CLUSTERING_METHOD)
                .key_attr(attr::CLUSTERING_METHOD, AttrType::Text)
                .nullable_attr("method_desc", AttrType::Text),
        )
        .entity(
            EntityDef::lookup(entity::CLUSTERING_PARAMSET)
                .parent(entity::CLUSTERING_METHOD, EdgeKind::Secondary)
                .key_attr(attr::PARAMSET_IDX, AttrType::Int)
                .attr(attr::CLUSTERING_METHOD, AttrType::Text)
                .attr("paramset_desc", AttrType::Text)
                .attr("param_set_hash", AttrType::Uuid)
                .attr("params", AttrType::Json),
        )
        .entity(
            insertion_key(EntityDef::imported(entity::EPHYS_RECORDING))
                .parent(entity::PROBE_INSERTION, EdgeKind::Primary)
                .attr(attr::ACQ_SOFTWARE, AttrType::Text)
                .attr(attr::SAMPLING_RATE, AttrType::Real)
                .attr("channel_count", AttrType::Int)
                .attr("recording_datetime", AttrType::Timestamp),
        )
        .entity(
            insertion_key(EntityDef::part(entity::EPHYS_FILE, entity::EPHYS_RECORDING))
                .key_attr(attr::FILE_PATH, AttrType::Text),
        )
        .entity(
            task_key(EntityDef::manual(entity::CLUSTERING_TASK))
                .parent(entity::EPHYS_RECORDING, EdgeKind::Primary)
                .parent(entity::CLUSTERING_PARAMSET, EdgeKind::Primary)
                .attr(attr::CLUSTERING_OUTPUT_DIR, AttrType::Text)
                .attr(attr::TASK_MODE, AttrType::Text),
        )
        .entity(
            task_key(EntityDef::computed(entity::CLUSTERING))
                .parent(entity::CLUSTERING_TASK, EdgeKind::Primary)
                .attr("clustering_time", AttrType::Timestamp),
        );

    if mode.has_curation() {
        builder = builder.entity(
            curated_key(EntityDef::manual(entity::CURATION), mode)
                .parent(entity::CLUSTERING, EdgeKind::Primary)
                .attr("curation_time", AttrType::Timestamp)
                .attr(attr::CURATION_OUTPUT_DIR, AttrType::Text)
                .attr("quality_control", AttrType::Int)
                .attr("manual_curation", AttrType::Int)
                .nullable_attr("curation_note", AttrType::Text),
        );
    }

    let curated_parent = if mode.has_curation() {
        entity::CURATION
    } else {
        entity::CLUSTERING
    };

    let registry = builder
        .entity(
            curated_key(EntityDef::computed(entity::CURATED_CLUSTERING), mode)
                .parent(curated_parent, EdgeKind::Primary)
                .attr("unit_count", AttrType::Int),
        )
        .entity(
            curated_key(EntityDef::part(entity::UNIT, entity::CURATED_CLUSTERING), mode)
                .key_attr(attr::UNIT, AttrType::Int)
                .attr("cluster_quality_label", AttrType::Text)
                .attr("spike_count", AttrType::Int)
                .attr("spike_times", AttrType::Json)
                .nullable_attr("spike_depths", AttrType::Json),
        )
        .entity(
            insertion_key(EntityDef::imported(entity::LFP))
                .parent(entity::EPHYS_RECORDING, EdgeKind::Primary)
                .attr("lfp_sampling_rate", AttrType::Real)
                .attr("lfp_sample_count", AttrType::Int),
        )
        .entity(
            insertion_key(EntityDef::part(entity::LFP_ELECTRODE, entity::LFP))
                .key_attr(attr::ELECTRODE, AttrType::Int)
                .attr("lfp_rms", AttrType::Real),
        )
        .entity(
            curated_key(EntityDef::computed(entity::WAVEFORM_SET), mode)
                .parent(entity::CURATED_CLUSTERING, EdgeKind::Primary),
        )
        .entity(
            curated_key(EntityDef::part(entity::PEAK_WAVEFORM, entity::WAVEFORM_SET), mode)
                .key_attr(attr::UNIT, AttrType::Int)
                .attr("peak_channel", AttrType::Int)
                .attr("waveform", AttrType::Json),
        )
        .build()?;

    Ok(registry)
}

/// Where clustering parameter sets live, for [`ParamStore`] access.
///
/// [`ParamStore`]: spikeline_core::params::ParamStore
pub fn paramset_spec() -> ParamTableSpec {
    ParamTableSpec {
        entity: entity::CLUSTERING_PARAMSET.to_string(),
        method_entity: entity::CLUSTERING_METHOD.to_string(),
        method_attr: attr::CLUSTERING_METHOD.to_string(),
        idx_attr: attr::PARAMSET_IDX.to_string(),
        desc_attr: "paramset_desc".to_string(),
        hash_attr: "param_set_hash".to_string(),
        params_attr: "params".to_string(),
    }
}
