//! Test helper modules for the ephys workflow integration tests
//!
//! Provides the two fixture layers the pipeline consumes:
//! - session_fixtures: a synthetic SpikeGLX session on disk plus the CSV
//!   manifests that describe it
//! - sorter_fixtures: canned Kilosort output whose spikes line up with
//!   the synthetic acquisition stream

pub mod session_fixtures;
pub mod sorter_fixtures;

// Re-export commonly used items
pub use session_fixtures::{
    open_store, session_datetime, workflow_config, write_acquisition, write_manifests,
    AP_SAMPLING_RATE, GOOD_UNIT_AMPLITUDE, GOOD_UNIT_CENTERS, GOOD_UNIT_CHANNEL, LFP_LEVEL_CH0,
    LFP_LEVEL_CH9, LF_FRAMES, LF_SAMPLING_RATE, MUA_UNIT_CENTERS, MUA_UNIT_CHANNEL, SUBJECT,
};
pub use sorter_fixtures::write_sorter_output;
