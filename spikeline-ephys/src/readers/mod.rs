//! File-format readers for acquisition systems and sorter output

pub mod kilosort;
pub mod npy;
pub mod openephys;
pub mod spikeglx;
