//! LFP band extraction from SpikeGLX low-frequency streams.
//!
//! SpikeGLX writes a separate `.lf.bin`/`.lf.meta` pair per probe; the
//! make reads every trigger segment of the stream in order, keeps one
//! electrode out of every nine (the last saved channel is the sync
//! line, not an electrode), and stores the RMS amplitude per kept
//! electrode. Recordings acquired with other software have no separate
//! LFP stream and are rejected as unsupported.

use std::path::PathBuf;

use async_trait::async_trait;
use spikeline_core::{AttrMap, AttrValue, EntityKey, EntityMake, Error, MakeResult, Result, Store};
use tracing::debug;

use crate::keys::InsertionKey;
use crate::readers::spikeglx;
use crate::schema::{attr, entity};
use crate::tables::{find_stream_metas, resolve_session_dir, text_field};
use crate::tables::recording::ACQ_SPIKEGLX;

/// Keep one of every this many probe channels
const ELECTRODE_STRIDE: usize = 9;

pub struct LfpMake {
    roots: Vec<PathBuf>,
}

impl LfpMake {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        LfpMake { roots }
    }
}

#[async_trait]
impl EntityMake for LfpMake {
    fn entity(&self) -> &str {
        entity::LFP
    }

    async fn make(&self, store: &Store, key: &EntityKey) -> Result<MakeResult> {
        let insertion = InsertionKey::from_key(key)?;
        let recording = store.fetch_row(entity::EPHYS_RECORDING, key).await?;
        let acq = text_field(&recording, entity::EPHYS_RECORDING, attr::ACQ_SOFTWARE)?;
        if acq != ACQ_SPIKEGLX {
            return Err(Error::Unsupported(format!(
                "LFP extraction needs a SpikeGLX low-frequency stream, {} was acquired with {}",
                insertion, acq
            )));
        }

        let session_dir = resolve_session_dir(store, &self.roots, &insertion.session).await?;
        let metas = find_stream_metas(&session_dir, insertion.insertion_number, ".lf.meta")?;
        let meta = spikeglx::SpikeGlxMeta::from_file(&metas[0])?;
        let lfp_rate = meta.sampling_rate()?;
        let channel_count = meta.channel_count()?;
        let channels = usize::try_from(channel_count)
            .ok()
            .filter(|&c| c > 0)
            .ok_or_else(|| {
                Error::MissingData(format!(
                    "{} declares {} saved channels",
                    metas[0].display(),
                    channel_count
                ))
            })?;

        let bin_paths: Vec<PathBuf> = metas
            .iter()
            .map(|m| m.with_extension("bin"))
            .collect();
        for (meta_path, bin_path) in metas.iter().zip(&bin_paths) {
            if !bin_path.exists() {
                return Err(Error::MissingData(format!(
                    "{} has no companion binary",
                    meta_path.display()
                )));
            }
        }

        // Trigger segments are consecutive pieces of one stream
        let samples = tokio::task::spawn_blocking(move || -> Result<Vec<i16>> {
            let mut all = Vec::new();
            for path in &bin_paths {
                let piece = spikeglx::read_i16_samples(path)?;
                if piece.len() % channels != 0 {
                    return Err(Error::MissingData(format!(
                        "{} is not a whole number of {}-channel frames",
                        path.display(),
                        channels
                    )));
                }
                all.extend(piece);
            }
            Ok(all)
        })
        .await
        .map_err(|e| Error::Internal(format!("LFP read task failed: {}", e)))??;

        let frame_count = samples.len() / channels;
        if frame_count == 0 {
            return Err(Error::MissingData(format!(
                "LFP stream for {} contains no samples",
                insertion
            )));
        }

        let probe_channels = channels - 1;
        let mut electrodes = Vec::new();
        for electrode in (0..probe_channels).step_by(ELECTRODE_STRIDE) {
            let mut sum = 0f64;
            for frame in 0..frame_count {
                let v = f64::from(samples[frame * channels + electrode]);
                sum += v * v;
            }
            let rms = (sum / frame_count as f64).sqrt();
            let mut row = AttrMap::new();
            row.insert(attr::ELECTRODE.to_string(), AttrValue::Int(electrode as i64));
            row.insert("lfp_rms".to_string(), AttrValue::Real(rms));
            electrodes.push(row);
        }
        debug!(
            insertion = %insertion,
            frames = frame_count,
            electrodes = electrodes.len(),
            "Extracted LFP band"
        );

        let mut master = AttrMap::new();
        master.insert("lfp_sampling_rate".to_string(), AttrValue::Real(lfp_rate));
        master.insert(
            "lfp_sample_count".to_string(),
            AttrValue::Int(frame_count as i64),
        );
        Ok(MakeResult::new()
            .with_master(master)
            .with_part(entity::LFP_ELECTRODE, electrodes))
    }
}
