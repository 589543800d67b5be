//! Mean spike waveforms from the wideband stream.
//!
//! For every curated unit the make cuts a window around each spike out
//! of the `.ap.bin` data, averages the windows per channel, and keeps
//! the channel with the largest peak-to-peak swing as the unit's peak
//! waveform. Units whose spikes all fall too close to the recording
//! edges produce no row. The master entity carries no attributes of its
//! own; the content lives in the part rows.

use std::path::PathBuf;

use async_trait::async_trait;
use spikeline_core::{AttrMap, AttrValue, EntityKey, EntityMake, Error, MakeResult, Result, Store};
use tracing::debug;

use crate::keys::CurationKey;
use crate::readers::spikeglx;
use crate::schema::{attr, entity};
use crate::tables::recording::ACQ_SPIKEGLX;
use crate::tables::{
    find_stream_metas, int_field, json_field, real_field, resolve_session_dir, seconds_from_json,
    text_field,
};

/// Samples kept on each side of a spike
pub const WAVEFORM_HALF_WIDTH: usize = 16;

/// Mean waveform of one unit on its loudest channel.
///
/// `samples` is the interleaved wideband stream; the last channel is the
/// sync line and never wins. Returns `None` when no spike window fits
/// inside the recording.
fn mean_peak_waveform(
    samples: &[i16],
    channels: usize,
    centers: &[usize],
    half: usize,
) -> Option<(usize, Vec<f64>)> {
    let frame_count = samples.len() / channels;
    let probe_channels = channels.saturating_sub(1);
    let usable: Vec<usize> = centers
        .iter()
        .copied()
        .filter(|&c| c >= half && c + half <= frame_count)
        .collect();
    if usable.is_empty() || probe_channels == 0 {
        return None;
    }

    let window = 2 * half;
    let mut best: Option<(usize, Vec<f64>, f64)> = None;
    for channel in 0..probe_channels {
        let mut mean = vec![0f64; window];
        for &center in &usable {
            let start = center - half;
            for (i, value) in mean.iter_mut().enumerate() {
                *value += f64::from(samples[(start + i) * channels + channel]);
            }
        }
        for value in &mut mean {
            *value /= usable.len() as f64;
        }

        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for &v in &mean {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        let ptp = hi - lo;
        let better = match &best {
            Some((_, _, b)) => ptp > *b,
            None => true,
        };
        if better {
            best = Some((channel, mean, ptp));
        }
    }
    best.map(|(channel, mean, _)| (channel, mean))
}

pub struct WaveformSetMake {
    roots: Vec<PathBuf>,
}

impl WaveformSetMake {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        WaveformSetMake { roots }
    }
}

#[async_trait]
impl EntityMake for WaveformSetMake {
    fn entity(&self) -> &str {
        entity::WAVEFORM_SET
    }

    async fn make(&self, store: &Store, key: &EntityKey) -> Result<MakeResult> {
        let curated = CurationKey::from_key(key)?;
        let insertion = curated.task.insertion.clone();

        let recording = store
            .fetch_row(entity::EPHYS_RECORDING, &insertion.to_key())
            .await?;
        let acq = text_field(&recording, entity::EPHYS_RECORDING, attr::ACQ_SOFTWARE)?;
        if acq != ACQ_SPIKEGLX {
            return Err(Error::Unsupported(format!(
                "waveform extraction needs SpikeGLX wideband data, {} was acquired with {}",
                insertion, acq
            )));
        }
        let sampling_rate = real_field(&recording, entity::EPHYS_RECORDING, attr::SAMPLING_RATE)?;

        let unit_rows = store
            .fetch_rows(entity::UNIT, &spikeline_core::Restriction::from_key(key))
            .await?;
        let mut unit_spikes = Vec::with_capacity(unit_rows.len());
        for row in &unit_rows {
            let unit = int_field(row, entity::UNIT, attr::UNIT)?;
            let times = seconds_from_json(json_field(row, entity::UNIT, "spike_times")?)?;
            let centers: Vec<usize> = times
                .iter()
                .filter_map(|t| {
                    let sample = (t * sampling_rate).round();
                    (sample >= 0.0).then_some(sample as usize)
                })
                .collect();
            unit_spikes.push((unit, centers));
        }
        let unit_count = unit_spikes.len();

        let session_dir = resolve_session_dir(store, &self.roots, &insertion.session).await?;
        let metas = find_stream_metas(&session_dir, insertion.insertion_number, ".ap.meta")?;
        let meta = spikeglx::SpikeGlxMeta::from_file(&metas[0])?;
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
        let bin_paths: Vec<PathBuf> = metas.iter().map(|m| m.with_extension("bin")).collect();
        for (meta_path, bin_path) in metas.iter().zip(&bin_paths) {
            if !bin_path.exists() {
                return Err(Error::MissingData(format!(
                    "{} has no companion binary",
                    meta_path.display()
                )));
            }
        }

        let computed =
            tokio::task::spawn_blocking(move || -> Result<Vec<(i64, usize, Vec<f64>)>> {
                let mut samples = Vec::new();
                for path in &bin_paths {
                    let piece = spikeglx::read_i16_samples(path)?;
                    if piece.len() % channels != 0 {
                        return Err(Error::MissingData(format!(
                            "{} is not a whole number of {}-channel frames",
                            path.display(),
                            channels
                        )));
                    }
                    samples.extend(piece);
                }
                let mut out = Vec::new();
                for (unit, centers) in &unit_spikes {
                    if let Some((peak, mean)) =
                        mean_peak_waveform(&samples, channels, centers, WAVEFORM_HALF_WIDTH)
                    {
                        out.push((*unit, peak, mean));
                    }
                }
                Ok(out)
            })
            .await
            .map_err(|e| Error::Internal(format!("waveform task failed: {}", e)))??;

        if computed.len() < unit_count {
            debug!(
                key = %key,
                skipped = unit_count - computed.len(),
                "Units without an in-bounds spike window were skipped"
            );
        }

        let mut rows = Vec::with_capacity(computed.len());
        for (unit, peak_channel, mean) in computed {
            let waveform: Vec<serde_json::Value> =
                mean.into_iter().map(serde_json::Value::from).collect();
            let mut row = AttrMap::new();
            row.insert(attr::UNIT.to_string(), AttrValue::Int(unit));
            row.insert(
                "peak_channel".to_string(),
                AttrValue::Int(peak_channel as i64),
            );
            row.insert(
                "waveform".to_string(),
                AttrValue::Json(serde_json::Value::Array(waveform)),
            );
            rows.push(row);
        }

        Ok(MakeResult::new()
            .with_master(AttrMap::new())
            .with_part(entity::PEAK_WAVEFORM, rows))
    }
}
