use std::{fs::File, io::ErrorKind, path::Path};

use anyhow::{Context, Result};
use symphonia::core::{
    audio::SampleBuffer, codecs::DecoderOptions, errors::Error as SymphoniaError,
    formats::FormatOptions, io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
};
use tracing::{debug, instrument};

/// A fully decoded audio region source, downmixed to mono at its native
/// rate. The render pipeline resamples it per block; the source is never
/// mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub source_channels: u16,
    pub samples: Vec<f32>,
}

impl DecodedAudio {
    #[must_use]
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// Decodes an audio region's on-disk source with symphonia. Any failure
/// here is a resource problem the caller degrades from (silent region),
/// never a render abort.
#[instrument(fields(path = %path.display()))]
pub fn decode_region_source(path: &Path) -> Result<DecodedAudio> {
    let file = File::open(path)
        .with_context(|| format!("failed to open audio source: {}", path.display()))?;
    let source = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|value| value.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        source,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow::anyhow!("no default audio track in {}", path.display()))?;
    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(48_000);
    let mut source_channels = track
        .codec_params
        .channels
        .map(|value| value.count() as u16)
        .unwrap_or(2);
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(error)) if error.kind() == ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                return Err(anyhow::anyhow!(
                    "audio stream reset required for {}",
                    path.display()
                ));
            }
            Err(error) => return Err(error.into()),
        };

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(error) => return Err(error.into()),
        };

        sample_rate = decoded.spec().rate;
        source_channels = decoded.spec().channels.count() as u16;

        let spec = *decoded.spec();
        let channel_count = spec.channels.count().max(1);
        let mut sample_buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buffer.copy_interleaved_ref(decoded);
        for frame in sample_buffer.samples().chunks(channel_count) {
            let sum: f32 = frame.iter().copied().sum();
            samples.push(sum / channel_count as f32);
        }
    }

    if samples.is_empty() {
        return Err(anyhow::anyhow!(
            "decoded zero samples from {}",
            path.display()
        ));
    }

    debug!(
        sample_rate,
        source_channels,
        frames = samples.len(),
        "region source decoded"
    );

    Ok(DecodedAudio {
        sample_rate,
        source_channels,
        samples,
    })
}
