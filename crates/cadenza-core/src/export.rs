use std::{
    fs,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::{
    render::{self, OfflineRender},
    snapshot::RenderSnapshot,
};

/// Outcome of a finished export, for logging and UI display.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub path: PathBuf,
    pub frames: usize,
    pub duration_seconds: f64,
    pub peak: f32,
}

/// Renders the snapshot offline and writes a 16-bit stereo WAV at the
/// project sample rate. The file is written to a temporary sibling and
/// renamed into place, so a failed or cancelled export never leaves a
/// partial file at `path`.
#[instrument(skip(snapshot, cancel), fields(project_id = %snapshot.project_id, path = %path.display()))]
pub fn export_wav(
    snapshot: &RenderSnapshot,
    block_size: usize,
    path: &Path,
    cancel: Option<&AtomicBool>,
) -> Result<ExportReport> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create wav output directory: {}",
                parent.display()
            )
        })?;
    }

    let rendered = render::render_offline(snapshot, block_size, cancel)?;
    write_wav_atomic(&rendered, path)?;

    let report = ExportReport {
        path: path.to_path_buf(),
        frames: rendered.frames,
        duration_seconds: rendered.duration_seconds(),
        peak: rendered.master.peak,
    };
    info!(
        frames = report.frames,
        duration_seconds = report.duration_seconds,
        peak = report.peak,
        "wav export completed"
    );
    Ok(report)
}

fn write_wav_atomic(rendered: &OfflineRender, path: &Path) -> Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    // Temp file in the destination directory so the final rename stays on
    // one filesystem and is atomic.
    let temp = tempfile::NamedTempFile::new_in(directory)
        .with_context(|| format!("failed to create temporary wav in {}", directory.display()))?;

    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: rendered.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let file = temp
        .as_file()
        .try_clone()
        .context("failed to clone temporary wav handle")?;
    let mut writer = hound::WavWriter::new(BufWriter::new(file), spec)
        .context("failed to start wav encoding")?;

    for &sample in &rendered.samples {
        let quantized = (sample * f32::from(i16::MAX)).round() as i16;
        writer
            .write_sample(quantized)
            .context("failed to write wav sample")?;
    }
    writer.finalize().context("failed to finalize wav file")?;

    temp.persist(path)
        .with_context(|| format!("failed to move wav into place: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{NoteSpan, TrackSnapshot};

    fn snapshot_with_note() -> RenderSnapshot {
        let mut snapshot = RenderSnapshot::empty(120.0, 48_000);
        snapshot.end_beat = 1.0;
        snapshot.tracks.push(TrackSnapshot::midi_for_test(vec![NoteSpan {
            pitch: 60,
            velocity: 100,
            start_beat: 0.0,
            end_beat: 1.0,
        }]));
        snapshot
    }

    #[test]
    fn export_produces_a_readable_wav() {
        let dir = tempfile::tempdir().expect("temp dir should create");
        let path = dir.path().join("mix.wav");
        let report =
            export_wav(&snapshot_with_note(), 512, &path, None).expect("export should succeed");

        let reader = hound::WavReader::open(&path).expect("wav should open");
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 48_000);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.duration() as usize, report.frames);
    }

    #[test]
    fn cancelled_export_leaves_no_file() {
        let dir = tempfile::tempdir().expect("temp dir should create");
        let path = dir.path().join("mix.wav");
        let cancel = AtomicBool::new(true);
        let result = export_wav(&snapshot_with_note(), 512, &path, Some(&cancel));
        assert!(result.is_err());
        assert!(!path.exists(), "no partial file at the destination");
    }

    #[test]
    fn export_creates_missing_directories() {
        let dir = tempfile::tempdir().expect("temp dir should create");
        let path = dir.path().join("nested/out/mix.wav");
        export_wav(&snapshot_with_note(), 512, &path, None).expect("export should succeed");
        assert!(path.exists());
    }
}
