//! Merge pipeline
//!
//! Repackages an ordered list of segments into one container with continuous
//! per-track timestamps. Samples are copied verbatim; nothing is decoded.

use crate::export::container::{ContainerFormat, ContainerWriter};
use crate::export::sgmt::SgmtFormat;
use crate::export::types::{MergeError, MergeReport, Sample, TrackKind, TrackSummary};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Output track state kept while merging
struct OutputTrack {
    kind: TrackKind,
    index: usize,
    /// Added to every source timestamp of the current segment
    offset_us: i64,
    /// Largest adjusted timestamp written so far
    max_pts_us: Option<i64>,
    samples: u64,
}

/// Merge pipeline for one container family
#[derive(Clone)]
pub struct MergePipeline {
    format: Arc<dyn ContainerFormat>,
}

impl Default for MergePipeline {
    fn default() -> Self {
        Self::new(Arc::new(SgmtFormat))
    }
}

impl MergePipeline {
    /// Create a pipeline reading and writing `format`
    pub fn new(format: Arc<dyn ContainerFormat>) -> Self {
        Self { format }
    }

    /// File extension of merged outputs
    pub fn extension(&self) -> &'static str {
        self.format.extension()
    }

    /// Run the merge
    ///
    /// The output only appears at `output` once every input has been copied;
    /// any error leaves nothing behind.
    pub fn run<P: AsRef<Path>>(&self, inputs: &[P], output: &Path) -> Result<MergeReport, MergeError> {
        let started = Instant::now();

        let Some(first_path) = inputs.first().map(|p| p.as_ref()) else {
            return Err(MergeError::NothingToMerge);
        };

        tracing::info!("Merging {} segments into {:?}", inputs.len(), output);

        // 1. Open one output track per media type found in the first segment
        let first_reader = self.format.open(first_path)?;
        let formats: Vec<_> = TrackKind::ALL
            .iter()
            .filter_map(|kind| first_reader.tracks().iter().find(|t| t.kind == *kind).cloned())
            .collect();
        if formats.is_empty() {
            return Err(MergeError::NoTracks(first_path.to_path_buf()));
        }

        let mut writer = self.format.create(output)?;
        let mut tracks: Vec<OutputTrack> = Vec::with_capacity(formats.len());
        for format in formats {
            let kind = format.kind;
            tracing::debug!("Opening {:?} output track ({})", kind, format.codec);
            let index = writer.add_track(format)?;
            tracks.push(OutputTrack {
                kind,
                index,
                offset_us: 0,
                max_pts_us: None,
                samples: 0,
            });
        }
        let mut first = Some(first_reader);

        // 2. Copy every segment, shifting timestamps by the running offset
        for (position, input) in inputs.iter().enumerate() {
            let input = input.as_ref();
            let mut reader = match first.take() {
                Some(reader) => reader,
                None => self.format.open(input)?,
            };

            for track in tracks.iter_mut() {
                let Some(source) = reader.tracks().iter().position(|t| t.kind == track.kind) else {
                    tracing::debug!(
                        "Segment {} ({:?}) has no {:?} track, skipping it",
                        position,
                        input,
                        track.kind
                    );
                    continue;
                };

                copy_track(input, reader.samples(source), writer.as_mut(), track)?;

                // Continue from the latest timestamp actually written, never
                // from the nominal segment length
                if let Some(max) = track.max_pts_us {
                    track.offset_us = max;
                }
            }
        }

        // 3. Finalize
        writer.finish()?;

        let report = MergeReport {
            output_path: output.to_path_buf(),
            segments: inputs.len(),
            tracks: tracks
                .iter()
                .map(|t| TrackSummary {
                    kind: t.kind,
                    samples: t.samples,
                    last_pts_us: t.max_pts_us.unwrap_or(0),
                })
                .collect(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            "Merge complete: {} segments, {:.2}s of media in {}ms",
            report.segments,
            report.duration().as_secs_f64(),
            report.elapsed_ms
        );

        Ok(report)
    }
}

fn copy_track(
    input: &Path,
    samples: Box<dyn Iterator<Item = Result<Sample, MergeError>> + '_>,
    writer: &mut dyn ContainerWriter,
    track: &mut OutputTrack,
) -> Result<(), MergeError> {
    for sample in samples {
        let mut sample = sample?;
        sample.pts_us = sample.pts_us.checked_add(track.offset_us).ok_or_else(|| {
            MergeError::invalid(
                input,
                format!("{:?} timestamp {}us overflows after shifting", track.kind, sample.pts_us),
            )
        })?;
        writer.write_sample(track.index, &sample)?;

        track.max_pts_us = Some(track.max_pts_us.map_or(sample.pts_us, |m| m.max(sample.pts_us)));
        track.samples += 1;
    }
    Ok(())
}

/// Merge plain files with the default container family
pub fn merge_files(inputs: &[PathBuf], output: &Path) -> Result<MergeReport, MergeError> {
    MergePipeline::default().run(inputs, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::container::ContainerReader;
    use crate::export::sgmt::{SgmtReader, SgmtWriter};
    use crate::export::types::{Sample, TrackFormat, SAMPLE_FLAG_KEY_FRAME};
    use tempfile::tempdir;

    /// Write a segment with video frames at `video_pts` and audio at `audio_pts` (ms)
    fn write_segment(path: &Path, video_pts: &[i64], audio_pts: Option<&[i64]>) {
        let mut writer: Box<dyn ContainerWriter> = Box::new(SgmtWriter::create(path).unwrap());
        let video = writer.add_track(TrackFormat::video("h264", 1920, 1080)).unwrap();
        let audio = audio_pts.map(|_| writer.add_track(TrackFormat::audio("aac", 48_000, 2)).unwrap());

        for (i, pts) in video_pts.iter().enumerate() {
            let sample = Sample {
                pts_us: pts * 1000,
                duration_us: 33_333,
                flags: if i == 0 { SAMPLE_FLAG_KEY_FRAME } else { 0 },
                data: vec![i as u8; 16],
            };
            writer.write_sample(video, &sample).unwrap();
        }
        if let (Some(track), Some(pts)) = (audio, audio_pts) {
            for pts in pts {
                let sample = Sample {
                    pts_us: pts * 1000,
                    duration_us: 20_000,
                    flags: 0,
                    data: vec![0xAA; 8],
                };
                writer.write_sample(track, &sample).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    fn read_track(path: &Path, kind: TrackKind) -> Vec<Sample> {
        let mut reader = SgmtReader::open(path).unwrap();
        let index = reader.tracks().iter().position(|t| t.kind == kind).unwrap();
        reader.samples(index).collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn test_second_segment_starts_after_first() {
        let dir = tempdir().unwrap();
        let s1 = dir.path().join("s1.sgmt");
        let s2 = dir.path().join("s2.sgmt");
        let out = dir.path().join("out.sgmt");
        write_segment(&s1, &[0, 1000, 2000, 3000], None);
        write_segment(&s2, &[0, 1000, 2000, 3000], None);

        let report = merge_files(&[s1, s2], &out).unwrap();

        let video = read_track(&out, TrackKind::Video);
        assert_eq!(video.len(), 8);
        assert!(video[4..].iter().all(|s| s.pts_us >= 3_000_000));
        assert!(video.windows(2).all(|w| w[0].pts_us <= w[1].pts_us));
        assert_eq!(video[5].pts_us - video[4].pts_us, 1_000_000);
        assert_eq!(report.duration().as_millis(), 6000);
    }

    #[test]
    fn test_single_segment_is_identity() {
        let dir = tempdir().unwrap();
        let s1 = dir.path().join("s1.sgmt");
        let out = dir.path().join("out.sgmt");
        write_segment(&s1, &[0, 33, 66, 100], Some(&[0, 20, 40]));

        let report = merge_files(&[s1.clone()], &out).unwrap();

        for kind in TrackKind::ALL {
            assert_eq!(read_track(&s1, kind), read_track(&out, kind));
        }
        assert_eq!(report.track(TrackKind::Video).unwrap().samples, 4);
        assert_eq!(report.track(TrackKind::Audio).unwrap().samples, 3);
    }

    #[test]
    fn test_offset_follows_actual_length_not_nominal() {
        let dir = tempdir().unwrap();
        let short = dir.path().join("short.sgmt");
        let next = dir.path().join("next.sgmt");
        let out = dir.path().join("out.sgmt");
        // Asked for 3s, only 1.2s captured
        write_segment(&short, &[0, 400, 800, 1200], None);
        write_segment(&next, &[0, 500], None);

        merge_files(&[short, next], &out).unwrap();

        let pts: Vec<i64> = read_track(&out, TrackKind::Video).iter().map(|s| s.pts_us).collect();
        assert_eq!(pts, vec![0, 400_000, 800_000, 1_200_000, 1_200_000, 1_700_000]);
    }

    #[test]
    fn test_flags_and_payload_preserved() {
        let dir = tempdir().unwrap();
        let s1 = dir.path().join("s1.sgmt");
        let s2 = dir.path().join("s2.sgmt");
        let out = dir.path().join("out.sgmt");
        write_segment(&s1, &[0, 40], None);
        write_segment(&s2, &[0, 40], None);

        merge_files(&[s1, s2], &out).unwrap();

        let video = read_track(&out, TrackKind::Video);
        let keys: Vec<bool> = video.iter().map(|s| s.is_key_frame()).collect();
        assert_eq!(keys, vec![true, false, true, false]);
        assert_eq!(video[3].data, vec![1u8; 16]);
        assert_eq!(video[3].duration_us, 33_333);
    }

    #[test]
    fn test_segment_without_audio_is_skipped_for_that_track() {
        let dir = tempdir().unwrap();
        let s1 = dir.path().join("s1.sgmt");
        let s2 = dir.path().join("s2.sgmt");
        let s3 = dir.path().join("s3.sgmt");
        let out = dir.path().join("out.sgmt");
        write_segment(&s1, &[0, 1000], Some(&[0, 980]));
        write_segment(&s2, &[0, 1000], None);
        write_segment(&s3, &[0, 1000], Some(&[0, 980]));

        let report = merge_files(&[s1, s2, s3], &out).unwrap();

        let audio: Vec<i64> = read_track(&out, TrackKind::Audio).iter().map(|s| s.pts_us).collect();
        assert_eq!(audio, vec![0, 980_000, 980_000, 1_960_000]);
        assert_eq!(report.track(TrackKind::Video).unwrap().samples, 6);
    }

    #[test]
    fn test_zero_segments_is_an_error() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.sgmt");
        let inputs: Vec<PathBuf> = Vec::new();

        assert!(matches!(merge_files(&inputs, &out), Err(MergeError::NothingToMerge)));
        assert!(!out.exists());
    }

    #[test]
    fn test_first_segment_without_tracks_is_an_error() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty.sgmt");
        let out = dir.path().join("out.sgmt");
        let writer: Box<dyn ContainerWriter> = Box::new(SgmtWriter::create(&empty).unwrap());
        writer.finish().unwrap();

        assert!(matches!(merge_files(&[empty], &out), Err(MergeError::NoTracks(_))));
        assert!(!out.exists());
    }

    #[test]
    fn test_timestamp_overflow_is_rejected() {
        let dir = tempdir().unwrap();
        let s1 = dir.path().join("s1.sgmt");
        let huge = dir.path().join("huge.sgmt");
        let out = dir.path().join("out.sgmt");
        write_segment(&s1, &[0, 1000], None);

        let mut writer: Box<dyn ContainerWriter> = Box::new(SgmtWriter::create(&huge).unwrap());
        let video = writer.add_track(TrackFormat::video("h264", 1920, 1080)).unwrap();
        let sample = Sample {
            pts_us: i64::MAX - 10,
            duration_us: 33_333,
            flags: SAMPLE_FLAG_KEY_FRAME,
            data: vec![0; 16],
        };
        writer.write_sample(video, &sample).unwrap();
        writer.finish().unwrap();

        let result = merge_files(&[s1, huge.clone()], &out);

        match result {
            Err(MergeError::InvalidContainer { path, .. }) => assert_eq!(path, huge),
            other => panic!("expected an invalid container error, got {:?}", other),
        }
        assert!(!out.exists());
    }

    #[test]
    fn test_failed_merge_discards_partial_output() {
        let dir = tempdir().unwrap();
        let s1 = dir.path().join("s1.sgmt");
        let broken = dir.path().join("broken.sgmt");
        let out = dir.path().join("out.sgmt");
        write_segment(&s1, &[0, 1000], None);
        std::fs::write(&broken, b"SGMT garbage").unwrap();

        let result = merge_files(&[s1, broken], &out);

        assert!(result.is_err());
        assert!(!out.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
