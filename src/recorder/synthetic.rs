//! Synthetic segment recorder
//!
//! Produces SGMT segments filled with generated samples instead of camera
//! output. Handy for exercising the buffer on machines without a capture
//! device, and used throughout the tests.

use super::channel::{RecorderError, RecorderResult, SegmentRecorder};
use super::segment::Segment;
use crate::export::container::ContainerWriter;
use crate::export::sgmt::SgmtWriter;
use crate::export::types::{MergeError, Sample, TrackFormat, SAMPLE_FLAG_KEY_FRAME};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Shape of the generated media
#[derive(Debug, Clone)]
pub struct SyntheticRecorderConfig {
    /// Directory segment files are written to
    pub dir: PathBuf,
    /// Spacing of video frames
    pub frame_interval: Duration,
    /// Every n-th frame is a key frame
    pub keyframe_interval: u32,
    /// Whether segments carry an audio track
    pub audio: bool,
    /// Spacing of audio frames
    pub audio_frame_interval: Duration,
    /// Payload size of each generated sample
    pub payload_bytes: usize,
}

impl SyntheticRecorderConfig {
    /// 25 fps video with audio, written to `dir`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            frame_interval: Duration::from_millis(40),
            keyframe_interval: 25,
            audio: true,
            audio_frame_interval: Duration::from_millis(20),
            payload_bytes: 64,
        }
    }
}

#[derive(Default)]
struct Script {
    failures: VecDeque<String>,
    requested: Vec<Duration>,
}

/// Resets the in-flight marker even if the recording future is dropped
struct InFlightGuard<'a> {
    in_flight: &'a AtomicBool,
    stop_requested: &'a AtomicBool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
    }
}

/// Recorder writing generated segments in real (or paused tokio) time
pub struct SyntheticRecorder {
    id: String,
    config: SyntheticRecorderConfig,
    next_sequence: AtomicU64,
    in_flight: AtomicBool,
    stop_requested: AtomicBool,
    stop_signal: Notify,
    script: Mutex<Script>,
}

impl SyntheticRecorder {
    pub fn new(config: SyntheticRecorderConfig) -> Self {
        Self {
            id: format!("synthetic:{}", config.dir.display()),
            config,
            next_sequence: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stop_signal: Notify::new(),
            script: Mutex::new(Script::default()),
        }
    }

    /// Make the next `count` calls to `begin` fail with `message`
    pub fn fail_next(&self, count: usize, message: &str) {
        let mut script = self.script.lock();
        script.failures.extend(std::iter::repeat(message.to_string()).take(count));
    }

    /// Durations passed to `begin`, in call order
    pub fn requested_durations(&self) -> Vec<Duration> {
        self.script.lock().requested.clone()
    }

    fn write_segment(&self, path: &Path, elapsed: Duration, sequence: u64) -> Result<(), MergeError> {
        let mut writer: Box<dyn ContainerWriter> = Box::new(SgmtWriter::create(path)?);
        let video = writer.add_track(TrackFormat::video("h264", 1280, 720))?;
        let audio = if self.config.audio {
            Some(writer.add_track(TrackFormat::audio("aac", 48_000, 2))?)
        } else {
            None
        };

        let elapsed_us = elapsed.as_micros() as i64;
        let frame_us = self.config.frame_interval.as_micros().max(1) as i64;
        let keyframe_interval = u64::from(self.config.keyframe_interval.max(1));

        let mut frame = 0u64;
        while (frame as i64) * frame_us < elapsed_us {
            let flags = if frame % keyframe_interval == 0 {
                SAMPLE_FLAG_KEY_FRAME
            } else {
                0
            };
            writer.write_sample(video, &self.sample(sequence, frame, frame_us, flags))?;
            frame += 1;
        }

        if let Some(audio) = audio {
            let audio_us = self.config.audio_frame_interval.as_micros().max(1) as i64;
            let mut index = 0u64;
            while (index as i64) * audio_us < elapsed_us {
                writer.write_sample(audio, &self.sample(sequence, index, audio_us, SAMPLE_FLAG_KEY_FRAME))?;
                index += 1;
            }
        }

        writer.finish()
    }

    fn sample(&self, sequence: u64, index: u64, interval_us: i64, flags: u8) -> Sample {
        let mut data = vec![(sequence & 0xFF) as u8; self.config.payload_bytes.max(8)];
        data[..8].copy_from_slice(&index.to_le_bytes());
        Sample {
            pts_us: index as i64 * interval_us,
            duration_us: interval_us as u32,
            flags,
            data,
        }
    }
}

#[async_trait]
impl SegmentRecorder for SyntheticRecorder {
    fn id(&self) -> &str {
        &self.id
    }

    async fn begin(&self, duration: Duration) -> RecorderResult<Segment> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(RecorderError::AlreadyRecording);
        }
        let _guard = InFlightGuard {
            in_flight: &self.in_flight,
            stop_requested: &self.stop_requested,
        };

        let failure = {
            let mut script = self.script.lock();
            script.requested.push(duration);
            script.failures.pop_front()
        };
        if let Some(message) = failure {
            return Err(RecorderError::StartFailed(message));
        }

        let started = Instant::now();
        let full_length = tokio::time::sleep(duration);
        tokio::pin!(full_length);
        loop {
            tokio::select! {
                _ = &mut full_length => break,
                _ = self.stop_signal.notified() => {
                    if self.stop_requested.swap(false, Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        let elapsed = started.elapsed().min(duration);
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.config.dir.join(format!("segment-{:06}.sgmt", sequence));

        self.write_segment(&path, elapsed, sequence).map_err(|e| match e {
            MergeError::Io(io) => RecorderError::Io(io),
            other => RecorderError::Aborted(other.to_string()),
        })?;

        tracing::debug!(
            "Synthetic segment {} complete: {}ms of {}ms",
            sequence,
            elapsed.as_millis(),
            duration.as_millis()
        );
        Ok(Segment::new(sequence, path, duration).with_recorded(elapsed))
    }

    fn request_early_stop(&self) {
        if !self.in_flight.load(Ordering::SeqCst) {
            tracing::debug!("Early stop requested with nothing recording, ignoring it");
            return;
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_signal.notify_one();
    }
}
