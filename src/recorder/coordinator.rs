//! Capture coordinator
//!
//! Owns the buffer state machine. All buffering and capture work happens on
//! one tokio task; callers talk to it through a cloneable [`ReplayHandle`].
//! While a session is waiting on the recorder or the merge, the task keeps
//! answering control messages, so a second trigger is refused right away
//! instead of queueing behind the first.

use super::buffering::{BufferingLoop, InFlight};
use super::channel::SegmentRecorder;
use super::config::{BufferConfig, ConfigError, PostBufferStrategy};
use super::segment::discard_all;
use super::state::{BufferState, CaptureSession, MergedOutput, RecorderEvent};
use super::telemetry::{EventPublisher, TelemetrySink};
use crate::export::pipeline::MergePipeline;
use crate::utils::error::{CaptureError, CaptureErrorKind, CaptureResult};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use uuid::Uuid;

const COMMAND_QUEUE: usize = 32;
const EVENT_CAPACITY: usize = 64;

enum Command {
    Enable {
        pre_buffer: Duration,
        post_buffer: Duration,
        reply: oneshot::Sender<CaptureResult<()>>,
    },
    Disable {
        reply: oneshot::Sender<()>,
    },
    Trigger {
        output: Option<PathBuf>,
        reply: oneshot::Sender<CaptureResult<MergedOutput>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Builder for the capture task
pub struct ReplayCoordinator {
    recorder: Arc<dyn SegmentRecorder>,
    config: BufferConfig,
    pipeline: MergePipeline,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl ReplayCoordinator {
    pub fn new(recorder: Arc<dyn SegmentRecorder>, config: BufferConfig) -> Self {
        Self {
            recorder,
            config,
            pipeline: MergePipeline::default(),
            telemetry: None,
        }
    }

    /// Also send every lifecycle event to `sink`
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Merge with a different container family
    pub fn with_pipeline(mut self, pipeline: MergePipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Start the capture task on the current tokio runtime
    ///
    /// The task starts in `Idle`; call `enable_buffer_mode` to begin
    /// buffering. It runs until `shutdown` is called or every handle is
    /// dropped.
    pub fn spawn(self) -> Result<ReplayHandle, ConfigError> {
        self.config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(BufferState::Idle);
        let events = EventPublisher::new(EVENT_CAPACITY, self.telemetry);

        tracing::info!("Starting replay buffer with recorder {}", self.recorder.id());

        let orchestrator = Orchestrator {
            buffering: BufferingLoop::new(self.recorder.clone(), &self.config),
            recorder: self.recorder,
            config: self.config,
            enabled: false,
            closing: false,
            state: BufferState::Idle,
            state_tx,
            pipeline: Arc::new(self.pipeline),
            events: events.clone(),
            commands: command_rx,
            shutdown_replies: Vec::new(),
        };
        tokio::spawn(orchestrator.run());

        Ok(ReplayHandle {
            commands: command_tx,
            state: state_rx,
            events,
        })
    }
}

/// Control surface of a running replay buffer
#[derive(Clone)]
pub struct ReplayHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<BufferState>,
    events: EventPublisher,
}

impl ReplayHandle {
    /// Turn buffer mode on with the given pre/post durations
    ///
    /// While a capture is in progress the new durations apply to the next
    /// buffering cycle.
    pub async fn enable_buffer_mode(&self, pre_buffer: Duration, post_buffer: Duration) -> CaptureResult<()> {
        self.request(|reply| Command::Enable {
            pre_buffer,
            post_buffer,
            reply,
        })
        .await?
    }

    /// Turn buffer mode off
    ///
    /// Buffered segments are deleted. A capture in progress still completes,
    /// after which the buffer goes idle.
    pub async fn disable_buffer_mode(&self) -> CaptureResult<()> {
        self.request(|reply| Command::Disable { reply }).await
    }

    /// Capture the buffered footage plus the post-buffer into a file in the
    /// configured output directory
    pub async fn trigger_capture(&self) -> CaptureResult<MergedOutput> {
        self.request(|reply| Command::Trigger { output: None, reply }).await?
    }

    /// Same as `trigger_capture`, writing to `path`
    pub async fn trigger_capture_to(&self, path: impl Into<PathBuf>) -> CaptureResult<MergedOutput> {
        let output = Some(path.into());
        self.request(|reply| Command::Trigger { output, reply }).await?
    }

    pub fn state(&self) -> BufferState {
        *self.state.borrow()
    }

    /// Wait until the buffer reaches `target`
    pub async fn wait_for_state(&self, target: BufferState) -> CaptureResult<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| stopped())
    }

    /// Lifecycle events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    /// Stop buffering, delete buffered segments and end the task
    ///
    /// A capture in progress is allowed to finish first.
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            tracing::debug!("Replay buffer already stopped");
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> CaptureResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }
}

fn stopped() -> CaptureError {
    CaptureError::unavailable("replay buffer has shut down")
}

/// Default file name for a capture: `replay-YYYYmmdd-HHMMSS-<id>.<ext>`
pub fn default_output_path(dir: &Path, session_id: Uuid, extension: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let id = session_id.simple().to_string();
    dir.join(format!("replay-{}-{}.{}", stamp, &id[..8], extension))
}

struct Orchestrator {
    config: BufferConfig,
    enabled: bool,
    closing: bool,
    state: BufferState,
    state_tx: watch::Sender<BufferState>,
    buffering: BufferingLoop,
    recorder: Arc<dyn SegmentRecorder>,
    pipeline: Arc<MergePipeline>,
    events: EventPublisher,
    commands: mpsc::Receiver<Command>,
    shutdown_replies: Vec<oneshot::Sender<()>>,
}

impl Orchestrator {
    async fn run(mut self) {
        while !self.closing {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::debug!("All replay handles dropped");
                        self.closing = true;
                    }
                },
                step = self.buffering.next_step() => {
                    if let Some(event) = self.buffering.handle(step) {
                        self.events.publish(event);
                    }
                }
            }
        }

        self.enabled = false;
        self.drain_buffering().await;
        let discarded = self.buffering.discard_window();
        tracing::debug!("Discarded {} buffered segments", discarded);
        self.set_state(BufferState::Idle);
        tracing::info!("Replay buffer stopped");

        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enable {
                pre_buffer,
                post_buffer,
                reply,
            } => {
                let result = self.enable(pre_buffer, post_buffer);
                let _ = reply.send(result);
            }
            Command::Disable { reply } => {
                self.disable().await;
                let _ = reply.send(());
            }
            Command::Trigger { output, reply } => {
                let result = self.capture(output).await;
                // The caller may have given up waiting
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                self.shutdown_replies.push(reply);
                self.closing = true;
            }
        }
    }

    /// Answer a command without suspending; used while a session or a drain
    /// is in progress
    fn handle_busy(&mut self, command: Command) {
        match command {
            Command::Enable {
                pre_buffer,
                post_buffer,
                reply,
            } => {
                let result = self.apply_durations(pre_buffer, post_buffer).map(|()| {
                    self.enabled = true;
                });
                let _ = reply.send(result);
            }
            Command::Disable { reply } => {
                tracing::info!("Buffer mode disabled, going idle once the current work completes");
                self.enabled = false;
                let _ = reply.send(());
            }
            Command::Trigger { reply, .. } => {
                let error = if self.state.is_busy() {
                    CaptureError::busy(format!("a capture is already {}", self.state))
                } else {
                    CaptureError::unavailable("buffer mode is being disabled")
                };
                tracing::debug!("Rejecting trigger: {}", error);
                let _ = reply.send(Err(error));
            }
            Command::Shutdown { reply } => {
                self.shutdown_replies.push(reply);
                self.closing = true;
            }
        }
    }

    /// Await `fut` while still answering control messages
    async fn guarded<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return output,
                command = self.commands.recv(), if !self.closing => match command {
                    Some(command) => self.handle_busy(command),
                    None => self.closing = true,
                },
            }
        }
    }

    fn set_state(&mut self, next: BufferState) {
        if self.state == next {
            return;
        }
        let from = std::mem::replace(&mut self.state, next);
        tracing::info!("Buffer state: {} -> {}", from, next);
        self.state_tx.send_replace(next);
        self.events.publish(RecorderEvent::StateChanged { from, to: next });
    }

    fn apply_durations(&mut self, pre_buffer: Duration, post_buffer: Duration) -> CaptureResult<()> {
        let config = self.config.with_durations(pre_buffer, post_buffer);
        config.validate()?;
        self.config = config;
        Ok(())
    }

    fn enable(&mut self, pre_buffer: Duration, post_buffer: Duration) -> CaptureResult<()> {
        self.apply_durations(pre_buffer, post_buffer)?;
        self.enabled = true;
        tracing::info!(
            "Buffer mode enabled: {}ms before, {}ms after",
            self.config.pre_buffer_ms,
            self.config.post_buffer_ms
        );
        self.resume_or_idle();
        Ok(())
    }

    async fn disable(&mut self) {
        self.enabled = false;
        if self.state != BufferState::Buffering {
            return;
        }
        self.drain_buffering().await;
        let discarded = self.buffering.discard_window();
        tracing::debug!("Discarded {} buffered segments", discarded);
        self.resume_or_idle();
    }

    /// Buffer again if buffer mode is (still) on, otherwise go idle
    fn resume_or_idle(&mut self) {
        let evicted = self.buffering.reconfigure(&self.config);
        if !evicted.is_empty() {
            tracing::debug!("Window shrank, evicted segments {:?}", evicted);
        }
        if self.enabled && !self.closing {
            self.buffering.start();
            self.set_state(BufferState::Buffering);
        } else {
            self.set_state(BufferState::Idle);
        }
    }

    /// Stop buffering and wait (bounded) for the in-flight segment
    ///
    /// A partial segment is never buffered; its file is deleted. A segment
    /// that still reached its full length goes into the window.
    async fn drain_buffering(&mut self) {
        let in_flight = match self.buffering.stop() {
            Some(in_flight) => in_flight,
            None => return,
        };
        let limit = self.config.early_stop_timeout();
        match self.guarded(tokio::time::timeout(limit, in_flight)).await {
            Ok(Ok(segment)) if segment.is_complete() => {
                let evicted = self.buffering.keep(segment);
                if !evicted.is_empty() {
                    tracing::debug!("Evicted segments {:?} for a drained segment", evicted);
                }
            }
            Ok(Ok(segment)) => {
                tracing::debug!(
                    "Discarding partial segment {} ({}ms of {}ms)",
                    segment.sequence,
                    segment.recorded_duration.as_millis(),
                    segment.nominal_duration.as_millis()
                );
                segment.discard();
            }
            Ok(Err(e)) => tracing::debug!("In-flight segment ended with an error: {}", e),
            Err(_) => tracing::warn!(
                "In-flight segment ignored the early stop for {}ms, abandoning it",
                limit.as_millis()
            ),
        }
    }

    async fn capture(&mut self, output: Option<PathBuf>) -> CaptureResult<MergedOutput> {
        if self.state != BufferState::Buffering {
            return Err(CaptureError::unavailable("buffer mode is not enabled"));
        }

        let session_id = Uuid::new_v4();
        let output = output.unwrap_or_else(|| {
            default_output_path(&self.config.output_dir, session_id, self.pipeline.extension())
        });
        let mut session = CaptureSession::new(session_id, output);

        tracing::info!("Capture {} triggered, output {:?}", session_id, session.output_path);
        self.set_state(BufferState::Capturing);
        self.drain_buffering().await;

        session.pre_segments = self.buffering.snapshot();
        // The session owns these files from here on
        self.buffering.release_window();

        let result = self.run_session(&mut session).await;
        self.finish_session(session, result)
    }

    async fn run_session(&mut self, session: &mut CaptureSession) -> CaptureResult<MergedOutput> {
        if session.pre_segments.is_empty() {
            return Err(CaptureError::new(
                CaptureErrorKind::NoPreBufferSegments,
                "no completed segment in the buffer yet",
            ));
        }
        self.events.publish(RecorderEvent::CaptureStarted {
            session_id: session.id,
            pre_segments: session.pre_segments.len(),
        });

        let timed_out = self.record_post_buffer(session).await?;
        tracing::info!(
            "Post-buffer recorded: {} segments ({}ms){}",
            session.post_segments.len(),
            session.post_buffer_recorded().as_millis(),
            if timed_out { ", cut short" } else { "" }
        );
        self.events.publish(RecorderEvent::PostBufferRecorded {
            session_id: session.id,
            post_segments: session.post_segments.len(),
            timed_out,
        });

        self.set_state(BufferState::Merging);
        self.merge(session).await
    }

    /// Record the post-buffer, returning whether the deadline cut it short
    async fn record_post_buffer(&mut self, session: &mut CaptureSession) -> CaptureResult<bool> {
        let target = self.config.post_buffer();
        let deadline = Instant::now() + self.config.post_buffer_deadline();
        let (segment_length, max_segments) = match self.config.post_buffer_strategy {
            PostBufferStrategy::Continuous => (target, 1),
            PostBufferStrategy::Segmented { segment_ms } => {
                (Duration::from_millis(segment_ms), self.config.max_post_segments)
            }
        };

        let mut recorded = Duration::ZERO;
        while recorded < target && session.post_segments.len() < max_segments {
            let length = segment_length.min(target - recorded);
            let recorder = self.recorder.clone();
            let mut segment: InFlight = Box::pin(async move { recorder.begin(length).await });

            let outcome = self.guarded(tokio::time::timeout_at(deadline, &mut segment)).await;
            let completed = match outcome {
                Ok(completed) => completed?,
                Err(_) => {
                    tracing::warn!(
                        "Post-buffer passed its {}ms deadline, stopping early",
                        self.config.post_buffer_deadline().as_millis()
                    );
                    self.recorder.request_early_stop();
                    let limit = self.config.early_stop_timeout();
                    match self.guarded(tokio::time::timeout(limit, segment)).await {
                        Ok(Ok(partial)) => session.post_segments.push(Arc::new(partial)),
                        Ok(Err(e)) => tracing::warn!("Post-buffer segment failed after early stop: {}", e),
                        Err(_) => tracing::warn!("Recorder ignored the early stop, using what was captured"),
                    }
                    return Ok(true);
                }
            };

            tracing::debug!("Post-buffer segment {} complete", completed.sequence);
            recorded += completed.nominal_duration;
            session.post_segments.push(Arc::new(completed));
        }
        Ok(false)
    }

    async fn merge(&mut self, session: &CaptureSession) -> CaptureResult<MergedOutput> {
        let sources: Vec<PathBuf> = session.segments().map(|s| s.path.clone()).collect();
        let output = session.output_path.clone();
        let pipeline = self.pipeline.clone();

        let job = {
            let sources = sources.clone();
            tokio::task::spawn_blocking(move || {
                if let Some(parent) = output.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                pipeline.run(&sources, &output)
            })
        };

        let report = match self.guarded(job).await {
            Ok(result) => result?,
            Err(e) => {
                return Err(CaptureError::new(
                    CaptureErrorKind::MergeIoError,
                    format!("merge task failed: {}", e),
                ))
            }
        };

        Ok(MergedOutput {
            session_id: session.id,
            path: report.output_path.clone(),
            duration_ms: report.duration().as_millis() as u64,
            pre_segments: session.pre_segments.len(),
            post_segments: session.post_segments.len(),
            sources,
            report,
        })
    }

    /// Cleanup that runs whatever the session outcome
    fn finish_session(
        &mut self,
        session: CaptureSession,
        result: CaptureResult<MergedOutput>,
    ) -> CaptureResult<MergedOutput> {
        let failed = discard_all(session.segments());
        if failed > 0 {
            tracing::warn!(
                "CLEANUP_WARNING: {} of {} segments from capture {} could not be deleted",
                failed,
                session.segment_count(),
                session.id
            );
        }

        match &result {
            Ok(merged) => {
                tracing::info!(
                    "Capture {} complete: {:?} ({}ms from {} segments)",
                    session.id,
                    merged.path,
                    merged.duration_ms,
                    merged.segment_count()
                );
                self.events.publish(RecorderEvent::CaptureCompleted {
                    session_id: session.id,
                    segments: merged.segment_count(),
                    duration_ms: merged.duration_ms,
                    merge_ms: merged.report.elapsed_ms,
                });
            }
            Err(e) => {
                tracing::error!("Capture {} failed: {}", session.id, e);
                self.events.publish(RecorderEvent::CaptureFailed {
                    session_id: session.id,
                    kind: e.kind,
                    message: e.message.clone(),
                });
            }
        }

        self.resume_or_idle();
        result
    }
}
