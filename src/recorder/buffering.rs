//! Continuous buffering loop
//!
//! Records one segment after another into the sliding window. The loop is
//! driven step by step by the orchestrator task: `next_step` waits for the
//! in-flight segment (or the retry timer) and `handle` decides what happens
//! next. The `running` flag is checked after every completion, before the
//! next `begin` is issued, which is what lets a capture stop buffering
//! without racing an already scheduled segment.

use super::channel::{RecorderResult, SegmentRecorder};
use super::config::BufferConfig;
use super::segment::{Segment, SharedSegment};
use super::state::RecorderEvent;
use super::window::SegmentWindow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Sleep;

/// A segment recording that has been started but not yet observed complete
pub type InFlight = Pin<Box<dyn Future<Output = RecorderResult<Segment>> + Send>>;

/// What the loop observed
pub enum LoopStep {
    /// The in-flight segment resolved
    Completed(RecorderResult<Segment>),
    /// The backoff after a failure elapsed
    RetryDue,
}

pub struct BufferingLoop {
    recorder: Arc<dyn SegmentRecorder>,
    window: SegmentWindow,
    segment_duration: Duration,
    retry_backoff: Duration,
    degraded_threshold: u32,
    running: bool,
    in_flight: Option<InFlight>,
    /// Set once `next_step` has polled the in-flight `begin`
    in_flight_started: bool,
    retry: Option<Pin<Box<Sleep>>>,
    consecutive_failures: u32,
}

impl BufferingLoop {
    pub fn new(recorder: Arc<dyn SegmentRecorder>, config: &BufferConfig) -> Self {
        Self {
            recorder,
            window: SegmentWindow::new(config.pre_buffer(), config.segment_duration()),
            segment_duration: config.segment_duration(),
            retry_backoff: config.retry_backoff(),
            degraded_threshold: config.degraded_threshold.max(1),
            running: false,
            in_flight: None,
            in_flight_started: false,
            retry: None,
            consecutive_failures: 0,
        }
    }

    /// Apply new durations; takes effect from the next segment
    pub fn reconfigure(&mut self, config: &BufferConfig) -> Vec<u64> {
        self.segment_duration = config.segment_duration();
        self.retry_backoff = config.retry_backoff();
        self.degraded_threshold = config.degraded_threshold.max(1);
        self.window.resize(config.pre_buffer(), config.segment_duration())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn window(&self) -> &SegmentWindow {
        &self.window
    }

    /// Start (or keep) looping
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        tracing::info!(
            "Buffering started with {} ({}ms segments, window of {})",
            self.recorder.id(),
            self.segment_duration.as_millis(),
            self.window.capacity()
        );
        self.running = true;
        self.consecutive_failures = 0;
        if self.in_flight.is_none() && self.retry.is_none() {
            self.issue();
        }
    }

    fn issue(&mut self) {
        let recorder = self.recorder.clone();
        let duration = self.segment_duration;
        self.in_flight = Some(Box::pin(async move { recorder.begin(duration).await }));
        self.in_flight_started = false;
    }

    /// Wait for the next thing the loop has to react to
    ///
    /// Cancel safe: dropping the returned future leaves the in-flight segment
    /// and the retry timer untouched. Never resolves while the loop is idle.
    pub async fn next_step(&mut self) -> LoopStep {
        if let Some(in_flight) = self.in_flight.as_mut() {
            self.in_flight_started = true;
            let result = in_flight.await;
            self.in_flight = None;
            self.in_flight_started = false;
            return LoopStep::Completed(result);
        }
        if let Some(retry) = self.retry.as_mut() {
            retry.await;
            self.retry = None;
            return LoopStep::RetryDue;
        }
        std::future::pending().await
    }

    /// React to a step, issuing the next `begin` only while still running
    pub fn handle(&mut self, step: LoopStep) -> Option<RecorderEvent> {
        match step {
            LoopStep::Completed(Ok(segment)) if self.running => {
                self.consecutive_failures = 0;
                let sequence = segment.sequence;
                let evicted = self.window.push(Arc::new(segment));
                self.issue();
                Some(RecorderEvent::SegmentBuffered {
                    sequence,
                    window_len: self.window.len(),
                    evicted,
                })
            }
            LoopStep::Completed(Ok(segment)) => {
                tracing::debug!("Segment {} completed after buffering stopped", segment.sequence);
                segment.discard();
                None
            }
            LoopStep::Completed(Err(e)) if self.running => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    "Buffering segment failed ({} in a row), retrying in {}ms: {}",
                    self.consecutive_failures,
                    self.retry_backoff.as_millis(),
                    e
                );
                self.retry = Some(Box::pin(tokio::time::sleep(self.retry_backoff)));

                let over = self.consecutive_failures.checked_sub(self.degraded_threshold)?;
                if over % self.degraded_threshold == 0 {
                    tracing::warn!(
                        "Buffering degraded after {} consecutive failures",
                        self.consecutive_failures
                    );
                    Some(RecorderEvent::BufferingDegraded {
                        consecutive_failures: self.consecutive_failures,
                        last_error: e.to_string(),
                    })
                } else {
                    None
                }
            }
            LoopStep::Completed(Err(e)) => {
                tracing::debug!("Segment failed after buffering stopped: {}", e);
                None
            }
            LoopStep::RetryDue => {
                if self.running {
                    self.issue();
                }
                None
            }
        }
    }

    /// Stop looping
    ///
    /// Asks the recorder to end the in-flight segment early and hands that
    /// segment back so the caller can wait for it to drain. A `begin` that
    /// was issued but never polled has not reached the recorder yet, so it is
    /// dropped without an early stop and nothing is handed back.
    pub fn stop(&mut self) -> Option<InFlight> {
        if self.running {
            tracing::info!("Buffering stopped ({} segments held)", self.window.len());
        }
        self.running = false;
        self.retry = None;
        let started = std::mem::take(&mut self.in_flight_started);
        match self.in_flight.take() {
            Some(in_flight) if started => {
                self.recorder.request_early_stop();
                Some(in_flight)
            }
            Some(_) => {
                tracing::debug!("Dropping a segment that never started recording");
                None
            }
            None => None,
        }
    }

    /// Put a full-length segment drained after `stop` back into the window
    pub fn keep(&mut self, segment: Segment) -> Vec<u64> {
        tracing::debug!("Keeping drained segment {}", segment.sequence);
        self.window.push(Arc::new(segment))
    }

    /// Ordered copy of the window
    pub fn snapshot(&self) -> Vec<SharedSegment> {
        self.window.snapshot()
    }

    /// Forget the window contents; their files now belong to a session
    pub fn release_window(&mut self) {
        self.window.clear();
    }

    /// Delete everything held in the window, returning how many segments it held
    pub fn discard_window(&mut self) -> usize {
        self.window.drain_and_discard()
    }
}
