//! The frame loop: read, analyze, match, record, hand off side effects.

use crate::effects::{EffectsHandle, RenderRequest};
use chrono::NaiveTime;
use rollcall_core::{
    AnalyzerError, AttendanceLedger, AttendanceStatus, BoundingBox, Clock, EuclideanMatcher,
    FaceAnalyzer, Gallery, Identity, LedgerSnapshot, MatchResult, Matcher, RecordOutcome,
    StatusKind, TransitionEvent, ARRIVAL_FORMAT,
};
use rollcall_hw::{Frame, FrameSource, SourceError};
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub threshold: f32,
    /// Frames are shrunk by this factor before analysis; 1.0 disables it.
    pub detection_scale: f32,
    pub warmup_frames: usize,
    pub max_consecutive_failures: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            threshold: 1.10,
            detection_scale: 1.0,
            warmup_frames: 0,
            max_consecutive_failures: 30,
        }
    }
}

/// What happened to one detected face.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceStatus {
    /// First recognition this session; the ledger changed.
    CheckedIn { status: StatusKind, at: NaiveTime },
    /// Recognized, but the ledger already had an arrival.
    AlreadyRecorded(AttendanceStatus),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceOutcome {
    /// In original-frame coordinates.
    pub bbox: BoundingBox,
    pub identity: Option<Identity>,
    pub distance: Option<f32>,
    pub status: FaceStatus,
}

impl FaceOutcome {
    /// Short caption for drawing next to the face.
    pub fn label(&self) -> String {
        match (&self.identity, &self.status) {
            (Some(name), FaceStatus::CheckedIn { status, at }) => {
                format!("{name}: {status} {}", at.format(ARRIVAL_FORMAT))
            }
            (Some(name), FaceStatus::AlreadyRecorded(_)) => format!("{name}: already recorded"),
            _ => "Unknown".to_string(),
        }
    }
}

/// Per-frame result, in face order.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub sequence: u32,
    pub faces: Vec<FaceOutcome>,
    pub transitions: Vec<TransitionEvent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_read: u64,
    pub frames_analyzed: u64,
    pub dark_frames: u64,
    pub read_failures: u64,
    pub analyzer_errors: u64,
    pub faces: u64,
    pub transitions: u64,
    pub dropped_renders: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Quit requested (keyboard or signal).
    Operator,
    EndOfStream,
    /// The source disconnected or kept failing.
    DeviceLost(String),
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub snapshot: LedgerSnapshot,
    pub reason: StopReason,
    pub stats: PipelineStats,
}

pub struct FramePipeline<A, C> {
    gallery: Arc<Gallery>,
    matcher: EuclideanMatcher,
    ledger: AttendanceLedger,
    analyzer: A,
    clock: C,
    effects: EffectsHandle,
    settings: PipelineSettings,
    stats: PipelineStats,
}

impl<A: FaceAnalyzer, C: Clock> FramePipeline<A, C> {
    /// Start a session: every gallery identity begins absent.
    pub fn new(
        gallery: Arc<Gallery>,
        cutoff: NaiveTime,
        analyzer: A,
        clock: C,
        effects: EffectsHandle,
        settings: PipelineSettings,
    ) -> Self {
        let ledger = AttendanceLedger::from_gallery(&gallery, cutoff);
        Self {
            gallery,
            matcher: EuclideanMatcher,
            ledger,
            analyzer,
            clock,
            effects,
            settings,
            stats: PipelineStats::default(),
        }
    }

    #[cfg(test)]
    fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            dropped_renders: self.effects.dropped_renders(),
            ..self.stats
        }
    }

    /// Analyze one frame and apply every recognized face to the ledger.
    ///
    /// Dark frames are not analyzed and yield an empty report.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<FrameReport, AnalyzerError> {
        let mut report = FrameReport {
            sequence: frame.sequence,
            faces: Vec::new(),
            transitions: Vec::new(),
        };

        if frame.is_dark {
            self.stats.dark_frames += 1;
            return Ok(report);
        }

        let scale = self.settings.detection_scale;
        let analyzed: Cow<'_, Frame> = if scale > 0.0 && scale < 1.0 {
            Cow::Owned(frame.downscaled(scale))
        } else {
            Cow::Borrowed(frame)
        };
        let back_to_frame = frame.width as f32 / analyzed.width.max(1) as f32;

        let faces = self
            .analyzer
            .analyze(&analyzed.data, analyzed.width, analyzed.height)?;
        self.stats.frames_analyzed += 1;
        self.stats.faces += faces.len() as u64;

        let probes: Vec<_> = faces.iter().map(|f| &f.embedding).collect();
        let matches = self
            .matcher
            .compare_all(&probes, &self.gallery, self.settings.threshold);

        for (face, result) in faces.iter().zip(matches) {
            let distance = result.distance();
            let (identity, status) = match result {
                MatchResult::Identified { identity, .. } => {
                    let status = match self.ledger.record(identity.as_str(), &self.clock) {
                        RecordOutcome::Transitioned(event) => {
                            let status = FaceStatus::CheckedIn {
                                status: event.status,
                                at: event.at,
                            };
                            report.transitions.push(event);
                            status
                        }
                        RecordOutcome::AlreadyRecorded(existing) => {
                            FaceStatus::AlreadyRecorded(existing)
                        }
                        RecordOutcome::NotEnrolled => {
                            tracing::warn!(%identity, "matched identity missing from ledger");
                            FaceStatus::Unknown
                        }
                    };
                    (Some(identity), status)
                }
                MatchResult::Unknown { .. } => (None, FaceStatus::Unknown),
            };

            report.faces.push(FaceOutcome {
                bbox: face.bbox.scaled(back_to_frame),
                identity,
                distance,
                status,
            });
        }

        self.stats.transitions += report.transitions.len() as u64;
        tracing::debug!(
            sequence = frame.sequence,
            faces = report.faces.len(),
            transitions = report.transitions.len(),
            "frame processed"
        );
        Ok(report)
    }

    /// Announce transitions, then offer the frame to the renderer.
    fn dispatch(&mut self, frame: Frame, report: FrameReport) {
        for event in &report.transitions {
            self.effects.announce(event.clone());
        }
        self.effects.render(RenderRequest {
            frame: Arc::new(frame),
            report: Arc::new(report),
            board: Arc::new(self.ledger.snapshot()),
        });
    }

    /// Drive the loop until `stop` fires, the source ends or the source is lost.
    ///
    /// Consumes the pipeline; dropping it closes the effects queue.
    pub fn run<S: FrameSource + ?Sized>(
        mut self,
        source: &mut S,
        stop: &CancellationToken,
    ) -> SessionOutcome {
        let mut warmup = self.settings.warmup_frames;
        let mut consecutive_failures = 0usize;

        let reason = loop {
            if stop.is_cancelled() {
                break StopReason::Operator;
            }

            let frame = match source.next_frame() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    frame
                }
                Err(SourceError::Transient(msg)) => {
                    consecutive_failures += 1;
                    self.stats.read_failures += 1;
                    tracing::warn!(error = %msg, consecutive = consecutive_failures, "frame read failed; skipping");
                    if consecutive_failures >= self.settings.max_consecutive_failures {
                        break StopReason::DeviceLost(format!(
                            "{consecutive_failures} consecutive read failures, last: {msg}"
                        ));
                    }
                    continue;
                }
                Err(SourceError::Disconnected(msg)) => break StopReason::DeviceLost(msg),
                Err(SourceError::EndOfStream) => break StopReason::EndOfStream,
            };
            self.stats.frames_read += 1;

            if warmup > 0 {
                warmup -= 1;
                continue;
            }

            match self.process_frame(&frame) {
                Ok(report) => self.dispatch(frame, report),
                Err(e) => {
                    self.stats.analyzer_errors += 1;
                    tracing::warn!(sequence = frame.sequence, error = %e, "analysis failed; frame skipped");
                }
            }
        };

        let stats = self.stats();
        let summary = self.ledger.summary();
        tracing::info!(
            ?reason,
            frames = stats.frames_read,
            present = summary.present,
            late = summary.late,
            absent = summary.absent,
            "session ended"
        );

        SessionOutcome {
            snapshot: self.ledger.snapshot(),
            reason,
            stats,
        }
    }
}
