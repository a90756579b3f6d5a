//! Side effects (rendering, announcements) on their own thread.
//!
//! The frame loop talks to the consumer through a bounded channel. Transition
//! announcements block for room and are never lost; render requests are
//! offered without waiting and dropped when the consumer is behind.

use crate::pipeline::FrameReport;
use rollcall_core::{LedgerSnapshot, TransitionEvent};
use rollcall_hw::Frame;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("command failed: {0}")]
    Command(String),
}

/// Everything a renderer needs to draw one processed frame.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub frame: Arc<Frame>,
    pub report: Arc<FrameReport>,
    pub board: Arc<LedgerSnapshot>,
}

#[derive(Debug)]
pub enum Effect {
    Announce(TransitionEvent),
    Render(RenderRequest),
}

pub trait Renderer: Send {
    fn render(&mut self, request: &RenderRequest) -> Result<(), SinkError>;
}

pub trait Announcer: Send {
    fn announce(&mut self, event: &TransitionEvent) -> Result<(), SinkError>;

    /// Called once after the last event.
    fn finish(&mut self) {}
}

impl<R: Renderer + ?Sized> Renderer for Box<R> {
    fn render(&mut self, request: &RenderRequest) -> Result<(), SinkError> {
        (**self).render(request)
    }
}

impl<A: Announcer + ?Sized> Announcer for Box<A> {
    fn announce(&mut self, event: &TransitionEvent) -> Result<(), SinkError> {
        (**self).announce(event)
    }

    fn finish(&mut self) {
        (**self).finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectsStats {
    pub announced: u64,
    pub rendered: u64,
    pub failed: u64,
}

/// Producer side, owned by the frame loop.
pub struct EffectsHandle {
    tx: mpsc::Sender<Effect>,
    dropped_renders: u64,
}

impl EffectsHandle {
    /// Queue an announcement, waiting for room if the consumer is behind.
    ///
    /// Must not be called from inside an async context.
    pub fn announce(&mut self, event: TransitionEvent) {
        if self.tx.blocking_send(Effect::Announce(event)).is_err() {
            tracing::warn!("effects consumer gone; announcement lost");
        }
    }

    /// Offer a render request; returns false if it was dropped.
    pub fn render(&mut self, request: RenderRequest) -> bool {
        match self.tx.try_send(Effect::Render(request)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped_renders += 1;
                tracing::debug!(dropped = self.dropped_renders, "render queue full; frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped_renders += 1;
                false
            }
        }
    }

    pub fn dropped_renders(&self) -> u64 {
        self.dropped_renders
    }
}

/// Consumer side. Dropping every [`EffectsHandle`] ends the thread.
pub struct EffectsWorker {
    join: JoinHandle<EffectsStats>,
}

impl EffectsWorker {
    /// Wait for the consumer to drain its queue.
    pub fn finish(self) -> EffectsStats {
        self.join.join().unwrap_or_else(|_| {
            tracing::error!("effects thread panicked");
            EffectsStats::default()
        })
    }
}

/// Start the consumer thread.
pub fn spawn_effects<R, A>(
    mut renderer: R,
    mut announcer: A,
    capacity: usize,
) -> std::io::Result<(EffectsHandle, EffectsWorker)>
where
    R: Renderer + 'static,
    A: Announcer + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Effect>(capacity.max(1));

    let join = std::thread::Builder::new()
        .name("rollcall-effects".into())
        .spawn(move || {
            let mut stats = EffectsStats::default();
            while let Some(effect) = rx.blocking_recv() {
                let result = match &effect {
                    Effect::Announce(event) => announcer.announce(event).map(|()| stats.announced += 1),
                    Effect::Render(request) => renderer.render(request).map(|()| stats.rendered += 1),
                };
                if let Err(e) = result {
                    stats.failed += 1;
                    tracing::warn!(error = %e, "side effect failed");
                }
            }
            announcer.finish();
            tracing::debug!(?stats, "effects thread exiting");
            stats
        })?;

    Ok((
        EffectsHandle {
            tx,
            dropped_renders: 0,
        },
        EffectsWorker { join },
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveTime;
    use rollcall_core::StatusKind;
    use std::sync::mpsc as std_mpsc;
    use std::sync::{Arc, Mutex};

    /// Records announced names; optionally fails on one of them.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingAnnouncer {
        pub names: Arc<Mutex<Vec<String>>>,
        pub fail_on: Option<&'static str>,
    }

    impl Announcer for RecordingAnnouncer {
        fn announce(&mut self, event: &TransitionEvent) -> Result<(), SinkError> {
            if self.fail_on == Some(event.identity.as_str()) {
                return Err(SinkError::Command("speaker unplugged".into()));
            }
            self.names.lock().unwrap().push(event.identity.to_string());
            Ok(())
        }
    }

    /// Counts render calls.
    #[derive(Clone, Default)]
    pub(crate) struct CountingRenderer {
        pub sequences: Arc<Mutex<Vec<u32>>>,
    }

    impl Renderer for CountingRenderer {
        fn render(&mut self, request: &RenderRequest) -> Result<(), SinkError> {
            self.sequences.lock().unwrap().push(request.report.sequence);
            Ok(())
        }
    }

    /// Blocks every render until the test releases it.
    struct GatedRenderer {
        gate: std_mpsc::Receiver<()>,
    }

    impl Renderer for GatedRenderer {
        fn render(&mut self, _request: &RenderRequest) -> Result<(), SinkError> {
            let _ = self.gate.recv();
            Ok(())
        }
    }

    fn event(name: &str) -> TransitionEvent {
        TransitionEvent {
            identity: name.into(),
            status: StatusKind::Present,
            at: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        }
    }

    pub(crate) fn request(sequence: u32) -> RenderRequest {
        RenderRequest {
            frame: Arc::new(Frame::from_gray(vec![128; 4], 2, 2, sequence)),
            report: Arc::new(FrameReport {
                sequence,
                faces: Vec::new(),
                transitions: Vec::new(),
            }),
            board: Arc::new(LedgerSnapshot {
                records: Vec::new(),
                cutoff: NaiveTime::from_hms_opt(7, 30, 0).unwrap(),
            }),
        }
    }

    #[test]
    fn test_announcements_delivered_in_order() {
        let announcer = RecordingAnnouncer::default();
        let names = announcer.names.clone();
        let (mut handle, worker) = spawn_effects(CountingRenderer::default(), announcer, 1).unwrap();

        for name in ["Alice", "Bob", "Carol"] {
            handle.announce(event(name));
        }
        drop(handle);

        let stats = worker.finish();
        assert_eq!(stats.announced, 3);
        assert_eq!(*names.lock().unwrap(), vec!["Alice", "Bob", "Carol"]);
    }

    #[test]
    fn test_failed_announcement_does_not_stop_consumer() {
        let announcer = RecordingAnnouncer {
            fail_on: Some("Bob"),
            ..Default::default()
        };
        let names = announcer.names.clone();
        let (mut handle, worker) = spawn_effects(CountingRenderer::default(), announcer, 4).unwrap();

        handle.announce(event("Alice"));
        handle.announce(event("Bob"));
        handle.announce(event("Carol"));
        drop(handle);

        let stats = worker.finish();
        assert_eq!(stats, EffectsStats { announced: 2, rendered: 0, failed: 1 });
        assert_eq!(*names.lock().unwrap(), vec!["Alice", "Carol"]);
    }

    #[test]
    fn test_render_dropped_when_queue_full() {
        let (release, gate) = std_mpsc::channel();
        let (mut handle, worker) =
            spawn_effects(GatedRenderer { gate }, RecordingAnnouncer::default(), 1).unwrap();

        // The consumer takes at most one request and blocks on it; the queue
        // holds one more. Everything past that must be dropped.
        let accepted = (0..10).filter(|&i| handle.render(request(i))).count();
        assert!(accepted <= 2);
        assert_eq!(handle.dropped_renders(), 10 - accepted as u64);

        drop(handle);
        for _ in 0..accepted {
            release.send(()).unwrap();
        }
        assert_eq!(worker.finish().rendered, accepted as u64);
    }
}
