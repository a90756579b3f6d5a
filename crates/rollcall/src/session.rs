//! Runs the frame loop on a dedicated OS thread.
//!
//! Capture and inference block, so the pipeline never runs on the async
//! runtime. The runtime only waits for the outcome.

use crate::pipeline::{FramePipeline, SessionOutcome};
use rollcall_core::{Clock, FaceAnalyzer};
use rollcall_hw::FrameSource;
use std::io::BufRead;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("pipeline thread exited without a result")]
    ThreadExited,
}

/// Handle to a running session.
pub struct SessionHandle {
    rx: oneshot::Receiver<SessionOutcome>,
}

impl SessionHandle {
    /// Wait for the loop to finish and return the final ledger.
    pub async fn wait(self) -> Result<SessionOutcome, SessionError> {
        self.rx.await.map_err(|_| SessionError::ThreadExited)
    }
}

/// Move the pipeline and its source onto the `rollcall-pipeline` thread.
///
/// Cancelling `stop` ends the loop at the next frame boundary.
pub fn spawn_session<A, C, S>(
    pipeline: FramePipeline<A, C>,
    mut source: S,
    stop: CancellationToken,
) -> Result<SessionHandle, SessionError>
where
    A: FaceAnalyzer + Send + 'static,
    C: Clock + Send + 'static,
    S: FrameSource + Send + 'static,
{
    let (tx, rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("rollcall-pipeline".into())
        .spawn(move || {
            tracing::info!("pipeline thread started");
            let outcome = pipeline.run(&mut source, &stop);
            let _ = tx.send(outcome);
            tracing::info!("pipeline thread exiting");
        })?;

    Ok(SessionHandle { rx })
}

/// Cancel `stop` when the operator types `q` and Enter.
///
/// Stdin is read on a detached thread, so a pending read never holds up
/// process exit. Stdin closing (e.g. running under a service manager) does
/// not stop the session.
pub fn watch_quit_key(stop: CancellationToken) -> std::io::Result<()> {
    watch_lines(std::io::BufReader::new(std::io::stdin()), stop)
}

fn watch_lines<R>(reader: R, stop: CancellationToken) -> std::io::Result<()>
where
    R: BufRead + Send + 'static,
{
    std::thread::Builder::new()
        .name("rollcall-stdin".into())
        .spawn(move || {
            for line in reader.lines() {
                if stop.is_cancelled() {
                    return;
                }
                match line {
                    Ok(line) if is_quit(&line) => {
                        tracing::info!("quit requested");
                        stop.cancel();
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
        })?;
    Ok(())
}

fn is_quit(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("q")
}
