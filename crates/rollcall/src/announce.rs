//! Announcers for check-in events.

use crate::effects::{Announcer, SinkError};
use rollcall_core::{StatusKind, TransitionEvent};
use std::process::{Child, Command, Stdio};

/// Spoken / logged text for a transition.
pub fn announcement_text(event: &TransitionEvent) -> String {
    match event.status {
        StatusKind::Late => format!("{} checked in late", event.identity),
        _ => format!("{} checked in", event.identity),
    }
}

/// Writes each announcement to the log.
#[derive(Debug, Default)]
pub struct LogAnnouncer;

impl Announcer for LogAnnouncer {
    fn announce(&mut self, event: &TransitionEvent) -> Result<(), SinkError> {
        tracing::info!(identity = %event.identity, "{}", announcement_text(event));
        Ok(())
    }
}

/// Runs a text-to-speech command (e.g. `espeak -v en`) with the text as the
/// final argument. Children are not waited on while the session runs.
pub struct CommandAnnouncer {
    program: String,
    args: Vec<String>,
    running: Vec<Child>,
}

impl CommandAnnouncer {
    pub fn parse(command: &str) -> Result<Self, SinkError> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| SinkError::Command("empty announce command".into()))?;
        Ok(Self {
            program,
            args: words.collect(),
            running: Vec::new(),
        })
    }

    fn reap(&mut self) {
        self.running.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    tracing::warn!(program = %self.program, %status, "announce command failed");
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll announce command");
                false
            }
        });
    }
}

impl Announcer for CommandAnnouncer {
    fn announce(&mut self, event: &TransitionEvent) -> Result<(), SinkError> {
        self.reap();
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(announcement_text(event))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| SinkError::Command(format!("{}: {e}", self.program)))?;
        self.running.push(child);
        Ok(())
    }

    fn finish(&mut self) {
        for mut child in self.running.drain(..) {
            if let Err(e) = child.wait() {
                tracing::warn!(error = %e, "announce command did not exit cleanly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn event(status: StatusKind) -> TransitionEvent {
        TransitionEvent {
            identity: "Alice".into(),
            status,
            at: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_announcement_text() {
        assert_eq!(announcement_text(&event(StatusKind::Present)), "Alice checked in");
        assert_eq!(announcement_text(&event(StatusKind::Late)), "Alice checked in late");
    }

    #[test]
    fn test_parse_command() {
        let a = CommandAnnouncer::parse("espeak -v en").unwrap();
        assert_eq!(a.program, "espeak");
        assert_eq!(a.args, vec!["-v", "en"]);
        assert!(CommandAnnouncer::parse("   ").is_err());
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let mut a = CommandAnnouncer::parse("/nonexistent/rollcall-tts").unwrap();
        assert!(matches!(a.announce(&event(StatusKind::Present)), Err(SinkError::Command(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_runs_with_text_argument() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("said.txt");
        // `sh -c 'echo "$0" > out' TEXT`: the text lands in $0.
        let mut a = CommandAnnouncer {
            program: "sh".into(),
            args: vec!["-c".into(), format!("echo \"$0\" > '{}'", out.display())],
            running: Vec::new(),
        };
        a.announce(&event(StatusKind::Late)).unwrap();
        a.finish();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "Alice checked in late");
    }
}
