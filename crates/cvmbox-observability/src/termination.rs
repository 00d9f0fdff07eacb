//! Capture of fatal events into the container termination log

use std::fmt;
use std::path::PathBuf;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Field that marks an event as the process' final failure
pub const FATAL_FIELD: &str = "fatal";

/// Log `message` as the reason the process is about to exit
pub fn log_fatal(message: &str) {
    tracing::error!(fatal = true, "{message}");
}

/// Writes the message of every `fatal = true` event to a file
#[derive(Debug, Clone)]
pub struct TerminationLogLayer {
    path: PathBuf,
}

impl TerminationLogLayer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Default)]
struct FatalVisitor {
    fatal: bool,
    message: Option<String>,
    error: Option<String>,
}

impl FatalVisitor {
    fn text(self) -> Option<String> {
        if !self.fatal {
            return None;
        }
        match (self.message, self.error) {
            (Some(message), Some(error)) => Some(format!("{message}: {error}")),
            (Some(text), None) | (None, Some(text)) => Some(text),
            (None, None) => None,
        }
    }
}

impl Visit for FatalVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == FATAL_FIELD {
            self.fatal = value;
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = Some(value.to_string()),
            "error" => self.error = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = Some(format!("{value:?}")),
            "error" => self.error = Some(format!("{value:?}")),
            _ => {}
        }
    }
}

impl<S: Subscriber> Layer<S> for TerminationLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FatalVisitor::default();
        event.record(&mut visitor);
        let Some(text) = visitor.text() else {
            return;
        };
        if let Err(e) = std::fs::write(&self.path, text.as_bytes()) {
            // Not routed through tracing, this runs inside the subscriber
            eprintln!(
                "failed to write termination log {}: {e}",
                self.path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(path: &std::path::Path, emit: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(TerminationLogLayer::new(path));
        tracing::subscriber::with_default(subscriber, emit);
    }

    #[test]
    fn test_fatal_event_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termination-log");

        capture(&path, || {
            tracing::error!("ordinary error");
            log_fatal("pull image: manifest unknown");
        });

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "pull image: manifest unknown"
        );
    }

    #[test]
    fn test_non_fatal_events_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termination-log");

        capture(&path, || {
            tracing::error!(fatal = false, "not really");
            tracing::warn!("still fine");
        });

        assert!(!path.exists());
    }

    #[test]
    fn test_error_field_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("termination-log");

        capture(&path, || {
            tracing::error!(fatal = true, error = "daemon exited", "workspace failed");
        });

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "workspace failed: daemon exited"
        );
    }
}
