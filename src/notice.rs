//! Non-fatal stage notifications.
//!
//! Compile errors in the template and stylesheet stages do not stop the
//! pipeline. They are turned into a [`Notice`] and handed to a [`Notifier`],
//! and the stage moves on to the next file. The same channel carries the
//! one-per-run success message of the stylesheet stage.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Success,
    Error,
}

/// A message surfaced to the developer while a stage runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub stage: &'static str,
    pub level: Level,
    pub message: String,
}

impl Notice {
    pub fn error(stage: &'static str, message: impl fmt::Display) -> Self {
        Self {
            stage,
            level: Level::Error,
            message: format!("Error: {message}"),
        }
    }

    pub fn success(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            level: Level::Success,
            message: message.into(),
        }
    }
}

/// Sink for notices. Implementations must not fail.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            Level::Success => tracing::info!(stage = notice.stage, "{}", notice.message),
            Level::Error => tracing::error!(stage = notice.stage, "{}", notice.message),
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Notifier that keeps every notice for later assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub notices: Mutex<Vec<Notice>>,
    }

    impl RecordingNotifier {
        pub fn errors(&self) -> Vec<Notice> {
            self.notices
                .lock()
                .unwrap()
                .iter()
                .filter(|n| n.level == Level::Error)
                .cloned()
                .collect()
        }

        pub fn successes(&self) -> Vec<Notice> {
            self.notices
                .lock()
                .unwrap()
                .iter()
                .filter(|n| n.level == Level::Success)
                .cloned()
                .collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notice: Notice) {
            self.notices.lock().unwrap().push(notice);
        }
    }

    #[test]
    fn error_notice_is_prefixed() {
        let n = Notice::error("pug", "unexpected token");
        assert_eq!(n.message, "Error: unexpected token");
        assert_eq!(n.level, Level::Error);
    }

    #[test]
    fn recording_notifier_splits_levels() {
        let r = RecordingNotifier::default();
        r.notify(Notice::success("sass", "done"));
        r.notify(Notice::error("sass", "bad"));
        assert_eq!(r.errors().len(), 1);
        assert_eq!(r.successes().len(), 1);
    }
}
