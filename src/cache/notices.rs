//! Presentation hooks fired at mutation lifecycle points.
//!
//! These carry title/description pairs for toasts; they are not part of the
//! cache contract and may be disabled per mutation.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub title: String,
    pub description: String,
}

impl Notice {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticePhase {
    /// The optimistic value is visible.
    Optimistic,
    /// The server confirmed the write.
    Success,
    /// The remote write failed.
    Error,
}

/// Per-mutation notice descriptors; `None` silences a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationNotices {
    pub optimistic: Option<Notice>,
    pub success: Option<Notice>,
    pub error: Option<Notice>,
}

impl Default for MutationNotices {
    fn default() -> Self {
        Self {
            optimistic: Some(Notice::new(
                "Processing...",
                "Your request is being processed",
            )),
            success: Some(Notice::new("Success", "Operation completed successfully")),
            error: Some(Notice::new("Error", "Operation failed")),
        }
    }
}

impl MutationNotices {
    pub fn none() -> Self {
        Self {
            optimistic: None,
            success: None,
            error: None,
        }
    }

    pub fn optimistic(mut self, notice: Option<Notice>) -> Self {
        self.optimistic = notice;
        self
    }

    pub fn success(mut self, notice: Option<Notice>) -> Self {
        self.success = notice;
        self
    }

    pub fn error(mut self, notice: Option<Notice>) -> Self {
        self.error = notice;
        self
    }

    pub fn for_phase(&self, phase: NoticePhase) -> Option<&Notice> {
        match phase {
            NoticePhase::Optimistic => self.optimistic.as_ref(),
            NoticePhase::Success => self.success.as_ref(),
            NoticePhase::Error => self.error.as_ref(),
        }
    }
}

/// Receives notices; implemented by whatever shows toasts.
pub trait Notifier: Send + Sync {
    fn notify(&self, phase: NoticePhase, notice: &Notice);
}

/// Default notifier: writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, phase: NoticePhase, notice: &Notice) {
        match phase {
            NoticePhase::Error => warn!(
                title = %notice.title,
                description = %notice.description,
                "Mutation notice"
            ),
            NoticePhase::Optimistic | NoticePhase::Success => info!(
                phase = ?phase,
                title = %notice.title,
                description = %notice.description,
                "Mutation notice"
            ),
        }
    }
}
