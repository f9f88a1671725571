//! Operational events collected during a pass and published by the
//! controller once the pass is over.

use strum::{Display, IntoStaticStr};

#[derive(Clone, Copy, Debug, Display, Eq, IntoStaticStr, PartialEq)]
pub enum EventReason {
    Updated,
    Processing,
    ProcessingError,
    Warning,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

#[derive(Clone, Debug)]
pub struct PassEvent {
    pub severity: EventSeverity,
    pub reason: EventReason,
    pub action: &'static str,
    pub message: String,
}

impl PassEvent {
    pub fn updated(action: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Normal,
            reason: EventReason::Updated,
            action,
            message: message.into(),
        }
    }

    pub fn warning(action: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Warning,
            reason: EventReason::Warning,
            action,
            message: message.into(),
        }
    }
}
