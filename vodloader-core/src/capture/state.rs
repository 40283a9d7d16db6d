use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    Idle,
    Opening,
    Recording,
    RollingOver,
    Finalizing,
    Ended,
    Aborted,
}

impl CaptureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureState::Idle => "idle",
            CaptureState::Opening => "opening",
            CaptureState::Recording => "recording",
            CaptureState::RollingOver => "rolling_over",
            CaptureState::Finalizing => "finalizing",
            CaptureState::Ended => "ended",
            CaptureState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CaptureState::Ended | CaptureState::Aborted)
    }

    pub fn can_transition_to(&self, next: CaptureState) -> bool {
        use CaptureState::*;
        match (self, next) {
            (Ended, _) | (Aborted, _) => false,
            (_, Aborted) => true,
            (Idle, Opening)
            | (Opening, Recording)
            | (Recording, RollingOver)
            | (RollingOver, Recording)
            | (Recording, Finalizing)
            | (Finalizing, Ended) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
