//! Stage and side state management

use serde::Serialize;

/// Stage state machine
///
/// Each filter or encode stage moves through these states. Transitions are
/// validated so a stage can never be reopened or fed after end of stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageState {
    /// Not constructed yet; waiting for the first frame
    Uninitialized,

    /// Being opened from the first frame's format
    Preparing,

    /// Open and accepting input
    Ready,

    /// End of stream pushed; remaining output is being pulled
    Draining,

    /// Fully drained
    Eof,

    /// Open or push/pull failed; terminal
    Failed,
}

impl StageState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &StageState) -> bool {
        use StageState::*;
        match (self, target) {
            (Uninitialized, Preparing) => true,
            // a stage that never saw a frame finishes without opening
            (Uninitialized, Eof) => true,

            (Preparing, Ready) => true,

            (Ready, Draining) => true,

            (Draining, Eof) => true,

            // Terminal states
            (Eof, _) | (Failed, _) => false,

            // Anything live may fail
            (_, Failed) => true,

            // Self-transitions
            (a, b) if a == b => true,

            _ => false,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StageState::Uninitialized => "Uninitialized",
            StageState::Preparing => "Preparing",
            StageState::Ready => "Ready",
            StageState::Draining => "Draining",
            StageState::Eof => "EOF",
            StageState::Failed => "Failed",
        }
    }

    /// Open and not yet drained
    pub fn is_ready(&self) -> bool {
        matches!(self, StageState::Ready | StageState::Draining)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Eof | StageState::Failed)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Progress of the writing (input) side of a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriterStatus {
    Unknown,
    Writing,
    Completed,
    Failed,
    Cancelled,
}

/// Progress of the reading (output) side of a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReaderStatus {
    Unknown,
    Reading,
    Completed,
    Failed,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use StageState::*;

        assert!(Uninitialized.can_transition_to(&Preparing));
        assert!(Preparing.can_transition_to(&Ready));
        assert!(Ready.can_transition_to(&Draining));
        assert!(Draining.can_transition_to(&Eof));
        assert!(Uninitialized.can_transition_to(&Eof));

        assert!(Preparing.can_transition_to(&Failed));
        assert!(Ready.can_transition_to(&Failed));
        assert!(Draining.can_transition_to(&Failed));

        // Self-transitions
        assert!(Ready.can_transition_to(&Ready));
    }

    #[test]
    fn test_invalid_transitions() {
        use StageState::*;

        assert!(!Uninitialized.can_transition_to(&Ready)); // Must be prepared first
        assert!(!Ready.can_transition_to(&Eof)); // Must drain first
        assert!(!Eof.can_transition_to(&Ready)); // Can't reopen
        assert!(!Failed.can_transition_to(&Ready));
        assert!(!Eof.can_transition_to(&Failed));
    }

    #[test]
    fn test_state_checks() {
        assert!(StageState::Ready.is_ready());
        assert!(StageState::Draining.is_ready());
        assert!(!StageState::Preparing.is_ready());
        assert!(StageState::Eof.is_terminal());
        assert!(StageState::Failed.is_terminal());
        assert_eq!(StageState::Eof.to_string(), "EOF");
    }
}
