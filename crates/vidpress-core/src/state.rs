// crates/vidpress-core/src/state.rs
// Pipeline lifecycle for one compress() call. Pure data, no ffmpeg.
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Configuring,
    Running,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

/// Attempted a transition the lifecycle does not allow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: PipelineState,
    pub to:   PipelineState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pipeline transition {:?} → {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed | PipelineState::Cancelled)
    }

    /// Idle → Configuring → Running → Finalizing → Completed, with Failed and
    /// Cancelled reachable from every non-terminal state after Idle.
    pub fn can_advance(self, to: PipelineState) -> bool {
        use PipelineState::*;
        match (self, to) {
            (Idle, Configuring)        => true,
            (Configuring, Running)     => true,
            (Running, Finalizing)      => true,
            (Finalizing, Completed)    => true,
            (Configuring | Running | Finalizing, Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn advance(&mut self, to: PipelineState) -> Result<(), InvalidTransition> {
        if self.can_advance(to) {
            *self = to;
            Ok(())
        } else {
            Err(InvalidTransition { from: *self, to })
        }
    }
}

/// Per-track cursor inside a running session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    Active,
    Finished,
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn happy_path() {
        let mut s = Idle;
        for next in [Configuring, Running, Finalizing, Completed] {
            s.advance(next).unwrap();
        }
        assert!(s.is_terminal());
    }

    #[test]
    fn failure_and_cancel_from_active_states() {
        for from in [Configuring, Running, Finalizing] {
            assert!(from.can_advance(Failed));
            assert!(from.can_advance(Cancelled));
        }
        assert!(!Idle.can_advance(Failed));
    }

    #[test]
    fn terminal_states_are_final() {
        for from in [Completed, Failed, Cancelled] {
            for to in [Idle, Configuring, Running, Finalizing, Completed, Failed, Cancelled] {
                assert!(!from.can_advance(to), "{from:?} → {to:?}");
            }
        }
    }

    #[test]
    fn skipping_running_is_rejected() {
        let mut s = Configuring;
        let err = s.advance(Finalizing).unwrap_err();
        assert_eq!(err, InvalidTransition { from: Configuring, to: Finalizing });
        assert_eq!(s, Configuring);
    }
}
