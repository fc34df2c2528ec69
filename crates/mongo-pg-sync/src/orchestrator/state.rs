//! Single-flight run state.

use serde::Serialize;

/// Whether a pass is executing, and whether another one is owed.
///
/// Pending requests coalesce into the `RunningWithPending` flag; they are
/// never queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    RunningWithPending,
}

impl RunState {
    /// A sync request arrived. Returns the next state and whether to start a
    /// pass now.
    pub fn on_request(self) -> (RunState, bool) {
        match self {
            RunState::Idle => (RunState::Running, true),
            RunState::Running | RunState::RunningWithPending => (RunState::RunningWithPending, false),
        }
    }

    /// The running pass finished, whatever its outcome. Returns the next state
    /// and whether to start the owed pass now.
    pub fn on_pass_complete(self) -> (RunState, bool) {
        match self {
            RunState::RunningWithPending => (RunState::Running, true),
            RunState::Running | RunState::Idle => (RunState::Idle, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_request_starts_immediately() {
        assert_eq!(RunState::Idle.on_request(), (RunState::Running, true));
    }

    #[test]
    fn test_requests_while_running_coalesce() {
        let (state, start) = RunState::Running.on_request();
        assert_eq!((state, start), (RunState::RunningWithPending, false));
        let (state, start) = state.on_request();
        assert_eq!((state, start), (RunState::RunningWithPending, false));
    }

    #[test]
    fn test_completion_runs_exactly_one_owed_pass() {
        assert_eq!(
            RunState::RunningWithPending.on_pass_complete(),
            (RunState::Running, true)
        );
        assert_eq!(RunState::Running.on_pass_complete(), (RunState::Idle, false));
    }

    #[test]
    fn test_burst_of_requests_yields_two_passes() {
        let mut state = RunState::Idle;
        let mut passes = 0;

        let (next, start) = state.on_request();
        state = next;
        passes += start as u32;
        for _ in 0..5 {
            let (next, start) = state.on_request();
            state = next;
            passes += start as u32;
        }
        while state != RunState::Idle {
            let (next, start) = state.on_pass_complete();
            state = next;
            passes += start as u32;
        }
        assert_eq!(passes, 2);
    }
}
