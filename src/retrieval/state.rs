//! States of a single question-answering run.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    /// Question accepted, history loaded.
    Received,
    /// Standalone search query fixed (rewritten or passed through).
    Rewritten,
    /// Nearest chunks fetched from the store.
    Retrieved,
    /// Context assembled within the size limit.
    Grounded,
    /// Answer generated and persisted.
    Answered,
    Failed,
}

impl QueryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryState::Received => "received",
            QueryState::Rewritten => "rewritten",
            QueryState::Retrieved => "retrieved",
            QueryState::Grounded => "grounded",
            QueryState::Answered => "answered",
            QueryState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryState::Answered | QueryState::Failed)
    }

    /// The only forward step from this state, if any.
    pub fn next(&self) -> Option<QueryState> {
        match self {
            QueryState::Received => Some(QueryState::Rewritten),
            QueryState::Rewritten => Some(QueryState::Retrieved),
            QueryState::Retrieved => Some(QueryState::Grounded),
            QueryState::Grounded => Some(QueryState::Answered),
            QueryState::Answered | QueryState::Failed => None,
        }
    }

    pub fn can_transition_to(&self, to: QueryState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == QueryState::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The state of one run plus every state it passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryRun {
    state: QueryState,
    trace: Vec<QueryState>,
}

impl Default for QueryRun {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRun {
    pub fn new() -> Self {
        Self {
            state: QueryState::Received,
            trace: vec![QueryState::Received],
        }
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn trace(&self) -> &[QueryState] {
        &self.trace
    }

    /// Move to `to`. Returns `false` and stays put on an illegal step.
    pub fn advance(&mut self, to: QueryState) -> bool {
        if !self.state.can_transition_to(to) {
            return false;
        }
        self.state = to;
        self.trace.push(to);
        true
    }

    /// Enter `Failed`, returning the state the run failed in.
    pub fn fail(&mut self) -> QueryState {
        let at = self.state;
        self.advance(QueryState::Failed);
        at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_trace() {
        let mut run = QueryRun::new();
        for state in [
            QueryState::Rewritten,
            QueryState::Retrieved,
            QueryState::Grounded,
            QueryState::Answered,
        ] {
            assert!(run.advance(state));
        }
        assert_eq!(run.trace().len(), 5);
        assert!(!run.advance(QueryState::Failed));
    }

    #[test]
    fn no_skipping_and_fail_from_anywhere() {
        let mut run = QueryRun::new();
        assert!(!run.advance(QueryState::Grounded));
        assert!(run.advance(QueryState::Rewritten));
        assert_eq!(run.fail(), QueryState::Rewritten);
        assert_eq!(run.state(), QueryState::Failed);
        assert!(!run.advance(QueryState::Retrieved));
    }
}
