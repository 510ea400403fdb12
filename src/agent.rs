//! Generation agent lifecycle.
//!
//! Both agents run the same pipeline:
//!
//! ```text
//! Idle -> Retrieving -> Prompting -> AwaitingLlm -> Parsing -> Done
//!                           ^                          |
//!                           +------ (one retry) -------+
//! ```
//!
//! Any non-terminal state may move to `Failed`. `Done` and `Failed` are
//! terminal. The single backward edge `Parsing -> Prompting` is the
//! bounded retry after a malformed model response; it may be taken once
//! per run.

use std::fmt;

use crate::error::{QaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Retrieving,
    Prompting,
    AwaitingLlm,
    Parsing,
    Done,
    Failed,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Done | AgentState::Failed)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Idle => "idle",
            AgentState::Retrieving => "retrieving",
            AgentState::Prompting => "prompting",
            AgentState::AwaitingLlm => "awaiting_llm",
            AgentState::Parsing => "parsing",
            AgentState::Done => "done",
            AgentState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One execution of an agent, tracking every state it passed through.
#[derive(Debug, Clone)]
pub struct AgentRun {
    agent: &'static str,
    state: AgentState,
    history: Vec<AgentState>,
    retried: bool,
}

impl AgentRun {
    pub fn new(agent: &'static str) -> Self {
        Self {
            agent,
            state: AgentState::Idle,
            history: vec![AgentState::Idle],
            retried: false,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// All states visited, starting with `Idle`.
    pub fn history(&self) -> &[AgentState] {
        &self.history
    }

    /// Number of prompts sent so far (1 + retries).
    pub fn attempts(&self) -> u32 {
        self.history
            .iter()
            .filter(|s| **s == AgentState::AwaitingLlm)
            .count() as u32
    }

    /// Whether the bounded retry is still available.
    pub fn can_retry(&self) -> bool {
        !self.retried && self.state == AgentState::Parsing
    }

    /// Move to `to`, rejecting transitions the lifecycle does not allow.
    pub fn advance(&mut self, to: AgentState) -> Result<()> {
        use AgentState::*;

        let allowed = match (self.state, to) {
            (Idle, Retrieving)
            | (Retrieving, Prompting)
            | (Prompting, AwaitingLlm)
            | (AwaitingLlm, Parsing)
            | (Parsing, Done) => true,
            (Parsing, Prompting) => !self.retried,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(QaError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        if self.state == Parsing && to == Prompting {
            self.retried = true;
        }
        tracing::debug!(agent = self.agent, from = %self.state, to = %to, "agent transition");
        self.state = to;
        self.history.push(to);
        Ok(())
    }

    /// Mark the run failed. No-op once the run is terminal.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            tracing::debug!(agent = self.agent, from = %self.state, "agent failed");
            self.state = AgentState::Failed;
            self.history.push(AgentState::Failed);
        }
    }
}
