//! Linear run state machine: each stage may only advance to its successor,
//! and any stage may abort to `Failed`.

use std::fmt;

use tracing::{error, info};

use crate::{LorafuseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Fetching,
    TokenizerExported,
    BaseLoaded,
    Merged,
    /// Terminal; records the stage that was active when the run aborted.
    Failed { during: FailedDuring },
}

/// Non-terminal stages, used to say where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedDuring {
    Idle,
    Fetching,
    TokenizerExported,
    BaseLoaded,
}

impl Stage {
    /// The only stage reachable from `self` on success.
    pub fn successor(&self) -> Option<Stage> {
        match self {
            Stage::Idle => Some(Stage::Fetching),
            Stage::Fetching => Some(Stage::TokenizerExported),
            Stage::TokenizerExported => Some(Stage::BaseLoaded),
            Stage::BaseLoaded => Some(Stage::Merged),
            Stage::Merged | Stage::Failed { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.successor().is_none()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Idle => f.write_str("idle"),
            Stage::Fetching => f.write_str("fetching"),
            Stage::TokenizerExported => f.write_str("tokenizer-exported"),
            Stage::BaseLoaded => f.write_str("base-loaded"),
            Stage::Merged => f.write_str("merged"),
            Stage::Failed { during } => write!(f, "failed ({during:?})"),
        }
    }
}

#[derive(Debug)]
pub struct StageMachine {
    current: Stage,
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StageMachine {
    pub fn new() -> Self {
        Self {
            current: Stage::Idle,
        }
    }

    pub fn current(&self) -> Stage {
        self.current
    }

    /// Move to `next`, which must be the successor of the current stage.
    pub fn advance(&mut self, next: Stage) -> Result<()> {
        match self.current.successor() {
            Some(expected) if expected == next => {
                info!("stage {} -> {}", self.current, next);
                self.current = next;
                Ok(())
            }
            _ => Err(LorafuseError::Internal(format!(
                "illegal stage transition {} -> {}",
                self.current, next
            ))),
        }
    }

    /// Abort the run. Has no effect once a terminal stage is reached.
    pub fn fail(&mut self, err: &LorafuseError) {
        let during = match self.current {
            Stage::Idle => FailedDuring::Idle,
            Stage::Fetching => FailedDuring::Fetching,
            Stage::TokenizerExported => FailedDuring::TokenizerExported,
            Stage::BaseLoaded => FailedDuring::BaseLoaded,
            Stage::Merged | Stage::Failed { .. } => return,
        };
        error!("run aborted in stage {}: {err}", self.current);
        self.current = Stage::Failed { during };
    }
}
