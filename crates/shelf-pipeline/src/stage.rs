//! Pipeline stages and their fixed ordering.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A pipeline stage.
///
/// Variants are declared in pipeline order, so the derived `Ord` is the
/// order stages are visited in. `Failed` sorts last but is reachable from
/// any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    /// Created, not yet admitted
    Pending,
    /// Waiting for a concurrency slot
    Queued,
    /// Local input checks
    Validation,
    /// AI annotation
    AiProcessing,
    /// Content store write
    Storage,
    /// Search index update
    Indexing,
    /// Local finalization and discovery trigger
    PostProcessing,
    /// All stages succeeded
    Complete,
    /// A stage failed irrecoverably
    Failed,
}

impl Stage {
    /// The stages that perform work, in execution order.
    pub const ACTIVE: [Stage; 5] = [
        Stage::Validation,
        Stage::AiProcessing,
        Stage::Storage,
        Stage::Indexing,
        Stage::PostProcessing,
    ];

    /// Share of overall progress contributed by completing this stage.
    pub fn weight(self) -> u8 {
        match self {
            Stage::Validation => 10,
            Stage::AiProcessing => 40,
            Stage::Storage => 20,
            Stage::Indexing => 20,
            Stage::PostProcessing => 10,
            _ => 0,
        }
    }

    /// Progress reported on entering this stage.
    ///
    /// Equals the summed weight of every active stage before it, so entering
    /// `Complete` yields exactly 100. `Failed` has no fixed value; a failed
    /// pipeline keeps the progress it had.
    pub fn entry_progress(self) -> Option<u8> {
        match self {
            Stage::Pending | Stage::Queued => Some(0),
            Stage::Failed => None,
            stage => Some(
                Self::ACTIVE
                    .iter()
                    .take_while(|s| **s < stage)
                    .map(|s| s.weight())
                    .sum(),
            ),
        }
    }

    /// Whether the stage is one of the work-performing stages.
    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    /// Whether the stage is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed)
    }

    /// The stage that follows this one on the success path.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Pending | Stage::Queued => Some(Stage::Validation),
            Stage::Validation => Some(Stage::AiProcessing),
            Stage::AiProcessing => Some(Stage::Storage),
            Stage::Storage => Some(Stage::Indexing),
            Stage::Indexing => Some(Stage::PostProcessing),
            Stage::PostProcessing => Some(Stage::Complete),
            Stage::Complete | Stage::Failed => None,
        }
    }

    /// Whether moving from `self` to `to` respects the stage order.
    ///
    /// Allowed moves are the success-path successor, `Pending -> Queued`,
    /// and `Failed` from any non-terminal stage.
    pub fn can_transition_to(self, to: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Stage::Failed => true,
            Stage::Queued => self == Stage::Pending,
            to => self.next() == Some(to),
        }
    }

    /// camelCase name used in events and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Queued => "queued",
            Stage::Validation => "validation",
            Stage::AiProcessing => "aiProcessing",
            Stage::Storage => "storage",
            Stage::Indexing => "indexing",
            Stage::PostProcessing => "postProcessing",
            Stage::Complete => "complete",
            Stage::Failed => "failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
