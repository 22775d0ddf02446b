use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

use crate::domain::task::TaskStatus;
use crate::error::CoreError;

/// One step of the fixed Brief -> Plan -> Execute pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Brief,
    Plan,
    Execute,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Brief, Stage::Plan, Stage::Execute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brief => "brief",
            Self::Plan => "plan",
            Self::Execute => "execute",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "brief" => Some(Self::Brief),
            "plan" => Some(Self::Plan),
            "execute" => Some(Self::Execute),
            _ => None,
        }
    }

    /// Name of the skill template that drives this stage.
    pub fn skill_name(&self) -> &'static str {
        self.as_str()
    }

    /// Status a task holds while this stage executes.
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Brief => TaskStatus::Briefing,
            Self::Plan => TaskStatus::Planning,
            Self::Execute => TaskStatus::Running,
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Brief => Some(Self::Plan),
            Self::Plan => Some(Self::Execute),
            Self::Execute => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| CoreError::UnknownStage(s.to_string()))
    }
}

/// Workflow step shown alongside an active status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStep {
    #[default]
    None,
    Brief,
    Plan,
    Execute,
}

impl WorkflowStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Brief => "brief",
            Self::Plan => "plan",
            Self::Execute => "execute",
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::None => None,
            Self::Brief => Some(Stage::Brief),
            Self::Plan => Some(Stage::Plan),
            Self::Execute => Some(Stage::Execute),
        }
    }
}

impl From<Stage> for WorkflowStep {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Brief => Self::Brief,
            Stage::Plan => Self::Plan,
            Stage::Execute => Self::Execute,
        }
    }
}
