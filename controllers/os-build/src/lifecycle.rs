//! Build lifecycle state machine.
//!
//! A record's five conditions are a rendering of one [`BuildPhase`]. Phases
//! change only through [`BuildPhase::transition_to`], and the condition
//! vector is always rewritten whole from the new phase, so at most one
//! condition is ever true.

use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use crds::{BuildCondition, BuildConditionType, BuildRecordStatus, ConditionStatus};
use std::fmt;

/// Lifecycle phase of a build record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildPhase {
    /// Record exists but no build has been claimed for it
    Pending,
    /// Builder object exists, not yet observed running
    Prepared,
    Building,
    Succeeded,
    Failed,
    /// Build was stopped by configuration churn; eligible for a fresh attempt
    Interrupted,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildPhase::Pending => "Pending",
            BuildPhase::Prepared => "Prepared",
            BuildPhase::Building => "Building",
            BuildPhase::Succeeded => "Succeeded",
            BuildPhase::Failed => "Failed",
            BuildPhase::Interrupted => "Interrupted",
        };
        f.write_str(name)
    }
}

/// Fixed reason and message for a condition type.
#[must_use]
pub fn reason_and_message(condition: BuildConditionType) -> (&'static str, &'static str) {
    match condition {
        BuildConditionType::Prepared => ("Prepared", "Build Prepared and Pending"),
        BuildConditionType::Building => ("Building", "Image Build In Progress"),
        BuildConditionType::Failed => ("Failed", "Build Failed"),
        BuildConditionType::Interrupted => ("Interrupted", "Build Interrupted"),
        BuildConditionType::Succeeded => ("Ready", "Build Ready"),
    }
}

impl BuildPhase {
    /// Reads the phase from a record status. No true condition is `Pending`.
    #[must_use]
    pub fn from_status(status: Option<&BuildRecordStatus>) -> Self {
        let Some(status) = status else {
            return BuildPhase::Pending;
        };
        BuildConditionType::ALL
            .iter()
            .find(|&&t| {
                status
                    .conditions
                    .iter()
                    .any(|c| c.condition_type == t && c.status == ConditionStatus::True)
            })
            .map_or(BuildPhase::Pending, |&t| Self::from_condition(t))
    }

    fn from_condition(condition: BuildConditionType) -> Self {
        match condition {
            BuildConditionType::Prepared => BuildPhase::Prepared,
            BuildConditionType::Building => BuildPhase::Building,
            BuildConditionType::Failed => BuildPhase::Failed,
            BuildConditionType::Interrupted => BuildPhase::Interrupted,
            BuildConditionType::Succeeded => BuildPhase::Succeeded,
        }
    }

    /// The condition that is true in this phase, if any
    #[must_use]
    pub fn condition(self) -> Option<BuildConditionType> {
        match self {
            BuildPhase::Pending => None,
            BuildPhase::Prepared => Some(BuildConditionType::Prepared),
            BuildPhase::Building => Some(BuildConditionType::Building),
            BuildPhase::Succeeded => Some(BuildConditionType::Succeeded),
            BuildPhase::Failed => Some(BuildConditionType::Failed),
            BuildPhase::Interrupted => Some(BuildConditionType::Interrupted),
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildPhase::Succeeded | BuildPhase::Failed)
    }

    /// A builder object exists and may still be running
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, BuildPhase::Prepared | BuildPhase::Building)
    }

    #[must_use]
    pub fn can_transition_to(self, next: BuildPhase) -> bool {
        use BuildPhase::{Building, Failed, Interrupted, Pending, Prepared, Succeeded};
        if self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Prepared | Building | Failed | Interrupted),
            Prepared => matches!(next, Building | Succeeded | Failed | Interrupted),
            // Back to Prepared when an evicted build is rescheduled
            Building => matches!(next, Prepared | Succeeded | Failed | Interrupted),
            Interrupted => matches!(next, Prepared | Failed),
            Succeeded | Failed => false,
        }
    }

    /// Validates a transition. Re-entering the current phase is allowed and
    /// leaves the record unchanged.
    pub fn transition_to(self, next: BuildPhase) -> Result<BuildPhase, ControllerError> {
        if next == BuildPhase::Pending && self != BuildPhase::Pending {
            return Err(self.invalid(next));
        }
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(self.invalid(next))
        }
    }

    fn invalid(self, next: BuildPhase) -> ControllerError {
        ControllerError::InvalidTransition {
            from: self.to_string(),
            to: next.to_string(),
        }
    }

    /// Renders the full five-condition vector for this phase.
    ///
    /// Conditions whose status does not change keep their previous
    /// transition time.
    #[must_use]
    pub fn render(self, previous: &[BuildCondition], now: DateTime<Utc>) -> Vec<BuildCondition> {
        let active = self.condition();
        BuildConditionType::ALL
            .iter()
            .map(|&condition_type| {
                let status = if Some(condition_type) == active {
                    ConditionStatus::True
                } else {
                    ConditionStatus::False
                };
                let last_transition_time = previous
                    .iter()
                    .find(|c| c.condition_type == condition_type && c.status == status)
                    .and_then(|c| c.last_transition_time)
                    .or(Some(now));
                let (reason, message) = reason_and_message(condition_type);
                BuildCondition {
                    condition_type,
                    status,
                    reason: reason.to_string(),
                    message: message.to_string(),
                    last_transition_time,
                }
            })
            .collect()
    }
}
