//! Lifecycle phases of an IntentDeployment.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

/// Single authoritative lifecycle position. The uninitialized state is
/// represented as `None` at the status level, never as a variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum Phase {
    Pending,
    Compiling,
    Rendering,
    Delivering,
    Reconciling,
    Verifying,
    Succeeded,
    Failed,
    RollingBack,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown phase: {0:?}")]
pub struct UnknownPhase(pub String);

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Pending,
        Phase::Compiling,
        Phase::Rendering,
        Phase::Delivering,
        Phase::Reconciling,
        Phase::Verifying,
        Phase::Succeeded,
        Phase::Failed,
        Phase::RollingBack,
    ];

    /// Phase a freshly initialized resource enters.
    pub const INITIAL: Phase = Phase::Pending;

    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Compiling => "Compiling",
            Phase::Rendering => "Rendering",
            Phase::Delivering => "Delivering",
            Phase::Reconciling => "Reconciling",
            Phase::Verifying => "Verifying",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::RollingBack => "RollingBack",
        }
    }

    /// Forward edge taken when this phase's step completes.
    pub const fn successor(self) -> Option<Phase> {
        match self {
            Phase::Pending => Some(Phase::Compiling),
            Phase::Compiling => Some(Phase::Rendering),
            Phase::Rendering => Some(Phase::Delivering),
            Phase::Delivering => Some(Phase::Reconciling),
            Phase::Reconciling => Some(Phase::Verifying),
            Phase::Verifying => Some(Phase::Succeeded),
            Phase::RollingBack => Some(Phase::Succeeded),
            Phase::Succeeded | Phase::Failed => None,
        }
    }

    /// Phases whose step calls an external collaborator.
    pub const fn has_side_effect(self) -> bool {
        matches!(
            self,
            Phase::Compiling
                | Phase::Rendering
                | Phase::Delivering
                | Phase::Reconciling
                | Phase::Verifying
                | Phase::RollingBack
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPhase(s.to_string()))
    }
}

/// Parse a possibly-empty phase literal. `""` is the uninitialized state.
pub fn parse_opt(raw: &str) -> Result<Option<Phase>, UnknownPhase> {
    if raw.is_empty() {
        Ok(None)
    } else {
        raw.parse().map(Some)
    }
}

/// Serde hook for `status.phase`: treats `""` as unset and rejects unknown literals.
pub(crate) fn deserialize_opt<'de, D>(de: D) -> Result<Option<Phase>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    match raw {
        None => Ok(None),
        Some(s) => parse_opt(&s).map_err(serde::de::Error::custom),
    }
}
