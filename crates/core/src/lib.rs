//! Intent core types: the IntentDeployment resource, its lifecycle phases,
//! the condition ledger and the phase transition table.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod conditions;
pub mod duration;
pub mod lifecycle;
pub mod phase;
pub mod types;

pub use conditions::{Condition, ConditionStatus, Conditions};
pub use lifecycle::{Requeue, Transition, TransitionKind};
pub use phase::{Phase, UnknownPhase};
pub use types::*;

pub mod prelude {
    pub use super::{
        Condition, ConditionStatus, Conditions, IntentDeployment, IntentDeploymentSpec,
        IntentDeploymentStatus, ObjectKey, Phase, Requeue, TargetSite, Transition,
    };
}

/// Namespace/name address of an IntentDeployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of a resource; a missing namespace maps to `default`.
    pub fn of(obj: &IntentDeployment) -> Self {
        Self {
            namespace: obj.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Delivery target. `both` fans out to every edge site.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetSite {
    Edge1,
    Edge2,
    #[default]
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid target site: {0}")]
pub struct InvalidTargetSite(pub String);

impl TargetSite {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetSite::Edge1 => "edge1",
            TargetSite::Edge2 => "edge2",
            TargetSite::Both => "both",
        }
    }

    /// Concrete site names this target expands to.
    pub fn sites(self) -> &'static [&'static str] {
        match self {
            TargetSite::Edge1 => &["edge1"],
            TargetSite::Edge2 => &["edge2"],
            TargetSite::Both => &["edge1", "edge2"],
        }
    }

    /// Parse an optional raw value; unset or empty selects the default.
    pub fn parse_opt(raw: Option<&str>) -> Result<Self, InvalidTargetSite> {
        match raw {
            None | Some("") => Ok(TargetSite::default()),
            Some(s) => s.parse(),
        }
    }
}

impl FromStr for TargetSite {
    type Err = InvalidTargetSite;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "edge1" => Ok(TargetSite::Edge1),
            "edge2" => Ok(TargetSite::Edge2),
            "both" => Ok(TargetSite::Both),
            other => Err(InvalidTargetSite(other.to_string())),
        }
    }
}

impl fmt::Display for TargetSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
