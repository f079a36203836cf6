//! Condition ledger: an ordered set of condition records unique by `type`.
//!
//! Conditions are only ever changed through [`Conditions::set`] / [`Conditions::set_at`],
//! which upsert by type. Deserialization folds duplicates the same way, so a list read
//! back from the store can never hold two entries of one type.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

pub const READY: &str = "Ready";
pub const COMPILING: &str = "Compiling";
pub const RENDERED: &str = "Rendered";
pub const GITOPS_SYNC: &str = "GitOpsSync";
pub const RECONCILED: &str = "Reconciled";
pub const VERIFIED: &str = "Verified";
pub const FAILED: &str = "Failed";
pub const ROLLED_BACK: &str = "RolledBack";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).map_or(false, |c| c.status == ConditionStatus::True)
    }

    /// Upsert a condition stamped with the current time.
    pub fn set(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: &str) {
        self.set_at(type_, status, reason, message, Utc::now());
    }

    /// Upsert a condition.
    ///
    /// - absent type: appended with `last_transition_time = now`
    /// - same status: reason/message refreshed, transition time kept
    /// - status changed: every field replaced, transition time bumped
    pub fn set_at(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.status = status;
                    existing.last_transition_time = now;
                }
                existing.reason = reason.to_string();
                existing.message = message.to_string();
            }
            None => self.0.push(Condition {
                type_: type_.to_string(),
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
            }),
        }
    }

    pub fn remove(&mut self, type_: &str) -> Option<Condition> {
        let idx = self.0.iter().position(|c| c.type_ == type_)?;
        Some(self.0.remove(idx))
    }
}

impl From<Vec<Condition>> for Conditions {
    /// First position wins, last values win.
    fn from(list: Vec<Condition>) -> Self {
        let mut out: Vec<Condition> = Vec::with_capacity(list.len());
        for c in list {
            match out.iter_mut().find(|e| e.type_ == c.type_) {
                Some(slot) => *slot = c,
                None => out.push(c),
            }
        }
        Conditions(out)
    }
}

impl<'de> Deserialize<'de> for Conditions {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let list = Option::<Vec<Condition>>::deserialize(de)?.unwrap_or_default();
        Ok(Conditions::from(list))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    #[test]
    fn appends_new_types_in_insertion_order() {
        let mut c = Conditions::new();
        c.set_at(READY, ConditionStatus::False, "Initializing", "init", t(0));
        c.set_at(COMPILING, ConditionStatus::True, "InProgress", "compiling", t(1));
        let types: Vec<_> = c.iter().map(|x| x.type_.as_str()).collect();
        assert_eq!(types, vec![READY, COMPILING]);
        assert_eq!(c.get(COMPILING).unwrap().last_transition_time, t(1));
    }

    #[test]
    fn same_status_keeps_transition_time() {
        let mut c = Conditions::new();
        c.set_at(READY, ConditionStatus::False, "Initializing", "init", t(0));
        c.set_at(READY, ConditionStatus::False, "Retrying", "retry 1/3", t(10));
        let r = c.get(READY).unwrap();
        assert_eq!(r.last_transition_time, t(0));
        assert_eq!(r.reason, "Retrying");
        assert_eq!(r.message, "retry 1/3");
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn status_change_bumps_transition_time() {
        let mut c = Conditions::new();
        c.set_at(READY, ConditionStatus::False, "Initializing", "init", t(0));
        c.set_at(READY, ConditionStatus::True, "Succeeded", "done", t(30));
        let r = c.get(READY).unwrap();
        assert_eq!(r.status, ConditionStatus::True);
        assert_eq!(r.last_transition_time, t(30));
        assert!(c.is_true(READY));
    }

    #[test]
    fn deserializing_duplicates_folds_by_type() {
        let raw = serde_json::json!([
            {"type": "Ready", "status": "False", "reason": "A", "message": "", "lastTransitionTime": "2024-01-01T00:00:00Z"},
            {"type": "Compiling", "status": "True", "reason": "B", "message": "", "lastTransitionTime": "2024-01-01T00:00:01Z"},
            {"type": "Ready", "status": "True", "reason": "C", "message": "", "lastTransitionTime": "2024-01-01T00:00:02Z"}
        ]);
        let c: Conditions = serde_json::from_value(raw).unwrap();
        assert_eq!(c.len(), 2);
        let first = c.iter().next().unwrap();
        assert_eq!(first.type_, READY);
        assert_eq!(first.reason, "C");
    }

    #[test]
    fn null_list_deserializes_empty() {
        let c: Conditions = serde_json::from_value(serde_json::Value::Null).unwrap();
        assert!(c.is_empty());
    }

    #[test]
    fn remove_drops_only_the_named_type() {
        let mut c = Conditions::new();
        c.set_at(READY, ConditionStatus::False, "x", "", t(0));
        c.set_at(FAILED, ConditionStatus::True, "y", "", t(0));
        assert!(c.remove(FAILED).is_some());
        assert!(c.remove(FAILED).is_none());
        assert_eq!(c.len(), 1);
    }
}
