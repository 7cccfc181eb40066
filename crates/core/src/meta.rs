//! Owner reference and status condition helpers.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};

/// Put `owner` in front as the single controller reference. Any other
/// reference flagged as controller is demoted; references with the same UID
/// are replaced.
pub fn set_controller_owner(existing: &[OwnerReference], owner: OwnerReference) -> Vec<OwnerReference> {
    let mut out = Vec::with_capacity(existing.len() + 1);
    let uid = owner.uid.clone();
    out.push(owner);
    for o in existing {
        if o.uid == uid { continue; }
        let mut o = o.clone();
        if o.controller == Some(true) { o.controller = Some(false); }
        out.push(o);
    }
    out
}

/// The owner reference flagged `controller=true`, if any.
pub fn controller_of(refs: &[OwnerReference]) -> Option<&OwnerReference> {
    refs.iter().find(|o| o.controller == Some(true))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

impl Condition {
    pub fn ready(type_: &str) -> Self {
        Self { type_: type_.to_string(), status: ConditionStatus::True, reason: "Available".into(), message: String::new(), last_transition_time: Utc::now() }
    }

    pub fn error(type_: &str, reason: &str, message: impl Into<String>) -> Self {
        Self { type_: type_.to_string(), status: ConditionStatus::False, reason: reason.to_string(), message: message.into(), last_transition_time: Utc::now() }
    }

    pub fn is_true(&self) -> bool { self.status == ConditionStatus::True }
}

/// Replace the condition of the same type. The transition time only moves when
/// the status actually changes.
pub fn set_condition(conds: &mut Vec<Condition>, mut c: Condition) {
    match conds.iter_mut().find(|x| x.type_ == c.type_) {
        Some(existing) => {
            if existing.status == c.status { c.last_transition_time = existing.last_transition_time; }
            *existing = c;
        }
        None => conds.push(c),
    }
}

pub fn get_condition<'a>(conds: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conds.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "v1".into(),
            kind: "X".into(),
            name: uid.into(),
            uid: uid.into(),
            controller: Some(controller),
            block_owner_deletion: None,
        }
    }

    #[test]
    fn controller_owner_is_exclusive() {
        let existing = vec![owner("old", true), owner("peer", false), owner("new", false)];
        let refs = set_controller_owner(&existing, owner("new", true));
        assert_eq!(refs.len(), 3);
        assert_eq!(refs.iter().filter(|o| o.controller == Some(true)).count(), 1);
        assert_eq!(controller_of(&refs).map(|o| o.uid.as_str()), Some("new"));
    }

    #[test]
    fn transition_time_kept_when_status_unchanged() {
        let mut conds = Vec::new();
        set_condition(&mut conds, Condition::ready("Parsed"));
        let t0 = conds[0].last_transition_time;
        std::thread::sleep(std::time::Duration::from_millis(2));
        set_condition(&mut conds, Condition::ready("Parsed"));
        assert_eq!(conds[0].last_transition_time, t0);
        set_condition(&mut conds, Condition::error("Parsed", "ParseError", "bad"));
        assert_eq!(conds.len(), 1);
        assert!(!conds[0].is_true());
        assert!(conds[0].last_transition_time > t0);
    }
}
