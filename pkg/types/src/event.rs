use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

/// The object an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

fn one() -> u32 {
    1
}

/// Human-readable record attached to a central object.
///
/// Repeats of the same (object, type, reason, action, cluster) are folded
/// into one series: `count` goes up and `timestamp` moves to the latest
/// occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub involved_object: ObjectReference,
    pub event_type: EventType,
    /// Machine-readable reason (e.g. "RoleNotFound")
    pub reason: String,
    /// What the controller was doing (e.g. "Reconcile", "Teardown")
    pub action: String,
    #[serde(default)]
    pub note: Option<String>,
    /// Member cluster the event concerns, if any.
    #[serde(default)]
    pub cluster: Option<String>,
    pub reporting_controller: String,
    #[serde(default = "one")]
    pub count: u32,
    #[serde(default = "Utc::now")]
    pub first_timestamp: DateTime<Utc>,
    /// Latest occurrence.
    pub timestamp: DateTime<Utc>,
}
