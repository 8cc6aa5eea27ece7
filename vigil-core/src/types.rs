use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LeaseError, Result};

/// Scalar-valued parameter mapping stored per camera subscription.
pub type ParamMap = serde_json::Map<String, serde_json::Value>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub i64);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionTypeId(pub i32);

impl fmt::Display for DetectionTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity a process writes into `assignment.worker_id`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named kind of analysis, e.g. `car`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(LeaseError::InvalidMessage(
                "capability name must not be empty".into(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, name: &str) -> bool {
        self.0 == name
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Stopped,
    Leased,
    Expired,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Stopped => "stopped",
            AssignmentStatus::Leased => "leased",
            AssignmentStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "stopped" => Ok(AssignmentStatus::Stopped),
            "leased" => Ok(AssignmentStatus::Leased),
            "expired" => Ok(AssignmentStatus::Expired),
            other => Err(LeaseError::Internal(format!(
                "store returned unknown assignment status {other}"
            ))),
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted owner, expiry and status of one (camera, capability) lease.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub camera_id: CameraId,
    pub detection_type_id: DetectionTypeId,
    pub worker_id: Option<WorkerId>,
    pub lease_until: Option<DateTime<Utc>>,
    pub status: AssignmentStatus,
    pub updated_at: DateTime<Utc>,
}

impl Assignment {
    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.status == AssignmentStatus::Leased && self.worker_id.as_ref() == Some(worker)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraSubscription {
    pub camera_id: CameraId,
    pub detection_type_id: DetectionTypeId,
    pub params: ParamMap,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// A detection result ready to be persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewDetectionEvent {
    pub event_id: Option<String>,
    pub camera_id: CameraId,
    pub detection_type: Capability,
    pub ts: DateTime<Utc>,
    pub cls: Option<String>,
    pub conf: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_known_values_only() {
        for status in [
            AssignmentStatus::Stopped,
            AssignmentStatus::Leased,
            AssignmentStatus::Expired,
        ] {
            assert_eq!(AssignmentStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(AssignmentStatus::parse("dead_letter").is_err());
    }

    #[test]
    fn capability_rejects_blank_names() {
        assert!(Capability::new("   ").is_err());
        assert_eq!(Capability::new(" car ").unwrap().as_str(), "car");
    }
}
