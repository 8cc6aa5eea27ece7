//! Wire format of the control and event queues.
//!
//! Control traffic arrives on three queues per capability: a
//! capability-specific `start` queue and the shared `stop` and `params`
//! queues. The queue a delivery came from decides which schema its body is
//! validated against; shared-queue messages then name their target
//! capability through `type` or `detection_type`.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, de};
use serde_json::Value;

use crate::error::{LeaseError, Result};
use crate::types::{CameraId, Capability, NewDetectionEvent, ParamMap};

pub const DEFAULT_QUEUE_PREFIX: &str = "det.";

/// Lease length applied when a start message carries no `lease_ttl_sec`.
pub const DEFAULT_LEASE_TTL_SECS: i64 = 60;

/// Top-level keys accepted in place of a `params` object.
const LEGACY_PARAM_KEYS: [&str; 2] = ["threshold", "max_fps"];

/// Resolves queue names under a shared prefix.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueNames {
    prefix: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_PREFIX)
    }
}

impl QueueNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn start(&self, capability: &Capability) -> String {
        format!("{}start.{}", self.prefix, capability)
    }

    pub fn stop(&self) -> String {
        format!("{}stop", self.prefix)
    }

    pub fn params(&self) -> String {
        format!("{}params", self.prefix)
    }

    pub fn events(&self) -> String {
        format!("{}events", self.prefix)
    }

    /// The three queues a command consumer for `capability` subscribes to.
    pub fn control_queues(&self, capability: &Capability) -> Vec<String> {
        vec![self.start(capability), self.stop(), self.params()]
    }

    pub fn control_kind(&self, capability: &Capability, queue: &str) -> Option<ControlKind> {
        if queue == self.start(capability) {
            Some(ControlKind::Start)
        } else if queue == self.stop() {
            Some(ControlKind::Stop)
        } else if queue == self.params() {
            Some(ControlKind::Params)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ControlKind {
    Start,
    Stop,
    Params,
}

impl ControlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::Start => "start",
            ControlKind::Stop => "stop",
            ControlKind::Params => "params",
        }
    }
}

/// Claim (or reclaim) a camera for the consuming worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartCommand {
    pub camera_id: CameraId,
    pub lease_ttl_secs: Option<i64>,
}

/// Release a camera for one capability.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopCommand {
    pub camera_id: CameraId,
    pub detection_type: String,
}

/// Merge detection parameters for a camera and capability.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamsCommand {
    pub camera_id: CameraId,
    pub detection_type: String,
    pub params: ParamMap,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    Start(StartCommand),
    Stop(StopCommand),
    Params(ParamsCommand),
}

impl ControlMessage {
    /// Validate `body` against the schema of `kind`.
    pub fn decode(kind: ControlKind, body: &[u8]) -> Result<Self> {
        match kind {
            ControlKind::Start => {
                let raw: RawStart = parse(body, kind)?;
                if let Some(ttl) = raw.lease_ttl_sec
                    && ttl <= 0
                {
                    return Err(LeaseError::InvalidMessage(format!(
                        "lease_ttl_sec must be positive, got {ttl}"
                    )));
                }
                Ok(ControlMessage::Start(StartCommand {
                    camera_id: CameraId(raw.camera_id),
                    lease_ttl_secs: raw.lease_ttl_sec,
                }))
            }
            ControlKind::Stop => {
                let raw: RawTargeted = parse(body, kind)?;
                let detection_type = raw.target()?;
                Ok(ControlMessage::Stop(StopCommand {
                    camera_id: CameraId(raw.camera_id),
                    detection_type,
                }))
            }
            ControlKind::Params => {
                let raw: RawTargeted = parse(body, kind)?;
                let detection_type = raw.target()?;
                let camera_id = CameraId(raw.camera_id);
                let params = raw.into_params()?;
                Ok(ControlMessage::Params(ParamsCommand {
                    camera_id,
                    detection_type,
                    params,
                }))
            }
        }
    }

    /// Decode `body` only if it is addressed to `capability`.
    ///
    /// Shared-queue bodies are checked for their `type`/`detection_type`
    /// first; one that names another capability, or none, yields `None`
    /// without the rest of it being validated. Start bodies are addressed by
    /// their queue and always decode.
    pub fn decode_for(
        kind: ControlKind,
        capability: &Capability,
        body: &[u8],
    ) -> Result<Option<Self>> {
        if kind != ControlKind::Start && !addressed_to(kind, capability, body)? {
            return Ok(None);
        }
        Self::decode(kind, body).map(Some)
    }

    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::Start(_) => ControlKind::Start,
            ControlMessage::Stop(_) => ControlKind::Stop,
            ControlMessage::Params(_) => ControlKind::Params,
        }
    }

    pub fn camera_id(&self) -> CameraId {
        match self {
            ControlMessage::Start(cmd) => cmd.camera_id,
            ControlMessage::Stop(cmd) => cmd.camera_id,
            ControlMessage::Params(cmd) => cmd.camera_id,
        }
    }

    /// Capability named in the payload. Start messages are addressed by
    /// their queue instead.
    pub fn target(&self) -> Option<&str> {
        match self {
            ControlMessage::Start(_) => None,
            ControlMessage::Stop(cmd) => Some(&cmd.detection_type),
            ControlMessage::Params(cmd) => Some(&cmd.detection_type),
        }
    }

    /// Whether a consumer serving `capability` should act on this message.
    pub fn is_for(&self, capability: &Capability) -> bool {
        self.target().is_none_or(|name| capability.matches(name))
    }
}

/// Validate an event-queue body.
pub fn decode_event(body: &[u8]) -> Result<NewDetectionEvent> {
    let raw: RawEvent = serde_json::from_slice(body)
        .map_err(|e| LeaseError::InvalidMessage(format!("event payload: {e}")))?;

    if let Some(event_id) = raw.event_id.as_deref()
        && event_id.trim().is_empty()
    {
        return Err(LeaseError::InvalidMessage(
            "event_id must not be blank".into(),
        ));
    }

    let conf = raw.conf.unwrap_or(0.0);
    if !conf.is_finite() {
        return Err(LeaseError::InvalidMessage(format!(
            "conf must be finite, got {conf}"
        )));
    }

    Ok(NewDetectionEvent {
        event_id: raw.event_id,
        camera_id: CameraId(raw.camera_id),
        detection_type: Capability::new(raw.detection_type)?,
        ts: raw.ts,
        cls: raw.cls,
        conf,
    })
}

fn addressed_to(kind: ControlKind, capability: &Capability, body: &[u8]) -> Result<bool> {
    let raw: RawAddress = parse(body, kind)?;
    Ok([raw.kind, raw.detection_type]
        .iter()
        .flatten()
        .any(|name| name.as_str().is_some_and(|name| capability.matches(name))))
}

fn parse<'a, T: Deserialize<'a>>(body: &'a [u8], kind: ControlKind) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| LeaseError::InvalidMessage(format!("{} payload: {e}", kind.as_str())))
}

#[derive(Debug, Deserialize)]
struct RawStart {
    camera_id: i64,
    #[serde(default)]
    lease_ttl_sec: Option<i64>,
}

/// Only the addressing fields of a shared-queue body, whatever their type.
#[derive(Debug, Deserialize)]
struct RawAddress {
    #[serde(rename = "type", default)]
    kind: Option<Value>,
    #[serde(default)]
    detection_type: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawTargeted {
    camera_id: i64,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    detection_type: Option<String>,
    #[serde(default)]
    params: Option<ParamMap>,
    #[serde(default)]
    threshold: Option<Value>,
    #[serde(default)]
    max_fps: Option<Value>,
}

impl RawTargeted {
    fn target(&self) -> Result<String> {
        let name = match (self.kind.as_deref(), self.detection_type.as_deref()) {
            (Some(a), Some(b)) if a != b => {
                return Err(LeaseError::InvalidMessage(format!(
                    "type {a:?} disagrees with detection_type {b:?}"
                )));
            }
            (Some(name), _) | (None, Some(name)) => name,
            (None, None) => {
                return Err(LeaseError::InvalidMessage(
                    "missing type/detection_type".into(),
                ));
            }
        };
        if name.trim().is_empty() {
            return Err(LeaseError::InvalidMessage(
                "type/detection_type must not be blank".into(),
            ));
        }
        Ok(name.to_string())
    }

    fn into_params(self) -> Result<ParamMap> {
        let map = match self.params {
            Some(map) => map,
            None => {
                let mut map = ParamMap::new();
                for (key, value) in LEGACY_PARAM_KEYS.iter().zip([self.threshold, self.max_fps]) {
                    if let Some(value) = value {
                        map.insert((*key).to_string(), value);
                    }
                }
                if map.is_empty() {
                    return Err(LeaseError::InvalidMessage(
                        "params payload carries no parameters".into(),
                    ));
                }
                map
            }
        };

        if let Some((key, _)) = map
            .iter()
            .find(|(_, value)| value.is_array() || value.is_object())
        {
            return Err(LeaseError::InvalidMessage(format!(
                "param {key:?} must be a scalar"
            )));
        }

        Ok(map)
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    event_id: Option<String>,
    camera_id: i64,
    detection_type: String,
    #[serde(deserialize_with = "event_time")]
    ts: DateTime<Utc>,
    #[serde(default)]
    cls: Option<String>,
    #[serde(default)]
    conf: Option<f64>,
}

/// Event timestamps with an offset are converted to UTC; ones without an
/// offset are taken to already be UTC.
fn event_time<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    let raw = raw.trim();
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| raw.parse::<NaiveDateTime>().map(|naive| naive.and_utc()))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").map(|naive| naive.and_utc())
        })
        .map_err(|_| de::Error::custom(format!("invalid event timestamp {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn car() -> Capability {
        Capability::new("car").unwrap()
    }

    fn body(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn queue_names_follow_prefix() {
        let names = QueueNames::default();
        assert_eq!(
            names.control_queues(&car()),
            vec!["det.start.car", "det.stop", "det.params"]
        );
        assert_eq!(names.events(), "det.events");
        assert_eq!(
            names.control_kind(&car(), "det.start.car"),
            Some(ControlKind::Start)
        );
        assert_eq!(names.control_kind(&car(), "det.start.person"), None);
    }

    #[test]
    fn start_defaults_ttl_to_none() {
        let msg = ControlMessage::decode(ControlKind::Start, &body(json!({"camera_id": 3}))).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Start(StartCommand {
                camera_id: CameraId(3),
                lease_ttl_secs: None
            })
        );
        assert!(msg.is_for(&car()));
    }

    #[test]
    fn start_rejects_non_positive_ttl_and_string_ids() {
        let zero = body(json!({"camera_id": 3, "lease_ttl_sec": 0}));
        assert!(ControlMessage::decode(ControlKind::Start, &zero).is_err());

        let stringly = body(json!({"camera_id": "3"}));
        assert!(ControlMessage::decode(ControlKind::Start, &stringly).is_err());
    }

    #[test]
    fn stop_accepts_either_type_field() {
        for payload in [
            json!({"camera_id": 9, "type": "car"}),
            json!({"camera_id": 9, "detection_type": "car"}),
            json!({"camera_id": 9, "type": "car", "detection_type": "car"}),
        ] {
            let msg = ControlMessage::decode(ControlKind::Stop, &body(payload)).unwrap();
            assert_eq!(msg.target(), Some("car"));
            assert_eq!(msg.camera_id(), CameraId(9));
        }
    }

    #[test]
    fn stop_rejects_ambiguous_or_missing_type() {
        let ambiguous = body(json!({"camera_id": 9, "type": "car", "detection_type": "person"}));
        assert!(ControlMessage::decode(ControlKind::Stop, &ambiguous).is_err());

        let missing = body(json!({"camera_id": 9}));
        assert!(ControlMessage::decode(ControlKind::Stop, &missing).is_err());
    }

    #[test]
    fn other_capabilities_are_not_for_us() {
        let msg = ControlMessage::decode(
            ControlKind::Stop,
            &body(json!({"camera_id": 1, "type": "person"})),
        )
        .unwrap();
        assert!(!msg.is_for(&car()));
    }

    #[test]
    fn foreign_bodies_are_not_validated() {
        for (kind, payload) in [
            (ControlKind::Stop, json!({"camera_id": "3", "type": "person"})),
            (ControlKind::Stop, json!({"detection_type": "person"})),
            (ControlKind::Stop, json!({"camera_id": 3})),
            (ControlKind::Stop, json!({"camera_id": 3, "type": 7})),
            (ControlKind::Params, json!({"type": "person", "params": {"zones": [1, 2]}})),
            (ControlKind::Params, json!({"camera_id": 3, "detection_type": "person"})),
        ] {
            let decoded = ControlMessage::decode_for(kind, &car(), &body(payload.clone()));
            assert!(matches!(decoded, Ok(None)), "{payload} should be skipped");
        }
    }

    #[test]
    fn addressed_bodies_are_fully_validated() {
        let stop = ControlMessage::decode_for(
            ControlKind::Stop,
            &car(),
            &body(json!({"camera_id": 9, "type": "car"})),
        )
        .unwrap();
        assert_eq!(stop.map(|msg| msg.camera_id()), Some(CameraId(9)));

        let nested = body(json!({"camera_id": 4, "type": "car", "params": {"zones": [1]}}));
        assert!(ControlMessage::decode_for(ControlKind::Params, &car(), &nested).is_err());

        let ambiguous = body(json!({"camera_id": 9, "type": "person", "detection_type": "car"}));
        assert!(ControlMessage::decode_for(ControlKind::Stop, &car(), &ambiguous).is_err());

        // Start bodies are addressed by their queue, so a bad one is an error.
        let start = body(json!({"camera_id": "3"}));
        assert!(ControlMessage::decode_for(ControlKind::Start, &car(), &start).is_err());

        // Without any readable addressing there is nothing to skip on.
        assert!(ControlMessage::decode_for(ControlKind::Stop, &car(), b"not json").is_err());
    }

    #[test]
    fn params_prefers_explicit_map() {
        let msg = ControlMessage::decode(
            ControlKind::Params,
            &body(json!({"camera_id": 4, "type": "car", "params": {"threshold": 7}, "max_fps": 2})),
        )
        .unwrap();
        let ControlMessage::Params(cmd) = msg else {
            panic!("expected params");
        };
        assert_eq!(cmd.params, json!({"threshold": 7}).as_object().cloned().unwrap());
    }

    #[test]
    fn params_falls_back_to_legacy_top_level_keys() {
        let msg = ControlMessage::decode(
            ControlKind::Params,
            &body(json!({"camera_id": 4, "detection_type": "car", "threshold": 5, "max_fps": 10})),
        )
        .unwrap();
        let ControlMessage::Params(cmd) = msg else {
            panic!("expected params");
        };
        assert_eq!(
            cmd.params,
            json!({"threshold": 5, "max_fps": 10}).as_object().cloned().unwrap()
        );
    }

    #[test]
    fn params_rejects_nested_values_and_empty_payloads() {
        let nested = body(json!({"camera_id": 4, "type": "car", "params": {"zones": [1, 2]}}));
        assert!(ControlMessage::decode(ControlKind::Params, &nested).is_err());

        let empty = body(json!({"camera_id": 4, "type": "car"}));
        assert!(ControlMessage::decode(ControlKind::Params, &empty).is_err());
    }

    #[test]
    fn event_defaults_conf_and_keeps_optional_fields() {
        let event = decode_event(&body(json!({
            "camera_id": 3,
            "detection_type": "car",
            "ts": "2025-03-01T12:00:00Z"
        })))
        .unwrap();
        assert_eq!(event.conf, 0.0);
        assert_eq!(event.event_id, None);
        assert_eq!(event.cls, None);
        assert_eq!(event.detection_type.as_str(), "car");
    }

    #[test]
    fn event_rejects_blank_id_and_bad_timestamp() {
        let blank = body(json!({
            "event_id": " ",
            "camera_id": 3,
            "detection_type": "car",
            "ts": "2025-03-01T12:00:00Z"
        }));
        assert!(decode_event(&blank).is_err());

        let bad_ts = body(json!({"camera_id": 3, "detection_type": "car", "ts": "yesterday"}));
        assert!(decode_event(&bad_ts).is_err());
    }

    #[test]
    fn event_timestamps_without_offset_are_utc() {
        let expected = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        for ts in [
            "2025-03-01T12:00:00",
            "2025-03-01 12:00:00",
            "2025-03-01T12:00:00.000",
            "2025-03-01T12:00:00Z",
            "2025-03-01T14:00:00+02:00",
        ] {
            let event =
                decode_event(&body(json!({"camera_id": 3, "detection_type": "car", "ts": ts})))
                    .unwrap_or_else(|err| panic!("{ts}: {err}"));
            assert_eq!(event.ts, expected, "{ts}");
        }
    }
}
