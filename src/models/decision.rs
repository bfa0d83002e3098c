use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source tag stamped on resolutions delivered through the local relay.
pub const LOCAL_RESOLUTION_SOURCE: &str = "local_dev_tunnel";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pending,
    Approved,
    Rejected,
    Timeout,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "PENDING",
            Status::Approved => "APPROVED",
            Status::Rejected => "REJECTED",
            Status::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// The human verdict on an ask. Terminal decisions are never revised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    #[serde(rename = "requestId", alias = "id", default)]
    pub request_id: String,
    pub status: Status,
    /// Effective payload: the reviewer's patch when one was made, otherwise
    /// the payload originally submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patched_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl Decision {
    pub fn pending(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: Status::Pending,
            payload: None,
            patched_payload: None,
            reason: None,
            resolved_at: None,
            actor_id: None,
            method: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == Status::Approved
    }

    /// Fills `payload` with the patch if present, else with `original`.
    pub fn with_original_payload(mut self, original: Option<&Value>) -> Self {
        self.payload = self
            .patched_payload
            .clone()
            .or_else(|| original.cloned());
        self
    }
}

/// Status document as returned by the hosted API. Resolution metadata may
/// appear at the top level or nested under `metadata`.
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub status: Status,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub patched_payload: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub metadata: Option<ResolutionMetadata>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolutionMetadata {
    #[serde(default)]
    pub resolved_at: Option<String>,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

impl StatusResponse {
    pub fn into_decision(self, request_id: &str) -> Decision {
        let meta = self.metadata.unwrap_or_default();
        let resolved_at = self
            .resolved_at
            .or(meta.resolved_at)
            .and_then(|raw| parse_timestamp(&raw));
        Decision {
            request_id: self.id.unwrap_or_else(|| request_id.to_string()),
            status: self.status,
            payload: self.payload,
            patched_payload: self.patched_payload,
            reason: self.reason,
            resolved_at,
            actor_id: self.actor_id.or(meta.actor_id),
            method: self.method.or(meta.method),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    tracing::debug!(raw = %raw, "unparseable resolved_at timestamp");
    None
}

/// Verdict carried by a `resolve_local_request` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolveUpdate {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patched_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvePayload {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub update: ResolveUpdate,
}

impl ResolvePayload {
    pub fn into_decision(self) -> Decision {
        Decision {
            request_id: self.request_id,
            status: self.update.status,
            payload: None,
            patched_payload: self.update.patched_payload,
            reason: self.update.reason,
            resolved_at: Some(Utc::now()),
            actor_id: self.update.actor_id,
            method: self.update.method,
        }
    }
}

/// Response body written to a held ingest connection once it is resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalResolution {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub metadata: LocalResolutionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalResolutionMetadata {
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl From<Decision> for LocalResolution {
    fn from(d: Decision) -> Self {
        Self {
            status: d.status,
            payload: d.patched_payload,
            reason: d.reason,
            metadata: LocalResolutionMetadata {
                source: LOCAL_RESOLUTION_SOURCE.to_string(),
                timestamp: Utc::now(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_value(Status::Approved).unwrap(), "APPROVED");
        let s: Status = serde_json::from_value(json!("TIMEOUT")).unwrap();
        assert_eq!(s, Status::Timeout);
        assert!(!Status::Pending.is_terminal());
        assert!(Status::Rejected.is_terminal());
    }

    #[test]
    fn test_patched_payload_wins() {
        let d = Decision {
            patched_payload: Some(json!({"limit": 10})),
            status: Status::Approved,
            ..Decision::pending("req_1")
        }
        .with_original_payload(Some(&json!({"limit": 5000})));
        assert_eq!(d.payload, Some(json!({"limit": 10})));
    }

    #[test]
    fn test_original_payload_when_unpatched() {
        let d = Decision {
            status: Status::Approved,
            ..Decision::pending("req_1")
        }
        .with_original_payload(Some(&json!({"limit": 5000})));
        assert_eq!(d.payload, Some(json!({"limit": 5000})));
    }

    #[test]
    fn test_status_response_reads_nested_metadata() {
        let raw: StatusResponse = serde_json::from_value(json!({
            "status": "APPROVED",
            "payload": {"amount": 100},
            "patched_payload": {"amount": 100},
            "metadata": {"actor_id": "user_1", "resolved_at": "2024-01-01"}
        }))
        .unwrap();
        let d = raw.into_decision("req_123");
        assert_eq!(d.request_id, "req_123");
        assert_eq!(d.actor_id.as_deref(), Some("user_1"));
        assert!(d.resolved_at.is_some());
    }

    #[test]
    fn test_status_response_top_level_wins() {
        let raw: StatusResponse = serde_json::from_value(json!({
            "id": "req_9",
            "status": "REJECTED",
            "reason": "Risk score too high",
            "actor_id": "top",
            "resolved_at": "2025-03-01T10:00:00Z",
            "metadata": {"actor_id": "nested"}
        }))
        .unwrap();
        let d = raw.into_decision("ignored");
        assert_eq!(d.request_id, "req_9");
        assert_eq!(d.actor_id.as_deref(), Some("top"));
        assert_eq!(d.reason.as_deref(), Some("Risk score too high"));
    }

    #[test]
    fn test_resolve_payload_wire_shape() {
        let p: ResolvePayload = serde_json::from_value(json!({
            "requestId": "req_local_1",
            "update": {"status": "APPROVED", "patched_payload": {"x": 1}}
        }))
        .unwrap();
        let d = p.into_decision();
        assert_eq!(d.request_id, "req_local_1");
        assert_eq!(d.patched_payload, Some(json!({"x": 1})));
        assert!(d.resolved_at.is_some());
    }

    #[test]
    fn test_local_resolution_omits_absent_payload() {
        let body = LocalResolution::from(Decision {
            status: Status::Rejected,
            reason: Some("nope".into()),
            ..Decision::pending("req_1")
        });
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["status"], "REJECTED");
        assert!(v.get("payload").is_none());
        assert_eq!(v["reason"], "nope");
        assert_eq!(v["metadata"]["source"], LOCAL_RESOLUTION_SOURCE);
    }
}
