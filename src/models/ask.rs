use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::{LetsPingError, Result};

/// Prefix used for ids minted by the hosted-API client.
pub const REQUEST_ID_PREFIX: &str = "req";
/// Prefix used for ids minted by the local tunnel relay.
pub const LOCAL_REQUEST_ID_PREFIX: &str = "req_local";

/// Marker key carried by schema-builder objects (e.g. Zod) that were passed
/// where a JSON Schema document was expected.
const VALIDATOR_DEFINITION_MARKER: &str = "_def";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Case-insensitive name lookup.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// Unknown or non-string priorities fall back to the default.
impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        match raw.as_str().and_then(Priority::parse) {
            Some(priority) => Ok(priority),
            None => {
                tracing::debug!(priority = %raw, "unrecognised priority, using default");
                Ok(Priority::default())
            }
        }
    }
}

/// A request for human approval of a proposed action.
///
/// Unknown fields supplied by the caller are preserved in `extra` so the
/// relay can republish the ask verbatim. Known optional fields are decoded
/// leniently: a malformed value degrades to unset instead of failing the
/// whole ask, leaving `validate` as the only gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AskRequest {
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    /// Service (or channel) the action belongs to, e.g. "stripe" or "db-ops".
    #[serde(
        default,
        alias = "channel",
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub service: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// JSON Schema describing the editable form shown to the reviewer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    /// Declared timeout, in whole seconds (fractions round up).
    #[serde(
        default,
        deserialize_with = "lenient::opt_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<u64>,
    /// Server-assigned; an unparseable inbound value is dropped.
    #[serde(
        default,
        deserialize_with = "lenient::opt_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AskRequest {
    pub fn new(service: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            service: Some(service.into()),
            action: action.into(),
            payload: Some(payload),
            description: None,
            priority: Priority::default(),
            schema: None,
            timeout: None,
            created_at: None,
            extra: Map::new(),
        }
    }

    /// Use a caller-supplied id; replays with the same id are idempotent.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.as_secs().max(1));
        self
    }

    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    pub fn service_name(&self) -> &str {
        self.service.as_deref().unwrap_or("unknown")
    }

    /// Rejects asks that lack a service/channel or an object payload.
    pub fn validate(&self) -> Result<()> {
        match self.service.as_deref() {
            Some(s) if !s.trim().is_empty() => {}
            _ => {
                return Err(LetsPingError::Validation(
                    "missing required field 'service' (or 'channel')".into(),
                ))
            }
        }
        match &self.payload {
            Some(Value::Object(_)) => Ok(()),
            Some(_) => Err(LetsPingError::Validation(
                "'payload' must be a JSON object".into(),
            )),
            None => Err(LetsPingError::Validation(
                "missing required field 'payload'".into(),
            )),
        }
    }

    /// Returns the caller-supplied id, or mints and stores a fresh one.
    pub fn ensure_id(&mut self, prefix: &str) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => {
                let id = generate_request_id(prefix);
                self.id = Some(id.clone());
                id
            }
        }
    }

    /// Advisory check on the `schema` field. Never fails the ask: a bad
    /// schema only degrades the reviewer's form to an empty one.
    ///
    /// Detection of validator objects is structural sniffing on a private
    /// marker key and will miss builders that do not carry it.
    pub fn check_schema(&self) -> Option<SchemaWarning> {
        let schema = self.schema.as_ref()?;
        let warning = if schema.get(VALIDATOR_DEFINITION_MARKER).is_some() {
            SchemaWarning::ValidatorObject
        } else if let Err(e) = jsonschema::JSONSchema::compile(schema) {
            SchemaWarning::InvalidSchema(e.to_string())
        } else {
            return None;
        };
        tracing::warn!(
            service = %self.service_name(),
            action = %self.action,
            "{}",
            warning
        );
        Some(warning)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaWarning {
    ValidatorObject,
    InvalidSchema(String),
}

impl std::fmt::Display for SchemaWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaWarning::ValidatorObject => write!(
                f,
                "'schema' looks like a raw validator object rather than JSON Schema; \
                 the reviewer will see an empty form. Convert it to JSON Schema first"
            ),
            SchemaWarning::InvalidSchema(e) => write!(
                f,
                "'schema' is not a valid JSON Schema ({}); the reviewer will see an empty form",
                e
            ),
        }
    }
}

/// `<prefix>_<base36 millis><8 random alphanumerics>`.
pub fn generate_request_id(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{}_{}{}", prefix, to_base36(millis), suffix)
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

mod lenient {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn opt_string<'de, D>(d: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn string<'de, D>(d: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(opt_string(d)?.unwrap_or_default())
    }

    pub fn opt_seconds<'de, D>(d: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        Ok(secs
            .filter(|s| s.is_finite() && *s > 0.0)
            .map(|s| s.ceil() as u64))
    }

    pub fn opt_timestamp<'de, D>(d: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(d)? {
            Value::String(raw) => DateTime::parse_from_rfc3339(&raw)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            _ => None,
        })
    }
}
