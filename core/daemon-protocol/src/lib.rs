//! IPC protocol types and validation for the playtime daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.
//!
//! Framing is one JSON object per line in each direction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_KEY_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    ActivityStarted,
    ActivityEnded,
    Presence,
    GetTotals,
    GetLiveSessions,
    Snapshot,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Params
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivityStartedParams {
    pub identity: String,
    pub activity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityParams {
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceParams {
    pub identity: String,
    #[serde(default)]
    pub activity: Option<String>,
}

impl ActivityStartedParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_key(&self.identity, "identity")?;
        require_key(&self.activity, "activity")
    }
}

impl IdentityParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_key(&self.identity, "identity")
    }
}

impl PresenceParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_key(&self.identity, "identity")?;
        match &self.activity {
            // Blank means "no activity" and is allowed.
            Some(activity) if activity.len() > MAX_KEY_BYTES => Err(ErrorInfo::new(
                "invalid_activity",
                format!("activity must be {} bytes or fewer", MAX_KEY_BYTES),
            )),
            _ => Ok(()),
        }
    }
}

pub fn parse_activity_started(params: Option<Value>) -> Result<ActivityStartedParams, ErrorInfo> {
    let parsed: ActivityStartedParams = parse_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_identity(params: Option<Value>) -> Result<IdentityParams, ErrorInfo> {
    let parsed: IdentityParams = parse_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_presence(params: Option<Value>) -> Result<PresenceParams, ErrorInfo> {
    let parsed: PresenceParams = parse_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new("invalid_params", "params are required"))?;
    if !params.is_object() {
        return Err(ErrorInfo::new("invalid_params", "params must be an object"));
    }
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("params are invalid: {}", err)))
}

fn require_key(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    if value.len() > MAX_KEY_BYTES {
        return Err(ErrorInfo::new(
            &format!("invalid_{}", field),
            format!("{} must be {} bytes or fewer", field, MAX_KEY_BYTES),
        ));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Response payloads
// ─────────────────────────────────────────────────────────────────────────────

/// `get_totals` payload. `found == false` means the identity has never
/// played anything; it is not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalsData {
    pub identity: String,
    pub found: bool,
    #[serde(default)]
    pub activities: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSessionData {
    pub identity: String,
    pub activity: String,
    pub opened_at: String,
    pub elapsed_nanos: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotData {
    pub flushed: usize,
    pub failed: usize,
}
