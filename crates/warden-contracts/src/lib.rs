use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_VERSION: &str = "0.1.0";

/// Fixed sentinel username for the demo identity. Never persisted.
pub const DEMO_USERNAME: &str = "demo";

/// Demo sessions and demo bearer tokens expire this many hours after creation.
pub const DEMO_SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Body returned in place of a real mutation when demo interception fires.
/// `simulated` is the caller-visible signal that no state changed; it is
/// always true when the envelope is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatedResponse {
    pub success: bool,
    pub message: String,
    pub simulated: bool,
}

impl SimulatedResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            simulated: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DemoLoginResponse {
    pub token: String,
    pub username: String,
    pub permissions: Vec<String>,
    pub is_demo: bool,
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DemoStatusResponse {
    pub enabled: bool,
    pub active_sessions: usize,
    #[serde(default)]
    pub last_reset: Option<String>,
    #[serde(default)]
    pub next_reset: Option<String>,
    pub reset_interval_hours: i64,
    pub simulated_actions: Vec<String>,
}

/// Wire contract for remote token verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyRequest {
    pub token: String,
    pub kind: TokenKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyResponse {
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }
}
