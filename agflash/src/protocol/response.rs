//! Typed command responses.
//!
//! The device prints a JSON object keyed by module name:
//!
//! ```text
//! {
//!   "FW_UPDATE": { "RESULT": "PASS", "MSG": {...}, "ERRNO": 0 }
//! }
//! $
//! ```
//!
//! Frames are decoded exactly once, here; callers only see [`Response`].

use {
    crate::error::{Error, Result},
    serde::Deserialize,
    serde_json::Value,
};

/// Result string reported for success.
pub const RESULT_PASS: &str = "PASS";

/// Successful response body.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Module-specific payload (`MSG`), `Null` when absent.
    pub msg: Value,
    /// Device error number (`ERRNO`), when reported.
    pub errno: Option<i64>,
}

/// Refused command.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    /// Reported result (usually `FAIL`).
    pub result: String,
    /// Module-specific payload (`MSG`).
    pub msg: Value,
    /// Device error number (`ERRNO`), when reported.
    pub errno: Option<i64>,
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// `RESULT` was `PASS`.
    Pass(Reply),
    /// `RESULT` was anything else.
    Fail(Failure),
    /// No complete frame arrived in time.
    Timeout,
    /// A frame arrived but was not a result object for the module.
    Invalid(String),
}

#[derive(Deserialize)]
struct Body {
    #[serde(rename = "RESULT")]
    result: String,
    #[serde(rename = "MSG", default)]
    msg: Value,
    #[serde(rename = "ERRNO", default)]
    errno: Option<i64>,
}

impl Response {
    /// Decode a captured frame for `module`.
    pub fn decode(module: &str, raw: &str) -> Self {
        let Ok(Value::Object(mut root)) = serde_json::from_str::<Value>(raw) else {
            return Self::Invalid(raw.to_string());
        };
        let Some(body) = root.remove(module) else {
            return Self::Invalid(raw.to_string());
        };
        match serde_json::from_value::<Body>(body) {
            Ok(body) if body.result == RESULT_PASS => Self::Pass(Reply {
                msg: body.msg,
                errno: body.errno,
            }),
            Ok(body) => Self::Fail(Failure {
                result: body.result,
                msg: body.msg,
                errno: body.errno,
            }),
            Err(_) => Self::Invalid(raw.to_string()),
        }
    }

    /// Short result label (`PASS`, `FAIL`, `TIMEOUT`, `INVALID`).
    pub fn label(&self) -> &str {
        match self {
            Self::Pass(_) => RESULT_PASS,
            Self::Fail(f) => &f.result,
            Self::Timeout => "TIMEOUT",
            Self::Invalid(_) => "INVALID",
        }
    }

    /// Whether the device reported `PASS`.
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass(_))
    }

    /// Convert into the reply, mapping every other outcome to its error.
    pub fn expect_pass(self, command: &str) -> Result<Reply> {
        match self {
            Self::Pass(reply) => Ok(reply),
            Self::Fail(failure) => Err(Error::DeviceRejected {
                command: command.to_string(),
                result: failure.result,
                errno: failure.errno,
            }),
            Self::Timeout => Err(Error::Timeout(format!("no response to {command}"))),
            Self::Invalid(raw) => Err(Error::MalformedResponse {
                command: command.to_string(),
                raw,
            }),
        }
    }
}
