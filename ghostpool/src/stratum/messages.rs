//! Stratum message types and JSON serialization.
//!
//! Requests carry an `id`, a `method` and positional `params`. Responses
//! echo the request ID with a `result` and an `error`, the latter being the
//! usual Stratum triple `[code, message, null]`. Notifications are pushed
//! with a null ID.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use strum::EnumString;
use thiserror::Error;

use crate::address::AddressError;
use crate::types::Difficulty;

/// Protocol name advertised in the subscribe result.
pub const PROTOCOL_VERSION: &str = "EthereumStratum/1.0.0";

/// Worker name used when `mining.authorize` carries a bare address.
pub const DEFAULT_WORKER: &str = "default";

/// Hex digits in a full nonce.
const NONCE_DIGITS: usize = 16;

/// Methods a miner may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
pub enum Method {
    #[strum(serialize = "mining.subscribe")]
    Subscribe,
    #[strum(serialize = "mining.extranonce.subscribe")]
    ExtranonceSubscribe,
    #[strum(serialize = "mining.authorize")]
    Authorize,
    #[strum(serialize = "mining.submit")]
    Submit,
}

/// Request from a miner.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub params: Vec<Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Request {
    /// String parameter at `index`.
    pub fn str_param(&self, index: usize, name: &'static str) -> Result<&str, ProtocolError> {
        self.params
            .get(index)
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MalformedParams(name))
    }
}

/// Stratum error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownMethod = 20,
    JobNotFound = 21,
    DuplicateShare = 22,
    LowDifficultyShare = 23,
}

impl ErrorCode {
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::UnknownMethod => "Unknown method",
            ErrorCode::JobNotFound => "Job not found",
            ErrorCode::DuplicateShare => "Duplicate share",
            ErrorCode::LowDifficultyShare => "Low difficulty share",
        }
    }
}

/// Error carried in a response, serialized as `[code, message, null]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StratumError(pub ErrorCode);

impl Serialize for StratumError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.0 as i32, self.0.message(), Value::Null).serialize(serializer)
    }
}

/// Response to a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Value,
    pub result: Value,
    pub error: Option<StratumError>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    /// A `false` result with an error, used for rejected shares.
    pub fn reject(id: Value, code: ErrorCode) -> Self {
        Self {
            id,
            result: Value::Bool(false),
            error: Some(StratumError(code)),
        }
    }

    /// A null result with an error.
    pub fn error(id: Value, code: ErrorCode) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(StratumError(code)),
        }
    }
}

/// Server-initiated message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    id: Option<u64>,
    pub method: &'static str,
    pub params: Vec<Value>,
}

impl Notification {
    fn new(method: &'static str, params: Vec<Value>) -> Self {
        Self {
            id: None,
            method,
            params,
        }
    }

    /// New work; `params` are the job ID followed by the encoded job.
    pub fn notify(params: Vec<Value>) -> Self {
        Self::new("mining.notify", params)
    }

    pub fn set_difficulty(difficulty: Difficulty) -> Self {
        Self::new("mining.set_difficulty", vec![json!(difficulty.as_f64())])
    }

    /// Extranonce prefix and the number of nonce bytes left to the miner.
    pub fn set_extranonce(extranonce: &str) -> Self {
        let remaining = (NONCE_DIGITS - extranonce.len().min(NONCE_DIGITS)) / 2;
        Self::new("mining.set_extranonce", vec![json!(extranonce), json!(remaining)])
    }
}

/// Protocol violations and unknown requests.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("already subscribed")]
    AlreadySubscribed,

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("worker '{0}' already authorized on this connection")]
    DuplicateWorker(String),

    #[error("worker '{worker}' is not authorized for {address}")]
    WorkerMismatch { address: String, worker: String },

    #[error("malformed {0}")]
    MalformedParams(&'static str),

    #[error("unknown method '{0}'")]
    UnknownMethod(String),
}

impl ProtocolError {
    /// Whether the connection must be closed.
    pub fn is_violation(&self) -> bool {
        !matches!(self, ProtocolError::UnknownMethod(_))
    }
}

/// Split `address.worker`, defaulting the worker name.
pub fn split_identity(identity: &str) -> (&str, &str) {
    match identity.split_once('.') {
        Some((address, worker)) if !worker.is_empty() => (address, worker),
        Some((address, _)) => (address, DEFAULT_WORKER),
        None => (identity, DEFAULT_WORKER),
    }
}

/// Parse a submitted nonce.
///
/// Nonces are hex with an optional `0x`. Miners given an extranonce send
/// only their own part; the extranonce is put in front and the miner part
/// zero-padded to fill the remaining digits.
pub fn parse_nonce(nonce: &str, extranonce: &str) -> Result<u64, ProtocolError> {
    let digits = nonce
        .strip_prefix("0x")
        .or_else(|| nonce.strip_prefix("0X"))
        .unwrap_or(nonce);
    if digits.is_empty() {
        return Err(ProtocolError::MalformedParams("nonce"));
    }

    let full = if !extranonce.is_empty() && digits.len() < NONCE_DIGITS {
        let width = NONCE_DIGITS.saturating_sub(extranonce.len());
        format!("{extranonce}{digits:0>width$}")
    } else {
        digits.to_string()
    };
    if full.len() > NONCE_DIGITS {
        return Err(ProtocolError::MalformedParams("nonce"));
    }
    u64::from_str_radix(&full, 16).map_err(|_| ProtocolError::MalformedParams("nonce"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_parse_request() {
        let request: Request = serde_json::from_str(
            r#"{"id":1,"method":"mining.subscribe","params":["lolMiner 1.0"]}"#,
        )
        .unwrap();
        assert_eq!(request.id, json!(1));
        assert_eq!(request.method.parse::<Method>().unwrap(), Method::Subscribe);
        assert_eq!(request.str_param(0, "identity"), Ok("lolMiner 1.0"));
        assert_eq!(
            request.str_param(1, "worker"),
            Err(ProtocolError::MalformedParams("worker"))
        );
    }

    #[test]
    fn test_missing_or_null_params() {
        let request: Request = serde_json::from_str(r#"{"id":"a","method":"x","params":null}"#).unwrap();
        assert!(request.params.is_empty());
        let request: Request = serde_json::from_str(r#"{"method":"x"}"#).unwrap();
        assert_eq!(request.id, Value::Null);
        assert!(request.params.is_empty());
    }

    #[test]
    fn test_unknown_method() {
        assert!("mining.suggest_difficulty".parse::<Method>().is_err());
        assert!(!ProtocolError::UnknownMethod("x".into()).is_violation());
        assert!(ProtocolError::AlreadySubscribed.is_violation());
    }

    #[test]
    fn test_response_shapes() {
        let ok = serde_json::to_value(Response::ok(json!(3), json!(true))).unwrap();
        assert_eq!(ok, json!({"id": 3, "result": true, "error": null}));

        let rejected = serde_json::to_value(Response::reject(json!(4), ErrorCode::DuplicateShare)).unwrap();
        assert_eq!(
            rejected,
            json!({"id": 4, "result": false, "error": [22, "Duplicate share", null]})
        );

        let unknown = serde_json::to_value(Response::error(json!(5), ErrorCode::UnknownMethod)).unwrap();
        assert_eq!(unknown["result"], Value::Null);
        assert_eq!(unknown["error"][0], 20);
    }

    #[test]
    fn test_notification_shapes() {
        let diff = serde_json::to_value(Notification::set_difficulty(Difficulty::new(4.0))).unwrap();
        assert_eq!(
            diff,
            json!({"id": null, "method": "mining.set_difficulty", "params": [4.0]})
        );

        let extranonce = serde_json::to_value(Notification::set_extranonce("beef")).unwrap();
        assert_eq!(extranonce["method"], "mining.set_extranonce");
        assert_eq!(extranonce["params"], json!(["beef", 6]));
    }

    #[test_case("kaspa:qq.rig1", ("kaspa:qq", "rig1") ; "address and worker")]
    #[test_case("kaspa:qq", ("kaspa:qq", "default") ; "bare address")]
    #[test_case("kaspa:qq.", ("kaspa:qq", "default") ; "empty worker")]
    #[test_case("kaspa:qq.rack.3", ("kaspa:qq", "rack.3") ; "dotted worker")]
    fn test_split_identity(identity: &str, expected: (&str, &str)) {
        assert_eq!(split_identity(identity), expected);
    }

    #[test_case("00000000000000ff", "", 0xff ; "full nonce")]
    #[test_case("0x1f", "", 0x1f ; "prefixed")]
    #[test_case("1f", "beef", 0xbeef_0000_0000_001f ; "extranonce prefixed")]
    #[test_case("0123456789abcdef", "beef", 0x0123_4567_89ab_cdef ; "full nonce ignores extranonce")]
    fn test_parse_nonce(nonce: &str, extranonce: &str, expected: u64) {
        assert_eq!(parse_nonce(nonce, extranonce), Ok(expected));
    }

    #[test]
    fn test_parse_nonce_rejects_garbage() {
        assert!(parse_nonce("", "").is_err());
        assert!(parse_nonce("0x", "").is_err());
        assert!(parse_nonce("zz", "").is_err());
        assert!(parse_nonce("00112233445566778", "").is_err());
    }
}
