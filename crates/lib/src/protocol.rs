//! Gateway WebSocket protocol types (frames, connect handshake, hello-ok).
//!
//! Every frame is a JSON object tagged by `"kind"`: `"req"`, `"res"` or `"event"`.
//! Inbound frames tagged with the legacy `"type"` key are accepted as well.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved request id of the connect handshake. Never produced by the request counter.
pub const HANDSHAKE_ID: &str = "connect";

/// Method name of the connect handshake request.
pub const CONNECT_METHOD: &str = "connect";

/// Protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = 1;

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// Wire request: `{ "kind": "req", "id", "method", "params"? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Wire response: `{ "kind": "res", "id", "ok", "payload"? , "error"? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Server push: `{ "kind": "event", "event", "payload"?, "seq"?, "stateVersion"? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Any JSON number; gateways are not required to send integers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<f64>,
    #[serde(
        rename = "stateVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub state_version: Option<Value>,
}

/// Structured error carried by a failed response.
///
/// Some gateways send `error` as a bare string; that form is read as `{ code: "ERROR", message }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ErrorRepr")]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    /// Error used when a failed response carries no `error` of its own.
    pub fn unspecified() -> Self {
        Self::new("UNAVAILABLE", "request failed")
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorRepr {
    Message(String),
    Shape {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        details: Option<Value>,
        #[serde(default)]
        retryable: Option<bool>,
        #[serde(rename = "retryAfterMs", default)]
        retry_after_ms: Option<u64>,
    },
}

impl From<ErrorRepr> for ErrorInfo {
    fn from(repr: ErrorRepr) -> Self {
        match repr {
            ErrorRepr::Message(message) => ErrorInfo::new("ERROR", message),
            ErrorRepr::Shape {
                code,
                message,
                details,
                retryable,
                retry_after_ms,
            } => ErrorInfo {
                code: code.unwrap_or_else(|| "ERROR".to_string()),
                message: message.unwrap_or_default(),
                details,
                retryable,
                retry_after_ms,
            },
        }
    }
}

impl Frame {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Frame::Request(RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Parse one inbound text message into a frame.
pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let mut value: Value = serde_json::from_str(text)?;
    if let Some(obj) = value.as_object_mut() {
        if !obj.contains_key("kind") {
            if let Some(kind) = obj.remove("type") {
                obj.insert("kind".to_string(), kind);
            }
        }
    }
    serde_json::from_value(value)
}

/// Params of the `connect` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default)]
    pub caps: Vec<String>,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub auth: ConnectAuth,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo::default(),
            caps: Vec::new(),
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            auth: ConnectAuth::default(),
        }
    }
}

/// Static identity the client announces during the handshake. Missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            id: "gateway-client".to_string(),
            display_name: Some("Gateway Client".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: "ui".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Payload of a successful `connect` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type", default)]
    pub typ: String,
    #[serde(default)]
    pub protocol: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<HelloPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    pub tick_interval_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_wire_shape() {
        let text = Frame::request("7", "models.list", Some(json!({})))
            .to_text()
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({ "kind": "req", "id": "7", "method": "models.list", "params": {} })
        );
    }

    #[test]
    fn request_without_params_omits_field() {
        let text = Frame::request("1", "health", None).to_text().unwrap();
        assert!(!text.contains("params"));
    }

    #[test]
    fn parses_response_with_structured_error() {
        let frame = parse_frame(
            r#"{"kind":"res","id":"3","ok":false,"error":{"code":"RATE_LIMITED","message":"slow down","retryable":true,"retryAfterMs":500}}"#,
        )
        .unwrap();
        let Frame::Response(res) = frame else {
            panic!("expected response");
        };
        let err = res.error.unwrap();
        assert_eq!(err.code, "RATE_LIMITED");
        assert_eq!(err.retryable, Some(true));
        assert_eq!(err.retry_after_ms, Some(500));
    }

    #[test]
    fn parses_string_error() {
        let frame =
            parse_frame(r#"{"kind":"res","id":"connect","ok":false,"error":"unauthorized"}"#)
                .unwrap();
        let Frame::Response(res) = frame else {
            panic!("expected response");
        };
        assert_eq!(res.error, Some(ErrorInfo::new("ERROR", "unauthorized")));
    }

    #[test]
    fn request_tag_is_kind() {
        let text = Frame::request("1", "models.list", None).to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["kind"], json!("req"));
        assert!(value.get("type").is_none());
    }

    #[test]
    fn accepts_legacy_type_tag() {
        let frame = parse_frame(r#"{"type":"res","id":"4","ok":true,"payload":1}"#).unwrap();
        let Frame::Response(res) = frame else {
            panic!("expected response");
        };
        assert_eq!(res.id, "4");
        assert_eq!(res.payload, Some(json!(1)));
    }

    #[test]
    fn event_seq_may_be_fractional() {
        let frame = parse_frame(r#"{"kind":"event","event":"tick","seq":2.5}"#).unwrap();
        let Frame::Event(evt) = frame else {
            panic!("expected event");
        };
        assert_eq!(evt.seq, Some(2.5));
    }

    #[test]
    fn parses_event_with_kind_tag() {
        let frame = parse_frame(
            r#"{"kind":"event","event":"presence","payload":{"n":1},"seq":4,"stateVersion":{"presence":2}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            Frame::Event(EventFrame {
                event: "presence".to_string(),
                payload: Some(json!({ "n": 1 })),
                seq: Some(4.0),
                state_version: Some(json!({ "presence": 2 })),
            })
        );
    }

    #[test]
    fn rejects_unknown_frame_type() {
        assert!(parse_frame(r#"{"kind":"hello","id":"1"}"#).is_err());
        assert!(parse_frame("not json").is_err());
    }

    #[test]
    fn connect_params_use_camel_case() {
        let mut params = ConnectParams::default();
        params.auth.token = Some("secret".to_string());
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["minProtocol"], json!(PROTOCOL_VERSION));
        assert_eq!(value["maxProtocol"], json!(PROTOCOL_VERSION));
        assert_eq!(value["client"]["displayName"], json!("Gateway Client"));
        assert_eq!(value["role"], json!("operator"));
        assert_eq!(value["auth"]["token"], json!("secret"));
    }

    #[test]
    fn hello_ok_reads_policy() {
        let hello: HelloOk = serde_json::from_value(json!({
            "type": "hello-ok",
            "protocol": 1,
            "policy": { "tickIntervalMs": 15000 }
        }))
        .unwrap();
        assert_eq!(hello.protocol, 1);
        assert_eq!(hello.policy.and_then(|p| p.tick_interval_ms), Some(15_000));
    }
}
