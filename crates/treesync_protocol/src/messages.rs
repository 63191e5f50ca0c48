//! Wire messages and their JSON framing.
//!
//! Outbound frames:
//!
//! ```text
//! {"r":7,"a":"l","b":{"p":"/a/b"}}
//! {"r":8,"a":"p","b":{"p":"/a","d":{"x":1}}}
//! {"r":9,"a":"auth","b":{"cred":"token"}}
//! ```
//!
//! Inbound frames are tagged by `t`: `h` handshake, `d` data update,
//! `r` response, `c` connection closed.

use crate::error::{ProtocolError, ProtocolResult};
use std::fmt;
use std::time::Duration;
use treesync_codec::{from_json_str, to_json_string, Value};
use treesync_core::Path;

/// Client-assigned request identifier, unique per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Returns the id that follows this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an outbound request asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Start pushing changes under a path.
    Listen,
    /// Stop pushing changes under a path.
    Unlisten,
    /// Replace the value at a path.
    Put,
    /// Merge an object into the value at a path.
    Merge,
    /// Present a credential.
    Auth,
    /// Idle keepalive.
    Keepalive,
}

impl Action {
    /// Wire code.
    pub fn code(self) -> &'static str {
        match self {
            Action::Listen => "l",
            Action::Unlisten => "u",
            Action::Put => "p",
            Action::Merge => "m",
            Action::Auth => "auth",
            Action::Keepalive => "ka",
        }
    }

    /// Parses a wire code.
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "l" => Action::Listen,
            "u" => Action::Unlisten,
            "p" => Action::Put,
            "m" => Action::Merge,
            "auth" => Action::Auth,
            "ka" => Action::Keepalive,
            _ => return None,
        })
    }

    /// Returns true for put and merge.
    pub fn is_write(self) -> bool {
        matches!(self, Action::Put | Action::Merge)
    }
}

/// A request sent from the client to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    /// Request id.
    pub id: RequestId,
    /// Requested action.
    pub action: Action,
    /// Target path (listen, unlisten, put, merge).
    pub path: Option<Path>,
    /// Payload (put, merge).
    pub data: Option<Value>,
    /// Credential (auth).
    pub credential: Option<String>,
}

impl OutboundRequest {
    fn bare(id: RequestId, action: Action) -> Self {
        Self {
            id,
            action,
            path: None,
            data: None,
            credential: None,
        }
    }

    /// Creates a listen request.
    pub fn listen(id: RequestId, path: Path) -> Self {
        Self {
            path: Some(path),
            ..Self::bare(id, Action::Listen)
        }
    }

    /// Creates an unlisten request.
    pub fn unlisten(id: RequestId, path: Path) -> Self {
        Self {
            path: Some(path),
            ..Self::bare(id, Action::Unlisten)
        }
    }

    /// Creates a put request.
    pub fn put(id: RequestId, path: Path, data: Value) -> Self {
        Self {
            path: Some(path),
            data: Some(data),
            ..Self::bare(id, Action::Put)
        }
    }

    /// Creates a merge request.
    pub fn merge(id: RequestId, path: Path, data: Value) -> Self {
        Self {
            path: Some(path),
            data: Some(data),
            ..Self::bare(id, Action::Merge)
        }
    }

    /// Creates an auth request.
    pub fn auth(id: RequestId, credential: impl Into<String>) -> Self {
        Self {
            credential: Some(credential.into()),
            ..Self::bare(id, Action::Auth)
        }
    }

    /// Creates a keepalive request.
    pub fn keepalive(id: RequestId) -> Self {
        Self::bare(id, Action::Keepalive)
    }

    /// Encodes to a JSON frame.
    pub fn encode(&self) -> String {
        let mut body = Vec::new();
        if let Some(ref path) = self.path {
            body.push(("p", Value::String(path.to_string())));
        }
        if let Some(ref data) = self.data {
            body.push(("d", data.clone()));
        }
        if let Some(ref credential) = self.credential {
            body.push(("cred", Value::string(credential.as_str())));
        }

        let mut pairs = vec![
            ("r", Value::Number(self.id.0 as f64)),
            ("a", Value::string(self.action.code())),
        ];
        if !body.is_empty() {
            pairs.push(("b", Value::object(body)));
        }
        to_json_string(&Value::object(pairs))
    }

    /// Decodes a JSON frame.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON, missing fields, unknown action
    /// codes and unparsable paths.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let value = from_json_str(text)?;
        let id = get_u64(&value, "r").map(RequestId)?;
        let code = get_str(&value, "a")?;
        let action =
            Action::from_code(code).ok_or_else(|| ProtocolError::unknown_code("a", code))?;

        let body = value.get("b");
        let get_body = |name: &str| body.and_then(|b| b.get(name));

        let path = get_body("p")
            .map(|p| p.as_str().ok_or_else(|| ProtocolError::missing("p")))
            .transpose()?
            .map(Path::parse)
            .transpose()?;
        let data = get_body("d").cloned();
        let credential = get_body("cred").and_then(Value::as_str).map(str::to_string);

        Ok(Self {
            id,
            action,
            path,
            data,
            credential,
        })
    }
}

/// Whether a data update replaces or merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Replace the value at the path.
    Put,
    /// Merge the object into the value at the path.
    Merge,
}

/// Outcome reported by a response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    /// The request succeeded.
    Ok,
    /// The request was rejected with a server status string.
    Rejected(String),
}

impl ResponseStatus {
    /// Returns true for [`ResponseStatus::Ok`].
    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseStatus::Ok)
    }

    fn code(&self) -> &str {
        match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::Rejected(status) => status,
        }
    }
}

/// A message received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// The connection is established.
    Handshake {
        /// Server wall clock at handshake, in milliseconds since the epoch.
        server_time_millis: u64,
    },
    /// Server-side data changed under a listened path.
    DataUpdate {
        /// Put or merge.
        kind: UpdateKind,
        /// Where the change applies.
        path: Path,
        /// New value or partial object.
        data: Value,
    },
    /// Completion of an earlier request.
    Response {
        /// The request being answered.
        id: RequestId,
        /// Outcome.
        status: ResponseStatus,
        /// Optional server payload or message.
        data: Option<Value>,
    },
    /// The transport closed or failed.
    ConnectionClosed {
        /// Whether the client should reconnect.
        recoverable: bool,
        /// Server-requested delay before reconnecting.
        retry_after: Option<Duration>,
    },
}

impl InboundMessage {
    /// Creates a handshake message.
    pub fn handshake(server_time_millis: u64) -> Self {
        Self::Handshake { server_time_millis }
    }

    /// Creates a put data update.
    pub fn put(path: Path, data: Value) -> Self {
        Self::DataUpdate {
            kind: UpdateKind::Put,
            path,
            data,
        }
    }

    /// Creates a merge data update.
    pub fn merge(path: Path, data: Value) -> Self {
        Self::DataUpdate {
            kind: UpdateKind::Merge,
            path,
            data,
        }
    }

    /// Creates a successful response.
    pub fn ok(id: RequestId) -> Self {
        Self::Response {
            id,
            status: ResponseStatus::Ok,
            data: None,
        }
    }

    /// Creates a rejection.
    pub fn rejected(id: RequestId, status: impl Into<String>) -> Self {
        Self::Response {
            id,
            status: ResponseStatus::Rejected(status.into()),
            data: None,
        }
    }

    /// Creates a close notification.
    pub fn closed(recoverable: bool, retry_after: Option<Duration>) -> Self {
        Self::ConnectionClosed {
            recoverable,
            retry_after,
        }
    }

    /// Encodes to a JSON frame.
    pub fn encode(&self) -> String {
        let value = match self {
            InboundMessage::Handshake { server_time_millis } => Value::object([
                ("t", Value::string("h")),
                ("ts", Value::Number(*server_time_millis as f64)),
            ]),
            InboundMessage::DataUpdate { kind, path, data } => {
                let code = match kind {
                    UpdateKind::Put => "p",
                    UpdateKind::Merge => "m",
                };
                Value::object([
                    ("t", Value::string("d")),
                    ("a", Value::string(code)),
                    (
                        "b",
                        Value::object([
                            ("p", Value::String(path.to_string())),
                            ("d", data.clone()),
                        ]),
                    ),
                ])
            }
            InboundMessage::Response { id, status, data } => {
                let mut pairs = vec![
                    ("t", Value::string("r")),
                    ("r", Value::Number(id.0 as f64)),
                    ("s", Value::string(status.code())),
                ];
                if let Some(data) = data {
                    pairs.push(("d", data.clone()));
                }
                Value::object(pairs)
            }
            InboundMessage::ConnectionClosed {
                recoverable,
                retry_after,
            } => {
                let mut pairs = vec![
                    ("t", Value::string("c")),
                    ("recoverable", Value::Bool(*recoverable)),
                ];
                if let Some(delay) = retry_after {
                    pairs.push(("retry_after", Value::Number(delay.as_millis() as f64)));
                }
                Value::object(pairs)
            }
        };
        to_json_string(&value)
    }

    /// Decodes a JSON frame.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON, missing fields, unknown type or
    /// action codes and unparsable paths.
    pub fn decode(text: &str) -> ProtocolResult<Self> {
        let value = from_json_str(text)?;
        let tag = get_str(&value, "t")?;

        match tag {
            "h" => Ok(Self::Handshake {
                server_time_millis: get_u64(&value, "ts")?,
            }),
            "d" => {
                let kind = match get_str(&value, "a")? {
                    "p" => UpdateKind::Put,
                    "m" => UpdateKind::Merge,
                    other => return Err(ProtocolError::unknown_code("a", other)),
                };
                let body = value.get("b").ok_or_else(|| ProtocolError::missing("b"))?;
                let path = Path::parse(get_str(body, "p")?)?;
                let data = body.get("d").cloned().unwrap_or_default();
                Ok(Self::DataUpdate { kind, path, data })
            }
            "r" => {
                let id = RequestId(get_u64(&value, "r")?);
                let status = match get_str(&value, "s")? {
                    "ok" => ResponseStatus::Ok,
                    other => ResponseStatus::Rejected(other.to_string()),
                };
                let data = value.get("d").filter(|d| !d.is_null()).cloned();
                Ok(Self::Response { id, status, data })
            }
            "c" => {
                let recoverable = value
                    .get("recoverable")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let retry_after = match value.get("retry_after") {
                    None | Some(Value::Null) => None,
                    Some(_) => Some(Duration::from_millis(get_u64(&value, "retry_after")?)),
                };
                Ok(Self::ConnectionClosed {
                    recoverable,
                    retry_after,
                })
            }
            other => Err(ProtocolError::unknown_code("t", other)),
        }
    }
}

fn get_str<'a>(value: &'a Value, field: &'static str) -> ProtocolResult<&'a str> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::missing(field))
}

fn get_u64(value: &Value, field: &'static str) -> ProtocolResult<u64> {
    value
        .get(field)
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite() && *n >= 0.0 && n.fract() == 0.0)
        .map(|n| n as u64)
        .ok_or_else(|| ProtocolError::missing(field))
}
