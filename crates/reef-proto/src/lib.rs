//! Wire protocol shared by the console's realtime client and relay.
//!
//! Everything that crosses a logical channel is a [`Frame`]; everything a
//! handler answers with is an [`Envelope`]. Keeping these in a dedicated
//! crate lets the client and server cores evolve without dragging each
//! other's runtime dependencies along.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP-style response envelope: a status code plus a structured body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub status_code: u16,
    pub body: Value,
}

impl Envelope {
    pub fn ok(body: Value) -> Self {
        Self {
            status_code: 200,
            body,
        }
    }

    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            body: serde_json::json!({ "error": message.into() }),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Transport-internal acknowledgement payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// Everything that can flow over one logical channel.
///
/// The discriminant is explicit so the channel boundary can tell
/// application data from transport-internal control messages without
/// shape-sniffing. Control frames never enter a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Application data: raw `data`, derived `pipeline`, or `stream` payloads.
    Data(Envelope),
    /// A router-bound request.
    Request(RequestFrame),
    /// `startStreaming` control message.
    Start(StreamStart),
    /// `stopStreaming` control message.
    Stop,
    /// Transport-internal acknowledgement.
    Ack(AckFrame),
}

impl Frame {
    /// True for frames the transport owns; these bypass pipelines untouched.
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Ack(_))
    }

    pub fn as_data(&self) -> Option<&Envelope> {
        match self {
            Frame::Data(envelope) => Some(envelope),
            _ => None,
        }
    }
}

/// Event vocabulary of a channel, camelCase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelEvent {
    Data,
    Pipeline,
    Stream,
    BeforeStreaming,
    StreamingError,
    StartStreaming,
    StopStreaming,
    Request,
    End,
}

/// HTTP-style verbs dispatched through the socket router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::Get => "get",
            Verb::Post => "post",
            Verb::Put => "put",
            Verb::Patch => "patch",
            Verb::Delete => "delete",
        };
        f.write_str(name)
    }
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(Verb::Get),
            "post" => Ok(Verb::Post),
            "put" => Ok(Verb::Put),
            "patch" => Ok(Verb::Patch),
            "delete" => Ok(Verb::Delete),
            other => Err(format!("unknown verb {other}")),
        }
    }
}

/// Headers and query-string parameters attached to a request or stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub qs: BTreeMap<String, String>,
}

impl RequestOptions {
    /// Merge copy: `self` wins over `base` on conflicting keys. Neither
    /// input is mutated.
    pub fn merged_over(&self, base: &RequestOptions) -> RequestOptions {
        let mut merged = base.clone();
        merged.headers.extend(
            self.headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
            .qs
            .extend(self.qs.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// A router-bound request framed onto a shared channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub path: String,
    pub verb: Verb,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub options: RequestOptions,
}

/// `startStreaming` control payload: which stream method to invoke and
/// with which options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStart {
    pub method: String,
    #[serde(default)]
    pub options: RequestOptions,
}

/// A backend collection body: `{ "objects": [...] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection<T> {
    pub objects: Vec<T>,
}

/// A long-running backend operation awaited by the completion loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: u64,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub errored: bool,
    /// Job resource URIs, e.g. `/api/job/3/`.
    #[serde(default)]
    pub jobs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Command {
    pub fn finished(&self) -> bool {
        self.cancelled || self.complete || self.errored
    }

    /// Numeric ids parsed out of the job resource URIs. URIs that do not
    /// end in an integer segment are skipped.
    pub fn job_ids(&self) -> Vec<u64> {
        self.jobs
            .iter()
            .filter_map(|uri| {
                uri.trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .and_then(|segment| segment.parse().ok())
            })
            .collect()
    }
}

/// One step of a long-running operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    #[serde(default)]
    pub step_results: Value,
}
