//! Core domain model for matchlog: queue types, fetch contracts and normalized documents.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "matchlog-core";

/// Opaque match identifier as issued by the listing endpoint (e.g. `NA1_4012345678`).
pub type MatchId = String;

/// Flat, single-level document handed to the sink.
pub type MatchDocument = serde_json::Map<String, JsonValue>;

/// Matchmaking categories this tool knows how to pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    /// Ranked/normal draft pick 5v5.
    Draft,
    /// Blind pick 5v5.
    Blind,
    /// All random, all mid.
    Aram,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Draft, QueueType::Blind, QueueType::Aram];

    /// Numeric queue code used by the remote API.
    pub fn code(self) -> u16 {
        match self {
            QueueType::Draft => 400,
            QueueType::Blind => 430,
            QueueType::Aram => 450,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueType::Draft => "draft",
            QueueType::Blind => "blind",
            QueueType::Aram => "aram",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueTypeError {
    #[error("unknown queue type `{0}` (expected one of: draft, blind, aram)")]
    Unknown(String),
}

impl FromStr for QueueType {
    type Err = QueueTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        QueueType::ALL
            .into_iter()
            .find(|q| q.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| QueueTypeError::Unknown(s.to_string()))
    }
}

/// Resolve a list of human-readable queue names, failing on the first unknown one.
pub fn resolve_queue_types<S: AsRef<str>>(names: &[S]) -> Result<Vec<QueueType>, QueueTypeError> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let queue = name.as_ref().parse::<QueueType>()?;
        if !out.contains(&queue) {
            out.push(queue);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
}

/// A single outbound call. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub method: HttpMethod,
    pub url: String,
    pub payload: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            payload: None,
        }
    }
}

/// Outcome of one request after the backoff protocol has settled.
///
/// `status` is `None` only when no HTTP response was ever received
/// (transport failure or cancellation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub url: String,
    pub status: Option<u16>,
    pub success: bool,
    pub body: Option<JsonValue>,
}

impl FetchResult {
    pub fn ok(url: impl Into<String>, status: u16, body: JsonValue) -> Self {
        Self {
            url: url.into(),
            status: Some(status),
            success: true,
            body: Some(body),
        }
    }

    pub fn failed(url: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            url: url.into(),
            status,
            success: false,
            body: None,
        }
    }
}

/// Unit tag written next to `gameDuration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurationUnit {
    Seconds,
    Milliseconds,
}

impl DurationUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            DurationUnit::Seconds => "s",
            DurationUnit::Milliseconds => "ms",
        }
    }
}

/// Time zone used when deriving `YYYY-MM-DD` strings from epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateZone {
    #[default]
    Local,
    Utc,
}

impl FromStr for DateZone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(DateZone::Local),
            "utc" => Ok(DateZone::Utc),
            other => Err(format!("unknown date zone `{other}` (expected local or utc)")),
        }
    }
}
