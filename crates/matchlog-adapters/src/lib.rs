//! Riot match-v5 adapter: summoner lookup, match-id collection and record normalization.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Local, Utc};
use matchlog_core::{
    DateZone, DurationUnit, FetchRequest, FetchResult, MatchDocument, MatchId, QueueType,
};
use matchlog_storage::HttpFetcher;
use reqwest::Url;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "matchlog-adapters";

/// Identifiers requested per listing page (the endpoint's maximum).
pub const PAGE_SIZE: usize = 100;

/// Safety bound on identifiers collected per queue type. History beyond it is dropped.
pub const MAX_MATCHES_PER_QUEUE: usize = 1000;

/// Separator between path segments in flattened field names.
pub const FIELD_SEPARATOR: char = '_';

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("could not authenticate summoner `{summoner}` (status {status:?}); make sure the API key is current")]
    Authentication { summoner: String, status: Option<u16> },
    #[error("invalid endpoint url `{url}`: {reason}")]
    Endpoint { url: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("payload has no participants to search")]
    NoParticipants,
    #[error("participant `{0}` is not part of this match")]
    ParticipantNotFound(String),
    #[error("payload is missing `{0}`")]
    MissingField(&'static str),
    #[error("participant record at index {0} is not an object")]
    MalformedParticipant(usize),
}

/// Base URLs for the platform-routed (summoner) and region-routed (match) APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiotEndpoints {
    pub platform_url: String,
    pub region_url: String,
}

impl Default for RiotEndpoints {
    fn default() -> Self {
        Self {
            platform_url: "https://na1.api.riotgames.com".to_string(),
            region_url: "https://americas.api.riotgames.com".to_string(),
        }
    }
}

impl RiotEndpoints {
    fn build(base: &str, segments: &[&str]) -> Result<Url, AdapterError> {
        let endpoint_error = |reason: String| AdapterError::Endpoint {
            url: base.to_string(),
            reason,
        };
        let mut url = Url::parse(base).map_err(|e| endpoint_error(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| endpoint_error("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn summoner_by_name(&self, summoner: &str) -> Result<String, AdapterError> {
        let url = Self::build(
            &self.platform_url,
            &["lol", "summoner", "v4", "summoners", "by-name", summoner],
        )?;
        Ok(url.to_string())
    }

    pub fn match_ids_page(
        &self,
        puuid: &str,
        queue: QueueType,
        start: usize,
        count: usize,
    ) -> Result<String, AdapterError> {
        let mut url = Self::build(
            &self.region_url,
            &["lol", "match", "v5", "matches", "by-puuid", puuid, "ids"],
        )?;
        url.query_pairs_mut()
            .append_pair("queue", &queue.code().to_string())
            .append_pair("start", &start.to_string())
            .append_pair("count", &count.to_string());
        Ok(url.to_string())
    }

    pub fn match_detail(&self, match_id: &str) -> Result<String, AdapterError> {
        let url = Self::build(&self.region_url, &["lol", "match", "v5", "matches", match_id])?;
        Ok(url.to_string())
    }
}

/// Deduplicated identifiers plus what each queue type contributed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectedMatchIds {
    pub ids: Vec<MatchId>,
    pub per_queue: BTreeMap<QueueType, usize>,
    pub duplicates_removed: usize,
}

#[derive(Debug, Clone)]
pub struct RiotApi {
    http: HttpFetcher,
    endpoints: RiotEndpoints,
}

impl RiotApi {
    pub fn new(http: HttpFetcher, endpoints: RiotEndpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }

    /// Resolve a summoner name to its PUUID. Any non-200 answer is fatal for the run.
    pub async fn summoner_puuid(&self, summoner: &str) -> Result<String, AdapterError> {
        let url = self.endpoints.summoner_by_name(summoner)?;
        let result = self.http.get_json(&FetchRequest::get(url)).await;

        let puuid = result
            .body
            .as_ref()
            .filter(|_| result.success)
            .and_then(|body| body.get("puuid"))
            .and_then(JsonValue::as_str);

        match puuid {
            Some(puuid) => {
                info!(summoner, "successfully authenticated");
                Ok(puuid.to_string())
            }
            None => Err(AdapterError::Authentication {
                summoner: summoner.to_string(),
                status: result.status,
            }),
        }
    }

    /// Page through the listing endpoint for each queue type in turn, then dedupe.
    ///
    /// Pages are requested one at a time. A failed page contributes nothing and the
    /// loop moves on; 429s are retried inside the fetcher.
    pub async fn collect_match_ids(
        &self,
        puuid: &str,
        queues: &[QueueType],
    ) -> Result<CollectedMatchIds, AdapterError> {
        let mut raw: Vec<MatchId> = Vec::new();
        let mut per_queue = BTreeMap::new();

        for &queue in queues {
            info!(queue = %queue, "getting all {queue} matches");
            let mut collected = 0usize;

            for start in (0..MAX_MATCHES_PER_QUEUE).step_by(PAGE_SIZE) {
                let url = self.endpoints.match_ids_page(puuid, queue, start, PAGE_SIZE)?;
                let result = self.http.get_json(&FetchRequest::get(url)).await;
                if !result.success {
                    debug!(queue = %queue, start, status = ?result.status, "skipping listing page");
                    continue;
                }

                let page = parse_id_page(result.body.as_ref());
                let page_len = page.len();
                collected += page_len;
                raw.extend(page);
                if page_len < PAGE_SIZE {
                    break;
                }
            }

            info!(queue = %queue, collected, "queue listing done");
            per_queue.insert(queue, collected);
        }

        let total = raw.len();
        let ids = dedupe_match_ids(raw);
        let duplicates_removed = total - ids.len();
        if duplicates_removed > 0 {
            info!(duplicates_removed, "duplicate matches removed");
        }
        info!(total = ids.len(), "there are {} total matches", ids.len());

        Ok(CollectedMatchIds {
            ids,
            per_queue,
            duplicates_removed,
        })
    }

    pub fn match_requests(&self, ids: &[MatchId]) -> Result<Vec<FetchRequest>, AdapterError> {
        ids.iter()
            .map(|id| self.endpoints.match_detail(id).map(FetchRequest::get))
            .collect()
    }
}

fn parse_id_page(body: Option<&JsonValue>) -> Vec<MatchId> {
    match body.and_then(JsonValue::as_array) {
        Some(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        None => {
            warn!("listing page body is not an array of ids");
            Vec::new()
        }
    }
}

/// Set union preserving first-seen order.
pub fn dedupe_match_ids(ids: Vec<MatchId>) -> Vec<MatchId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Last path segment of a match-detail URL.
pub fn match_id_from_url(url: &str) -> Option<&str> {
    url.split(['?', '#'])
        .next()?
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
}

pub fn millis_to_date(millis: i64, zone: DateZone) -> Option<String> {
    let utc = DateTime::<Utc>::from_timestamp_millis(millis)?;
    let date = match zone {
        DateZone::Local => utc.with_timezone(&Local).format("%Y-%m-%d").to_string(),
        DateZone::Utc => utc.format("%Y-%m-%d").to_string(),
    };
    Some(date)
}

fn date_value(timestamp: &JsonValue, zone: DateZone) -> JsonValue {
    let millis = timestamp
        .as_i64()
        .or_else(|| timestamp.as_f64().map(|f| f as i64));
    millis
        .and_then(|ms| millis_to_date(ms, zone))
        .map(JsonValue::String)
        .unwrap_or(JsonValue::Null)
}

/// Flatten nested objects into `parent_child` keys.
///
/// Array elements are flattened under the array's own path, so sibling elements
/// overwrite each other and the last one wins.
pub fn flatten_json(value: &JsonValue) -> MatchDocument {
    let mut out = MatchDocument::new();
    flatten_into(value, "", &mut out);
    out
}

fn flatten_into(value: &JsonValue, path: &str, out: &mut MatchDocument) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}{FIELD_SEPARATOR}{key}")
                };
                flatten_into(child, &child_path, out);
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                flatten_into(item, path, out);
            }
        }
        scalar => {
            out.insert(path.to_string(), scalar.clone());
        }
    }
}

/// Index of `participant` in `metadata.participants`. A repeated id resolves to its last slot.
pub fn find_participant_index(payload: &JsonValue, participant: &str) -> Result<usize, NormalizeError> {
    let participants = payload
        .pointer("/metadata/participants")
        .and_then(JsonValue::as_array)
        .ok_or(NormalizeError::MissingField("metadata.participants"))?;
    if participants.is_empty() {
        return Err(NormalizeError::NoParticipants);
    }
    participants
        .iter()
        .rposition(|p| p.as_str() == Some(participant))
        .ok_or_else(|| NormalizeError::ParticipantNotFound(participant.to_string()))
}

const COPIED_INFO_FIELDS: [&str; 6] = ["gameId", "gameMode", "gameName", "gameType", "gameVersion", "mapId"];

/// Turn one match payload into a flat document centred on `participant`.
pub fn normalize_match(
    payload: &JsonValue,
    participant: &str,
    zone: DateZone,
) -> Result<MatchDocument, NormalizeError> {
    let index = find_participant_index(payload, participant)?;
    let info = payload
        .get("info")
        .and_then(JsonValue::as_object)
        .ok_or(NormalizeError::MissingField("info"))?;
    let required = |key: &'static str| info.get(key).cloned().ok_or(NormalizeError::MissingField(key));

    let creation = required("gameCreation")?;
    let start = required("gameStartTimestamp")?;
    // gameEndTimestamp only exists on newer payloads; its presence switches gameDuration to seconds.
    let (unit, end, end_date) = match info.get("gameEndTimestamp") {
        Some(end) => (DurationUnit::Seconds, end.clone(), date_value(end, zone)),
        None => (DurationUnit::Milliseconds, JsonValue::Null, JsonValue::Null),
    };

    let mut doc = MatchDocument::new();
    doc.insert(
        "matchId".into(),
        payload.pointer("/metadata/matchId").cloned().unwrap_or(JsonValue::Null),
    );
    let creation_date = date_value(&creation, zone);
    doc.insert("gameCreation".into(), creation);
    doc.insert("gameCreationDate".into(), creation_date);
    doc.insert("gameDuration".into(), required("gameDuration")?);
    doc.insert("gameDurationUnits".into(), unit.as_str().into());
    let start_date = date_value(&start, zone);
    doc.insert("gameStartTimestamp".into(), start);
    doc.insert("gameStartTimestampDate".into(), start_date);
    doc.insert("gameEndTimestamp".into(), end);
    doc.insert("gameEndTimestampDate".into(), end_date);
    for key in COPIED_INFO_FIELDS {
        doc.insert(key.into(), required(key)?);
    }

    let record = info
        .get("participants")
        .and_then(JsonValue::as_array)
        .ok_or(NormalizeError::MissingField("participants"))?
        .get(index)
        .ok_or_else(|| NormalizeError::ParticipantNotFound(participant.to_string()))?;
    if !record.is_object() {
        return Err(NormalizeError::MalformedParticipant(index));
    }

    for (key, value) in flatten_json(record) {
        doc.insert(key, value);
    }
    Ok(doc)
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOutcome {
    pub documents: Vec<MatchDocument>,
    pub skipped: Vec<(String, NormalizeError)>,
}

/// Normalize every successful fetch result; failed results are ignored and bad records skipped.
pub fn normalize_results(results: &[FetchResult], participant: &str, zone: DateZone) -> NormalizeOutcome {
    let mut outcome = NormalizeOutcome::default();
    for result in results.iter().filter(|r| r.success) {
        let Some(body) = &result.body else {
            continue;
        };
        match normalize_match(body, participant, zone) {
            Ok(mut doc) => {
                if doc.get("matchId").map_or(true, JsonValue::is_null) {
                    if let Some(id) = match_id_from_url(&result.url) {
                        doc.insert("matchId".into(), JsonValue::String(id.to_string()));
                    }
                }
                debug!(match_id = ?doc.get("matchId"), "match processed");
                outcome.documents.push(doc);
            }
            Err(err) => {
                warn!(url = %result.url, error = %err, "skipping match");
                outcome.skipped.push((result.url.clone(), err));
            }
        }
    }
    outcome
}
