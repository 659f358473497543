use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use matchlog_core::{DateZone, MatchDocument, QueueType};
use matchlog_storage::MemoryDocumentSink;
use matchlog_sync::{IngestPipeline, RunRequest, SyncConfig};
use serde_json::{json, Value};

#[derive(Default)]
struct FakeRiot {
    hits: AtomicUsize,
    slow_ids: bool,
}

fn match_payload(id: &str, players: &[&str], kills: i64) -> Value {
    let participants: Vec<Value> = players
        .iter()
        .enumerate()
        .map(|(i, puuid)| {
            json!({
                "puuid": puuid,
                "championName": "Ahri",
                "kills": kills + i as i64,
                "perks": {"statPerks": {"offense": 5008}}
            })
        })
        .collect();
    json!({
        "metadata": {"matchId": id, "participants": players},
        "info": {
            "gameCreation": 1_600_000_000_000_i64,
            "gameDuration": 1800,
            "gameStartTimestamp": 1_600_000_001_000_i64,
            "gameEndTimestamp": 1_600_001_801_000_i64,
            "gameId": 1,
            "gameMode": "CLASSIC",
            "gameName": "teambuilder-match",
            "gameType": "MATCHED_GAME",
            "gameVersion": "13.1.1",
            "mapId": 11,
            "participants": participants
        }
    })
}

async fn summoner(State(riot): State<Arc<FakeRiot>>, Path(name): Path<String>) -> Response {
    riot.hits.fetch_add(1, Ordering::SeqCst);
    if name == "Known Player" {
        Json(json!({"puuid": "puuid-me"})).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn listing(State(riot): State<Arc<FakeRiot>>, Path(_puuid): Path<String>) -> Response {
    riot.hits.fetch_add(1, Ordering::SeqCst);
    if riot.slow_ids {
        return Json(vec!["NA1_slow"]).into_response();
    }
    Json(vec!["NA1_1", "NA1_2", "NA1_3", "NA1_4"]).into_response()
}

async fn detail(State(riot): State<Arc<FakeRiot>>, Path(id): Path<String>) -> Response {
    riot.hits.fetch_add(1, Ordering::SeqCst);
    match id.as_str() {
        "NA1_1" => Json(match_payload(&id, &["puuid-other", "puuid-me"], 3)).into_response(),
        "NA1_2" => StatusCode::NOT_FOUND.into_response(),
        "NA1_3" => Json(match_payload(&id, &["puuid-other", "puuid-third"], 1)).into_response(),
        "NA1_4" => Json(match_payload(&id, &["puuid-me"], 9)).into_response(),
        _ => (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "30")], "").into_response(),
    }
}

async fn spawn_fake_riot(slow_ids: bool) -> (String, Arc<FakeRiot>) {
    let riot = Arc::new(FakeRiot {
        slow_ids,
        ..Default::default()
    });
    let router = Router::new()
        .route("/lol/summoner/v4/summoners/by-name/{name}", get(summoner))
        .route("/lol/match/v5/matches/by-puuid/{puuid}/ids", get(listing))
        .route("/lol/match/v5/matches/{id}", get(detail))
        .with_state(riot.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    (format!("http://{addr}"), riot)
}

fn test_config(base: &str) -> SyncConfig {
    SyncConfig {
        platform_url: base.to_string(),
        region_url: base.to_string(),
        http_timeout_secs: 5,
        rate_limit: 4,
        pacing: Duration::ZERO,
        prefetch_cooldown: Duration::ZERO,
        date_zone: DateZone::Utc,
        ..Default::default()
    }
}

fn request() -> RunRequest {
    RunRequest {
        summoner: "Known Player".into(),
        queue_types: vec![QueueType::Draft],
    }
}

fn stale_document() -> MatchDocument {
    let mut doc = MatchDocument::new();
    doc.insert("matchId".into(), json!("NA1_stale"));
    doc
}

#[tokio::test]
async fn run_replaces_collection_with_normalized_matches() {
    let (base, _riot) = spawn_fake_riot(false).await;
    let pipeline = IngestPipeline::new(test_config(&base), "RGAPI-test").expect("pipeline");
    let sink = MemoryDocumentSink::with_documents("match_data", vec![stale_document(), stale_document()]);

    let summary = pipeline.run_once(&request(), &sink).await.expect("run");

    assert_eq!(summary.puuid, "puuid-me");
    assert_eq!(summary.match_ids, 4);
    assert_eq!(summary.fetched_ok, 3);
    assert_eq!(summary.fetch_failed, 1);
    assert_eq!(summary.normalized, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.deleted, 2);
    assert_eq!(summary.inserted, 2);
    assert!(summary.finished_at >= summary.started_at);

    let documents = sink.documents().await;
    let ids: BTreeSet<&str> = documents
        .iter()
        .filter_map(|d| d.get("matchId").and_then(Value::as_str))
        .collect();
    assert_eq!(ids, BTreeSet::from(["NA1_1", "NA1_4"]));

    let first = documents
        .iter()
        .find(|d| d["matchId"] == "NA1_1")
        .expect("NA1_1 document");
    assert_eq!(first["kills"], 4);
    assert_eq!(first["puuid"], "puuid-me");
    assert_eq!(first["gameDurationUnits"], "s");
    assert_eq!(first["gameCreationDate"], "2020-09-13");
    assert_eq!(first["perks_statPerks_offense"], 5008);
}

#[tokio::test]
async fn unknown_summoner_fails_without_touching_the_sink() {
    let (base, _riot) = spawn_fake_riot(false).await;
    let pipeline = IngestPipeline::new(test_config(&base), "RGAPI-test").expect("pipeline");
    let sink = MemoryDocumentSink::with_documents("match_data", vec![stale_document()]);

    let result = pipeline
        .run_once(
            &RunRequest {
                summoner: "Nobody".into(),
                queue_types: vec![QueueType::Draft],
            },
            &sink,
        )
        .await;

    assert!(result.is_err());
    assert_eq!(sink.documents().await.len(), 1);
}

#[tokio::test]
async fn missing_api_key_file_stops_before_any_request() {
    let (base, riot) = spawn_fake_riot(false).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let config = SyncConfig {
        api_key_path: dir.path().join("api_key.txt"),
        ..test_config(&base)
    };

    let result = IngestPipeline::from_config(config).await;

    assert!(result.is_err());
    assert_eq!(riot.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn api_key_file_is_used_for_requests() {
    let (base, _riot) = spawn_fake_riot(false).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("api_key.txt");
    std::fs::write(&path, "RGAPI-test\n").expect("write key");
    let config = SyncConfig {
        api_key_path: path,
        ..test_config(&base)
    };

    let pipeline = IngestPipeline::from_config(config).await.expect("pipeline");
    let extraction = pipeline.extract(&request()).await.expect("extract");

    assert_eq!(extraction.collected.ids.len(), 4);
    assert_eq!(extraction.documents.len(), 2);
}

#[tokio::test]
async fn cancelled_run_leaves_the_sink_untouched() {
    let (base, _riot) = spawn_fake_riot(true).await;
    let pipeline = IngestPipeline::new(test_config(&base), "RGAPI-test").expect("pipeline");
    let sink = MemoryDocumentSink::with_documents("match_data", vec![stale_document()]);

    let trigger = pipeline.cancellation();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), pipeline.run_once(&request(), &sink))
        .await
        .expect("cancellation should end the run before Retry-After elapses");

    assert!(result.is_err());
    let documents = sink.documents().await;
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0]["matchId"], "NA1_stale");
}
