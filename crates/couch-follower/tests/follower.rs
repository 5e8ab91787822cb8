//! Follower behaviour against a scripted continuous feed

use couch_client::mock::{MockReply, MockTransport};
use couch_client::{CouchClient, Database, HttpRequest};
use couch_core::config::{ClientConfig, FollowerConfig};
use couch_core::message::{ChangeEvent, ChangeKind, Seq};
use couch_core::observer::TracingObserver;
use couch_follower::{CheckpointStore, Follower, MemoryCheckpoint};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn setup(
    handler: impl Fn(&HttpRequest) -> MockReply + Send + Sync + 'static,
) -> (Arc<MockTransport>, Database) {
    let mock = MockTransport::new(handler);
    let mut config = ClientConfig::new("http://mock:5984");
    config.retry.max_retries = 0;
    let client = CouchClient::with_transport(&config, mock.clone(), TracingObserver::shared("test"))
        .unwrap();
    let db = client.database("source").unwrap();
    (mock, db)
}

/// Feed row with `seq` first, as servers send it; `seq` is a raw JSON token
fn row(seq: &str, id: &str, changes: &str) -> String {
    format!(r#"{{"seq":{},"id":"{}","changes":{}}}"#, seq, id, changes)
}

async fn collect(follower: &mut Follower) -> Vec<ChangeEvent> {
    let stream = follower.follow().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("feed terminated")
}

#[tokio::test]
async fn test_feed_events_and_position() {
    let (mock, db) = setup(|_| {
        MockReply::lines(
            200,
            [
                row("57", "a", r#"[{"rev":"1-aa"}]"#),
                String::new(),
                row(r#""58""#, "b", r#"[{"rev":"2-bb"}]"#),
                r#"{"seq":59,"id":"c","changes":[{"rev":"3-cc"}],"deleted":true}"#.to_string(),
                r#"{"last_seq":59,"pending":0}"#.to_string(),
            ],
        )
    });
    let mut follower = Follower::new(db, FollowerConfig::default());

    let events = collect(&mut follower).await;
    let kinds: Vec<ChangeKind> = events.iter().map(ChangeEvent::kind).collect();
    assert_eq!(
        kinds,
        vec![
            ChangeKind::Insert,
            ChangeKind::Heartbeat,
            ChangeKind::Update,
            ChangeKind::Delete,
            ChangeKind::Terminated,
        ]
    );
    assert_eq!(follower.last_seq(), Some(Seq::from("59")));

    let req = &mock.requests_to("_changes")[0];
    assert_eq!(req.query("feed").as_deref(), Some("continuous"));
    assert_eq!(req.query("heartbeat").as_deref(), Some("10000"));
    assert_eq!(req.query("timeout").as_deref(), Some("30000"));
    assert_eq!(req.query("include_docs").as_deref(), Some("true"));
    assert_eq!(req.query("since"), None);
}

#[tokio::test]
async fn test_resume_from_checkpoint() {
    let (mock, db) = setup(|_| {
        MockReply::lines(
            200,
            [row(r#""13-g1A""#, "x", r#"[{"rev":"4-dd"}]"#)],
        )
    });
    let checkpoint = MemoryCheckpoint::with_value("12-g1A");
    let mut follower =
        Follower::new(db, FollowerConfig::default()).with_since(checkpoint.load().await.unwrap());

    let events = collect(&mut follower).await;
    for event in &events {
        if let Some(seq) = event.seq() {
            checkpoint.save(seq).await.unwrap();
        }
    }

    assert_eq!(mock.requests()[0].query("since").as_deref(), Some("12-g1A"));
    assert_eq!(checkpoint.load().await.unwrap(), Some(Seq::from("13-g1A")));

    // following again resumes from the last seen position
    follower.follow().await.unwrap();
    follower.close().await;
    assert_eq!(mock.requests()[1].query("since").as_deref(), Some("13-g1A"));
}

#[tokio::test]
async fn test_bad_row_reported_and_reading_continues() {
    let (_, db) = setup(|_| {
        MockReply::lines(
            200,
            [
                r#"{"seq":1,"id":"a","changes":"#.to_string(),
                row("2", "b", r#"[{"rev":"1-b"}]"#),
            ],
        )
    });
    let mut follower = Follower::new(db, FollowerConfig::default());

    let events = collect(&mut follower).await;
    assert!(matches!(events[0], ChangeEvent::Error(_)));
    assert_eq!(events[1].change().unwrap().meta.id, "b");
    assert_eq!(events[2].kind(), ChangeKind::Terminated);
}

#[tokio::test]
async fn test_truncated_final_row_is_error() {
    let (_, db) = setup(|_| {
        MockReply::chunks(
            200,
            [
                format!("{}\n", row("1", "a", r#"[{"rev":"1-a"}]"#)),
                r#"{"seq":2,"id":"b","chan"#.to_string(),
            ],
        )
    });
    let mut follower = Follower::new(db, FollowerConfig::default());

    let kinds: Vec<ChangeKind> = collect(&mut follower).await.iter().map(ChangeEvent::kind).collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::Insert, ChangeKind::Error, ChangeKind::Terminated]
    );
    assert_eq!(follower.last_seq(), Some(Seq::from("1")));
}

#[tokio::test]
async fn test_change_without_revisions_is_error() {
    let (_, db) = setup(|_| {
        MockReply::lines(200, [row("3", "a", "[]")])
    });
    let mut follower = Follower::new(db, FollowerConfig::default());

    let events = collect(&mut follower).await;
    assert_eq!(events[0].kind(), ChangeKind::Error);
    assert_eq!(follower.last_seq(), Some(Seq::from("3")));
}

#[tokio::test]
async fn test_close_stops_live_feed() {
    let (_, db) = setup(|_| {
        MockReply::lines(
            200,
            [row("1", "a", r#"[{"rev":"1-a"}]"#)],
        )
        .hold_open()
    });
    let mut follower = Follower::new(db, FollowerConfig::default());
    let mut stream = follower.follow().await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("first change delivered")
        .unwrap();
    assert_eq!(first.kind(), ChangeKind::Insert);
    assert!(follower.is_following());

    tokio::time::timeout(Duration::from_secs(5), follower.close())
        .await
        .expect("close returned");
    assert!(!follower.is_following());
    let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream ended");
    assert!(end.is_none());
}

#[tokio::test]
async fn test_follow_twice_is_rejected() {
    let (_, db) = setup(|_| MockReply::lines(200, [""]).hold_open());
    let mut follower = Follower::new(db, FollowerConfig::default());

    let _stream = follower.follow().await.unwrap();
    assert!(follower.follow().await.is_err());
    follower.close().await;
}

#[tokio::test]
async fn test_error_status_returned_from_follow() {
    let (_, db) = setup(|_| {
        MockReply::json(404, &json!({"error": "not_found", "reason": "Database does not exist."}))
    });
    let mut follower = Follower::new(db, FollowerConfig::default());

    let err = follower.follow().await.err().unwrap();
    assert_eq!(err.status(), Some(404));
    assert!(!follower.is_following());
}
