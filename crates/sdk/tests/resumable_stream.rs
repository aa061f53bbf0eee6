//! Exercises `ResumableStream`'s reconnect behavior against a mock server
//! (spec §4.D): a connection that closes before `[DONE]` is resumed from
//! the last-advanced cursor, transparently to the caller.

use shiioo_core::RunId;
use shiioo_sdk::{ShiiooClient, ShiiooError, StreamEvent};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn entry_line(run_id: RunId, index: u64) -> String {
    format!(
        "data: {{\"run_id\":\"{run_id}\",\"index\":{index},\"recorded_at\":\"2026-01-01T00:00:00Z\",\"payload\":{{\"type\":\"log\",\"data\":\"line {index}\"}}}}\n\n"
    )
}

#[tokio::test]
async fn reconnects_from_last_cursor_after_an_unannounced_close() {
    let server = MockServer::start().await;
    let run_id = RunId::new();

    // First connection: the server hands back one entry then the
    // connection just ends, with no `[DONE]` — exactly the "dropped mid
    // stream" case the client must recover from transparently.
    Mock::given(method("GET"))
        .and(path(format!("/runs/{run_id}/stream")))
        .and(query_param("startIndex", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(entry_line(run_id, 1)))
        .expect(1)
        .mount(&server)
        .await;

    // The reconnect must resume from index 1 (the cursor the client had
    // already advanced past), not from 0.
    Mock::given(method("GET"))
        .and(path(format!("/runs/{run_id}/stream")))
        .and(query_param("startIndex", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "{}data: [DONE]\n\n",
            entry_line(run_id, 2)
        )))
        .expect(1)
        .mount(&server)
        .await;

    let client = ShiiooClient::builder()
        .base_url(server.uri())
        .build()
        .unwrap();

    let mut stream = client.runs().stream(run_id, 0).await.unwrap();

    let first = stream.next_event().await.unwrap().unwrap();
    assert!(matches!(first, StreamEvent::Entry(e) if e.index == 1));
    assert_eq!(stream.cursor(), 1);
    assert!(!stream.is_interrupted());

    // The underlying connection is now exhausted; the next call must
    // reconnect using startIndex=1 and pick back up seamlessly.
    let second = stream.next_event().await.unwrap().unwrap();
    assert!(matches!(second, StreamEvent::Entry(e) if e.index == 2));
    assert_eq!(stream.cursor(), 2);

    let done = stream.next_event().await.unwrap();
    assert!(done.is_none());
    assert!(stream.is_done());
    // cursor resets once the stream has terminated cleanly.
    assert_eq!(stream.cursor(), 0);
}

/// Spec §8 scenario 6: if the connection drops and every reconnect attempt
/// also fails, the client gives up rather than retrying forever, surfaces
/// `interrupted`, and retains the cursor at the last index it actually
/// observed so the caller can resume manually later.
#[tokio::test]
async fn gives_up_after_exhausting_reconnect_attempts_and_keeps_the_cursor() {
    let server = MockServer::start().await;
    let run_id = RunId::new();

    Mock::given(method("GET"))
        .and(path(format!("/runs/{run_id}/stream")))
        .and(query_param("startIndex", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(entry_line(run_id, 2)))
        .expect(1)
        .mount(&server)
        .await;

    // Every reconnect attempt from index 2 onward hits a dead endpoint.
    Mock::given(method("GET"))
        .and(path(format!("/runs/{run_id}/stream")))
        .and(query_param("startIndex", "2"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = ShiiooClient::builder()
        .base_url(server.uri())
        .build()
        .unwrap();

    let mut stream = client.runs().stream(run_id, 0).await.unwrap();

    let first = stream.next_event().await.unwrap().unwrap();
    assert!(matches!(first, StreamEvent::Entry(e) if e.index == 2));
    assert_eq!(stream.cursor(), 2);

    let err = stream.next_event().await.unwrap_err();
    assert!(matches!(err, ShiiooError::StreamInterrupted));
    assert!(stream.is_interrupted());
    // the cursor must stay put for a caller to persist and resume from
    // later — it is not reset just because reconnecting gave up.
    assert_eq!(stream.cursor(), 2);
}
