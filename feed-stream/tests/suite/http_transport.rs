use std::sync::Arc;
use std::time::Duration;

use codex_feed_stream::AbortHandle;
use codex_feed_stream::BackoffConfig;
use codex_feed_stream::FeedError;
use codex_feed_stream::HttpTransport;
use codex_feed_stream::PersistentStreamIterator;
use codex_feed_stream::PersistentStreamOptions;
use codex_feed_stream::PullIteratorExt;
use codex_feed_stream::RequestOptions;
use codex_feed_stream::Transport;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::timeout;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::header;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::matchers::query_param;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

fn quick_backoff(max_retries: Option<usize>) -> BackoffConfig {
    BackoffConfig {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
        jitter_factor: 0.0,
        max_retries,
    }
}

async fn collect(feed: &mut PersistentStreamIterator) -> codex_feed_stream::Result<Vec<Value>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    timeout(
        DEFAULT_READ_TIMEOUT,
        feed.for_each(move |item| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().await.push(item);
                Ok(())
            }
        }),
    )
    .await
    .expect("timeout")?;
    let seen = seen.lock().await.clone();
    Ok(seen)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changes_feed_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/db/_changes"))
        .and(query_param("feed", "normal"))
        .and(header("authorization", "Basic YWRtaW46cGFzcw=="))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"results":[
{"seq":1,"id":"doc-a","changes":[{"rev":"1-a"}]},
{"seq":2,"id":"doc-b","changes":[{"rev":"1-b"}]}
],
"last_seq":2}
"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let request = RequestOptions::get(format!("{}/db/_changes", server.uri()))
        .query("feed", "normal")
        .header("authorization", "Basic YWRtaW46cGFzcw==");
    let mut feed: PersistentStreamIterator = PersistentStreamIterator::new(
        Arc::new(HttpTransport::new()),
        PersistentStreamOptions {
            request,
            selector: "results.*".to_string(),
            backoff: quick_backoff(Some(0)),
            ..PersistentStreamOptions::default()
        },
    )
    .unwrap();

    let items = collect(&mut feed).await.unwrap();
    let ids: Vec<&str> = items.iter().filter_map(|item| item["id"].as_str()).collect();
    assert_eq!(vec!["doc-a", "doc-b"], ids);
    assert_eq!(json!([{"rev": "1-a"}]), items[0]["changes"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthorized_response_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/db/_changes"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_string(r#"{"error":"unauthorized","reason":"Name or password is incorrect."}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut feed: PersistentStreamIterator = PersistentStreamIterator::new(
        Arc::new(HttpTransport::new()),
        PersistentStreamOptions {
            request: RequestOptions::get(format!("{}/db/_changes", server.uri())),
            indefinite: true,
            backoff: quick_backoff(None),
            ..PersistentStreamOptions::default()
        },
    )
    .unwrap();

    let err = collect(&mut feed).await.expect_err("401 must fail");
    match &err {
        FeedError::Status { status, body } => {
            assert_eq!(401, *status);
            assert!(body.contains("unauthorized"), "{body}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_retryable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connection_exhausts_retries() {
    // Bind then drop a listener so the port is known to be closed.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut feed: PersistentStreamIterator = PersistentStreamIterator::new(
        Arc::new(HttpTransport::new()),
        PersistentStreamOptions {
            request: RequestOptions::get(format!("http://127.0.0.1:{port}/db/_changes")),
            backoff: quick_backoff(Some(1)),
            ..PersistentStreamOptions::default()
        },
    )
    .unwrap();

    let err = collect(&mut feed).await.expect_err("nothing listens");
    match err {
        FeedError::RetriesExhausted { attempts, last } => {
            assert_eq!(2, attempts);
            assert_eq!(Some("ECONNREFUSED"), last.code());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(2, feed.requests());
}

#[tokio::test]
async fn aborted_request_is_never_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(0)
        .mount(&server)
        .await;

    let cancel = AbortHandle::new();
    cancel.abort();
    let err = HttpTransport::new()
        .send(&RequestOptions::get(server.uri()), cancel)
        .await
        .expect_err("aborted");
    assert_eq!("request aborted", err.to_string());
}

#[tokio::test]
async fn invalid_method_is_rejected() {
    let request = RequestOptions {
        method: "NOT A METHOD".to_string(),
        ..RequestOptions::get("http://127.0.0.1:9/")
    };
    let err = HttpTransport::new()
        .send(&request, AbortHandle::new())
        .await
        .expect_err("bad method");
    assert!(matches!(err, FeedError::InvalidRequest(_)));
}
