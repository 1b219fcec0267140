//! End-to-end enrichment scenarios against a mock API server.

use serde_json::{json, Value};
use socmed_archiver::config::Config;
use socmed_archiver::instagram::enricher::{EnrichOptions, Enricher};
use socmed_archiver::instagram::session::{ApiSession, CookieBundle};
use socmed_archiver::store::{JsonMap, JsonStore, SyncTracker};
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_SHORTCODE: &str = "DUGZG3CjcN-";

fn write_cookies(root: &std::path::Path) {
    std::fs::write(
        root.join("cookies.txt"),
        ".instagram.com\tTRUE\t/\tTRUE\t0\tcsrftoken\tcsrf\n\
         #HttpOnly_.instagram.com\tTRUE\t/\tTRUE\t0\tsessionid\tsess\n\
         .instagram.com\tTRUE\t/\tTRUE\t0\tds_user_id\t42\n",
    )
    .unwrap();
}

fn test_config(root: &TempDir, server: &MockServer) -> Config {
    write_cookies(root.path());
    Config {
        api_base_url: server.uri(),
        ..Config::for_testing(root.path())
    }
}

fn stub_record(id: &str) -> JsonMap {
    match json!({
        "id": id,
        "platform": "instagram",
        "content_type": "saved_post",
        "text": "",
        "source": "archive",
        "collections": []
    }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn graphql_ok_body(caption: &str, username: &str, image_url: &str) -> Value {
    json!({
        "data": {
            "xdt_api__v1__media__shortcode__web_info": {
                "items": [{
                    "code": "ABC12345678",
                    "pk": 1234567890u64,
                    "user": { "username": username, "full_name": "A User" },
                    "caption": { "text": caption },
                    "media_type": 1,
                    "like_count": 11,
                    "comment_count": 2,
                    "taken_at": 1_700_000_000,
                    "image_versions2": {
                        "candidates": [{ "url": image_url, "width": 640, "height": 640 }]
                    }
                }]
            }
        }
    })
}

async fn load_session(root: &TempDir, server: &MockServer) -> ApiSession {
    write_cookies(root.path());
    let cookies = CookieBundle::load(&root.path().join("cookies.txt")).unwrap();
    ApiSession::with_base_url(&cookies, std::time::Duration::from_secs(5), &server.uri()).unwrap()
}

#[tokio::test]
async fn test_fresh_enrichment_of_live_post() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();
    let config = test_config(&root, &server);

    let image_url = format!("{}/media/a.jpg", server.uri());
    Mock::given(method("POST"))
        .and(path("/graphql/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(graphql_ok_body("hi", "u", &image_url)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/a.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 4096]))
        .mount(&server)
        .await;

    let store = JsonStore::with_default_key(config.saved_posts_path());
    store.append(&[stub_record("ABC12345678")], None).unwrap();

    let enricher = Enricher::new(config.clone()).unwrap();
    enricher
        .run(&EnrichOptions {
            delay: 0.0,
            ..EnrichOptions::default()
        })
        .await
        .unwrap();

    let items = store.read().unwrap();
    assert_eq!(items.len(), 1);
    let record = &items[0];
    assert_eq!(record["source"], json!("archive+api"));
    assert_eq!(record["text"], json!("hi"));
    assert_eq!(record["author"]["username"], json!("u"));
    assert_eq!(record["like_count"], json!(11));
    assert_eq!(record["reply_count"], json!(2));
    assert_eq!(record["media_pk"], json!("1234567890"));
    assert_eq!(record["media"][0]["url"], json!(image_url));

    let local_path = record["media"][0]["local_path"].as_str().unwrap();
    assert!(!local_path.is_empty());
    let meta = std::fs::metadata(local_path).unwrap();
    assert_eq!(meta.len(), 4096);

    let tracker = SyncTracker::new(config.sync_state_path());
    let cursor = tracker.get("instagram", "saved").unwrap();
    assert_eq!(cursor.last_sync_status, "success");

    // Nothing left pending: a re-run would fetch zero posts.
    let pending = enricher.pending_shortcodes(None, None).await.unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_deleted_post_is_marked_terminal() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();
    let config = test_config(&root, &server);

    Mock::given(method("POST"))
        .and(path("/graphql/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "xdt_api__v1__media__shortcode__web_info": { "items": [] } }
        })))
        .mount(&server)
        .await;

    let store = JsonStore::with_default_key(config.saved_posts_path());
    store.append(&[stub_record("GONE1234567")], None).unwrap();

    let enricher = Enricher::new(config.clone()).unwrap();
    enricher
        .run(&EnrichOptions {
            delay: 0.0,
            ..EnrichOptions::default()
        })
        .await
        .unwrap();

    let items = store.read().unwrap();
    assert_eq!(items[0]["source"], json!("archive:deleted"));
    assert_eq!(items[0]["text"], json!("[Post no longer available]"));
    // No media was fetched for a deleted post.
    assert!(!config.media_dir().join("instagram").exists());
}

#[tokio::test]
async fn test_graphql_checkpoint_downgrades_session_to_rest() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();

    // GraphQL answers with an HTML challenge page; the session must only
    // ever ask it once.
    Mock::given(method("POST"))
        .and(path("/graphql/query"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("<html><body>checkpoint</body></html>"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/api/v1/media/\d+/info/$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{
                "code": "ABC",
                "pk": 99,
                "user": { "username": "resty", "full_name": "" },
                "caption": { "text": "via rest" },
                "media_type": 1
            }]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let mut session = load_session(&root, &server).await;
    assert!(session.graphql_available());

    // First fetch: GraphQL checkpoints, the same call succeeds via REST.
    match session.fetch_post("ABC").await {
        socmed_archiver::instagram::api::FetchOutcome::Ok(post) => {
            assert_eq!(post.username, "resty");
            assert_eq!(post.caption, "via rest");
        }
        other => panic!("expected ok via REST, got {other:?}"),
    }
    assert!(!session.graphql_available());

    // Second fetch skips GraphQL entirely (the expect(1) above enforces it).
    match session.fetch_post("ABD").await {
        socmed_archiver::instagram::api::FetchOutcome::Ok(_) => {}
        other => panic!("expected ok via REST, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rate_limited_and_invalid_shortcode_outcomes() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();

    Mock::given(method("POST"))
        .and(path("/graphql/query"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let mut session = load_session(&root, &server).await;
    match session.fetch_post("ABC").await {
        socmed_archiver::instagram::api::FetchOutcome::RateLimited => {}
        other => panic!("expected rate limited, got {other:?}"),
    }
    // A 429 is not a checkpoint; GraphQL stays in play.
    assert!(session.graphql_available());

    // Invalid shortcode surfaces as a failure without any HTTP call.
    match session.fetch_post_rest("bad!code").await {
        socmed_archiver::instagram::api::FetchOutcome::Failed(f) => {
            assert!(f.to_string().contains('!'));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_error_is_retried_then_succeeds() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();

    Mock::given(method("POST"))
        .and(path("/graphql/query"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(graphql_ok_body(
            "recovered",
            "u",
            "",
        )))
        .mount(&server)
        .await;

    let session = load_session(&root, &server).await;
    match session.fetch_post_graphql("ABC").await {
        socmed_archiver::instagram::api::FetchOutcome::Ok(post) => {
            assert_eq!(post.caption, "recovered");
        }
        other => panic!("expected ok after retry, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_record_stays_pending_and_cursor_goes_partial() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();
    let config = test_config(&root, &server);

    // The auth self-test shortcode succeeds; the real post keeps 403ing.
    Mock::given(method("POST"))
        .and(path("/graphql/query"))
        .and(body_string_contains(TEST_SHORTCODE))
        .respond_with(ResponseTemplate::new(200).set_body_json(graphql_ok_body("ok", "u", "")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/graphql/query"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let store = JsonStore::with_default_key(config.saved_posts_path());
    store.append(&[stub_record("FORBIDDEN01")], None).unwrap();

    let enricher = Enricher::new(config.clone()).unwrap();
    enricher
        .run(&EnrichOptions {
            delay: 0.0,
            ..EnrichOptions::default()
        })
        .await
        .unwrap();

    // Not patched: still pending for the next run.
    let items = store.read().unwrap();
    assert_eq!(items[0]["source"], json!("archive"));
    let pending = enricher.pending_shortcodes(None, None).await.unwrap();
    assert_eq!(pending, vec!["FORBIDDEN01"]);

    let tracker = SyncTracker::new(config.sync_state_path());
    let cursor = tracker.get("instagram", "saved").unwrap();
    assert_eq!(cursor.last_sync_status, "partial");
    assert!(cursor.error_message.contains("failed"));
}

#[tokio::test]
async fn test_collection_filter_limits_pending_set() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();
    let config = test_config(&root, &server);

    let store = JsonStore::with_default_key(config.saved_posts_path());
    let mut in_col = stub_record("INCOL123456");
    in_col.insert("collections".to_string(), json!(["Recipes"]));
    let out_col = stub_record("OUTCOL12345");
    store.append(&[in_col, out_col], None).unwrap();

    let enricher = Enricher::new(config).unwrap();
    let pending = enricher
        .pending_shortcodes(None, Some("recip"))
        .await
        .unwrap();
    assert_eq!(pending, vec!["INCOL123456"]);
}
