//! Bootstrap sync against a mock API: pagination, dedup, media download,
//! and cursor updates.

use serde_json::{json, Value};
use socmed_archiver::config::Config;
use socmed_archiver::instagram::bootstrap::{Bootstrap, SyncOptions};
use socmed_archiver::store::{JsonMap, JsonStore, SyncTracker};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

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

fn feed_item(code: &str, collection_id: u64, image_url: &str) -> Value {
    json!({
        "media": {
            "code": code,
            "pk": 1000 + collection_id,
            "user": { "username": "author1", "full_name": "Author One" },
            "caption": { "text": format!("caption for {code}") },
            "media_type": 1,
            "taken_at": 1_700_000_000,
            "like_count": 1,
            "comment_count": 0,
            "saved_collection_ids": [collection_id],
            "image_versions2": {
                "candidates": [{ "url": image_url, "width": 320, "height": 320 }]
            }
        }
    })
}

async fn mount_collections(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v1/collections/list/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "collection_id": 111, "collection_name": "Recipes", "collection_media_count": 2 },
                { "collection_id": 222, "collection_name": "Dog Tricks", "collection_media_count": 1 }
            ],
            "more_available": false
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_sync_paginates_dedups_and_downloads() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();
    let config = test_config(&root, &server);

    mount_collections(&server).await;

    let image_url = format!("{}/media/img.jpg", server.uri());
    // Page 2 must be mounted first: its matcher is more specific.
    Mock::given(method("GET"))
        .and(path("/api/v1/feed/saved/posts/"))
        .and(query_param("max_id", "cursor1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [feed_item("CCC33333333", 222, &image_url)],
            "more_available": false
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/feed/saved/posts/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                feed_item("AAA11111111", 111, &image_url),
                feed_item("BBB22222222", 111, &image_url)
            ],
            "more_available": true,
            "next_max_id": "cursor1"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/img.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 2048]))
        .mount(&server)
        .await;

    // One of the feed posts already exists in the archive.
    let store = JsonStore::with_default_key(config.saved_posts_path());
    let existing: JsonMap = match json!({ "id": "BBB22222222", "source": "archive+api" }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    };
    store.append(&[existing], None).unwrap();

    let bootstrap = Bootstrap::new(config.clone()).unwrap();
    bootstrap
        .run_sync(&SyncOptions {
            delay: 0.0,
            ..SyncOptions::default()
        })
        .await
        .unwrap();

    let items = store.read().unwrap();
    assert_eq!(items.len(), 3);

    let by_id = |id: &str| {
        items
            .iter()
            .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
            .unwrap()
            .clone()
    };

    let new_post = by_id("AAA11111111");
    assert_eq!(new_post["source"], json!("archive+api"));
    assert_eq!(new_post["text"], json!("caption for AAA11111111"));
    assert_eq!(new_post["collections"], json!(["Recipes"]));
    assert_eq!(new_post["content_type"], json!("saved_post"));
    let local_path = new_post["media"][0]["local_path"].as_str().unwrap();
    assert_eq!(std::fs::metadata(local_path).unwrap().len(), 2048);

    let paged_post = by_id("CCC33333333");
    assert_eq!(paged_post["collections"], json!(["Dog Tricks"]));

    // The pre-existing record was skipped, not overwritten.
    let untouched = by_id("BBB22222222");
    assert!(untouched.get("text").is_none());

    let tracker = SyncTracker::new(config.sync_state_path());
    let cursor = tracker.get("instagram", "saved").unwrap();
    assert_eq!(cursor.last_sync_status, "success");
    assert_eq!(cursor.total_items, 3);
}

#[tokio::test]
async fn test_sync_collection_filter_and_no_media() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();
    let config = test_config(&root, &server);

    mount_collections(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/feed/saved/posts/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                feed_item("AAA11111111", 111, "https://cdn.example.com/a.jpg"),
                feed_item("BBB22222222", 222, "https://cdn.example.com/b.jpg")
            ],
            "more_available": false
        })))
        .mount(&server)
        .await;

    let bootstrap = Bootstrap::new(config.clone()).unwrap();
    bootstrap
        .run_sync(&SyncOptions {
            delay: 0.0,
            download_media: false,
            collection: Some("tricks".to_string()),
            ..SyncOptions::default()
        })
        .await
        .unwrap();

    let store = JsonStore::with_default_key(config.saved_posts_path());
    let items = store.read().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], json!("BBB22222222"));
    // Media URLs kept, nothing downloaded.
    assert_eq!(items[0]["media"][0]["local_path"], json!(""));
    assert!(!config.media_dir().exists());
}

#[tokio::test]
async fn test_sync_limit_stops_pagination() {
    let server = MockServer::start().await;
    let root = TempDir::new().unwrap();
    let config = test_config(&root, &server);

    mount_collections(&server).await;
    // A second page would loop forever; the limit must stop after page one.
    Mock::given(method("GET"))
        .and(path("/api/v1/feed/saved/posts/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                feed_item("AAA11111111", 111, ""),
                feed_item("BBB22222222", 111, "")
            ],
            "more_available": true,
            "next_max_id": "cursor1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let bootstrap = Bootstrap::new(config.clone()).unwrap();
    bootstrap
        .run_sync(&SyncOptions {
            delay: 0.0,
            limit: Some(1),
            download_media: false,
            ..SyncOptions::default()
        })
        .await
        .unwrap();

    let store = JsonStore::with_default_key(config.saved_posts_path());
    assert_eq!(store.count().unwrap(), 1);
}
