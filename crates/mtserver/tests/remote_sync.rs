//! Clients talking to an in-process share server.

use std::path::Path;

use cas::store::ContentStore;

use mountaintools::{ClientError, Key, MountainClient, Policy, RemoteClient};
use mtconfig::RemoteConfig;
use mtserver::ServerState;
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const WRITE_TOKEN: &str = "test-write-token";

struct TestServer {
    url: String,
    _root: TempDir,
    _shutdown: oneshot::Sender<()>,
}

async fn start_server() -> TestServer {
    let root = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = ServerState::new(root.path()).with_tokens(None, Some(WRITE_TOKEN.to_string()));

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(mtserver::serve(listener, state, async {
        let _ = rx.await;
    }));

    TestServer {
        url: format!("http://{}", addr),
        _root: root,
        _shutdown: tx,
    }
}

fn remote_config(url: &str, write_token: Option<&str>) -> RemoteConfig {
    RemoteConfig {
        url: url.to_string(),
        collection: "lab".to_string(),
        share: None,
        read_token: None,
        write_token: write_token.map(str::to_string),
        timeout_ms: 5_000,
    }
}

fn client(cache: &Path, url: &str, write_token: Option<&str>, policy: Policy) -> MountainClient {
    let remote = RemoteClient::new(remote_config(url, write_token)).unwrap();
    MountainClient::open(cache)
        .unwrap()
        .with_remote(remote)
        .with_policy(policy)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_value_visible_to_second_client() {
    let server = start_server().await;
    let (a_dir, b_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = client(a_dir.path(), &server.url, Some(WRITE_TOKEN), Policy::local_and_remote());
    let b = client(b_dir.path(), &server.url, None, Policy::remote_only());

    let key: Key = json!({"study": "synth", "recording": 1}).into();
    a.set_value(&key, None, Some(json!({"snr": 4.2})), None).await.unwrap();

    let value = b.get_value(&key, None, None).await.unwrap();
    assert_eq!(value, Some(json!({"snr": 4.2})));

    a.set_value(&key, Some("notes"), Some(json!("ok")), Some("pw")).await.unwrap();
    assert_eq!(
        b.get_value(&key, Some("notes"), Some("pw")).await.unwrap(),
        Some(json!("ok"))
    );
    assert_eq!(b.get_value(&key, Some("notes"), None).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_blob_fetched_and_cached() {
    let server = start_server().await;
    let (a_dir, b_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = client(a_dir.path(), &server.url, Some(WRITE_TOKEN), Policy::local_and_remote());
    let b = client(b_dir.path(), &server.url, None, Policy {
        local_read: true,
        local_write: true,
        remote_read: true,
        remote_write: false,
    });

    let address = a.save_text("firings", Some("firings.txt")).await.unwrap();
    assert!(!b.cas().exists(&address.hash));

    let text = b.load_text(&address.to_string()).await.unwrap();
    assert_eq!(text, "firings");
    assert!(b.cas().exists(&address.hash));

    let info = b.find(&address).await.unwrap().unwrap();
    assert_eq!(info.size, 7);

    let path = b.realize_file(&address.to_string()).await.unwrap();
    assert_eq!(path.file_name().unwrap(), "firings.txt");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_value_crosses_clients() {
    let server = start_server().await;
    let (a_dir, b_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = client(a_dir.path(), &server.url, Some(WRITE_TOKEN), Policy::remote_only());
    let b = client(b_dir.path(), &server.url, None, Policy::remote_only());

    let big = json!({"data": "y".repeat(mountaintools::MAX_INLINE_BYTES * 2)});
    let key = Key::from("big-result");
    a.set_value(&key, None, Some(big.clone()), None).await.unwrap();

    assert_eq!(b.get_value(&key, None, None).await.unwrap(), Some(big));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_readonly_remote_fails_before_local_write() {
    let server = start_server().await;
    let dir = TempDir::new().unwrap();
    let readonly = client(dir.path(), &server.url, None, Policy::local_and_remote());

    let key = Key::from("k");
    let err = readonly.set_value(&key, None, Some(json!(1)), None).await.unwrap_err();
    assert!(matches!(err, ClientError::Permission(_)));
    assert_eq!(readonly.kv().get(&key, None, None).unwrap(), None);

    let err = readonly.save_text("x", None).await.unwrap_err();
    assert!(matches!(err, ClientError::Permission(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_token_is_permission_error() {
    let server = start_server().await;
    let dir = TempDir::new().unwrap();
    let client = client(dir.path(), &server.url, Some("wrong"), Policy::remote_only());

    let err = client
        .set_if_absent(&Key::from("k"), json!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Permission(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_claims_exclusive_through_server() {
    let server = start_server().await;
    let key = Key::from("job-0");

    let mut handles = Vec::new();
    let mut dirs = Vec::new();
    for i in 0..10 {
        let dir = TempDir::new().unwrap();
        let c = client(dir.path(), &server.url, Some(WRITE_TOKEN), Policy::remote_only());
        dirs.push(dir);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            c.set_if_absent(&key, json!({"worker": i})).await.unwrap()
        }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_compare_and_set_through_server() {
    let server = start_server().await;
    let dir = TempDir::new().unwrap();
    let c = client(dir.path(), &server.url, Some(WRITE_TOKEN), Policy::local_and_remote());
    let key = Key::from("status");

    assert!(c.set_if_absent(&key, json!("in-process")).await.unwrap());
    assert!(!c
        .compare_and_set(&key, Some(json!("other")), Some(json!("complete")))
        .await
        .unwrap());
    assert!(c
        .compare_and_set(&key, Some(json!("in-process")), Some(json!("complete")))
        .await
        .unwrap());
    assert_eq!(
        c.get_latest_value(&key, None, None).await.unwrap(),
        Some(json!("complete"))
    );
    // The local mirror follows the claim authority.
    assert_eq!(c.kv().get(&key, None, None).unwrap(), Some(json!("complete")));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_key_reference_through_remote_collection() {
    let server = start_server().await;
    let (a_dir, b_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = client(a_dir.path(), &server.url, Some(WRITE_TOKEN), Policy::remote_only());
    let b = client(b_dir.path(), &server.url, None, Policy::remote_only());

    let address = a.save_text("raw data", None).await.unwrap();
    a.set_value(
        &MountainClient::named_key("lab", "recordings/r1/raw"),
        None,
        Some(json!(address.to_string())),
        None,
    )
    .await
    .unwrap();

    let text = b.load_text("key://lab/recordings/r1/raw").await.unwrap();
    assert_eq!(text, "raw data");
}

#[tokio::test]
async fn test_unreachable_remote_degrades_to_local() {
    let dir = TempDir::new().unwrap();
    // Nothing listens on the discard port.
    let c = client(dir.path(), "http://127.0.0.1:9", None, Policy {
        local_read: true,
        local_write: true,
        remote_read: true,
        remote_write: false,
    });

    let key = Key::from("local-only");
    assert_eq!(c.get_value(&key, None, None).await.unwrap(), None);
    c.set_value(&key, None, Some(json!(7)), None).await.unwrap();
    assert_eq!(c.get_value(&key, None, None).await.unwrap(), Some(json!(7)));

    let missing = mountaintools::Address::new(mountaintools::Sha1Hash::from_data(b"gone"));
    assert!(c.load_bytes(&missing.to_string()).await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_and_bad_upload() {
    let server = start_server().await;
    let http = reqwest::Client::new();

    let health: serde_json::Value = http
        .get(format!("{}/health", server.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let wrong_hash = mountaintools::Sha1Hash::from_data(b"expected");
    let response = http
        .put(format!("{}/blobs/lab/{}", server.url, wrong_hash))
        .bearer_auth(WRITE_TOKEN)
        .body("something else")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}
