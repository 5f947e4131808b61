//! Drives the push listener over a real loopback socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use berthd::{router, sign, HookSettings, HookState};
use reqwest::StatusCode;
use serde_json::Value;

const SECRET: &str = "0123456789abcdef0123456789abcdef";
const PUSH_MAIN: &str = r#"{"ref":"refs/heads/main","after":"4f1c2ab"}"#;

struct Listener {
    base: String,
    client: reqwest::Client,
}

impl Listener {
    async fn start(dir: &Path, script: PathBuf) -> Self {
        let settings = HookSettings {
            secret: SECRET.to_string(),
            git_ref: "refs/heads/main".to_string(),
            script,
            lock: dir.join("hook.lock"),
            stale_after: Duration::from_secs(3600),
        };
        let app = router(Arc::new(HookState::new(settings)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
        }
    }

    async fn deliver(&self, event: &str, body: &str, signature: Option<String>) -> (StatusCode, Value) {
        let mut request = self
            .client
            .post(format!("{}/hook", self.base))
            .header("x-github-event", event)
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(signature) = signature {
            request = request.header("x-hub-signature-256", signature);
        }
        let response = request.send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    async fn push(&self, body: &str) -> (StatusCode, Value) {
        let signature = sign(SECRET.as_bytes(), body.as_bytes()).unwrap();
        self.deliver("push", body, Some(signature)).await
    }

    async fn in_flight(&self) -> bool {
        let health: Value = self
            .client
            .get(format!("{}/healthz", self.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        health["in_flight"].as_bool().unwrap()
    }

    async fn wait_idle(&self) {
        for _ in 0..100 {
            if !self.in_flight().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("build never released the lock");
    }
}

#[cfg(unix)]
fn build_script(dir: &Path, sleep_secs: u32) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("rebuild.sh");
    let log = dir.join("runs.log");
    std::fs::write(
        &path,
        format!(
            "#!/bin/sh\necho \"$BERTH_REVISION\" >> '{}'\nsleep {sleep_secs}\n",
            log.display()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn runs(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("runs.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_bad_signature_is_unauthorized() {
    let dir = tempfile::tempdir().unwrap();
    let hook = Listener::start(dir.path(), dir.path().join("missing.sh")).await;

    let (status, _) = hook.deliver("push", PUSH_MAIN, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = sign(b"not-the-shared-secret", PUSH_MAIN.as_bytes()).unwrap();
    let (status, body) = hook.deliver("push", PUSH_MAIN, Some(forged)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], "unauthorized");
    assert!(!hook.in_flight().await);
}

#[tokio::test]
async fn test_ping_and_other_events() {
    let dir = tempfile::tempdir().unwrap();
    let hook = Listener::start(dir.path(), dir.path().join("missing.sh")).await;

    let body = r#"{"zen":"Keep it logically awesome."}"#;
    let signature = sign(SECRET.as_bytes(), body.as_bytes()).unwrap();
    let (status, reply) = hook.deliver("ping", body, Some(signature.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["status"], "pong");

    let (status, reply) = hook.deliver("issues", body, Some(signature)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(reply["status"], "ignored");
}

#[tokio::test]
async fn test_untracked_ref_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let hook = Listener::start(dir.path(), dir.path().join("missing.sh")).await;

    let (status, reply) = hook
        .push(r#"{"ref":"refs/heads/feature","after":"abc"}"#)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(reply["status"], "ignored");
    assert!(!dir.path().join("hook.lock").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_push_runs_build_with_revision() {
    let dir = tempfile::tempdir().unwrap();
    let hook = Listener::start(dir.path(), build_script(dir.path(), 0)).await;

    let (status, reply) = hook.push(PUSH_MAIN).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(reply["status"], "started");

    hook.wait_idle().await;
    assert_eq!(runs(dir.path()), vec!["4f1c2ab".to_string()]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_concurrent_pushes_collapse_to_one_build() {
    let dir = tempfile::tempdir().unwrap();
    let hook = Listener::start(dir.path(), build_script(dir.path(), 1)).await;

    let (first, second) = tokio::join!(hook.push(PUSH_MAIN), hook.push(PUSH_MAIN));
    let mut statuses = vec![first.0, second.0];
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::ACCEPTED, StatusCode::CONFLICT]);
    let collapsed = if first.0 == StatusCode::CONFLICT { first.1 } else { second.1 };
    assert_eq!(collapsed["status"], "in_flight");

    hook.wait_idle().await;
    assert_eq!(runs(dir.path()).len(), 1);

    // once released, the next push builds again
    let (status, _) = hook.push(PUSH_MAIN).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    hook.wait_idle().await;
    assert_eq!(runs(dir.path()).len(), 2);
}

#[tokio::test]
async fn test_missing_script_releases_lock() {
    let dir = tempfile::tempdir().unwrap();
    let hook = Listener::start(dir.path(), dir.path().join("missing.sh")).await;

    let (status, reply) = hook.push(PUSH_MAIN).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reply["status"], "error");
    assert!(!hook.in_flight().await);
}
