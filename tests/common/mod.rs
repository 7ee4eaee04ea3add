#![allow(dead_code)]

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use chrono::Duration;
use serde_json::Value;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use shuge::auth::{accounts, TokenSigner};
use shuge::config::Config;
use shuge::db;
use shuge::state::{AppState, Channels};
use shuge::{routes, workers};

pub const BOUNDARY: &str = "shuge-test-boundary";

pub struct TestApp {
    pub dir: TempDir,
    pub state: AppState,
    pub router: Router,
    pub channels: Option<Channels>,
    pub shutdown: CancellationToken,
    pub handles: Vec<JoinHandle<()>>,
}

pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.resolve_paths(dir.path());
    config.auth.bcrypt_cost = 4;
    config.parser.workers = 2;
    config.parser.backoff_base_ms = 10;
    config.clicks.flush_interval_ms = 50;
    config
}

impl TestApp {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self::with_config(test_config(&dir), dir).await
    }

    pub async fn with_config(config: Config, dir: TempDir) -> Self {
        std::fs::create_dir_all(config.uploads_path()).unwrap();
        let pool = db::create_pool(&config.db_path()).unwrap();
        db::run_migrations(&pool).unwrap();
        let tokens = TokenSigner::new(b"integration-test-secret", Duration::hours(1)).unwrap();

        let (state, channels) = AppState::build(pool, config, tokens).unwrap();
        let router = routes::router(state.clone());
        Self {
            dir,
            state,
            router,
            channels: Some(channels),
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Start parse workers, the click aggregator and the schedulers.
    pub fn start_workers(&mut self) {
        let channels = self.channels.take().expect("workers already started");
        self.handles = workers::spawn(&self.state, channels, self.shutdown.clone()).unwrap();
    }

    pub async fn stop_workers(&mut self) {
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            handle.await.unwrap();
        }
    }

    /// Register an activated account and return its id and bearer token.
    /// The first account registered becomes the administrator.
    pub fn user(&self, email: &str, nickname: &str) -> (i64, String) {
        let registration = accounts::register(
            &self.state.db,
            email,
            "secret-password",
            nickname,
            self.state.config.auth.bcrypt_cost,
        )
        .unwrap();
        if let Some(code) = registration.activation_code {
            accounts::activate(&self.state.db, email, &code).unwrap();
        }
        let user = registration.user;
        let (token, _) = self.state.tokens.mint(user.id, user.is_admin).unwrap();
        (user.id, token)
    }

    pub fn exec(&self, sql: &str) {
        self.state.db.get().unwrap().execute_batch(sql).unwrap();
    }

    pub fn query_i64(&self, sql: &str) -> i64 {
        self.state
            .db
            .get()
            .unwrap()
            .query_row(sql, [], |r| r.get(0))
            .unwrap()
    }

    pub fn query_string(&self, sql: &str) -> String {
        self.state
            .db
            .get()
            .unwrap()
            .query_row(sql, [], |r| r.get(0))
            .unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> TestResponse {
        self.send(request("GET", uri, token).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post_json(&self, uri: &str, token: Option<&str>, body: Value) -> TestResponse {
        self.send_json("POST", uri, token, body).await
    }

    pub async fn send_json(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Value,
    ) -> TestResponse {
        self.send(
            request(method, uri, token)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn upload(
        &self,
        token: &str,
        filename: &str,
        data: &[u8],
        fields: &[(&str, &str)],
    ) -> TestResponse {
        let body = multipart_body(filename, data, fields);
        self.send(
            request("POST", "/novels/upload", Some(token))
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    /// Poll until the novel leaves `unparsed`/`parsing`.
    pub async fn wait_parsed(&self, novel_id: i64) -> String {
        for _ in 0..200 {
            let status = self.query_string(&format!(
                "SELECT parsing_status FROM novels WHERE id = {}",
                novel_id
            ));
            if status == "parsed" || status == "failed" {
                return status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("novel {} was never parsed", novel_id);
    }
}

pub fn request(method: &str, uri: &str, token: Option<&str>) -> axum::http::request::Builder {
    let builder = Request::builder().method(method).uri(uri);
    match token {
        Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {}", token)),
        None => builder,
    }
}

pub fn multipart_body(filename: &str, data: &[u8], fields: &[(&str, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
            BOUNDARY, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or_else(|e| {
            panic!(
                "body is not json ({}): {}",
                e,
                String::from_utf8_lossy(&self.body)
            )
        })
    }

    pub fn header(&self, name: header::HeaderName) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }
}

/// Insert a novel row directly, bypassing upload.
pub fn insert_novel(app: &TestApp, id: i64, status: &str, author: &str, clicks: i64) {
    app.exec(&format!(
        "INSERT INTO novels (id, title, author, blob_path, file_size, content_hash, uploader_id, status, click_count)
         VALUES ({id}, 'novel {id}', '{author}', 'uploads/n{id}.txt', 1, 'hash-{id}', 1, '{status}', {clicks})"
    ));
}
