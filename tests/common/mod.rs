//! Local update server and fixtures shared by the integration tests.

#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::{Path as UrlPath, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bundlepush_lib::engine::updater::{TrustVerifier, UpdateOffer};
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use zip::write::SimpleFileOptions;

pub const API_KEY: &str = "test-api-key";
pub const PRIVATE_KEY: &[u8] = include_bytes!("../fixtures/signing_key.pk8");
pub const PUBLIC_KEY: &[u8] = include_bytes!("../fixtures/signing_key.pub.der");

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub api_key: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Clone, Default)]
pub struct ServerState {
    offer: Arc<Mutex<serde_json::Value>>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    interrupt: Arc<AtomicUsize>,
    checks: Arc<Mutex<Vec<CheckRequest>>>,
    downloads: Arc<AtomicUsize>,
}

pub struct TestServer {
    pub base_url: String,
    state: ServerState,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = ServerState {
            offer: Arc::new(Mutex::new(serde_json::json!({ "hasUpdate": false }))),
            ..Default::default()
        };
        let app = Router::new()
            .route("/api/updates/check", post(check))
            .route("/files/{name}", get(file))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    pub fn file_url(&self, name: &str) -> String {
        format!("{}/files/{}", self.base_url, name)
    }

    pub fn set_offer(&self, offer: &UpdateOffer) {
        *self.state.offer.lock().unwrap() = serde_json::to_value(offer).unwrap();
    }

    pub fn put_file(&self, name: &str, bytes: Vec<u8>) {
        self.state.files.lock().unwrap().insert(name.to_string(), bytes);
    }

    /// Cut the next `count` file downloads off mid-stream.
    pub fn interrupt_downloads(&self, count: usize) {
        self.state.interrupt.store(count, Ordering::SeqCst);
    }

    pub fn checks(&self) -> Vec<CheckRequest> {
        self.state.checks.lock().unwrap().clone()
    }

    pub fn download_count(&self) -> usize {
        self.state.downloads.load(Ordering::SeqCst)
    }
}

async fn check(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.checks.lock().unwrap().push(CheckRequest { api_key, body });
    Json(state.offer.lock().unwrap().clone())
}

async fn file(State(state): State<ServerState>, UrlPath(name): UrlPath<String>) -> Response {
    state.downloads.fetch_add(1, Ordering::SeqCst);
    let Some(bytes) = state.files.lock().unwrap().get(&name).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let interrupt = state
        .interrupt
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if interrupt {
        let half = Bytes::from(bytes[..bytes.len() / 2].to_vec());
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(half), Err(std::io::Error::other("connection reset"))];
        return Body::from_stream(futures_util::stream::iter(chunks)).into_response();
    }

    bytes.into_response()
}

/// Zip archive built in memory.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in entries {
        writer
            .start_file(name.to_string(), SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Attach the fixture public key and a valid signature.
pub fn sign_offer(offer: &mut UpdateOffer) {
    let key_pair = RsaKeyPair::from_pkcs8(PRIVATE_KEY).unwrap();
    let message = TrustVerifier::signed_message(offer);
    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(&RSA_PKCS1_SHA256, &SystemRandom::new(), &message, &mut signature)
        .unwrap();

    offer.public_key = Some(STANDARD.encode(PUBLIC_KEY));
    offer.signature = Some(STANDARD.encode(signature));
}
