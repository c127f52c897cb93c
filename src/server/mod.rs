// Copyright 2025 Muvon Un Limited
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Long-lived watcher/server variant of the pipeline.
//!
//! Runs the initial sync, then streams debounced file events into the same
//! ingest path, and answers authenticated search requests over local HTTP.
//! The process watches its own memory and spawns a replacement when it
//! grows past the restart threshold.

pub mod watch;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::constants::{
	SERVER_INDEX_WAIT_MS, SERVER_MAX_BODY_BYTES, SERVER_WARN_INTERVAL_SECS,
};
use crate::embedding::WorkerPool;
use crate::meta_store::MetaStore;
use crate::search::{self, SearchOptions};
use crate::state::{create_shared_state, SharedState};
use crate::store::Store;
use crate::sync::{self, SyncOptions};

/// Written to `<repo>/.osgrep/server.lock` so clients can find and
/// authenticate against the running server
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerLock {
	pub port: u16,
	pub pid: u32,
	#[serde(rename = "authToken")]
	pub auth_token: String,
	pub root: String,
}

pub struct ServerContext {
	pub store: Store,
	pub pool: WorkerPool,
	pub meta: MetaStore,
	pub config: Config,
	pub root: PathBuf,
	pub auth_token: String,
	pub sync_state: SharedState,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
	pub query: String,
	#[serde(default = "default_limit")]
	pub limit: usize,
	#[serde(default = "default_rerank")]
	pub rerank: bool,
	#[serde(default)]
	pub path: String,
}

fn default_limit() -> usize {
	25
}

fn default_rerank() -> bool {
	true
}

#[derive(Debug, Serialize)]
pub struct SearchResponseItem {
	pub path: String,
	pub score: f32,
	pub content: String,
	pub chunk_type: String,
	pub start_line: u32,
	pub num_lines: u32,
	pub is_anchor: bool,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
	pub results: Vec<SearchResponseItem>,
	pub status: String,
	pub progress: u8,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
	error: String,
}

/// Run the server until the process exits. `parent_pid` ties the server's
/// lifetime to the spawning process.
pub async fn run(
	config: Config,
	root: PathBuf,
	port: u16,
	parent_pid: Option<u32>,
) -> Result<()> {
	let pool = WorkerPool::new(&config);
	let vector_dim = pool.dense_dimension().await?;
	let store_name = crate::storage::store_name(&root)?;
	let store = Store::open_or_create(&store_name, vector_dim).await?;
	let meta = MetaStore::open_default()?;

	let context = Arc::new(ServerContext {
		store,
		pool,
		meta,
		config,
		root: root.clone(),
		auth_token: generate_token(),
		sync_state: create_shared_state(),
	});

	// Bind first so the lock file always names a live port. A replacement
	// process may race the port its predecessor is still releasing.
	let listener = bind_with_retry(port).await?;
	let bound_port = listener.local_addr()?.port();
	write_lock_file(&root, bound_port, &context.auth_token)?;

	// Initial sync runs in the background; /search reports progress until
	// it completes, then the watcher takes over ingest
	let sync_context = context.clone();
	tokio::spawn(async move {
		let cancel = Arc::new(AtomicBool::new(false));
		let result = sync::sync_repository(
			&sync_context.store,
			&sync_context.pool,
			&sync_context.meta,
			&sync_context.config,
			&sync_context.root,
			sync_context.sync_state.clone(),
			SyncOptions::default(),
			cancel,
			None,
		)
		.await;

		match result {
			Ok(outcome) => info!(
				"initial sync done: {} indexed, {} skipped",
				outcome.indexed, outcome.skipped
			),
			Err(e) => error!("initial sync failed: {}", e),
		}

		// Single writer: the watcher only starts once the sync finished
		if let Err(e) = watch::run(sync_context).await {
			error!("watcher stopped: {}", e);
		}
	});

	spawn_memory_governor(context.clone(), bound_port);
	if let Some(pid) = parent_pid {
		spawn_parent_watch(pid);
	}

	let app = router(context);
	info!("serving on 127.0.0.1:{}", bound_port);
	axum::serve(listener, app).await?;
	Ok(())
}

pub fn router(context: Arc<ServerContext>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/search", post(search_handler))
		.layer(middleware::from_fn_with_state(context.clone(), auth))
		.layer(DefaultBodyLimit::max(SERVER_MAX_BODY_BYTES))
		.layer(tower_http::trace::TraceLayer::new_for_http())
		.with_state(context)
}

async fn auth(
	State(context): State<Arc<ServerContext>>,
	request: Request,
	next: Next,
) -> Response {
	let authorized = request
		.headers()
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "))
		.is_some_and(|token| token == context.auth_token);

	if !authorized {
		return (
			StatusCode::UNAUTHORIZED,
			Json(ErrorBody {
				error: "missing or invalid bearer token".to_string(),
			}),
		)
			.into_response();
	}
	next.run(request).await
}

async fn health() -> Json<serde_json::Value> {
	Json(serde_json::json!({ "status": "ok" }))
}

async fn search_handler(
	State(context): State<Arc<ServerContext>>,
	Json(request): Json<SearchRequest>,
) -> Response {
	// Reject path traversal before touching the store
	let path_prefix = match validate_search_path(&context.root, &request.path) {
		Ok(prefix) => prefix,
		Err(e) => {
			return (
				StatusCode::BAD_REQUEST,
				Json(ErrorBody {
					error: e.to_string(),
				}),
			)
				.into_response();
		}
	};

	// Give the initial index a short window to finish
	let deadline = tokio::time::Instant::now() + Duration::from_millis(SERVER_INDEX_WAIT_MS);
	loop {
		if context.sync_state.read().sync_complete {
			break;
		}
		if tokio::time::Instant::now() >= deadline {
			let progress = context.sync_state.read().progress_percent();
			return Json(SearchResponse {
				results: Vec::new(),
				status: "indexing".to_string(),
				progress,
			})
			.into_response();
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}

	let mut options = SearchOptions::from_config(&context.config);
	options.top_k = request.limit.clamp(1, 200);
	options.rerank = request.rerank;
	options.path_prefix = path_prefix;

	match search::search(&context.store, &context.pool, &request.query, &options).await {
		Ok(results) => Json(SearchResponse {
			results: results
				.into_iter()
				.map(|r| SearchResponseItem {
					path: r.path,
					score: r.score,
					content: r.text,
					chunk_type: r.kind.as_str().to_string(),
					start_line: r.start_line,
					num_lines: r.end_line.saturating_sub(r.start_line),
					is_anchor: r.is_anchor,
				})
				.collect(),
			status: "ready".to_string(),
			progress: 100,
		})
		.into_response(),
		Err(e) => (
			StatusCode::INTERNAL_SERVER_ERROR,
			Json(ErrorBody {
				error: e.to_string(),
			}),
		)
			.into_response(),
	}
}

/// Resolve the request's path filter against the repository root, rejecting
/// anything that escapes it
pub fn validate_search_path(root: &Path, requested: &str) -> Result<Option<String>> {
	if requested.is_empty() {
		return Ok(None);
	}

	let mut resolved = root.to_path_buf();
	for component in Path::new(requested).components() {
		match component {
			Component::Normal(part) => resolved.push(part),
			Component::CurDir => {}
			Component::RootDir | Component::Prefix(_) => {
				return Err(anyhow::anyhow!("path must be relative to the repository"));
			}
			Component::ParentDir => {
				if !resolved.pop() || !resolved.starts_with(root) {
					return Err(anyhow::anyhow!("path escapes the repository root"));
				}
			}
		}
	}

	if !resolved.starts_with(root) {
		return Err(anyhow::anyhow!("path escapes the repository root"));
	}
	Ok(Some(resolved.to_string_lossy().to_string()))
}

fn generate_token() -> String {
	rand::rng()
		.sample_iter(&Alphanumeric)
		.take(32)
		.map(char::from)
		.collect()
}

pub fn write_lock_file(root: &Path, port: u16, auth_token: &str) -> Result<()> {
	let lock = ServerLock {
		port,
		pid: std::process::id(),
		auth_token: auth_token.to_string(),
		root: root.to_string_lossy().to_string(),
	};

	let path = crate::storage::server_lock_path(root);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	std::fs::write(&path, serde_json::to_string_pretty(&lock)?)
		.context("Failed to write server lock file")?;
	Ok(())
}

pub fn read_lock_file(root: &Path) -> Result<ServerLock> {
	let path = crate::storage::server_lock_path(root);
	let content = std::fs::read_to_string(&path)?;
	Ok(serde_json::from_str(&content)?)
}

async fn bind_with_retry(port: u16) -> Result<tokio::net::TcpListener> {
	let mut last_error = None;
	for _ in 0..20 {
		match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
			Ok(listener) => return Ok(listener),
			Err(e) => {
				last_error = Some(e);
				tokio::time::sleep(Duration::from_millis(250)).await;
			}
		}
	}
	Err(anyhow::anyhow!(
		"could not bind 127.0.0.1:{}: {:?}",
		port,
		last_error
	))
}

// Polls RSS: warn at most once per interval above the warning threshold,
// spawn a replacement and exit above the restart threshold
fn spawn_memory_governor(context: Arc<ServerContext>, port: u16) {
	let warn_bytes = context.config.server.memory_warn_mb * 1024 * 1024;
	let restart_bytes = context.config.server.memory_restart_mb * 1024 * 1024;
	if warn_bytes == 0 && restart_bytes == 0 {
		return;
	}

	tokio::spawn(async move {
		let mut last_warn = tokio::time::Instant::now() - Duration::from_secs(SERVER_WARN_INTERVAL_SECS);
		let mut interval = tokio::time::interval(Duration::from_secs(10));
		loop {
			interval.tick().await;
			let rss = crate::memory::current_rss_bytes();

			if restart_bytes > 0 && rss > restart_bytes {
				warn!(
					"rss {} MB above restart threshold, handing off",
					rss / (1024 * 1024)
				);
				if let Err(e) = spawn_replacement(&context.root, port) {
					error!("failed to spawn replacement server: {}", e);
					continue;
				}
				context.pool.shutdown().await;
				std::process::exit(0);
			}

			if warn_bytes > 0 && rss > warn_bytes && last_warn.elapsed().as_secs() >= SERVER_WARN_INTERVAL_SECS {
				warn!("rss {} MB above warning threshold", rss / (1024 * 1024));
				last_warn = tokio::time::Instant::now();
			}
		}
	});
}

fn spawn_replacement(root: &Path, port: u16) -> Result<()> {
	let exe = std::env::current_exe()?;
	std::process::Command::new(exe)
		.arg("serve")
		.arg("--port")
		.arg(port.to_string())
		.arg("--path")
		.arg(root)
		.spawn()
		.context("Failed to spawn replacement process")?;
	Ok(())
}

// Exit when the parent process disappears
fn spawn_parent_watch(parent_pid: u32) {
	tokio::spawn(async move {
		let mut interval = tokio::time::interval(Duration::from_secs(2));
		loop {
			interval.tick().await;
			if !crate::memory::process_alive(parent_pid) {
				info!("parent {} exited, shutting down", parent_pid);
				std::process::exit(0);
			}
		}
	});
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::embedding::worker::test_support::stub_factory;
	use axum::body::Body;
	use axum::http::Request as HttpRequest;
	use std::sync::atomic::AtomicUsize;
	use tower::util::ServiceExt;

	async fn test_context(sync_complete: bool) -> (tempfile::TempDir, Arc<ServerContext>) {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open_at(dir.path().join("store"), 4).await.unwrap();
		let pool = WorkerPool::with_factory(
			stub_factory(Duration::ZERO, Arc::new(AtomicUsize::new(0))),
			1,
			Duration::from_secs(5),
			0,
		);
		let meta = MetaStore::load(dir.path().join("meta.json"));
		let state = create_shared_state();
		state.write().sync_complete = sync_complete;

		let context = Arc::new(ServerContext {
			store,
			pool,
			meta,
			config: Config::default(),
			root: dir.path().to_path_buf(),
			auth_token: "test-token".to_string(),
			sync_state: state,
		});
		(dir, context)
	}

	#[test]
	fn test_validate_search_path() {
		let root = Path::new("/repo");

		assert_eq!(validate_search_path(root, "").unwrap(), None);
		assert_eq!(
			validate_search_path(root, "src").unwrap(),
			Some("/repo/src".to_string())
		);
		assert_eq!(
			validate_search_path(root, "src/../tests").unwrap(),
			Some("/repo/tests".to_string())
		);

		assert!(validate_search_path(root, "../../etc").is_err());
		assert!(validate_search_path(root, "/etc/passwd").is_err());
		assert!(validate_search_path(root, "src/../../outside").is_err());
	}

	#[tokio::test]
	async fn test_health_requires_auth() {
		let (_dir, context) = test_context(true).await;
		let app = router(context);

		let response = app
			.clone()
			.oneshot(
				HttpRequest::builder()
					.uri("/health")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

		let response = app
			.oneshot(
				HttpRequest::builder()
					.uri("/health")
					.header("Authorization", "Bearer test-token")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn test_search_rejects_traversal_without_store_access() {
		let (_dir, context) = test_context(true).await;
		let app = router(context);

		let body = serde_json::json!({
			"query": "auth",
			"path": "../../etc"
		});
		let response = app
			.oneshot(
				HttpRequest::builder()
					.method("POST")
					.uri("/search")
					.header("Authorization", "Bearer test-token")
					.header("Content-Type", "application/json")
					.body(Body::from(body.to_string()))
					.unwrap(),
			)
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn test_search_reports_indexing_progress() {
		let (_dir, context) = test_context(false).await;
		{
			let mut guard = context.sync_state.write();
			guard.total_files = 10;
			guard.processed_files = 4;
		}
		let app = router(context);

		// Indexing never finishes here, so the handler answers after the
		// wait window; shrink it by short-circuiting with a tiny timeout
		let body = serde_json::json!({ "query": "anything" });
		let request = HttpRequest::builder()
			.method("POST")
			.uri("/search")
			.header("Authorization", "Bearer test-token")
			.header("Content-Type", "application/json")
			.body(Body::from(body.to_string()))
			.unwrap();

		let response =
			tokio::time::timeout(Duration::from_secs(10), app.oneshot(request))
				.await
				.unwrap()
				.unwrap();
		assert_eq!(response.status(), StatusCode::OK);

		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(parsed["status"], "indexing");
		assert_eq!(parsed["progress"], 40);
	}

	#[tokio::test]
	async fn test_search_ready_on_synced_store() {
		let (_dir, context) = test_context(true).await;
		let app = router(context);

		let body = serde_json::json!({ "query": "anything" });
		let response = app
			.oneshot(
				HttpRequest::builder()
					.method("POST")
					.uri("/search")
					.header("Authorization", "Bearer test-token")
					.header("Content-Type", "application/json")
					.body(Body::from(body.to_string()))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);

		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(parsed["status"], "ready");
	}

	#[test]
	fn test_lock_file_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		write_lock_file(dir.path(), 4851, "secret").unwrap();

		let lock = read_lock_file(dir.path()).unwrap();
		assert_eq!(lock.port, 4851);
		assert_eq!(lock.pid, std::process::id());
		assert_eq!(lock.auth_token, "secret");
		assert_eq!(lock.root, dir.path().to_string_lossy());

		// Wire format keeps the camelCase key
		let raw = std::fs::read_to_string(crate::storage::server_lock_path(dir.path())).unwrap();
		assert!(raw.contains("authToken"));
	}
}
