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

//! Sync orchestrator: reconciles the index with the filesystem.
//!
//! Walk, filter, hash-skip, chunk, embed (deduplicated), then commit each
//! file as delete-then-insert. Stale paths are removed first. File pipelines
//! run with bounded concurrency; cancellation lets in-flight files finish
//! and persists the meta store before returning.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use futures::StreamExt;

use crate::chunker::Chunker;
use crate::config::Config;
use crate::constants::META_SAVE_INTERVAL;
use crate::embedding::{HybridEmbedding, WorkerPool};
use crate::meta_store::{hash_bytes, MetaStore};
use crate::scanner::{self, IgnoreFilter};
use crate::state::SharedState;
use crate::store::{FragmentRow, Store};

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
	/// Report what would be indexed without touching the store
	pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct SyncOutcome {
	pub processed: usize,
	pub indexed: usize,
	pub skipped: usize,
	pub stale_deleted: usize,
	pub cancelled: bool,
}

/// Progress callback: (processed, indexed, total, path)
pub type ProgressFn = Arc<dyn Fn(usize, usize, usize, &str) + Send + Sync>;

#[allow(clippy::too_many_arguments)]
pub async fn sync_repository(
	store: &Store,
	pool: &WorkerPool,
	meta: &MetaStore,
	config: &Config,
	root: &Path,
	state: SharedState,
	options: SyncOptions,
	cancel: Arc<AtomicBool>,
	progress: Option<ProgressFn>,
) -> Result<SyncOutcome> {
	{
		let mut guard = state.write();
		guard.root = root.to_path_buf();
		guard.sync_complete = false;
		guard.status_message = "Collecting indexed paths...".to_string();
	}

	// Hashes already in the index; doubles as the fallback when the meta
	// store was lost or corrupted
	let db_hashes: HashMap<String, String> = store.list_paths().await?.into_iter().collect();

	{
		let mut guard = state.write();
		guard.status_message = "Walking the repository...".to_string();
	}

	let filter = IgnoreFilter::for_root(root, &config.index.ignore_patterns)?;
	let disk_paths = scanner::list_files(root, &filter);
	let disk_set: HashSet<String> = disk_paths
		.iter()
		.map(|p| p.to_string_lossy().to_string())
		.collect();

	// Stale paths: in the index but gone from disk or newly ignored
	let mut outcome = SyncOutcome::default();
	if !options.dry_run {
		for (path, _) in db_hashes.iter().filter(|(p, _)| !disk_set.contains(*p)) {
			if let Err(e) = store.delete_by_path(path).await {
				warn!("failed to delete stale path {}: {}", path, e);
				continue;
			}
			meta.remove(Path::new(path));
			outcome.stale_deleted += 1;
		}
		if outcome.stale_deleted > 0 {
			meta.persist()?;
		}
	}

	{
		let mut guard = state.write();
		guard.total_files = disk_paths.len();
		guard.status_message = String::new();
	}

	let chunker = Chunker::new(config);
	let processed = AtomicUsize::new(0);
	let indexed = AtomicUsize::new(0);
	let skipped = AtomicUsize::new(0);
	let any_insert = AtomicBool::new(false);
	let total = disk_paths.len();

	futures::stream::iter(disk_paths.iter())
		.for_each_concurrent(config.sync_concurrency(), |path| {
			let chunker = &chunker;
			let db_hashes = &db_hashes;
			let processed = &processed;
			let indexed = &indexed;
			let skipped = &skipped;
			let any_insert = &any_insert;
			let cancel = &cancel;
			let progress = progress.clone();
			let state = state.clone();
			let options = options.clone();

			async move {
				// No new files once cancellation is raised
				if cancel.load(Ordering::SeqCst) {
					return;
				}

				let result = sync_one_file(
					store, pool, meta, db_hashes, config, chunker, path, &options,
				)
				.await;

				let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
				match result {
					Ok(FileOutcome::Indexed) => {
						let n = indexed.fetch_add(1, Ordering::SeqCst) + 1;
						any_insert.store(true, Ordering::SeqCst);
						if n % META_SAVE_INTERVAL == 0 {
							meta.persist_periodic();
						}
					}
					Ok(FileOutcome::WouldIndex) => {
						indexed.fetch_add(1, Ordering::SeqCst);
						info!("would have indexed {}", path.display());
					}
					Ok(FileOutcome::Skipped) => {
						skipped.fetch_add(1, Ordering::SeqCst);
					}
					Err(e) => {
						warn!("failed to index {}: {}", path.display(), e);
					}
				}

				{
					let mut guard = state.write();
					guard.processed_files = done;
					guard.indexed_files = indexed.load(Ordering::SeqCst);
					guard.skipped_files = skipped.load(Ordering::SeqCst);
				}
				if let Some(progress) = &progress {
					progress(
						done,
						indexed.load(Ordering::SeqCst),
						total,
						&path.to_string_lossy(),
					);
				}
			}
		})
		.await;

	outcome.processed = processed.load(Ordering::SeqCst);
	outcome.indexed = indexed.load(Ordering::SeqCst);
	outcome.skipped = skipped.load(Ordering::SeqCst);
	outcome.cancelled = cancel.load(Ordering::SeqCst);

	// Index maintenance only when something was written; failures degrade
	// search speed, not correctness
	if any_insert.load(Ordering::SeqCst) {
		if let Err(e) = store.create_fts_index().await {
			warn!("full-text index creation failed: {}", e);
		}
		if let Err(e) = store.create_vector_index().await {
			warn!("vector index creation failed: {}", e);
		}
	}

	if !options.dry_run {
		meta.persist()?;
	}

	{
		let mut guard = state.write();
		guard.sync_complete = true;
		guard.status_message = String::new();
	}

	Ok(outcome)
}

enum FileOutcome {
	Indexed,
	WouldIndex,
	Skipped,
}

/// Re-ingest a single file through the same pipeline the sync uses:
/// re-chunk, re-embed, delete-then-insert, then update the meta store.
/// Returns true when rows were written.
pub async fn ingest_path(
	store: &Store,
	pool: &WorkerPool,
	meta: &MetaStore,
	config: &Config,
	path: &Path,
) -> Result<bool> {
	let chunker = Chunker::new(config);
	let db_hashes = HashMap::new();
	let outcome = sync_one_file(
		store,
		pool,
		meta,
		&db_hashes,
		config,
		&chunker,
		path,
		&SyncOptions::default(),
	)
	.await?;
	Ok(matches!(outcome, FileOutcome::Indexed))
}

#[allow(clippy::too_many_arguments)]
async fn sync_one_file(
	store: &Store,
	pool: &WorkerPool,
	meta: &MetaStore,
	db_hashes: &HashMap<String, String>,
	config: &Config,
	chunker: &Chunker,
	path: &Path,
	options: &SyncOptions,
) -> Result<FileOutcome> {
	let bytes = match std::fs::read(path) {
		Ok(bytes) => bytes,
		Err(e) => {
			// Transient read failures skip the file, not the sync
			warn!("cannot read {}: {}", path.display(), e);
			return Ok(FileOutcome::Skipped);
		}
	};

	if bytes.is_empty() {
		return Ok(FileOutcome::Skipped);
	}

	let contents = match String::from_utf8(bytes) {
		Ok(contents) => contents,
		// Binary or non-UTF-8: silently out of scope
		Err(_) => return Ok(FileOutcome::Skipped),
	};

	let hash = hash_bytes(contents.as_bytes());
	let path_str = path.to_string_lossy();
	// Meta store miss falls back to the hash recorded in the index
	let known = meta
		.get(path)
		.or_else(|| db_hashes.get(path_str.as_ref()).cloned());
	if known.as_deref() == Some(hash.as_str()) {
		if meta.get(path).is_none() && !options.dry_run {
			// Rebuild the advisory cache from the index
			meta.set(path, &hash);
		}
		return Ok(FileOutcome::Skipped);
	}

	let fragments = chunker.chunk_file(path, &contents);
	if fragments.is_empty() {
		return Ok(FileOutcome::Skipped);
	}

	if options.dry_run {
		return Ok(FileOutcome::WouldIndex);
	}

	// The embedder runs once per unique text within this file; duplicate
	// fragments reuse the computed vector
	let embedding_texts: Vec<String> = fragments.iter().map(|f| f.embedding_text()).collect();
	let mut unique_texts: Vec<String> = Vec::new();
	let mut text_index: HashMap<&str, usize> = HashMap::new();
	for text in &embedding_texts {
		if !text_index.contains_key(text.as_str()) {
			text_index.insert(text.as_str(), unique_texts.len());
			unique_texts.push(text.clone());
		}
	}

	let mut embeddings: Vec<HybridEmbedding> = Vec::with_capacity(unique_texts.len());
	for batch in unique_texts.chunks(config.index.embed_batch_size.max(1)) {
		embeddings.extend(pool.hybrid(batch.to_vec()).await?);
	}

	let rows: Vec<FragmentRow> = fragments
		.iter()
		.zip(embedding_texts.iter())
		.map(|(fragment, text)| -> FragmentRow {
			let embedding = &embeddings[text_index[text.as_str()]];
			FragmentRow::new(
				&path_str,
				&hash,
				fragment,
				embedding.dense.clone(),
				embedding.late_interaction.clone(),
			)
		})
		.collect();

	// Delete-then-insert keeps per-file updates atomic for readers
	store.delete_by_path(&path_str).await?;
	store.insert_batch(&rows).await?;

	// Only after a successful insert does the meta store learn the hash
	meta.set(path, &hash);

	Ok(FileOutcome::Indexed)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::embedding::worker::{ModelSession, SessionFactory};
	use crate::state::create_shared_state;
	use std::fs;
	use std::sync::Mutex;
	use std::time::Duration;

	// Counting stub: records every text the pool embeds
	struct CountingSession {
		embedded: Arc<Mutex<Vec<String>>>,
	}

	impl ModelSession for CountingSession {
		fn embed_documents(&mut self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
			self.embedded.lock().unwrap().extend(texts.iter().cloned());
			Ok(texts
				.iter()
				.map(|t| crate::embedding::worker::test_support::stub_vector(t))
				.collect())
		}

		fn embed_query(&mut self, text: &str) -> anyhow::Result<Vec<f32>> {
			Ok(crate::embedding::worker::test_support::stub_vector(text))
		}

		fn rerank(&mut self, _: &str, documents: &[String]) -> anyhow::Result<Vec<f32>> {
			Ok(vec![0.5; documents.len()])
		}

		fn dimension(&self) -> usize {
			4
		}
	}

	fn counting_pool(embedded: Arc<Mutex<Vec<String>>>) -> WorkerPool {
		let factory: SessionFactory = Arc::new(move || {
			Ok(Box::new(CountingSession {
				embedded: embedded.clone(),
			}) as Box<dyn ModelSession>)
		});
		WorkerPool::with_factory(factory, 1, Duration::from_secs(5), 0)
	}

	struct Fixture {
		_data: tempfile::TempDir,
		repo: tempfile::TempDir,
		store: Store,
		pool: WorkerPool,
		meta: MetaStore,
		config: Config,
		embedded: Arc<Mutex<Vec<String>>>,
	}

	async fn fixture() -> Fixture {
		let data = tempfile::tempdir().unwrap();
		let repo = tempfile::tempdir().unwrap();
		let store = Store::open_at(data.path().join("store"), 4).await.unwrap();
		let embedded = Arc::new(Mutex::new(Vec::new()));
		let pool = counting_pool(embedded.clone());
		let meta = MetaStore::load(data.path().join("meta.json"));
		let config = Config::default();
		Fixture {
			_data: data,
			repo,
			store,
			pool,
			meta,
			config,
			embedded,
		}
	}

	async fn run_sync(fx: &Fixture, options: SyncOptions) -> SyncOutcome {
		crate::scanner::IgnoreFilter::invalidate(fx.repo.path());
		sync_repository(
			&fx.store,
			&fx.pool,
			&fx.meta,
			&fx.config,
			fx.repo.path(),
			create_shared_state(),
			options,
			Arc::new(AtomicBool::new(false)),
			None,
		)
		.await
		.unwrap()
	}

	const PY_FILE: &str = "\"\"\"Module a.\"\"\"\nimport os\n\ndef f(x):\n    y = x + 1\n    z = y * 2\n    return z\n";

	#[tokio::test]
	async fn test_sync_indexes_new_files() {
		let fx = fixture().await;
		fs::write(fx.repo.path().join("a.py"), PY_FILE).unwrap();

		let outcome = run_sync(&fx, SyncOptions::default()).await;

		assert_eq!(outcome.indexed, 1);
		assert!(fx.store.count_rows().await.unwrap() >= 2); // anchor + function

		let paths = fx.store.list_paths().await.unwrap();
		assert_eq!(paths.len(), 1);
		assert!(paths[0].0.ends_with("a.py"));
	}

	#[tokio::test]
	async fn test_second_sync_is_a_no_op() {
		let fx = fixture().await;
		fs::write(fx.repo.path().join("a.py"), PY_FILE).unwrap();

		run_sync(&fx, SyncOptions::default()).await;
		let first_embeds = fx.embedded.lock().unwrap().len();
		assert!(first_embeds > 0);

		let outcome = run_sync(&fx, SyncOptions::default()).await;

		// Unchanged files trigger zero chunker and zero worker work
		assert_eq!(outcome.indexed, 0);
		assert_eq!(outcome.skipped, 1);
		assert_eq!(fx.embedded.lock().unwrap().len(), first_embeds);
	}

	#[tokio::test]
	async fn test_modified_file_reingests_only_that_file() {
		let fx = fixture().await;
		fs::write(fx.repo.path().join("a.py"), PY_FILE).unwrap();
		fs::write(
			fx.repo.path().join("b.py"),
			"def g():\n    a = 1\n    b = 2\n    return a + b\n",
		)
		.unwrap();

		run_sync(&fx, SyncOptions::default()).await;

		let modified = format!("# touched\n{}", PY_FILE);
		fs::write(fx.repo.path().join("a.py"), &modified).unwrap();

		let outcome = run_sync(&fx, SyncOptions::default()).await;
		assert_eq!(outcome.indexed, 1);
		assert_eq!(outcome.skipped, 1);

		// No rows with the old hash survive for a.py
		let paths = fx.store.list_paths().await.unwrap();
		let a_hash = paths
			.iter()
			.find(|(p, _)| p.ends_with("a.py"))
			.map(|(_, h)| h.clone())
			.unwrap();
		assert_eq!(a_hash, hash_bytes(modified.as_bytes()));
	}

	#[tokio::test]
	async fn test_stale_paths_are_removed() {
		let fx = fixture().await;
		let path = fx.repo.path().join("gone.py");
		fs::write(&path, PY_FILE).unwrap();

		run_sync(&fx, SyncOptions::default()).await;
		assert!(fx.store.count_rows().await.unwrap() > 0);

		fs::remove_file(&path).unwrap();
		let outcome = run_sync(&fx, SyncOptions::default()).await;

		assert_eq!(outcome.stale_deleted, 1);
		assert_eq!(fx.store.count_rows().await.unwrap(), 0);
		assert!(fx.meta.get(&path).is_none());
	}

	#[tokio::test]
	async fn test_gitignored_files_produce_no_rows() {
		let fx = fixture().await;
		fs::write(fx.repo.path().join(".gitignore"), "secret.py\n").unwrap();
		fs::write(fx.repo.path().join("secret.py"), PY_FILE).unwrap();
		fs::write(fx.repo.path().join("open.py"), PY_FILE).unwrap();

		run_sync(&fx, SyncOptions::default()).await;

		let paths = fx.store.list_paths().await.unwrap();
		assert_eq!(paths.len(), 1);
		assert!(paths[0].0.ends_with("open.py"));
	}

	#[tokio::test]
	async fn test_duplicate_texts_embed_once() {
		let fx = fixture().await;

		// Three byte-identical functions in one file
		let body = "def dup():\n    total = 0\n    for i in range(10):\n        total += i\n    return total\n";
		let file = format!("{0}\n\n{0}\n\n{0}", body);
		fs::write(fx.repo.path().join("dups.py"), &file).unwrap();

		run_sync(&fx, SyncOptions::default()).await;

		let embedded = fx.embedded.lock().unwrap();
		let unique: HashSet<&String> = embedded.iter().collect();
		assert_eq!(embedded.len(), unique.len(), "no text embedded twice");
	}

	#[tokio::test]
	async fn test_dry_run_writes_nothing() {
		let fx = fixture().await;
		fs::write(fx.repo.path().join("a.py"), PY_FILE).unwrap();

		let outcome = run_sync(&fx, SyncOptions { dry_run: true }).await;

		assert_eq!(outcome.indexed, 1);
		assert_eq!(fx.store.count_rows().await.unwrap(), 0);
		assert!(fx.meta.is_empty());
		assert!(fx.embedded.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn test_cancellation_before_start_processes_nothing() {
		let fx = fixture().await;
		fs::write(fx.repo.path().join("a.py"), PY_FILE).unwrap();

		crate::scanner::IgnoreFilter::invalidate(fx.repo.path());
		let outcome = sync_repository(
			&fx.store,
			&fx.pool,
			&fx.meta,
			&fx.config,
			fx.repo.path(),
			create_shared_state(),
			SyncOptions::default(),
			Arc::new(AtomicBool::new(true)),
			None,
		)
		.await
		.unwrap();

		assert!(outcome.cancelled);
		assert_eq!(outcome.indexed, 0);
		assert_eq!(fx.store.count_rows().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn test_empty_files_are_skipped() {
		let fx = fixture().await;
		fs::write(fx.repo.path().join("empty.py"), "").unwrap();

		let outcome = run_sync(&fx, SyncOptions::default()).await;
		assert_eq!(outcome.indexed, 0);
		assert_eq!(fx.store.count_rows().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn test_meta_agrees_with_store_after_sync() {
		let fx = fixture().await;
		let path = fx.repo.path().join("a.py");
		fs::write(&path, PY_FILE).unwrap();

		run_sync(&fx, SyncOptions::default()).await;

		// Every meta entry is backed by store rows with the same hash
		let store_hashes: HashMap<String, String> =
			fx.store.list_paths().await.unwrap().into_iter().collect();
		let meta_hash = fx.meta.get(&path).unwrap();
		assert_eq!(
			store_hashes.get(&path.to_string_lossy().to_string()),
			Some(&meta_hash)
		);
	}
}
