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

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use osgrep::embedding::WorkerPool;
use osgrep::meta_store::MetaStore;
use osgrep::search::{self, SearchOptions, SearchResult};
use osgrep::state;
use osgrep::store::Store;
use osgrep::sync::{self, SyncOptions};
use osgrep::Config;

#[derive(Args, Debug)]
pub struct SearchArgs {
	/// Natural language query
	pub pattern: Option<String>,

	/// Restrict results to this subdirectory
	pub path: Option<PathBuf>,

	/// Maximum results to return
	#[arg(long, short)]
	pub limit: Option<usize>,

	/// Matches allowed per file
	#[arg(long)]
	pub per_file: Option<usize>,

	/// Skip the cross-encoder reranking pass
	#[arg(long)]
	pub no_rerank: bool,

	/// Print results as JSON
	#[arg(long)]
	pub json: bool,
}

pub async fn execute(config: &Config, args: &SearchArgs) -> Result<()> {
	let started = std::time::Instant::now();
	let query = args
		.pattern
		.as_deref()
		.ok_or_else(|| anyhow::anyhow!("a search pattern is required"))?;

	let root = std::env::current_dir()?;
	let pool = WorkerPool::new(config);
	let vector_dim = pool.dense_dimension().await?;
	let store_name = osgrep::storage::store_name(&root)?;
	let store = Store::open_or_create(&store_name, vector_dim).await?;
	let meta = MetaStore::open_default()?;

	// A fresh or wiped data directory means nothing to search yet; sync
	// first so the command still answers
	if store.count_rows().await? == 0 {
		eprintln!("Index is empty, indexing {} first...", root.display());
		sync::sync_repository(
			&store,
			&pool,
			&meta,
			config,
			&root,
			state::create_shared_state(),
			SyncOptions::default(),
			Arc::new(AtomicBool::new(false)),
			None,
		)
		.await?;
	}

	let mut options = SearchOptions::from_config(config);
	if let Some(limit) = args.limit {
		options.top_k = limit;
	}
	if let Some(per_file) = args.per_file {
		options.per_file = per_file;
	}
	if args.no_rerank {
		options.rerank = false;
	}
	if let Some(path) = &args.path {
		options.path_prefix =
			osgrep::server::validate_search_path(&root, &path.to_string_lossy())?;
	}

	let results = search::search(&store, &pool, query, &options).await?;
	pool.shutdown().await;

	if args.json {
		render_json(&results)?;
	} else {
		render_results(&results, &root);
	}

	if std::env::var("OSGREP_PROFILE").is_ok() {
		eprintln!("search took {:?}", started.elapsed());
	}
	Ok(())
}

fn render_json(results: &[SearchResult]) -> Result<()> {
	let items: Vec<serde_json::Value> = results
		.iter()
		.map(|r| {
			serde_json::json!({
				"path": r.path,
				"score": r.score,
				"content": r.text,
				"chunk_type": r.kind.as_str(),
				"start_line": r.start_line,
				"num_lines": r.end_line.saturating_sub(r.start_line),
				"is_anchor": r.is_anchor,
			})
		})
		.collect();
	println!("{}", serde_json::to_string_pretty(&items)?);
	Ok(())
}

fn render_results(results: &[SearchResult], root: &std::path::Path) {
	if results.is_empty() {
		println!("No matches found.");
		return;
	}

	println!("Found {} matches:\n", results.len());
	for (idx, result) in results.iter().enumerate() {
		let display_path = std::path::Path::new(&result.path)
			.strip_prefix(root)
			.map(|p| p.to_string_lossy().to_string())
			.unwrap_or_else(|_| result.path.clone());

		println!(
			"╔══ {} ({} of {})",
			display_path,
			idx + 1,
			results.len()
		);
		println!(
			"║ Lines {}-{} · {} · score {:.3}",
			result.start_line + 1,
			result.end_line,
			result.kind.as_str(),
			result.score
		);
		println!("║ ┌──────────────────────────────────");
		for line in result.text.lines().take(20) {
			println!("║ │ {}", line);
		}
		if result.text.lines().count() > 20 {
			println!("║ │ …");
		}
		println!("║ └──────────────────────────────────");
		println!("╚══\n");
	}
}
