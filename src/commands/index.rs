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
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use osgrep::embedding::WorkerPool;
use osgrep::meta_store::MetaStore;
use osgrep::state;
use osgrep::store::Store;
use osgrep::sync::{self, ProgressFn, SyncOptions};
use osgrep::Config;

#[derive(Args, Debug)]
pub struct IndexArgs {
	/// Report what would be indexed without writing anything
	#[arg(long)]
	pub dry_run: bool,

	/// Repository root to index (defaults to the current directory)
	#[arg(long)]
	pub path: Option<PathBuf>,

	/// Run in quiet mode with less output
	#[arg(long, short)]
	pub quiet: bool,
}

pub async fn execute(config: &Config, args: &IndexArgs) -> Result<()> {
	let started = std::time::Instant::now();
	let root = match &args.path {
		Some(path) => path.canonicalize()?,
		None => std::env::current_dir()?,
	};

	let pool = WorkerPool::new(config);
	let vector_dim = pool.dense_dimension().await?;
	let store_name = osgrep::storage::store_name(&root)?;
	let store = Store::open_or_create(&store_name, vector_dim).await?;
	let meta = MetaStore::open_default()?;

	if !args.quiet {
		println!("Indexing {}...", root.display());
	}

	// Ctrl-C finishes in-flight files and persists the meta store
	let cancel = Arc::new(AtomicBool::new(false));
	{
		let cancel = cancel.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				eprintln!("\nStopping after in-flight files...");
				cancel.store(true, Ordering::SeqCst);
			}
		});
	}

	let progress: Option<ProgressFn> = if args.quiet {
		None
	} else {
		Some(Arc::new(|processed, indexed, total, path: &str| {
			eprint!("\r\x1b[2K[{}/{}] {} indexed · {}", processed, total, indexed, path);
		}))
	};

	let outcome = sync::sync_repository(
		&store,
		&pool,
		&meta,
		config,
		&root,
		state::create_shared_state(),
		SyncOptions {
			dry_run: args.dry_run,
		},
		cancel,
		progress,
	)
	.await?;
	pool.shutdown().await;

	if !args.quiet {
		eprintln!();
		let verb = if args.dry_run { "would index" } else { "indexed" };
		println!(
			"Done: {} {} files, {} unchanged, {} stale removed ({} processed)",
			verb, outcome.indexed, outcome.skipped, outcome.stale_deleted, outcome.processed
		);
		if outcome.cancelled {
			println!("Cancelled; {} files were processed before stopping", outcome.processed);
		}
		if std::env::var("OSGREP_PROFILE").is_ok() {
			eprintln!("index took {:?}", started.elapsed());
		}
	}

	Ok(())
}
