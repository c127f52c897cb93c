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

//! Debounced file-event ingest for the server.
//!
//! Events are coalesced per path by the debouncer; ignored paths are
//! dropped, changed files re-enter the ingest pipeline, and deletions
//! cascade through `delete_by_path`.

use anyhow::Result;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ServerContext;
use crate::scanner::IgnoreFilter;
use crate::sync;

pub async fn run(context: Arc<ServerContext>) -> Result<()> {
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<DebouncedEvent>>();

	let debounce = Duration::from_millis(context.config.server.debounce_ms);
	let mut debouncer = new_debouncer(
		debounce,
		move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
			Ok(events) => {
				let _ = tx.send(events);
			}
			Err(e) => warn!("file watcher error: {:?}", e),
		},
	)?;

	debouncer
		.watcher()
		.watch(&context.root, notify::RecursiveMode::Recursive)?;
	info!("watching {} for changes", context.root.display());

	let filter = IgnoreFilter::for_root(&context.root, &context.config.index.ignore_patterns)?;

	while let Some(events) = rx.recv().await {
		for event in events {
			let path = event.path;

			if filter.is_ignored(&path) {
				continue;
			}

			if path.is_file() {
				match sync::ingest_path(
					&context.store,
					&context.pool,
					&context.meta,
					&context.config,
					&path,
				)
				.await
				{
					Ok(true) => debug!("reindexed {}", path.display()),
					Ok(false) => {}
					Err(e) => warn!("failed to reindex {}: {}", path.display(), e),
				}
			} else {
				// Unlinked or replaced by a directory: drop its rows
				let path_str = path.to_string_lossy();
				if let Err(e) = context.store.delete_by_path(&path_str).await {
					warn!("failed to delete rows for {}: {}", path_str, e);
					continue;
				}
				context.meta.remove(&path);
				context.meta.persist_periodic();
			}
		}
	}

	Ok(())
}
