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

use osgrep::embedding::WorkerPool;
use osgrep::Config;

#[derive(Args, Debug)]
pub struct SetupArgs {}

/// Pull encoder and reranker weights into the model cache so the first
/// index or search does not pay the download
pub async fn execute(config: &Config, _args: &SetupArgs) -> Result<()> {
	println!("Fetching model weights into {}...", osgrep::storage::models_dir()?.display());

	let pool = WorkerPool::new(config);

	let encoded = pool.query("setup probe".to_string()).await?;
	println!(
		"Dense encoder ready: {} ({} dimensions)",
		config.embedding.dense_model,
		encoded.dense.len()
	);

	pool.rerank(
		"setup probe".to_string(),
		vec!["probe document".to_string()],
	)
	.await?;
	println!("Reranker ready: {}", config.embedding.reranker_model);

	pool.shutdown().await;
	println!("Setup complete.");
	Ok(())
}
