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

use osgrep::chunker::languages;
use osgrep::meta_store::MetaStore;
use osgrep::store::Store;
use osgrep::Config;

#[derive(Args, Debug)]
pub struct DoctorArgs {}

pub async fn execute(config: &Config, _args: &DoctorArgs) -> Result<()> {
	let data_dir = osgrep::storage::data_dir()?;
	let models_dir = osgrep::storage::models_dir()?;

	println!("osgrep doctor");
	println!("  data directory:  {}", data_dir.display());
	println!("  config file:     {}", Config::config_path()?.display());
	println!("  model cache:     {}", models_dir.display());
	println!(
		"  models present:  {}",
		if dir_has_entries(&models_dir) { "yes" } else { "no (run `osgrep setup`)" }
	);
	println!("  dense model:     {}", config.embedding.dense_model);
	println!("  reranker model:  {}", config.embedding.reranker_model);

	let meta = MetaStore::open_default()?;
	println!("  meta store:      {} tracked files", meta.len());

	// Per-language grammar availability; grammars are compiled in, so this
	// doubles as the supported-language list
	let mut names: Vec<&str> = vec![
		"rust",
		"python",
		"javascript",
		"typescript",
		"go",
		"cpp",
		"php",
		"bash",
		"ruby",
		"json",
	];
	names.retain(|name| languages::get_language(name).is_some());
	println!("  grammars:        {}", names.join(", "));

	let root = std::env::current_dir()?;
	let store_name = osgrep::storage::store_name(&root)?;
	let store_dir = osgrep::storage::stores_dir()?.join(&store_name);
	println!("  store for {}:", root.display());
	println!("    name:  {}", store_name);
	if store_dir.exists() {
		let rows = Store::peek_row_count(&store_dir).await.unwrap_or(0);
		println!("    rows:  {}", rows);
	} else {
		println!("    rows:  not indexed yet");
	}

	Ok(())
}

fn dir_has_entries(dir: &std::path::Path) -> bool {
	std::fs::read_dir(dir)
		.map(|mut entries| entries.next().is_some())
		.unwrap_or(false)
}
