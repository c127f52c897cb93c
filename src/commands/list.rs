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

use osgrep::store::Store;

#[derive(Args, Debug)]
pub struct ListArgs {}

pub async fn execute(_args: &ListArgs) -> Result<()> {
	let stores_dir = osgrep::storage::stores_dir()?;
	let mut entries: Vec<_> = std::fs::read_dir(&stores_dir)?
		.filter_map(|entry| entry.ok())
		.filter(|entry| entry.path().is_dir())
		.collect();
	entries.sort_by_key(|entry| entry.file_name());

	if entries.is_empty() {
		println!("No index stores under {}", stores_dir.display());
		return Ok(());
	}

	println!("Index stores in {}:", stores_dir.display());
	for entry in entries {
		let path = entry.path();
		let rows = Store::peek_row_count(&path).await.unwrap_or(0);
		println!(
			"  {}  {} rows  ({})",
			entry.file_name().to_string_lossy(),
			rows,
			path.display()
		);
	}
	Ok(())
}
