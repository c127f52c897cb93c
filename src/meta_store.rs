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

//! Persistent `path → content hash` cache.
//!
//! Lets incremental sync skip unchanged files without consulting the index.
//! The store is advisory: when the file is missing or corrupt we start empty
//! and the sync falls back to hashes read from the index itself.

use anyhow::Result;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// SHA-256 over raw file bytes, lowercase hex
pub fn hash_bytes(bytes: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	format!("{:x}", hasher.finalize())
}

pub struct MetaStore {
	path: PathBuf,
	map: Mutex<HashMap<String, String>>,
}

impl MetaStore {
	/// Load from disk; corruption or absence yields an empty map
	pub fn load(path: PathBuf) -> Self {
		let map = match fs::read_to_string(&path) {
			Ok(content) => match serde_json::from_str::<HashMap<String, String>>(&content) {
				Ok(map) => map,
				Err(e) => {
					warn!("meta store corrupt, starting empty: {}", e);
					HashMap::new()
				}
			},
			Err(_) => HashMap::new(),
		};

		Self {
			path,
			map: Mutex::new(map),
		}
	}

	/// Open the default meta store under the data directory
	pub fn open_default() -> Result<Self> {
		Ok(Self::load(crate::storage::meta_store_path()?))
	}

	pub fn get(&self, path: &Path) -> Option<String> {
		self.map.lock().get(&path.to_string_lossy().to_string()).cloned()
	}

	pub fn set(&self, path: &Path, hash: &str) {
		self.map
			.lock()
			.insert(path.to_string_lossy().to_string(), hash.to_string());
	}

	pub fn remove(&self, path: &Path) {
		self.map.lock().remove(&path.to_string_lossy().to_string());
	}

	pub fn len(&self) -> usize {
		self.map.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.map.lock().is_empty()
	}

	/// Write the map to disk. Writes to a sibling temp file first so a crash
	/// mid-write never leaves a truncated JSON behind.
	pub fn persist(&self) -> Result<()> {
		let snapshot = self.map.lock().clone();
		let json = serde_json::to_string(&snapshot)?;

		if let Some(parent) = self.path.parent() {
			if !parent.exists() {
				fs::create_dir_all(parent)?;
			}
		}

		let tmp = self.path.with_extension("json.tmp");
		fs::write(&tmp, json)?;
		fs::rename(&tmp, &self.path)?;
		Ok(())
	}

	/// Best-effort periodic save; disabled by `OSGREP_SKIP_META_SAVE`
	pub fn persist_periodic(&self) {
		if std::env::var("OSGREP_SKIP_META_SAVE").is_ok() {
			return;
		}
		if let Err(e) = self.persist() {
			warn!("periodic meta store save failed: {}", e);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_hash_bytes_hex() {
		let hash = hash_bytes(b"hello");
		assert_eq!(hash.len(), 64);
		assert_eq!(
			hash,
			"2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
		);
	}

	#[test]
	fn test_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("meta.json");

		let store = MetaStore::load(path.clone());
		store.set(Path::new("/repo/a.py"), "deadbeef");
		store.set(Path::new("/repo/b.py"), "cafebabe");
		store.persist().unwrap();

		let reloaded = MetaStore::load(path);
		assert_eq!(reloaded.len(), 2);
		assert_eq!(
			reloaded.get(Path::new("/repo/a.py")).as_deref(),
			Some("deadbeef")
		);
	}

	#[test]
	fn test_corrupt_file_starts_empty() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("meta.json");
		fs::write(&path, "{not json").unwrap();

		let store = MetaStore::load(path);
		assert!(store.is_empty());
	}

	#[test]
	fn test_remove() {
		let dir = tempfile::tempdir().unwrap();
		let store = MetaStore::load(dir.path().join("meta.json"));

		store.set(Path::new("/repo/gone.rs"), "aa");
		store.remove(Path::new("/repo/gone.rs"));
		assert!(store.get(Path::new("/repo/gone.rs")).is_none());
	}
}
