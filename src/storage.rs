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

//! Data directory layout.
//!
//! Everything osgrep persists lives under one home-relative directory:
//!
//! - `data/<store_name>/` — LanceDB index files, one store per repository
//! - `meta.json`          — path → content hash cache for incremental sync
//! - `models/`            — downloaded encoder and reranker weights

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Root data directory, `~/.osgrep` unless overridden by `OSGREP_DATA_DIR`
pub fn data_dir() -> Result<PathBuf> {
	let base = if let Ok(dir) = std::env::var("OSGREP_DATA_DIR") {
		PathBuf::from(dir)
	} else {
		dirs::home_dir()
			.ok_or_else(|| anyhow::anyhow!("Unable to determine home directory"))?
			.join(".osgrep")
	};

	if !base.exists() {
		fs::create_dir_all(&base)?;
	}

	Ok(base)
}

/// Directory holding persistent index stores
pub fn stores_dir() -> Result<PathBuf> {
	let dir = data_dir()?.join("data");
	if !dir.exists() {
		fs::create_dir_all(&dir)?;
	}
	Ok(dir)
}

/// Cache directory for encoder and reranker weights
pub fn models_dir() -> Result<PathBuf> {
	let dir = data_dir()?.join("models");
	if !dir.exists() {
		fs::create_dir_all(&dir)?;
	}
	Ok(dir)
}

/// Location of the meta store JSON
pub fn meta_store_path() -> Result<PathBuf> {
	Ok(data_dir()?.join("meta.json"))
}

/// Stable store name for a repository root.
/// `OSGREP_STORE_NAME` overrides; otherwise the first 16 hex chars of the
/// SHA-256 of the canonical root path.
pub fn store_name(root: &Path) -> Result<String> {
	if let Ok(name) = std::env::var("OSGREP_STORE_NAME") {
		if !name.is_empty() {
			return Ok(name);
		}
	}

	let absolute = root.canonicalize().or_else(|_| {
		if root.is_absolute() {
			Ok(root.to_path_buf())
		} else {
			std::env::current_dir().map(|cwd| cwd.join(root))
		}
	})?;

	let mut hasher = Sha256::new();
	hasher.update(absolute.to_string_lossy().as_bytes());
	let digest = hasher.finalize();
	Ok(format!("{:x}", digest)[..16].to_string())
}

/// Repository-local directory for server runtime files (`.osgrep/`)
pub fn repo_local_dir(root: &Path) -> PathBuf {
	root.join(".osgrep")
}

/// Path of the server lock file inside a repository
pub fn server_lock_path(root: &Path) -> PathBuf {
	repo_local_dir(root).join("server.lock")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_store_name_is_stable() {
		let dir = tempfile::tempdir().unwrap();

		let a = store_name(dir.path()).unwrap();
		let b = store_name(dir.path()).unwrap();

		assert_eq!(a, b);
		assert_eq!(a.len(), 16);
		assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
	}

	#[test]
	fn test_store_name_differs_per_root() {
		let a = tempfile::tempdir().unwrap();
		let b = tempfile::tempdir().unwrap();

		assert_ne!(
			store_name(a.path()).unwrap(),
			store_name(b.path()).unwrap()
		);
	}

	#[test]
	fn test_server_lock_path_is_repo_local() {
		let lock = server_lock_path(Path::new("/tmp/repo"));
		assert_eq!(lock, PathBuf::from("/tmp/repo/.osgrep/server.lock"));
	}
}
