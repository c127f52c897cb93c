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

//! Repository scanning: the ignore filter and the file walker.
//!
//! The filter merges three sources, lowest to highest precedence: built-in
//! defaults (lockfiles, binary blobs, notebooks, build artifacts, VCS
//! metadata), the repository's `.gitignore` hierarchy, and a top-level
//! `.osgrepignore`. Hidden path components are always ignored.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::Gitignore;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::warn;

/// File name of the user-level ignore file, gitignore syntax
pub const USER_IGNORE_FILE: &str = ".osgrepignore";

const DEFAULT_IGNORE_GLOBS: &[&str] = &[
	// Lockfiles
	"*.lock",
	"package-lock.json",
	"pnpm-lock.yaml",
	"yarn.lock",
	"go.sum",
	// Generated / minified
	"*.min.js",
	"*.min.css",
	"*.map",
	"*.ipynb",
	// Compiled artifacts
	"*.o",
	"*.a",
	"*.so",
	"*.dylib",
	"*.dll",
	"*.exe",
	"*.class",
	"*.jar",
	"*.pyc",
	"*.wasm",
	// Binary blobs
	"*.png",
	"*.jpg",
	"*.jpeg",
	"*.gif",
	"*.ico",
	"*.pdf",
	"*.zip",
	"*.tar",
	"*.gz",
	"*.bz2",
	"*.xz",
	"*.7z",
	"*.woff",
	"*.woff2",
	"*.ttf",
	"*.eot",
	"*.mp3",
	"*.mp4",
	"*.sqlite",
	"*.db",
	"*.bin",
	// VCS and dependency directories
	"**/.git/**",
	"**/node_modules/**",
	"**/target/**",
	"**/dist/**",
	"**/build/**",
	"**/__pycache__/**",
	"**/venv/**",
	"**/.venv/**",
];

lazy_static! {
	static ref DEFAULT_IGNORE: GlobSet = {
		let mut builder = GlobSetBuilder::new();
		for pattern in DEFAULT_IGNORE_GLOBS {
			builder.add(Glob::new(pattern).expect("builtin ignore glob"));
		}
		builder.build().expect("builtin ignore globset")
	};

	// One filter per root; evaluations are pure with respect to their inputs
	static ref FILTER_CACHE: Mutex<HashMap<PathBuf, Arc<IgnoreFilter>>> =
		Mutex::new(HashMap::new());
}

/// Merged ignore decision for a single repository root
pub struct IgnoreFilter {
	root: PathBuf,
	matcher: Gitignore,
	extra: Option<GlobSet>,
}

impl IgnoreFilter {
	fn build(root: &Path, extra_patterns: &[String]) -> Result<Self> {
		let mut builder = ignore::gitignore::GitignoreBuilder::new(root);

		let gitignore = root.join(".gitignore");
		if gitignore.exists() {
			if let Some(e) = builder.add(&gitignore) {
				warn!("failed to load .gitignore: {}", e);
			}
		}

		// User ignore wins over repository rules, so it is added last
		let user_ignore = root.join(USER_IGNORE_FILE);
		if user_ignore.exists() {
			if let Some(e) = builder.add(&user_ignore) {
				warn!("failed to load {}: {}", USER_IGNORE_FILE, e);
			}
		}

		let extra = if extra_patterns.is_empty() {
			None
		} else {
			let mut set = GlobSetBuilder::new();
			for pattern in extra_patterns {
				match Glob::new(pattern) {
					Ok(glob) => {
						set.add(glob);
					}
					Err(e) => warn!("skipping ignore pattern {}: {}", pattern, e),
				}
			}
			Some(set.build()?)
		};

		Ok(Self {
			root: root.to_path_buf(),
			matcher: builder.build()?,
			extra,
		})
	}

	/// Cached filter for a root. Configured extra patterns only apply on
	/// first construction for that root.
	pub fn for_root(root: &Path, extra_patterns: &[String]) -> Result<Arc<Self>> {
		let mut cache = FILTER_CACHE.lock();
		if let Some(filter) = cache.get(root) {
			return Ok(filter.clone());
		}
		let filter = Arc::new(Self::build(root, extra_patterns)?);
		cache.insert(root.to_path_buf(), filter.clone());
		Ok(filter)
	}

	/// Drop the cached filter for a root so edits to ignore files are seen
	pub fn invalidate(root: &Path) {
		FILTER_CACHE.lock().remove(root);
	}

	pub fn is_ignored(&self, path: &Path) -> bool {
		let relative = match path.strip_prefix(&self.root) {
			Ok(rel) => rel,
			Err(_) => path,
		};

		// Hidden entries are always ignored
		if relative
			.components()
			.filter_map(|c| c.as_os_str().to_str())
			.any(|c| c.starts_with('.') && c != "." && c != "..")
		{
			return true;
		}

		if DEFAULT_IGNORE.is_match(relative) {
			return true;
		}

		if let Some(extra) = &self.extra {
			if extra.is_match(relative) {
				return true;
			}
		}

		self.matcher.matched(path, path.is_dir()).is_ignore()
	}
}

/// Enumerate candidate files under a root as absolute paths.
///
/// A git work tree is listed through `git ls-files` so the repository's own
/// ignore semantics apply for free; anything else falls back to a recursive
/// walk. Both sources are still filtered through [`IgnoreFilter`].
pub fn list_files(root: &Path, filter: &IgnoreFilter) -> Vec<PathBuf> {
	let candidates = if root.join(".git").exists() {
		match git_tracked_files(root) {
			Ok(files) => files,
			Err(e) => {
				warn!("git listing failed, falling back to walk: {}", e);
				walk_files(root)
			}
		}
	} else {
		walk_files(root)
	};

	candidates
		.into_iter()
		.filter(|p| !filter.is_ignored(p))
		.collect()
}

/// Tracked plus unignored untracked files, NUL separated
fn git_tracked_files(root: &Path) -> Result<Vec<PathBuf>> {
	let output = Command::new("git")
		.arg("-C")
		.arg(root)
		.args(["ls-files", "--cached", "--others", "--exclude-standard", "-z"])
		.output()?;

	if !output.status.success() {
		return Err(anyhow::anyhow!(
			"git ls-files exited with {}",
			output.status
		));
	}

	let stdout = String::from_utf8(output.stdout)?;
	Ok(stdout
		.split('\0')
		.filter(|s| !s.is_empty())
		.map(|s| root.join(s))
		.filter(|p| p.is_file())
		.collect())
}

fn walk_files(root: &Path) -> Vec<PathBuf> {
	let mut builder = ignore::WalkBuilder::new(root);
	builder
		.hidden(true) // Prune hidden files and directories
		.git_ignore(true)
		.git_global(true)
		.git_exclude(true);
	builder.add_custom_ignore_filename(USER_IGNORE_FILE);

	let mut files = Vec::new();
	for result in builder.build() {
		let entry = match result {
			Ok(entry) => entry,
			Err(e) => {
				// Per-subdirectory errors are not fatal to the walk
				warn!("walk error: {}", e);
				continue;
			}
		};
		if entry.file_type().is_some_and(|ft| ft.is_file()) {
			files.push(entry.into_path());
		}
	}
	files
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;

	fn filter_for(dir: &Path) -> Arc<IgnoreFilter> {
		// Bypass the cache so each test sees its own ignore files
		IgnoreFilter::invalidate(dir);
		IgnoreFilter::for_root(dir, &[]).unwrap()
	}

	#[test]
	fn test_hidden_paths_always_ignored() {
		let dir = tempfile::tempdir().unwrap();
		let filter = filter_for(dir.path());

		assert!(filter.is_ignored(&dir.path().join(".env")));
		assert!(filter.is_ignored(&dir.path().join(".github/workflows/ci.yml")));
		assert!(!filter.is_ignored(&dir.path().join("src/main.rs")));
	}

	#[test]
	fn test_default_patterns() {
		let dir = tempfile::tempdir().unwrap();
		let filter = filter_for(dir.path());

		assert!(filter.is_ignored(&dir.path().join("Cargo.lock")));
		assert!(filter.is_ignored(&dir.path().join("assets/logo.png")));
		assert!(filter.is_ignored(&dir.path().join("node_modules/left-pad/index.js")));
		assert!(filter.is_ignored(&dir.path().join("notebook.ipynb")));
	}

	#[test]
	fn test_user_ignore_file_respected() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join(USER_IGNORE_FILE), "generated/\n*.gen.ts\n").unwrap();
		let filter = filter_for(dir.path());

		assert!(filter.is_ignored(&dir.path().join("api.gen.ts")));
		assert!(!filter.is_ignored(&dir.path().join("api.ts")));
	}

	#[test]
	fn test_gitignore_respected() {
		let dir = tempfile::tempdir().unwrap();
		fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
		let filter = filter_for(dir.path());

		assert!(filter.is_ignored(&dir.path().join("debug.log")));
		assert!(!filter.is_ignored(&dir.path().join("debug.rs")));
	}

	#[test]
	fn test_walk_lists_regular_files() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir_all(dir.path().join("src")).unwrap();
		fs::write(dir.path().join("src/lib.rs"), "pub fn f() {}\n").unwrap();
		fs::write(dir.path().join("readme.md"), "# hi\n").unwrap();
		fs::write(dir.path().join("Cargo.lock"), "").unwrap();

		let filter = filter_for(dir.path());
		let mut files = list_files(dir.path(), &filter);
		files.sort();

		assert_eq!(files.len(), 2);
		assert!(files[1].ends_with("src/lib.rs") || files[0].ends_with("src/lib.rs"));
		assert!(files.iter().all(|f| !f.ends_with("Cargo.lock")));
	}
}
