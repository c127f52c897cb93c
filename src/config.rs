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
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::constants;
use crate::storage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
	/// Maximum lines per fragment before windowing
	pub max_fragment_lines: usize,
	pub overlap_lines: usize,
	pub min_fragment_lines: usize,

	/// Unique texts per embedding batch
	pub embed_batch_size: usize,

	/// In-flight file pipelines during sync. 0 = max(1, cpus / 2)
	pub concurrency: usize,

	/// Extra ignore patterns merged below .gitignore and .osgrepignore
	pub ignore_patterns: Vec<String>,
}

impl Default for IndexConfig {
	fn default() -> Self {
		Self {
			max_fragment_lines: constants::MAX_FRAGMENT_LINES,
			overlap_lines: constants::OVERLAP_LINES,
			min_fragment_lines: constants::MIN_FRAGMENT_LINES,
			embed_batch_size: constants::EMBED_BATCH_SIZE,
			concurrency: 0,
			ignore_patterns: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
	pub top_k: usize,

	/// Matches returned per file path
	pub per_file: usize,

	/// Cross-encoder reranking on by default
	pub rerank: bool,

	/// Weight of the reranker probability in the final blend;
	/// the remainder goes to the min-max normalized RRF score
	pub rerank_blend: f32,
}

impl Default for SearchConfig {
	fn default() -> Self {
		Self {
			top_k: 25,
			per_file: 1,
			rerank: true,
			rerank_blend: 0.7,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
	/// Worker threads, each owning its own model sessions
	pub count: usize,

	/// Deadline per request in milliseconds
	pub timeout_ms: u64,

	/// Recycle a worker when observed RSS exceeds this many megabytes.
	/// 0 = half of system RAM.
	pub memory_limit_mb: u64,
}

impl Default for WorkerConfig {
	fn default() -> Self {
		Self {
			count: 1,
			timeout_ms: constants::WORKER_TIMEOUT_MS,
			memory_limit_mb: 0,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
	/// 0 = pick a free port at startup
	pub port: u16,

	/// Log a warning when server RSS exceeds this many megabytes (0 = off)
	pub memory_warn_mb: u64,

	/// Spawn a replacement process when server RSS exceeds this (0 = off)
	pub memory_restart_mb: u64,

	pub debounce_ms: u64,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			port: 0,
			memory_warn_mb: 0,
			memory_restart_mb: 0,
			debounce_ms: constants::WATCH_DEBOUNCE_MS,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
	/// Dense encoder model name (fastembed registry)
	pub dense_model: String,

	/// Cross-encoder used for reranking
	pub reranker_model: String,
}

impl Default for EmbeddingConfig {
	fn default() -> Self {
		Self {
			dense_model: "jinaai/jina-embeddings-v2-base-code".to_string(),
			reranker_model: "jinaai/jina-reranker-v1-turbo-en".to_string(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	/// Configuration version for future migrations
	#[serde(default = "default_version")]
	pub version: u32,

	#[serde(default)]
	pub index: IndexConfig,

	#[serde(default)]
	pub search: SearchConfig,

	#[serde(default)]
	pub worker: WorkerConfig,

	#[serde(default)]
	pub server: ServerConfig,

	#[serde(default)]
	pub embedding: EmbeddingConfig,
}

fn default_version() -> u32 {
	1
}

impl Default for Config {
	fn default() -> Self {
		Self {
			version: default_version(),
			index: IndexConfig::default(),
			search: SearchConfig::default(),
			worker: WorkerConfig::default(),
			server: ServerConfig::default(),
			embedding: EmbeddingConfig::default(),
		}
	}
}

impl Config {
	pub fn load() -> Result<Self> {
		let config_path = Self::config_path()?;

		let mut config: Config = if config_path.exists() {
			let content = fs::read_to_string(&config_path)?;
			toml::from_str(&content)?
		} else {
			// First run: persist the defaults so users have a file to edit
			let defaults = Config::default();
			defaults.save()?;
			defaults
		};

		// Environment variables take precedence over config file values
		if let Ok(timeout) = std::env::var("OSGREP_WORKER_TIMEOUT_MS") {
			if let Ok(ms) = timeout.parse() {
				config.worker.timeout_ms = ms;
			}
		}
		if let Ok(cap) = std::env::var("OSGREP_WORKER_MEMORY_MB") {
			if let Ok(mb) = cap.parse() {
				config.worker.memory_limit_mb = mb;
			}
		}
		if let Ok(warn) = std::env::var("OSGREP_SERVER_MEMORY_WARN_MB") {
			if let Ok(mb) = warn.parse() {
				config.server.memory_warn_mb = mb;
			}
		}
		if let Ok(restart) = std::env::var("OSGREP_SERVER_MEMORY_RESTART_MB") {
			if let Ok(mb) = restart.parse() {
				config.server.memory_restart_mb = mb;
			}
		}
		if let Ok(threads) = std::env::var("OSGREP_THREADS") {
			if let Ok(n) = threads.parse() {
				config.index.concurrency = n;
			}
		}

		Ok(config)
	}

	pub fn save(&self) -> Result<()> {
		let config_path = Self::config_path()?;

		if let Some(parent) = config_path.parent() {
			if !parent.exists() {
				fs::create_dir_all(parent)?;
			}
		}

		let toml_content = toml::to_string_pretty(self)?;
		fs::write(config_path, toml_content)?;
		Ok(())
	}

	/// Config file lives next to the data directory contents
	pub fn config_path() -> Result<PathBuf> {
		Ok(storage::data_dir()?.join("config.toml"))
	}

	/// Effective sync concurrency: max(1, cpus / 2) unless pinned
	pub fn sync_concurrency(&self) -> usize {
		if self.index.concurrency > 0 {
			self.index.concurrency
		} else {
			(num_cpus::get() / 2).max(1)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_config() {
		let config = Config::default();
		assert_eq!(config.version, 1);
		assert_eq!(config.index.max_fragment_lines, 100);
		assert_eq!(config.index.embed_batch_size, 16);
		assert_eq!(config.search.top_k, 25);
		assert_eq!(config.search.per_file, 1);
		assert!(config.search.rerank);
		assert!((config.search.rerank_blend - 0.7).abs() < f32::EPSILON);
		assert_eq!(config.worker.timeout_ms, 60_000);
		assert_eq!(config.server.debounce_ms, 300);
	}

	#[test]
	fn test_sync_concurrency_floor() {
		let mut config = Config::default();
		config.index.concurrency = 0;
		assert!(config.sync_concurrency() >= 1);

		config.index.concurrency = 3;
		assert_eq!(config.sync_concurrency(), 3);
	}

	#[test]
	fn test_roundtrip_toml() {
		let config = Config::default();
		let text = toml::to_string_pretty(&config).unwrap();
		let parsed: Config = toml::from_str(&text).unwrap();
		assert_eq!(parsed.search.top_k, config.search.top_k);
		assert_eq!(parsed.embedding.dense_model, config.embedding.dense_model);
	}
}
