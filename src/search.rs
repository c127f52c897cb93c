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

//! Hybrid retrieval: vector and keyword candidates fused with reciprocal
//! rank fusion, refined by the cross-encoder reranker, shaped by a
//! kind-dependent structural boost and a per-file cap.

use anyhow::Result;
use std::collections::HashMap;
use tracing::warn;

use crate::chunker::FragmentKind;
use crate::config::Config;
use crate::constants::{CANDIDATE_FACTOR, CANDIDATE_FLOOR, RERANK_WINDOW, RRF_K};
use crate::embedding::WorkerPool;
use crate::store::{FragmentRow, Store};

#[derive(Debug, Clone)]
pub struct SearchOptions {
	pub top_k: usize,
	pub per_file: usize,
	pub rerank: bool,
	/// Only return fragments whose path starts with this prefix
	pub path_prefix: Option<String>,
	/// Reranker weight in the final blend
	pub rerank_blend: f32,
}

impl SearchOptions {
	pub fn from_config(config: &Config) -> Self {
		Self {
			top_k: config.search.top_k,
			per_file: config.search.per_file,
			rerank: config.search.rerank,
			path_prefix: None,
			rerank_blend: config.search.rerank_blend,
		}
	}
}

#[derive(Debug, Clone)]
pub struct SearchResult {
	pub path: String,
	pub start_line: u32,
	pub end_line: u32,
	pub kind: FragmentKind,
	pub text: String,
	pub score: f32,
	pub is_anchor: bool,
}

struct Candidate {
	row: FragmentRow,
	rrf: f32,
	probability: f32,
}

/// Execute a query against the store through the worker pool
pub async fn search(
	store: &Store,
	pool: &WorkerPool,
	query: &str,
	options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
	let encoded = pool.query(query.to_string()).await?;

	let candidate_count = CANDIDATE_FLOOR.max(CANDIDATE_FACTOR * options.top_k);
	let prefix = options.path_prefix.as_deref();

	let vector_hits = store
		.search_vector(&encoded.dense, candidate_count, prefix)
		.await?;
	let fts_hits = store.search_fts(query, candidate_count, prefix).await?;

	let mut candidates = fuse(vector_hits, fts_hits);
	if candidates.is_empty() {
		return Ok(Vec::new());
	}

	// Cross-encoder pass over the fusion window; failure falls back to the
	// fusion score so results degrade instead of erroring
	let window = candidates.len().min(RERANK_WINDOW);
	if options.rerank {
		let texts: Vec<String> = candidates[..window]
			.iter()
			.map(|c| c.row.text.clone())
			.collect();
		match pool.rerank(query.to_string(), texts).await {
			Ok(probabilities) => {
				for (candidate, probability) in
					candidates[..window].iter_mut().zip(probabilities)
				{
					candidate.probability = probability;
				}
			}
			Err(e) => {
				warn!("reranker unavailable, falling back to fusion scores: {}", e);
			}
		}
	}

	let scored = score_candidates(candidates, options.rerank_blend);

	let mut per_path: HashMap<String, usize> = HashMap::new();
	let mut results = Vec::with_capacity(options.top_k);
	for (score, row) in scored {
		let seen = per_path.entry(row.path.clone()).or_insert(0);
		if *seen >= options.per_file.max(1) {
			continue;
		}
		*seen += 1;

		results.push(SearchResult {
			path: row.path,
			start_line: row.start_line,
			end_line: row.end_line,
			kind: row.kind,
			text: row.text,
			score,
			is_anchor: row.is_anchor,
		});
		if results.len() >= options.top_k {
			break;
		}
	}

	Ok(results)
}

// Blend the reranker probability with the min-max normalized fusion score,
// multiply by the structural boost, and sort. The stable sort keeps the
// pre-sort order for equal scores.
fn score_candidates(candidates: Vec<Candidate>, blend: f32) -> Vec<(f32, FragmentRow)> {
	let (min_rrf, max_rrf) = candidates
		.iter()
		.fold((f32::MAX, f32::MIN), |(lo, hi), c| {
			(lo.min(c.rrf), hi.max(c.rrf))
		});
	let rrf_span = (max_rrf - min_rrf).max(f32::EPSILON);

	let mut scored: Vec<(f32, FragmentRow)> = candidates
		.into_iter()
		.map(|candidate| {
			let normalized_rrf = (candidate.rrf - min_rrf) / rrf_span;
			let blended =
				blend * candidate.probability + (1.0 - blend) * normalized_rrf;
			let final_score = blended * candidate.row.kind.score_boost();
			(final_score, candidate.row)
		})
		.collect();

	scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
	scored
}

// Reciprocal rank fusion over the two candidate lists. A row missing from
// one list simply contributes nothing for it. Candidates come back ordered
// by descending fusion score; the reranker probability starts out as the
// raw fusion score so unreranked rows still blend meaningfully.
fn fuse(vector_hits: Vec<FragmentRow>, fts_hits: Vec<FragmentRow>) -> Vec<Candidate> {
	let mut by_id: HashMap<String, Candidate> = HashMap::new();
	let mut order: Vec<String> = Vec::new();

	for (rank, row) in vector_hits.into_iter().enumerate() {
		let contribution = 1.0 / (RRF_K + (rank + 1) as f32);
		order.push(row.id.clone());
		by_id.insert(
			row.id.clone(),
			Candidate {
				row,
				rrf: contribution,
				probability: 0.0,
			},
		);
	}

	for (rank, row) in fts_hits.into_iter().enumerate() {
		let contribution = 1.0 / (RRF_K + (rank + 1) as f32);
		match by_id.get_mut(&row.id) {
			Some(candidate) => candidate.rrf += contribution,
			None => {
				order.push(row.id.clone());
				by_id.insert(
					row.id.clone(),
					Candidate {
						row,
						rrf: contribution,
						probability: 0.0,
					},
				);
			}
		}
	}

	let mut candidates: Vec<Candidate> = order
		.into_iter()
		.filter_map(|id| by_id.remove(&id))
		.collect();

	for candidate in &mut candidates {
		candidate.probability = candidate.rrf;
	}

	// Ties resolve by first-seen order via the stable sort
	candidates.sort_by(|a, b| b.rrf.partial_cmp(&a.rrf).unwrap_or(std::cmp::Ordering::Equal));
	candidates
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chunker::Fragment;
	use crate::constants::QUERY_PREFIX;
	use crate::embedding::worker::test_support::stub_vector;
	use crate::embedding::worker::{ModelSession, SessionFactory};
	use crate::store::FragmentRow;
	use std::sync::Arc;
	use std::time::Duration;

	fn stub_pool(rerank_fails: bool) -> WorkerPool {
		struct Session {
			rerank_fails: bool,
		}
		impl ModelSession for Session {
			fn embed_documents(&mut self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
				Ok(texts.iter().map(|t| stub_vector(t)).collect())
			}
			fn embed_query(&mut self, text: &str) -> anyhow::Result<Vec<f32>> {
				Ok(stub_vector(text))
			}
			fn rerank(&mut self, _: &str, documents: &[String]) -> anyhow::Result<Vec<f32>> {
				if self.rerank_fails {
					return Err(anyhow::anyhow!("reranker weights missing"));
				}
				// Shorter documents score higher, deterministically
				Ok(documents
					.iter()
					.map(|d| 1.0 / (1.0 + d.len() as f32 / 100.0))
					.collect())
			}
			fn dimension(&self) -> usize {
				4
			}
		}

		let factory: SessionFactory = Arc::new(move || {
			Ok(Box::new(Session { rerank_fails }) as Box<dyn ModelSession>)
		});
		WorkerPool::with_factory(factory, 1, Duration::from_secs(5), 0)
	}

	fn row(path: &str, kind: FragmentKind, text: &str, vector: Vec<f32>) -> FragmentRow {
		FragmentRow::new(
			path,
			"hash",
			&Fragment {
				path: path.to_string(),
				start_line: 0,
				end_line: 5,
				kind,
				text: text.to_string(),
				context: Vec::new(),
				is_anchor: kind == FragmentKind::Anchor,
			},
			vector,
			None,
		)
	}

	/// The exact dense vector the stub pool produces for a query
	fn query_vector(query: &str) -> Vec<f32> {
		stub_vector(&format!("{}{}", QUERY_PREFIX, query))
	}

	async fn seeded_store(dir: &tempfile::TempDir, rows: &[FragmentRow]) -> Store {
		let store = Store::open_at(dir.path().join("store"), 4).await.unwrap();
		store.insert_batch(rows).await.unwrap();
		store.create_fts_index().await.unwrap();
		store
	}

	fn options(top_k: usize, per_file: usize, rerank: bool) -> SearchOptions {
		SearchOptions {
			top_k,
			per_file,
			rerank,
			path_prefix: None,
			rerank_blend: 0.7,
		}
	}

	#[tokio::test]
	async fn test_per_file_cap_is_honored() {
		let dir = tempfile::tempdir().unwrap();
		let query = "find parser";
		let near = query_vector(query);

		// Five close fragments in one file, one in another
		let mut rows = Vec::new();
		for i in 0..5 {
			let mut r = row(
				"/repo/parser.py",
				FragmentKind::Function,
				&format!("def parse_{}(): pass", i),
				near.clone(),
			);
			r.start_line = i * 10;
			rows.push(r);
		}
		rows.push(row(
			"/repo/other.py",
			FragmentKind::Function,
			"def other(): pass",
			near.clone(),
		));
		let store = seeded_store(&dir, &rows).await;

		let results = search(&store, &stub_pool(false), query, &options(10, 1, false))
			.await
			.unwrap();

		let mut counts: HashMap<&str, usize> = HashMap::new();
		for result in &results {
			*counts.entry(result.path.as_str()).or_insert(0) += 1;
		}
		assert!(counts.values().all(|&c| c <= 1));
		assert!(counts.len() >= 2);
	}

	#[test]
	fn test_structural_boost_flips_close_scores() {
		// Equal blend inputs: only the kind multiplier separates them
		let make = |path: &str, kind, rrf: f32, probability: f32| Candidate {
			row: row(path, kind, "text", vec![1.0; 4]),
			rrf,
			probability,
		};
		let candidates = vec![
			make("/repo/frag.txt", FragmentKind::Fallback, 0.016, 0.6),
			make("/repo/func.py", FragmentKind::Function, 0.016, 0.6),
			make("/repo/anchor.py", FragmentKind::Anchor, 0.016, 0.6),
			make("/repo/block.py", FragmentKind::Block, 0.015, 0.6),
		];

		let scored = score_candidates(candidates, 0.7);
		let order: Vec<&str> = scored
			.iter()
			.map(|(_, row)| row.path.as_str())
			.collect();

		// function 1.10 > anchor 1.05 > fallback 0.95 among equals
		assert_eq!(order[0], "/repo/func.py");
		assert_eq!(order[1], "/repo/anchor.py");
		assert_eq!(order[2], "/repo/frag.txt");
	}

	#[test]
	fn test_equal_scores_keep_prior_order() {
		let make = |path: &str| Candidate {
			row: row(path, FragmentKind::Block, "text", vec![1.0; 4]),
			rrf: 0.016,
			probability: 0.5,
		};
		let scored = score_candidates(
			vec![make("/repo/first.py"), make("/repo/second.py")],
			0.7,
		);
		assert_eq!(scored[0].1.path, "/repo/first.py");
		assert_eq!(scored[1].1.path, "/repo/second.py");
	}

	#[tokio::test]
	async fn test_reranker_failure_falls_back_to_fusion_order() {
		let dir = tempfile::tempdir().unwrap();
		let query = "ranking";
		let near = query_vector(query);

		let rows = vec![
			row("/repo/a.py", FragmentKind::Function, "short", near.clone()),
			row(
				"/repo/b.py",
				FragmentKind::Function,
				"a considerably longer fragment body",
				near.clone(),
			),
		];
		let store = seeded_store(&dir, &rows).await;

		let disabled = search(&store, &stub_pool(false), query, &options(10, 1, false))
			.await
			.unwrap();
		let failing = search(&store, &stub_pool(true), query, &options(10, 1, true))
			.await
			.unwrap();

		// A dead reranker produces exactly the rerank-disabled ordering
		let disabled_paths: Vec<&str> = disabled.iter().map(|r| r.path.as_str()).collect();
		let failing_paths: Vec<&str> = failing.iter().map(|r| r.path.as_str()).collect();
		assert_eq!(disabled_paths, failing_paths);
	}

	#[tokio::test]
	async fn test_top_k_truncation() {
		let dir = tempfile::tempdir().unwrap();
		let query = "many";
		let near = query_vector(query);

		let rows: Vec<FragmentRow> = (0..20)
			.map(|i| {
				row(
					&format!("/repo/f{}.py", i),
					FragmentKind::Function,
					&format!("def f{}(): pass", i),
					near.clone(),
				)
			})
			.collect();
		let store = seeded_store(&dir, &rows).await;

		let results = search(&store, &stub_pool(false), query, &options(5, 1, false))
			.await
			.unwrap();
		assert_eq!(results.len(), 5);
	}

	#[tokio::test]
	async fn test_empty_store_returns_no_results() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open_at(dir.path().join("store"), 4).await.unwrap();

		let results = search(&store, &stub_pool(false), "query", &options(5, 1, true))
			.await
			.unwrap();
		assert!(results.is_empty());
	}

	#[test]
	fn test_fuse_sums_contributions() {
		let shared = row("/repo/a.py", FragmentKind::Function, "text", vec![1.0; 4]);
		let only_vector = row("/repo/b.py", FragmentKind::Function, "text", vec![1.0; 4]);

		let vector_hits = vec![shared.clone(), only_vector.clone()];
		let fts_hits = vec![shared.clone()];

		let candidates = fuse(vector_hits, fts_hits);
		assert_eq!(candidates.len(), 2);

		// The shared row ranked first in both lists: 1/61 + 1/61
		assert_eq!(candidates[0].row.id, shared.id);
		assert!((candidates[0].rrf - 2.0 / 61.0).abs() < 1e-6);
		assert!((candidates[1].rrf - 1.0 / 62.0).abs() < 1e-6);
	}
}
