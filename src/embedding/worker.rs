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

//! Embedding worker: a dedicated thread owning its model sessions.
//!
//! Model sessions are not reentrant, so each worker processes exactly one
//! request at a time off its channel. Sessions load lazily on the first
//! request; dropping the worker's sender shuts the thread down and releases
//! the session memory, which is how the pool implements recycling.

use anyhow::{Context, Result};
use fastembed::{
	EmbeddingModel, InitOptions, RerankInitOptions, RerankerModel, TextEmbedding, TextRerank,
};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, warn};

use super::{l2_normalize, quantize_matrix, HybridEmbedding, QueryEmbedding};
use crate::config::Config;
use crate::constants::QUERY_PREFIX;

/// Requests a worker understands; anything else is a protocol error
#[derive(Debug, Clone, Hash)]
pub enum WorkerRequest {
	/// Document-side encoding for a batch of fragment texts
	Hybrid { texts: Vec<String> },
	/// Query-side encoding; the recognized query prefix is prepended
	Query { text: String },
	/// Cross-encoder relevance probabilities for (query, documents)
	Rerank {
		query: String,
		documents: Vec<String>,
	},
}

#[derive(Debug, Clone)]
pub enum WorkerReply {
	Hybrid(Vec<HybridEmbedding>),
	Query(QueryEmbedding),
	Rerank(Vec<f32>),
}

/// Every reply carries the observed resident size so the pool can apply
/// its memory policy
pub struct WorkerResponse {
	pub reply: Result<WorkerReply>,
	pub rss_bytes: u64,
}

/// Loaded model state owned by a single worker. The default implementation
/// wraps fastembed; tests substitute stubs through the factory.
pub trait ModelSession: Send {
	fn embed_documents(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
	fn embed_query(&mut self, text: &str) -> Result<Vec<f32>>;
	fn rerank(&mut self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
	fn dimension(&self) -> usize;

	/// Per-token vectors for late-interaction scoring. The default encoder
	/// emits pooled vectors only, so this returns None unless a
	/// token-level model backs the session.
	fn token_matrix(&mut self, _text: &str) -> Result<Option<Vec<Vec<f32>>>> {
		Ok(None)
	}
}

pub type SessionFactory =
	std::sync::Arc<dyn Fn() -> Result<Box<dyn ModelSession>> + Send + Sync>;

/// Factory for the configured fastembed sessions
pub fn fastembed_factory(config: &Config) -> SessionFactory {
	let dense_model = config.embedding.dense_model.clone();
	let reranker_model = config.embedding.reranker_model.clone();
	std::sync::Arc::new(move || {
		Ok(Box::new(FastembedSession::new(&dense_model, &reranker_model)?)
			as Box<dyn ModelSession>)
	})
}

struct FastembedSession {
	encoder: TextEmbedding,
	reranker: Option<TextRerank>,
	reranker_model: String,
	dimension: usize,
}

impl FastembedSession {
	fn new(dense_model: &str, reranker_model: &str) -> Result<Self> {
		let cache_dir = crate::storage::models_dir()?;

		let encoder = TextEmbedding::try_new(
			InitOptions::new(map_embedding_model(dense_model)?)
				.with_show_download_progress(false)
				.with_cache_dir(cache_dir),
		)
		.context("Failed to initialize embedding model")?;

		// Probe once for the dimension; fastembed caches model state
		let dimension = encoder
			.embed(vec!["dimension probe"], None)?
			.first()
			.map(|v| v.len())
			.ok_or_else(|| anyhow::anyhow!("encoder produced no probe vector"))?;

		Ok(Self {
			encoder,
			reranker: None,
			reranker_model: reranker_model.to_string(),
			dimension,
		})
	}

	// The reranker loads on first use; most ingest-only workers never need it
	fn reranker(&mut self) -> Result<&TextRerank> {
		if self.reranker.is_none() {
			let cache_dir = crate::storage::models_dir()?;
			let reranker = TextRerank::try_new(
				RerankInitOptions::new(map_reranker_model(&self.reranker_model)?)
					.with_show_download_progress(false)
					.with_cache_dir(cache_dir),
			)
			.context("Failed to initialize reranker model")?;
			self.reranker = Some(reranker);
		}
		Ok(self.reranker.as_ref().unwrap())
	}
}

impl ModelSession for FastembedSession {
	fn embed_documents(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
		let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
		Ok(self.encoder.embed(refs, None)?)
	}

	fn embed_query(&mut self, text: &str) -> Result<Vec<f32>> {
		let embeddings = self.encoder.embed(vec![text], None)?;
		embeddings
			.into_iter()
			.next()
			.ok_or_else(|| anyhow::anyhow!("encoder produced no query vector"))
	}

	fn rerank(&mut self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
		let docs: Vec<&str> = documents.iter().map(|s| s.as_str()).collect();
		let results = self.reranker()?.rerank(query, docs, false, None)?;

		// Results come back sorted by score; restore input order and squash
		// raw cross-encoder scores into probabilities
		let mut scores = vec![0.0f32; documents.len()];
		for result in results {
			if let Some(slot) = scores.get_mut(result.index) {
				*slot = 1.0 / (1.0 + (-result.score).exp());
			}
		}
		Ok(scores)
	}

	fn dimension(&self) -> usize {
		self.dimension
	}
}

fn map_embedding_model(model: &str) -> Result<EmbeddingModel> {
	let mapped = match model {
		"jinaai/jina-embeddings-v2-base-code" => EmbeddingModel::JinaEmbeddingsV2BaseCode,
		"sentence-transformers/all-MiniLM-L6-v2" => EmbeddingModel::AllMiniLML6V2,
		"sentence-transformers/all-MiniLM-L6-v2-quantized" => EmbeddingModel::AllMiniLML6V2Q,
		"BAAI/bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
		"BAAI/bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
		"nomic-ai/nomic-embed-text-v1.5" => EmbeddingModel::NomicEmbedTextV15,
		other => return Err(anyhow::anyhow!("Unsupported embedding model: {}", other)),
	};
	Ok(mapped)
}

fn map_reranker_model(model: &str) -> Result<RerankerModel> {
	let mapped = match model {
		"jinaai/jina-reranker-v1-turbo-en" => RerankerModel::JINARerankerV1TurboEn,
		"BAAI/bge-reranker-base" => RerankerModel::BGERerankerBase,
		other => return Err(anyhow::anyhow!("Unsupported reranker model: {}", other)),
	};
	Ok(mapped)
}

struct Job {
	request: WorkerRequest,
	reply: tokio::sync::oneshot::Sender<WorkerResponse>,
}

/// Handle to one worker thread. Dropping it closes the channel; the thread
/// drains and exits, releasing its model sessions.
pub struct Worker {
	sender: mpsc::Sender<Job>,
}

impl Worker {
	pub fn spawn(factory: SessionFactory) -> Self {
		let (sender, receiver) = mpsc::channel::<Job>();

		thread::spawn(move || {
			let mut session: Option<Box<dyn ModelSession>> = None;

			while let Ok(job) = receiver.recv() {
				if session.is_none() {
					match factory() {
						Ok(loaded) => session = Some(loaded),
						Err(e) => {
							let _ = job.reply.send(WorkerResponse {
								reply: Err(e),
								rss_bytes: crate::memory::current_rss_bytes(),
							});
							continue;
						}
					}
				}

				let reply = process(session.as_mut().unwrap().as_mut(), job.request);
				let _ = job.reply.send(WorkerResponse {
					reply,
					rss_bytes: crate::memory::current_rss_bytes(),
				});
			}

			debug!("worker thread shutting down");
		});

		Self { sender }
	}

	/// Queue a request. The returned receiver resolves when the worker gets
	/// to it; a closed receiver means the worker died.
	pub fn submit(&self, request: WorkerRequest) -> tokio::sync::oneshot::Receiver<WorkerResponse> {
		let (tx, rx) = tokio::sync::oneshot::channel();
		if self.sender.send(Job { request, reply: tx }).is_err() {
			warn!("submit to a dead worker");
		}
		rx
	}
}

fn process(session: &mut dyn ModelSession, request: WorkerRequest) -> Result<WorkerReply> {
	match request {
		WorkerRequest::Hybrid { texts } => {
			let mut dense = session.embed_documents(&texts)?;
			if dense.len() != texts.len() {
				return Err(anyhow::anyhow!(
					"encoder returned {} vectors for {} texts",
					dense.len(),
					texts.len()
				));
			}

			let mut results = Vec::with_capacity(texts.len());
			for (vector, text) in dense.iter_mut().zip(texts.iter()) {
				l2_normalize(vector);
				let late_interaction = session
					.token_matrix(text)?
					.and_then(|matrix| quantize_matrix(&matrix));
				results.push(HybridEmbedding {
					dense: vector.clone(),
					late_interaction,
				});
			}
			Ok(WorkerReply::Hybrid(results))
		}
		WorkerRequest::Query { text } => {
			let prefixed = format!("{}{}", QUERY_PREFIX, text);
			let mut dense = session.embed_query(&prefixed)?;
			l2_normalize(&mut dense);
			let late_interaction = session.token_matrix(&prefixed)?;
			Ok(WorkerReply::Query(QueryEmbedding {
				dense,
				late_interaction,
			}))
		}
		WorkerRequest::Rerank { query, documents } => {
			let scores = session.rerank(&query, &documents)?;
			if scores.len() != documents.len() {
				return Err(anyhow::anyhow!(
					"reranker returned {} scores for {} documents",
					scores.len(),
					documents.len()
				));
			}
			Ok(WorkerReply::Rerank(scores))
		}
	}
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;
	use std::time::Duration;

	/// Deterministic stub: embeds by hashing characters, reranks by length
	pub struct StubSession {
		pub delay: Duration,
		pub in_flight: Arc<AtomicUsize>,
		pub max_observed: Arc<AtomicUsize>,
	}

	impl ModelSession for StubSession {
		fn embed_documents(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
			let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.max_observed.fetch_max(current, Ordering::SeqCst);
			std::thread::sleep(self.delay);
			self.in_flight.fetch_sub(1, Ordering::SeqCst);

			Ok(texts.iter().map(|t| stub_vector(t)).collect())
		}

		fn embed_query(&mut self, text: &str) -> Result<Vec<f32>> {
			Ok(stub_vector(text))
		}

		fn rerank(&mut self, _query: &str, documents: &[String]) -> Result<Vec<f32>> {
			Ok(documents
				.iter()
				.map(|d| 1.0 / (1.0 + d.len() as f32))
				.collect())
		}

		fn dimension(&self) -> usize {
			4
		}
	}

	pub fn stub_vector(text: &str) -> Vec<f32> {
		let mut v = vec![
			text.len() as f32,
			text.chars().filter(|c| c.is_alphabetic()).count() as f32,
			text.chars().filter(|c| c.is_numeric()).count() as f32,
			1.0,
		];
		super::l2_normalize(&mut v);
		v
	}

	pub fn stub_factory(delay: Duration, max_observed: Arc<AtomicUsize>) -> SessionFactory {
		let in_flight = Arc::new(AtomicUsize::new(0));
		Arc::new(move || {
			Ok(Box::new(StubSession {
				delay,
				in_flight: in_flight.clone(),
				max_observed: max_observed.clone(),
			}) as Box<dyn ModelSession>)
		})
	}
}
