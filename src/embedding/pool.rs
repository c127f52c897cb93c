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

//! Worker pool manager.
//!
//! Model sessions are not reentrant, so each worker slot is guarded by an
//! async mutex: at most one request is in flight per worker. Requests carry
//! a deadline; an expired or failed request recycles the worker (the slot is
//! emptied and the next request lazily spawns a fresh one) and is retried
//! once. Request identity is derived from the request content, so a
//! runaway input keeps its strike record across submissions: the third
//! consecutive recycle for the same identity rejects it permanently. After
//! every reply the observed RSS is compared against the memory threshold
//! and the worker recycled when it grew too large.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::worker::{SessionFactory, Worker, WorkerReply, WorkerRequest};
use super::{HybridEmbedding, QueryEmbedding};
use crate::config::Config;
use crate::constants::WORKER_MAX_STRIKES;

// Upper bound on tracked strike records; distinct failing inputs beyond
// this forgive older strikes instead of growing the table
const STRIKE_TABLE_CAP: usize = 1024;

pub struct WorkerPool {
	inner: Arc<PoolInner>,
}

struct PoolInner {
	factory: SessionFactory,
	slots: Vec<Mutex<Option<Worker>>>,
	next_slot: AtomicUsize,
	timeout: Duration,
	memory_limit_bytes: u64,
	strikes: parking_lot::Mutex<HashMap<u64, u32>>,
}

impl WorkerPool {
	/// Pool backed by the configured fastembed models
	pub fn new(config: &Config) -> Self {
		Self::with_factory(
			super::worker::fastembed_factory(config),
			config.worker.count.max(1),
			Duration::from_millis(config.worker.timeout_ms),
			memory_limit_bytes(config),
		)
	}

	pub fn with_factory(
		factory: SessionFactory,
		count: usize,
		timeout: Duration,
		memory_limit_bytes: u64,
	) -> Self {
		let slots = (0..count.max(1)).map(|_| Mutex::new(None)).collect();
		Self {
			inner: Arc::new(PoolInner {
				factory,
				slots,
				next_slot: AtomicUsize::new(0),
				timeout,
				memory_limit_bytes,
				strikes: parking_lot::Mutex::new(HashMap::new()),
			}),
		}
	}

	pub async fn hybrid(&self, texts: Vec<String>) -> Result<Vec<HybridEmbedding>> {
		match self.request(WorkerRequest::Hybrid { texts }).await? {
			WorkerReply::Hybrid(embeddings) => Ok(embeddings),
			_ => Err(anyhow::anyhow!("worker returned a mismatched reply")),
		}
	}

	pub async fn query(&self, text: String) -> Result<QueryEmbedding> {
		match self.request(WorkerRequest::Query { text }).await? {
			WorkerReply::Query(embedding) => Ok(embedding),
			_ => Err(anyhow::anyhow!("worker returned a mismatched reply")),
		}
	}

	pub async fn rerank(&self, query: String, documents: Vec<String>) -> Result<Vec<f32>> {
		match self.request(WorkerRequest::Rerank { query, documents }).await? {
			WorkerReply::Rerank(scores) => Ok(scores),
			_ => Err(anyhow::anyhow!("worker returned a mismatched reply")),
		}
	}

	/// Dimension of the configured dense encoder, discovered with a probe
	/// query
	pub async fn dense_dimension(&self) -> Result<usize> {
		let encoded = self.query("dimension probe".to_string()).await?;
		Ok(encoded.dense.len())
	}

	/// Drain every slot and drop its worker; threads exit once their
	/// channels close
	pub async fn shutdown(&self) {
		for slot in &self.inner.slots {
			let mut guard = slot.lock().await;
			*guard = None;
		}
	}

	async fn request(&self, request: WorkerRequest) -> Result<WorkerReply> {
		let pool = &self.inner;
		// Identity is content-derived: resubmitting the same runaway input
		// lands on the same strike record
		let request_id = request_fingerprint(&request);
		let slot_index =
			pool.next_slot.fetch_add(1, Ordering::Relaxed) % pool.slots.len();

		// One retry after a worker restart; strike_or_reject cuts the loop
		// short once the identity hits its third consecutive recycle
		for attempt in 0..2u32 {
			let mut slot = pool.slots[slot_index].lock().await;
			if slot.is_none() {
				*slot = Some(Worker::spawn(pool.factory.clone()));
			}
			let receiver = slot.as_ref().unwrap().submit(request.clone());

			match tokio::time::timeout(pool.timeout, receiver).await {
				Ok(Ok(response)) => {
					if response.reply.is_ok() {
						// A success breaks the recycle streak
						pool.strikes.lock().remove(&request_id);
						// Memory policy applies after the reply is taken
						if pool.memory_limit_bytes > 0
							&& response.rss_bytes > pool.memory_limit_bytes
						{
							info!(
								"worker rss {} MB over limit, recycling",
								response.rss_bytes / (1024 * 1024)
							);
							*slot = None;
						}
						return response.reply;
					}

					// Session-level failure: recycle and maybe retry
					*slot = None;
					drop(slot);
					self.strike_or_reject(request_id)?;
					if attempt == 1 {
						return response.reply;
					}
					warn!("worker request failed, retrying once");
				}
				Ok(Err(_)) => {
					// Worker thread died without replying
					*slot = None;
					drop(slot);
					self.strike_or_reject(request_id)?;
					if attempt == 1 {
						return Err(anyhow::anyhow!("worker died while processing request"));
					}
				}
				Err(_) => {
					// Deadline expired: the worker may be stuck in the model
					// runtime; abandon it entirely
					*slot = None;
					drop(slot);
					self.strike_or_reject(request_id)?;
					if attempt == 1 {
						return Err(anyhow::anyhow!(
							"worker request timed out after {:?}",
							pool.timeout
						));
					}
					warn!("worker request timed out, recycling and retrying");
				}
			}
		}

		Err(anyhow::anyhow!("request retries exhausted"))
	}

	// Record one recycle against this identity. The record below the
	// threshold stays in the table on purpose: it is what lets a later
	// submission of the same input reach the permanent rejection. The
	// third consecutive recycle rejects and clears the record.
	fn strike_or_reject(&self, request_id: u64) -> Result<()> {
		let mut strikes = self.inner.strikes.lock();

		if strikes.len() >= STRIKE_TABLE_CAP && !strikes.contains_key(&request_id) {
			strikes.clear();
		}

		let count = {
			let entry = strikes.entry(request_id).or_insert(0);
			*entry += 1;
			*entry
		};
		if count >= WORKER_MAX_STRIKES {
			strikes.remove(&request_id);
			return Err(anyhow::anyhow!(
				"request rejected permanently after {} worker recycles in a row",
				WORKER_MAX_STRIKES
			));
		}
		Ok(())
	}
}

// Stable fingerprint of a request's content, valid for the pool's lifetime
fn request_fingerprint(request: &WorkerRequest) -> u64 {
	use std::hash::{Hash, Hasher};
	let mut hasher = std::collections::hash_map::DefaultHasher::new();
	request.hash(&mut hasher);
	hasher.finish()
}

impl Clone for WorkerPool {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

/// Effective RSS threshold: explicit override or half of system RAM
fn memory_limit_bytes(config: &Config) -> u64 {
	if config.worker.memory_limit_mb > 0 {
		config.worker.memory_limit_mb * 1024 * 1024
	} else {
		crate::memory::total_memory_bytes() / 2
	}
}
