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

//! Application-wide constants

/// Maximum lines per fragment before windowing kicks in
pub const MAX_FRAGMENT_LINES: usize = 100;

/// Overlap between adjacent windows of an oversized fragment
pub const OVERLAP_LINES: usize = 10;

/// Fragments shorter than this are absorbed into their parent, never emitted alone
pub const MIN_FRAGMENT_LINES: usize = 3;

/// Number of import lines included in a fragment's context preamble
pub const PREAMBLE_IMPORT_LINES: usize = 8;

/// Upper bound on the context preamble, in characters
pub const PREAMBLE_MAX_CHARS: usize = 512;

/// Unique texts per embedding request sent to the worker pool
pub const EMBED_BATCH_SIZE: usize = 16;

/// Reciprocal rank fusion constant
pub const RRF_K: f32 = 60.0;

/// Candidates handed to the cross-encoder reranker
pub const RERANK_WINDOW: usize = 50;

/// Candidate pool floor; the pool is max(this, CANDIDATE_FACTOR * top_k)
pub const CANDIDATE_FLOOR: usize = 50;
pub const CANDIDATE_FACTOR: usize = 5;

/// Successful files between best-effort meta store saves
pub const META_SAVE_INTERVAL: usize = 50;

/// Per-path debounce for watcher events
pub const WATCH_DEBOUNCE_MS: u64 = 300;

/// Default deadline for a single worker request
pub const WORKER_TIMEOUT_MS: u64 = 60_000;

/// Consecutive recycles for one request id before it is rejected permanently
pub const WORKER_MAX_STRIKES: u32 = 3;

/// Maximum accepted HTTP request body
pub const SERVER_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// How long /search waits for the initial index before answering "indexing"
pub const SERVER_INDEX_WAIT_MS: u64 = 5_000;

/// Minimum gap between repeated memory warnings from the server
pub const SERVER_WARN_INTERVAL_SECS: u64 = 300;

/// Embedding input prefixes for models that expect an instruction
pub const QUERY_PREFIX: &str = "Represent the query for retrieving supporting documents: ";
pub const DOCUMENT_PREFIX: &str = "Represent the document for retrieval: ";
