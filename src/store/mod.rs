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

//! Persistent fragment store on LanceDB.
//!
//! One store per repository, one `fragments` table per store. Rows pair the
//! fragment text with its dense vector and optional quantized
//! late-interaction payload. Per-file updates are delete-then-insert, so a
//! reader observes either the previous row set for a path or the new one,
//! never a mix of hashes.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

// Arrow imports
use arrow::array::{
	Array, BinaryArray, BooleanArray, FixedSizeListArray, Float32Array, StringArray, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;

// LanceDB imports
use futures::TryStreamExt;
use lancedb::index::scalar::{FtsIndexBuilder, FullTextSearchQuery};
use lancedb::{
	connect,
	index::Index,
	query::{ExecutableQuery, QueryBase, Select},
	Connection, DistanceType,
};

use crate::chunker::FragmentKind;
use crate::embedding::LateInteraction;

const FRAGMENTS_TABLE: &str = "fragments";

/// One stored fragment row
#[derive(Debug, Clone)]
pub struct FragmentRow {
	pub id: String,
	pub path: String,
	pub hash: String,
	pub start_line: u32,
	pub end_line: u32,
	pub kind: FragmentKind,
	pub text: String,
	pub dense_vector: Vec<f32>,
	pub late_interaction: Option<LateInteraction>,
	pub is_anchor: bool,
	/// Populated by searches: cosine distance or FTS score
	pub distance: Option<f32>,
}

impl FragmentRow {
	pub fn new(
		path: &str,
		hash: &str,
		fragment: &crate::chunker::Fragment,
		dense_vector: Vec<f32>,
		late_interaction: Option<LateInteraction>,
	) -> Self {
		Self {
			id: Uuid::new_v4().to_string(),
			path: path.to_string(),
			hash: hash.to_string(),
			start_line: fragment.start_line as u32,
			end_line: fragment.end_line as u32,
			kind: fragment.kind,
			text: fragment.text.clone(),
			dense_vector,
			late_interaction,
			is_anchor: fragment.is_anchor,
			distance: None,
		}
	}
}

pub struct Store {
	db: Connection,
	vector_dim: usize,
}

impl Store {
	/// Open or create the named store under the data directory
	pub async fn open_or_create(name: &str, vector_dim: usize) -> Result<Self> {
		let dir = crate::storage::stores_dir()?.join(name);
		Self::open_at(dir, vector_dim).await
	}

	/// Open a store rooted at an explicit directory
	pub async fn open_at(dir: PathBuf, vector_dim: usize) -> Result<Self> {
		std::fs::create_dir_all(&dir)?;
		let db = connect(&dir.to_string_lossy())
			.execute()
			.await
			.context("Failed to open index store")?;

		let store = Self { db, vector_dim };
		store.ensure_table().await?;
		Ok(store)
	}

	/// Row count of a store directory without enforcing the schema, so a
	/// dimension mismatch is never "fixed" by a read-only diagnostic
	pub async fn peek_row_count(dir: &std::path::Path) -> Result<usize> {
		let db = connect(&dir.to_string_lossy()).execute().await?;
		let names = db.table_names().execute().await?;
		if !names.contains(&FRAGMENTS_TABLE.to_string()) {
			return Ok(0);
		}
		let table = db.open_table(FRAGMENTS_TABLE).execute().await?;
		Ok(table.count_rows(None).await?)
	}

	/// Remove a named store entirely
	pub async fn drop_store(name: &str) -> Result<()> {
		let dir = crate::storage::stores_dir()?.join(name);
		if dir.exists() {
			std::fs::remove_dir_all(&dir)?;
		}
		Ok(())
	}

	fn schema(&self) -> Arc<Schema> {
		Arc::new(Schema::new(vec![
			Field::new("id", DataType::Utf8, false),
			Field::new("path", DataType::Utf8, false),
			Field::new("hash", DataType::Utf8, false),
			Field::new("start_line", DataType::UInt32, false),
			Field::new("end_line", DataType::UInt32, false),
			Field::new("kind", DataType::Utf8, false),
			Field::new("text", DataType::Utf8, false),
			Field::new(
				"dense_vector",
				DataType::FixedSizeList(
					Arc::new(Field::new("item", DataType::Float32, true)),
					self.vector_dim as i32,
				),
				true,
			),
			Field::new("late_interaction", DataType::Binary, true),
			Field::new("li_scale", DataType::Float32, false),
			Field::new("li_dim", DataType::UInt32, false),
			Field::new("is_anchor", DataType::Boolean, false),
		]))
	}

	// Create the fragments table if needed; rebuild it when the stored
	// vector dimension no longer matches the current model
	async fn ensure_table(&self) -> Result<()> {
		let names = self.db.table_names().execute().await?;

		if names.contains(&FRAGMENTS_TABLE.to_string()) {
			let table = self.db.open_table(FRAGMENTS_TABLE).execute().await?;
			let schema = table.schema().await?;
			let stored_dim = schema
				.field_with_name("dense_vector")
				.ok()
				.and_then(|field| match field.data_type() {
					DataType::FixedSizeList(_, size) => Some(*size as usize),
					_ => None,
				});

			if stored_dim == Some(self.vector_dim) {
				return Ok(());
			}

			info!(
				"vector dimension changed ({:?} -> {}), rebuilding fragments table",
				stored_dim, self.vector_dim
			);
			self.db.drop_table(FRAGMENTS_TABLE).await?;
		}

		self.db
			.create_empty_table(FRAGMENTS_TABLE, self.schema())
			.execute()
			.await?;
		Ok(())
	}

	pub fn vector_dim(&self) -> usize {
		self.vector_dim
	}

	/// Atomic append of fragment rows
	pub async fn insert_batch(&self, rows: &[FragmentRow]) -> Result<()> {
		if rows.is_empty() {
			return Ok(());
		}

		for (i, row) in rows.iter().enumerate() {
			if row.dense_vector.len() != self.vector_dim {
				return Err(anyhow::anyhow!(
					"Fragment at index {} has dimension {} but expected {}",
					i,
					row.dense_vector.len(),
					self.vector_dim
				));
			}
		}

		let batch = self.rows_to_batch(rows)?;
		let table = self.db.open_table(FRAGMENTS_TABLE).execute().await?;

		use std::iter::once;
		let schema = batch.schema();
		let batches = once(Ok(batch));
		let reader = arrow::record_batch::RecordBatchIterator::new(batches, schema);
		table.add(reader).execute().await?;

		Ok(())
	}

	/// Remove every row with the given path
	pub async fn delete_by_path(&self, path: &str) -> Result<()> {
		let table = self.db.open_table(FRAGMENTS_TABLE).execute().await?;
		table
			.delete(&format!("path = '{}'", escape(path)))
			.await?;
		Ok(())
	}

	/// One (path, hash) per distinct path currently in the index
	pub async fn list_paths(&self) -> Result<Vec<(String, String)>> {
		let table = self.db.open_table(FRAGMENTS_TABLE).execute().await?;

		let mut results = table
			.query()
			.select(Select::Columns(vec![
				"path".to_string(),
				"hash".to_string(),
			]))
			.execute()
			.await?;

		let mut seen = std::collections::HashMap::new();
		while let Some(batch) = results.try_next().await? {
			let paths = string_column(&batch, "path")?;
			let hashes = string_column(&batch, "hash")?;
			for i in 0..batch.num_rows() {
				seen.entry(paths.value(i).to_string())
					.or_insert_with(|| hashes.value(i).to_string());
			}
		}

		Ok(seen.into_iter().collect())
	}

	pub async fn count_rows(&self) -> Result<usize> {
		let table = self.db.open_table(FRAGMENTS_TABLE).execute().await?;
		Ok(table.count_rows(None).await?)
	}

	/// Approximate nearest neighbor search, cosine over normalized vectors
	pub async fn search_vector(
		&self,
		query_vector: &[f32],
		k: usize,
		path_prefix: Option<&str>,
	) -> Result<Vec<FragmentRow>> {
		if query_vector.len() != self.vector_dim {
			return Err(anyhow::anyhow!(
				"Search vector has dimension {} but expected {}",
				query_vector.len(),
				self.vector_dim
			));
		}

		let table = self.db.open_table(FRAGMENTS_TABLE).execute().await?;
		if table.count_rows(None).await? == 0 {
			return Ok(Vec::new());
		}

		let mut query = table
			.query()
			.nearest_to(query_vector)?
			.distance_type(DistanceType::Cosine)
			.limit(k);

		if let Some(prefix) = path_prefix {
			query = query.only_if(format!("path LIKE '{}%'", escape(prefix)));
		}

		let mut results = query.execute().await?;
		let mut rows = Vec::new();
		while let Some(batch) = results.try_next().await? {
			rows.extend(self.batch_to_rows(&batch, true)?);
		}
		Ok(rows)
	}

	/// BM25-style keyword search over fragment text. Requires the FTS
	/// index; absent one, logs and returns no candidates so the vector
	/// side still answers.
	pub async fn search_fts(
		&self,
		query_text: &str,
		k: usize,
		path_prefix: Option<&str>,
	) -> Result<Vec<FragmentRow>> {
		let table = self.db.open_table(FRAGMENTS_TABLE).execute().await?;
		if table.count_rows(None).await? == 0 {
			return Ok(Vec::new());
		}

		let mut query = table
			.query()
			.full_text_search(FullTextSearchQuery::new(query_text.to_string()))
			.limit(k);

		if let Some(prefix) = path_prefix {
			query = query.only_if(format!("path LIKE '{}%'", escape(prefix)));
		}

		let mut results = match query.execute().await {
			Ok(results) => results,
			Err(e) => {
				warn!("full-text search unavailable: {}", e);
				return Ok(Vec::new());
			}
		};

		let mut rows = Vec::new();
		while let Some(batch) = results.try_next().await? {
			rows.extend(self.batch_to_rows(&batch, false)?);
		}
		Ok(rows)
	}

	/// Idempotent; called after bulk load. Small tables skip the ANN index
	/// and fall back to a flat scan.
	pub async fn create_vector_index(&self) -> Result<()> {
		let table = self.db.open_table(FRAGMENTS_TABLE).execute().await?;

		let has_index = table
			.list_indices()
			.await?
			.iter()
			.any(|idx| idx.columns == vec!["dense_vector"]);
		let row_count = table.count_rows(None).await?;
		if !has_index && row_count > 256 {
			table
				.create_index(&["dense_vector"], Index::Auto)
				.execute()
				.await?;
		}
		Ok(())
	}

	/// Idempotent BM25 index over the text column
	pub async fn create_fts_index(&self) -> Result<()> {
		let table = self.db.open_table(FRAGMENTS_TABLE).execute().await?;

		let has_index = table
			.list_indices()
			.await?
			.iter()
			.any(|idx| idx.columns == vec!["text"]);
		if !has_index {
			table
				.create_index(&["text"], Index::FTS(FtsIndexBuilder::default()))
				.execute()
				.await?;
		}
		Ok(())
	}

	fn rows_to_batch(&self, rows: &[FragmentRow]) -> Result<RecordBatch> {
		let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
		let paths: Vec<&str> = rows.iter().map(|r| r.path.as_str()).collect();
		let hashes: Vec<&str> = rows.iter().map(|r| r.hash.as_str()).collect();
		let start_lines: Vec<u32> = rows.iter().map(|r| r.start_line).collect();
		let end_lines: Vec<u32> = rows.iter().map(|r| r.end_line).collect();
		let kinds: Vec<&str> = rows.iter().map(|r| r.kind.as_str()).collect();
		let texts: Vec<&str> = rows.iter().map(|r| r.text.as_str()).collect();
		let anchors: Vec<bool> = rows.iter().map(|r| r.is_anchor).collect();

		let mut flattened = Vec::with_capacity(rows.len() * self.vector_dim);
		for row in rows {
			flattened.extend_from_slice(&row.dense_vector);
		}
		let vector_array = FixedSizeListArray::new(
			Arc::new(Field::new("item", DataType::Float32, true)),
			self.vector_dim as i32,
			Arc::new(Float32Array::from(flattened)),
			None,
		);

		let payloads: Vec<Option<&[u8]>> = rows
			.iter()
			.map(|r| r.late_interaction.as_ref().map(|li| li.data.as_slice()))
			.collect();
		let scales: Vec<f32> = rows
			.iter()
			.map(|r| r.late_interaction.as_ref().map(|li| li.scale).unwrap_or(0.0))
			.collect();
		let dims: Vec<u32> = rows
			.iter()
			.map(|r| r.late_interaction.as_ref().map(|li| li.dim).unwrap_or(0))
			.collect();

		let batch = RecordBatch::try_new(
			self.schema(),
			vec![
				Arc::new(StringArray::from(ids)),
				Arc::new(StringArray::from(paths)),
				Arc::new(StringArray::from(hashes)),
				Arc::new(UInt32Array::from(start_lines)),
				Arc::new(UInt32Array::from(end_lines)),
				Arc::new(StringArray::from(kinds)),
				Arc::new(StringArray::from(texts)),
				Arc::new(vector_array),
				Arc::new(BinaryArray::from_opt_vec(payloads)),
				Arc::new(Float32Array::from(scales)),
				Arc::new(UInt32Array::from(dims)),
				Arc::new(BooleanArray::from(anchors)),
			],
		)?;

		Ok(batch)
	}

	// Distance semantics differ per search: vector results carry
	// `_distance` (smaller is closer), FTS results `_score`
	fn batch_to_rows(&self, batch: &RecordBatch, vector_search: bool) -> Result<Vec<FragmentRow>> {
		let ids = string_column(batch, "id")?;
		let paths = string_column(batch, "path")?;
		let hashes = string_column(batch, "hash")?;
		let kinds = string_column(batch, "kind")?;
		let texts = string_column(batch, "text")?;

		let start_lines = batch
			.column_by_name("start_line")
			.and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
			.ok_or_else(|| anyhow::anyhow!("start_line column missing"))?;
		let end_lines = batch
			.column_by_name("end_line")
			.and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
			.ok_or_else(|| anyhow::anyhow!("end_line column missing"))?;
		let anchors = batch
			.column_by_name("is_anchor")
			.and_then(|c| c.as_any().downcast_ref::<BooleanArray>())
			.ok_or_else(|| anyhow::anyhow!("is_anchor column missing"))?;

		let payloads = batch
			.column_by_name("late_interaction")
			.and_then(|c| c.as_any().downcast_ref::<BinaryArray>());
		let scales = batch
			.column_by_name("li_scale")
			.and_then(|c| c.as_any().downcast_ref::<Float32Array>());
		let dims = batch
			.column_by_name("li_dim")
			.and_then(|c| c.as_any().downcast_ref::<UInt32Array>());

		let score_name = if vector_search { "_distance" } else { "_score" };
		let scores = batch
			.column_by_name(score_name)
			.and_then(|c| c.as_any().downcast_ref::<Float32Array>());

		let mut rows = Vec::with_capacity(batch.num_rows());
		for i in 0..batch.num_rows() {
			let late_interaction = match (payloads, scales, dims) {
				(Some(p), Some(s), Some(d)) if !p.is_null(i) && d.value(i) > 0 => {
					Some(LateInteraction {
						data: p.value(i).to_vec(),
						scale: s.value(i),
						dim: d.value(i),
					})
				}
				_ => None,
			};

			rows.push(FragmentRow {
				id: ids.value(i).to_string(),
				path: paths.value(i).to_string(),
				hash: hashes.value(i).to_string(),
				start_line: start_lines.value(i),
				end_line: end_lines.value(i),
				kind: FragmentKind::parse(kinds.value(i)),
				text: texts.value(i).to_string(),
				dense_vector: Vec::new(),
				late_interaction,
				is_anchor: anchors.value(i),
				distance: scores.map(|s| s.value(i)),
			});
		}
		Ok(rows)
	}
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
	batch
		.column_by_name(name)
		.and_then(|c| c.as_any().downcast_ref::<StringArray>())
		.ok_or_else(|| anyhow::anyhow!("{} column missing", name))
}

fn escape(value: &str) -> String {
	value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::chunker::{Fragment, FragmentKind};

	fn fragment(path: &str, start: usize, end: usize, kind: FragmentKind) -> Fragment {
		Fragment {
			path: path.to_string(),
			start_line: start,
			end_line: end,
			kind,
			text: format!("{} body {}..{}", path, start, end),
			context: Vec::new(),
			is_anchor: kind == FragmentKind::Anchor,
		}
	}

	fn row(path: &str, hash: &str, start: usize, vector: Vec<f32>) -> FragmentRow {
		FragmentRow::new(
			path,
			hash,
			&fragment(path, start, start + 5, FragmentKind::Function),
			vector,
			None,
		)
	}

	async fn test_store(dir: &tempfile::TempDir, dim: usize) -> Store {
		Store::open_at(dir.path().join("store"), dim).await.unwrap()
	}

	#[tokio::test]
	async fn test_insert_and_list_paths() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(&dir, 2).await;

		store
			.insert_batch(&[
				row("/repo/a.py", "h1", 0, vec![1.0, 0.0]),
				row("/repo/a.py", "h1", 10, vec![0.9, 0.1]),
				row("/repo/b.py", "h2", 0, vec![0.0, 1.0]),
			])
			.await
			.unwrap();

		let mut paths = store.list_paths().await.unwrap();
		paths.sort();
		assert_eq!(
			paths,
			vec![
				("/repo/a.py".to_string(), "h1".to_string()),
				("/repo/b.py".to_string(), "h2".to_string()),
			]
		);
		assert_eq!(store.count_rows().await.unwrap(), 3);
	}

	#[tokio::test]
	async fn test_delete_by_path_cascades() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(&dir, 2).await;

		store
			.insert_batch(&[
				row("/repo/a.py", "h1", 0, vec![1.0, 0.0]),
				row("/repo/a.py", "h1", 10, vec![0.9, 0.1]),
				row("/repo/b.py", "h2", 0, vec![0.0, 1.0]),
			])
			.await
			.unwrap();

		store.delete_by_path("/repo/a.py").await.unwrap();

		let paths = store.list_paths().await.unwrap();
		assert_eq!(paths, vec![("/repo/b.py".to_string(), "h2".to_string())]);
		assert_eq!(store.count_rows().await.unwrap(), 1);
	}

	#[tokio::test]
	async fn test_vector_search_orders_by_similarity() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(&dir, 2).await;

		store
			.insert_batch(&[
				row("/repo/near.py", "h1", 0, vec![1.0, 0.0]),
				row("/repo/far.py", "h2", 0, vec![0.0, 1.0]),
			])
			.await
			.unwrap();

		let results = store
			.search_vector(&[1.0, 0.05], 2, None)
			.await
			.unwrap();

		assert_eq!(results.len(), 2);
		assert_eq!(results[0].path, "/repo/near.py");
		assert!(results[0].distance.unwrap() < results[1].distance.unwrap());
	}

	#[tokio::test]
	async fn test_vector_search_honors_path_prefix() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(&dir, 2).await;

		store
			.insert_batch(&[
				row("/repo/src/a.py", "h1", 0, vec![1.0, 0.0]),
				row("/repo/tests/b.py", "h2", 0, vec![1.0, 0.0]),
			])
			.await
			.unwrap();

		let results = store
			.search_vector(&[1.0, 0.0], 10, Some("/repo/src"))
			.await
			.unwrap();

		assert_eq!(results.len(), 1);
		assert_eq!(results[0].path, "/repo/src/a.py");
	}

	#[tokio::test]
	async fn test_dimension_mismatch_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(&dir, 4).await;

		let result = store
			.insert_batch(&[row("/repo/a.py", "h1", 0, vec![1.0, 0.0])])
			.await;
		assert!(result.is_err());
	}

	#[tokio::test]
	async fn test_dimension_change_rebuilds_table() {
		let dir = tempfile::tempdir().unwrap();
		{
			let store = test_store(&dir, 2).await;
			store
				.insert_batch(&[row("/repo/a.py", "h1", 0, vec![1.0, 0.0])])
				.await
				.unwrap();
			assert_eq!(store.count_rows().await.unwrap(), 1);
		}

		// Same directory, new model dimension: table is dropped and
		// recreated empty, never serving mismatched vectors
		let store = test_store(&dir, 3).await;
		assert_eq!(store.count_rows().await.unwrap(), 0);

		store
			.insert_batch(&[row("/repo/a.py", "h1", 0, vec![1.0, 0.0, 0.0])])
			.await
			.unwrap();
		assert_eq!(store.count_rows().await.unwrap(), 1);
	}

	#[tokio::test]
	async fn test_fts_search_finds_keywords() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(&dir, 2).await;

		let mut special = row("/repo/auth.py", "h1", 0, vec![1.0, 0.0]);
		special.text = "def authenticate_user(token): validate bearer token".to_string();
		let mut other = row("/repo/math.py", "h2", 0, vec![0.0, 1.0]);
		other.text = "def add(a, b): return a + b".to_string();

		store.insert_batch(&[special, other]).await.unwrap();
		store.create_fts_index().await.unwrap();

		let results = store
			.search_fts("authenticate bearer", 5, None)
			.await
			.unwrap();
		assert!(!results.is_empty());
		assert_eq!(results[0].path, "/repo/auth.py");
	}

	#[tokio::test]
	async fn test_late_interaction_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(&dir, 2).await;

		let payload = crate::embedding::quantize_matrix(&[vec![0.5, -0.5], vec![0.25, 0.75]])
			.unwrap();
		let mut with_payload = row("/repo/li.py", "h1", 0, vec![1.0, 0.0]);
		with_payload.late_interaction = Some(payload.clone());
		let without = row("/repo/plain.py", "h2", 0, vec![0.0, 1.0]);

		store.insert_batch(&[with_payload, without]).await.unwrap();

		let results = store.search_vector(&[1.0, 0.0], 2, None).await.unwrap();
		let li_row = results.iter().find(|r| r.path == "/repo/li.py").unwrap();
		assert_eq!(li_row.late_interaction.as_ref().unwrap(), &payload);

		let plain_row = results.iter().find(|r| r.path == "/repo/plain.py").unwrap();
		assert!(plain_row.late_interaction.is_none());
	}

	#[tokio::test]
	async fn test_index_creation_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let store = test_store(&dir, 2).await;

		store
			.insert_batch(&[row("/repo/a.py", "h1", 0, vec![1.0, 0.0])])
			.await
			.unwrap();

		store.create_fts_index().await.unwrap();
		store.create_fts_index().await.unwrap();
		store.create_vector_index().await.unwrap();
		store.create_vector_index().await.unwrap();
	}
}
