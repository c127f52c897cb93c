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

//! Embedding types shared between the worker pool and the store:
//! dense vectors, the optional quantized late-interaction payload, and the
//! MaxSim scoring over dequantized token matrices.

pub mod pool;
pub mod worker;

pub use pool::WorkerPool;
pub use worker::{ModelSession, SessionFactory, WorkerReply, WorkerRequest};

/// Quantized per-token matrix (row-major i8 stored as bytes) plus the scale
/// used for dequantization
#[derive(Debug, Clone, PartialEq)]
pub struct LateInteraction {
	pub data: Vec<u8>,
	pub scale: f32,
	pub dim: u32,
}

/// Document-side encoding result
#[derive(Debug, Clone)]
pub struct HybridEmbedding {
	/// CLS-pooled, L2-normalized
	pub dense: Vec<f32>,
	/// Absent when the encoder does not emit token vectors
	pub late_interaction: Option<LateInteraction>,
}

/// Query-side encoding result; token vectors stay unquantized
#[derive(Debug, Clone)]
pub struct QueryEmbedding {
	pub dense: Vec<f32>,
	pub late_interaction: Option<Vec<Vec<f32>>>,
}

/// Normalize a vector to unit length in place. Zero vectors are left as-is.
pub fn l2_normalize(vector: &mut [f32]) {
	let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
	if norm > f32::EPSILON {
		for value in vector.iter_mut() {
			*value /= norm;
		}
	}
}

/// Symmetric i8 quantization of a token matrix. All rows must share one
/// dimension; the scale maps the i8 range back onto the input range.
pub fn quantize_matrix(rows: &[Vec<f32>]) -> Option<LateInteraction> {
	let dim = rows.first()?.len();
	if dim == 0 {
		return None;
	}

	let max_abs = rows
		.iter()
		.flat_map(|row| row.iter())
		.fold(0f32, |acc, v| acc.max(v.abs()));
	let scale = if max_abs > f32::EPSILON {
		max_abs / 127.0
	} else {
		1.0
	};

	let mut data = Vec::with_capacity(rows.len() * dim);
	for row in rows {
		debug_assert_eq!(row.len(), dim);
		for value in row {
			let q = (value / scale).round().clamp(-127.0, 127.0) as i8;
			data.push(q as u8);
		}
	}

	Some(LateInteraction {
		data,
		scale,
		dim: dim as u32,
	})
}

/// Reconstruct the float matrix from a quantized payload
pub fn dequantize_matrix(payload: &LateInteraction) -> Vec<Vec<f32>> {
	let dim = payload.dim as usize;
	if dim == 0 {
		return Vec::new();
	}

	payload
		.data
		.chunks_exact(dim)
		.map(|chunk| {
			chunk
				.iter()
				.map(|&b| (b as i8) as f32 * payload.scale)
				.collect()
		})
		.collect()
}

/// MaxSim between a query token matrix and a quantized document payload:
/// the sum over query tokens of the best dot product against any document
/// token.
pub fn maxsim(query_tokens: &[Vec<f32>], document: &LateInteraction) -> f32 {
	let doc_tokens = dequantize_matrix(document);
	if doc_tokens.is_empty() {
		return 0.0;
	}

	query_tokens
		.iter()
		.map(|q| {
			doc_tokens
				.iter()
				.map(|d| dot(q, d))
				.fold(f32::MIN, f32::max)
		})
		.sum()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
	if a.len() != b.len() {
		return 0.0;
	}
	// simsimd returns a distance-style f64 dot product
	simsimd::SpatialSimilarity::dot(a, b).map(|d| d as f32).unwrap_or_else(|| {
		a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_l2_normalize() {
		let mut v = vec![3.0, 4.0];
		l2_normalize(&mut v);
		let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
		assert!((norm - 1.0).abs() < 1e-5);

		// Zero vectors are not touched
		let mut zero = vec![0.0, 0.0];
		l2_normalize(&mut zero);
		assert_eq!(zero, vec![0.0, 0.0]);
	}

	#[test]
	fn test_quantize_preserves_shape_and_range() {
		let rows = vec![vec![0.5, -0.25, 0.1], vec![-0.9, 0.3, 0.0]];
		let payload = quantize_matrix(&rows).unwrap();

		assert_eq!(payload.dim, 3);
		assert_eq!(payload.data.len(), 6);

		let restored = dequantize_matrix(&payload);
		assert_eq!(restored.len(), 2);
		for (row, original) in restored.iter().zip(rows.iter()) {
			for (a, b) in row.iter().zip(original.iter()) {
				assert!((a - b).abs() < 0.01, "lossy but close: {} vs {}", a, b);
			}
		}
	}

	#[test]
	fn test_quantize_rejects_empty() {
		assert!(quantize_matrix(&[]).is_none());
		assert!(quantize_matrix(&[vec![]]).is_none());
	}

	#[test]
	fn test_maxsim_prefers_matching_tokens() {
		let doc_a = quantize_matrix(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
		let doc_b = quantize_matrix(&[vec![-1.0, 0.0], vec![0.0, -1.0]]).unwrap();
		let query = vec![vec![1.0, 0.0]];

		assert!(maxsim(&query, &doc_a) > maxsim(&query, &doc_b));
	}
}
