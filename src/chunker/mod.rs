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

//! Structure-aware splitting of source files into fragments.
//!
//! A file becomes one anchor fragment (header summary) plus declaration
//! fragments from the tree-sitter grammar when one is available, with a
//! line-window fallback otherwise. Oversized fragments are sliced into
//! overlapping windows; undersized ones are merged into a sibling or
//! absorbed by their parent, never emitted alone.
//!
//! The chunker is deterministic: identical input bytes produce identical
//! fragment lists.

pub mod languages;

use std::path::Path;
use tracing::debug;
use tree_sitter::{Node, Parser};

use crate::config::Config;
use languages::Language;

/// Structural category of a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
	Function,
	Class,
	Method,
	Block,
	Anchor,
	Fallback,
}

impl FragmentKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			FragmentKind::Function => "function",
			FragmentKind::Class => "class",
			FragmentKind::Method => "method",
			FragmentKind::Block => "block",
			FragmentKind::Anchor => "anchor",
			FragmentKind::Fallback => "fallback",
		}
	}

	pub fn parse(s: &str) -> FragmentKind {
		match s {
			"function" => FragmentKind::Function,
			"class" => FragmentKind::Class,
			"method" => FragmentKind::Method,
			"anchor" => FragmentKind::Anchor,
			"fallback" => FragmentKind::Fallback,
			_ => FragmentKind::Block,
		}
	}

	/// Multiplicative score boost applied during retrieval
	pub fn score_boost(&self) -> f32 {
		match self {
			FragmentKind::Function | FragmentKind::Class | FragmentKind::Method => 1.10,
			FragmentKind::Anchor => 1.05,
			FragmentKind::Block => 1.00,
			FragmentKind::Fallback => 0.95,
		}
	}
}

/// One indexable fragment of a source file
#[derive(Debug, Clone)]
pub struct Fragment {
	pub path: String,
	/// Inclusive, 0-based
	pub start_line: usize,
	/// Exclusive
	pub end_line: usize,
	pub kind: FragmentKind,
	/// Display-ready body text
	pub text: String,
	/// Context preamble lines (file header, enclosing signature); these feed
	/// the embedding input but are never shown to users
	pub context: Vec<String>,
	pub is_anchor: bool,
}

impl Fragment {
	/// Text handed to the embedding model: preamble plus body
	pub fn embedding_text(&self) -> String {
		if self.context.is_empty() {
			self.text.clone()
		} else {
			format!("{}\n\n{}", self.context.join("\n"), self.text)
		}
	}
}

// Candidate region before windowing and size policy
struct Candidate {
	start_line: usize,
	end_line: usize,
	kind: FragmentKind,
	/// Enclosing declaration signature for nested fragments
	enclosing: Option<String>,
}

// Header information extracted once per file
struct FileHeader {
	docblock: Vec<String>,
	imports: Vec<String>,
	exports: Vec<String>,
	header_end: usize,
}

pub struct Chunker {
	max_lines: usize,
	overlap_lines: usize,
	min_lines: usize,
}

impl Chunker {
	pub fn new(config: &Config) -> Self {
		Self {
			max_lines: config.index.max_fragment_lines.max(2),
			overlap_lines: config.index.overlap_lines,
			min_lines: config.index.min_fragment_lines,
		}
	}

	/// Split a file into fragments. Empty input yields no fragments; the
	/// anchor fragment always precedes the rest, which are ordered by
	/// increasing start line.
	pub fn chunk_file(&self, path: &Path, contents: &str) -> Vec<Fragment> {
		if contents.is_empty() {
			return Vec::new();
		}

		let lines: Vec<&str> = contents.lines().collect();
		let path_str = path.to_string_lossy().to_string();

		let (candidates, header) = match languages::language_for_path(path) {
			Some(lang) => match self.structural_candidates(contents, &lines, lang.as_ref()) {
				Some(result) => result,
				None => {
					debug!("parse failed for {}, using fallback splitter", path_str);
					(self.fallback_candidates(&lines), text_header(&lines))
				}
			},
			None => (self.fallback_candidates(&lines), text_header(&lines)),
		};

		let preamble = self.file_preamble(&header);
		let (sized, orphans) = self.apply_size_policy(candidates);

		let mut anchor = self.anchor_fragment(&path_str, &header, lines.len());
		// Isolated under-floor declarations are never emitted alone; their
		// text joins the file-level anchor instead of stretching an
		// unrelated neighbor's span
		for orphan in &orphans {
			let end = orphan.end_line.min(lines.len());
			if orphan.start_line < end {
				anchor.text.push('\n');
				anchor.text.push_str(&lines[orphan.start_line..end].join("\n"));
			}
		}

		let mut fragments = Vec::new();
		fragments.push(anchor);

		for candidate in sized {
			// Grammars may report an end position past the last line
			let capped_end = candidate.end_line.min(lines.len());
			if candidate.start_line >= capped_end {
				continue;
			}
			for (start, end) in self.windows(candidate.start_line, capped_end) {
				let mut context = preamble.clone();
				if let Some(enclosing) = &candidate.enclosing {
					context.push(enclosing.clone());
				}
				fragments.push(Fragment {
					path: path_str.clone(),
					start_line: start,
					end_line: end,
					kind: candidate.kind,
					text: lines[start..end].join("\n"),
					context,
					is_anchor: false,
				});
			}
		}

		fragments
	}

	// Parse with the grammar and collect declaration and block candidates.
	// Returns None when the parser cannot be driven with this grammar.
	fn structural_candidates(
		&self,
		contents: &str,
		lines: &[&str],
		lang: &dyn Language,
	) -> Option<(Vec<Candidate>, FileHeader)> {
		let mut parser = Parser::new();
		parser.set_language(&lang.get_ts_language()).ok()?;
		let tree = parser.parse(contents, None)?;
		let root = tree.root_node();

		let mut candidates = Vec::new();
		let mut imports = Vec::new();
		let mut exports = Vec::new();
		let mut last_leading_import_end = 0usize;
		let mut seen_declaration = false;

		// Pending run of plain top-level statements
		let mut block_run: Option<(usize, usize)> = None;

		let mut cursor = root.walk();
		for child in root.named_children(&mut cursor) {
			let kind = child.kind();
			let start = child.start_position().row;
			let end = child.end_position().row + 1;

			if lang.import_kinds().contains(&kind) {
				if let Ok(text) = child.utf8_text(contents.as_bytes()) {
					imports.push(text.lines().next().unwrap_or("").to_string());
				}
				if !seen_declaration {
					last_leading_import_end = end;
				}
				continue;
			}

			if kind.contains("comment") {
				continue;
			}

			if lang.function_kinds().contains(&kind) {
				flush_block(&mut block_run, &mut candidates);
				seen_declaration = true;
				if let Some(name) = lang.declaration_name(child, contents) {
					exports.push(name);
				}
				candidates.push(Candidate {
					start_line: extend_over_preceding_comment(child, start),
					end_line: end,
					kind: FragmentKind::Function,
					enclosing: None,
				});
				continue;
			}

			if lang.class_kinds().contains(&kind) {
				flush_block(&mut block_run, &mut candidates);
				seen_declaration = true;
				if let Some(name) = lang.declaration_name(child, contents) {
					exports.push(name);
				}
				candidates.push(Candidate {
					start_line: extend_over_preceding_comment(child, start),
					end_line: end,
					kind: FragmentKind::Class,
					enclosing: None,
				});

				let signature = lines
					.get(start)
					.map(|l| l.trim().to_string())
					.unwrap_or_default();
				self.collect_nested(child, contents, lang, &signature, &mut candidates);
				continue;
			}

			// Anything else joins the current block run; runs split when
			// separated by more than one line
			block_run = match block_run {
				Some((run_start, run_end)) if start <= run_end + 1 => {
					Some((run_start, end.max(run_end)))
				}
				Some(run) => {
					candidates.push(Candidate {
						start_line: run.0,
						end_line: run.1,
						kind: FragmentKind::Block,
						enclosing: None,
					});
					Some((start, end))
				}
				None => Some((start, end)),
			};
		}
		flush_block(&mut block_run, &mut candidates);

		let docblock = leading_comment_lines(lines);
		let header_end = docblock
			.len()
			.max(last_leading_import_end)
			.clamp(1, lines.len());

		Some((
			candidates,
			FileHeader {
				docblock,
				imports,
				exports,
				header_end,
			},
		))
	}

	// Function and class nodes nested inside a class-like declaration
	fn collect_nested(
		&self,
		node: Node,
		contents: &str,
		lang: &dyn Language,
		enclosing: &str,
		candidates: &mut Vec<Candidate>,
	) {
		let mut cursor = node.walk();
		for child in node.children(&mut cursor) {
			let kind = child.kind();
			let start = child.start_position().row;
			let end = child.end_position().row + 1;

			if lang.function_kinds().contains(&kind) {
				candidates.push(Candidate {
					start_line: extend_over_preceding_comment(child, start),
					end_line: end,
					kind: FragmentKind::Method,
					enclosing: Some(enclosing.to_string()),
				});
			} else if lang.class_kinds().contains(&kind) {
				candidates.push(Candidate {
					start_line: extend_over_preceding_comment(child, start),
					end_line: end,
					kind: FragmentKind::Class,
					enclosing: Some(enclosing.to_string()),
				});
				let signature = contents
					.lines()
					.nth(start)
					.map(|l| l.trim().to_string())
					.unwrap_or_default();
				self.collect_nested(child, contents, lang, &signature, candidates);
			} else {
				self.collect_nested(child, contents, lang, enclosing, candidates);
			}
		}
	}

	// Line-window fallback used for unsupported or unparseable files
	fn fallback_candidates(&self, lines: &[&str]) -> Vec<Candidate> {
		if lines.is_empty() {
			return Vec::new();
		}
		vec![Candidate {
			start_line: 0,
			end_line: lines.len(),
			kind: FragmentKind::Fallback,
			enclosing: None,
		}]
	}

	// Enforce the minimum size: nested fragments below the floor are covered
	// by their parent and dropped; top-level ones merge into an adjacent
	// sibling. Smalls with no adjacent neighbor come back as orphans for
	// the caller to fold into the file-level anchor, so no fragment's span
	// ever stretches across the gap to cover them.
	fn apply_size_policy(&self, mut candidates: Vec<Candidate>) -> (Vec<Candidate>, Vec<Candidate>) {
		candidates.sort_by_key(|c| c.start_line);

		let mut result: Vec<Candidate> = Vec::new();
		let mut orphans: Vec<Candidate> = Vec::new();
		let mut pending_small: Option<Candidate> = None;

		for candidate in candidates {
			let len = candidate.end_line - candidate.start_line;

			if len >= self.min_lines {
				if let Some(small) = pending_small.take() {
					if candidate.start_line <= small.end_line + 1 {
						// An adjacent small sibling joins this fragment
						result.push(Candidate {
							start_line: small.start_line.min(candidate.start_line),
							end_line: candidate.end_line.max(small.end_line),
							kind: candidate.kind,
							enclosing: candidate.enclosing.clone(),
						});
						continue;
					}
					orphans.push(small);
				}
				result.push(candidate);
				continue;
			}

			if candidate.enclosing.is_some() {
				// Promoted into the parent fragment's text by construction
				continue;
			}

			match result.last_mut() {
				Some(prev) if candidate.start_line <= prev.end_line + 1 => {
					prev.end_line = prev.end_line.max(candidate.end_line);
				}
				_ => match pending_small.take() {
					Some(held) if candidate.start_line <= held.end_line + 1 => {
						let merged = Candidate {
							start_line: held.start_line,
							end_line: candidate.end_line.max(held.end_line),
							kind: FragmentKind::Block,
							enclosing: None,
						};
						if merged.end_line - merged.start_line >= self.min_lines {
							result.push(merged);
						} else {
							pending_small = Some(merged);
						}
					}
					Some(held) => {
						orphans.push(held);
						pending_small = Some(candidate);
					}
					None => pending_small = Some(candidate),
				},
			}
		}

		// A trailing small merges backwards only into an adjacent fragment
		if let Some(small) = pending_small {
			match result.last_mut() {
				Some(prev) if small.start_line <= prev.end_line + 1 => {
					prev.end_line = prev.end_line.max(small.end_line);
				}
				_ => orphans.push(small),
			}
		}

		(result, orphans)
	}

	// Monotone overlapping windows of at most max_lines
	fn windows(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
		let len = end.saturating_sub(start);
		if len <= self.max_lines {
			return vec![(start, end)];
		}

		let step = self.max_lines - self.overlap_lines.min(self.max_lines - 1);
		let mut windows = Vec::new();
		let mut cursor = start;
		loop {
			let window_end = (cursor + self.max_lines).min(end);
			windows.push((cursor, window_end));
			if window_end == end {
				break;
			}
			cursor += step;
		}
		windows
	}

	// One whole-file summary fragment spanning the header region
	fn anchor_fragment(&self, path: &str, header: &FileHeader, line_count: usize) -> Fragment {
		let mut text = String::new();
		if !header.docblock.is_empty() {
			text.push_str(&header.docblock.join("\n"));
			text.push('\n');
		}
		if !header.imports.is_empty() {
			text.push_str(&header.imports.join("\n"));
			text.push('\n');
		}
		if !header.exports.is_empty() {
			text.push_str("Exports: ");
			text.push_str(&header.exports.join(", "));
		}
		if text.is_empty() {
			text = path.to_string();
		}

		Fragment {
			path: path.to_string(),
			start_line: 0,
			end_line: header.header_end.clamp(1, line_count.max(1)),
			kind: FragmentKind::Anchor,
			text: text.trim_end().to_string(),
			context: Vec::new(),
			is_anchor: true,
		}
	}

	// Bounded context preamble shared by every fragment of the file
	fn file_preamble(&self, header: &FileHeader) -> Vec<String> {
		let mut preamble = Vec::new();
		let mut budget = crate::constants::PREAMBLE_MAX_CHARS;

		for line in header
			.docblock
			.iter()
			.take(3)
			.chain(header.imports.iter().take(crate::constants::PREAMBLE_IMPORT_LINES))
		{
			if line.len() > budget {
				break;
			}
			budget -= line.len();
			preamble.push(line.clone());
		}
		preamble
	}
}

fn flush_block(run: &mut Option<(usize, usize)>, candidates: &mut Vec<Candidate>) {
	if let Some((start, end)) = run.take() {
		candidates.push(Candidate {
			start_line: start,
			end_line: end,
			kind: FragmentKind::Block,
			enclosing: None,
		});
	}
}

// Pull a directly preceding comment sibling into the fragment span
fn extend_over_preceding_comment(node: Node, start: usize) -> usize {
	if let Some(prev) = node.prev_named_sibling() {
		if prev.kind().contains("comment") && prev.end_position().row + 1 >= start {
			return prev.start_position().row;
		}
	}
	start
}

// Leading comment lines of the file, used for the anchor and docblock
fn leading_comment_lines(lines: &[&str]) -> Vec<String> {
	let mut docblock = Vec::new();
	for line in lines.iter().take(20) {
		let trimmed = line.trim_start();
		let is_comment = trimmed.starts_with('#')
			|| trimmed.starts_with("//")
			|| trimmed.starts_with("/*")
			|| trimmed.starts_with('*')
			|| trimmed.starts_with("--")
			|| trimmed.starts_with("\"\"\"")
			|| trimmed.starts_with("'''");
		if is_comment {
			docblock.push(line.to_string());
		} else if trimmed.is_empty() && !docblock.is_empty() {
			break;
		} else if !trimmed.is_empty() {
			break;
		}
	}
	docblock
}

// Header for files without a usable grammar: text-heuristic imports
fn text_header(lines: &[&str]) -> FileHeader {
	let docblock = leading_comment_lines(lines);
	let mut imports = Vec::new();
	let mut header_end = docblock.len();

	for (i, line) in lines.iter().take(50).enumerate() {
		let trimmed = line.trim_start();
		if trimmed.starts_with("import ")
			|| trimmed.starts_with("from ")
			|| trimmed.starts_with("use ")
			|| trimmed.starts_with("#include")
			|| trimmed.starts_with("require ")
			|| trimmed.starts_with("require(")
		{
			imports.push(line.to_string());
			header_end = header_end.max(i + 1);
		}
	}

	FileHeader {
		docblock,
		imports,
		exports: Vec::new(),
		header_end: header_end.clamp(1, lines.len().max(1)),
	}
}
