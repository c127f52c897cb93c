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

//! Rust language implementation for the chunker

use crate::chunker::languages::Language;
use tree_sitter::Node;

pub struct Rust {}

impl Language for Rust {
	fn name(&self) -> &'static str {
		"rust"
	}

	fn get_ts_language(&self) -> tree_sitter::Language {
		tree_sitter_rust::LANGUAGE.into()
	}

	fn function_kinds(&self) -> &'static [&'static str] {
		&["function_item"]
	}

	fn class_kinds(&self) -> &'static [&'static str] {
		&[
			"struct_item",
			"enum_item",
			"union_item",
			"trait_item",
			"impl_item",
			"mod_item",
		]
	}

	fn import_kinds(&self) -> &'static [&'static str] {
		&["use_declaration", "extern_crate_declaration"]
	}

	fn file_extensions(&self) -> &'static [&'static str] {
		&["rs"]
	}

	fn declaration_name(&self, node: Node, contents: &str) -> Option<String> {
		// impl blocks have no name field; use the implemented type
		if node.kind() == "impl_item" {
			if let Some(ty) = node.child_by_field_name("type") {
				if let Ok(text) = ty.utf8_text(contents.as_bytes()) {
					return Some(text.to_string());
				}
			}
		}

		if let Some(name) = node.child_by_field_name("name") {
			if let Ok(text) = name.utf8_text(contents.as_bytes()) {
				return Some(text.to_string());
			}
		}
		None
	}
}
