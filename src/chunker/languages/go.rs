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

//! Go language implementation for the chunker

use crate::chunker::languages::Language;
use tree_sitter::Node;

pub struct Go {}

impl Language for Go {
	fn name(&self) -> &'static str {
		"go"
	}

	fn get_ts_language(&self) -> tree_sitter::Language {
		tree_sitter_go::LANGUAGE.into()
	}

	fn function_kinds(&self) -> &'static [&'static str] {
		&["function_declaration", "method_declaration"]
	}

	fn class_kinds(&self) -> &'static [&'static str] {
		&["type_declaration"]
	}

	fn import_kinds(&self) -> &'static [&'static str] {
		&["import_declaration"]
	}

	fn file_extensions(&self) -> &'static [&'static str] {
		&["go"]
	}

	fn declaration_name(&self, node: Node, contents: &str) -> Option<String> {
		// type declarations wrap the named spec one level down
		if node.kind() == "type_declaration" {
			let mut cursor = node.walk();
			for child in node.children(&mut cursor) {
				if child.kind() == "type_spec" {
					if let Some(name) = child.child_by_field_name("name") {
						if let Ok(text) = name.utf8_text(contents.as_bytes()) {
							return Some(text.to_string());
						}
					}
				}
			}
			return None;
		}

		if let Some(name) = node.child_by_field_name("name") {
			if let Ok(text) = name.utf8_text(contents.as_bytes()) {
				return Some(text.to_string());
			}
		}
		None
	}
}
