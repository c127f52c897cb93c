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

//! C/C++ language implementation for the chunker

use crate::chunker::languages::Language;
use tree_sitter::Node;

pub struct Cpp {}

impl Language for Cpp {
	fn name(&self) -> &'static str {
		"cpp"
	}

	fn get_ts_language(&self) -> tree_sitter::Language {
		tree_sitter_cpp::LANGUAGE.into()
	}

	fn function_kinds(&self) -> &'static [&'static str] {
		&["function_definition"]
	}

	fn class_kinds(&self) -> &'static [&'static str] {
		&[
			"class_specifier",
			"struct_specifier",
			"enum_specifier",
			"namespace_definition",
		]
	}

	fn import_kinds(&self) -> &'static [&'static str] {
		&["preproc_include"]
	}

	fn file_extensions(&self) -> &'static [&'static str] {
		&["cpp", "cc", "cxx", "hpp", "hxx", "c", "h"]
	}

	fn declaration_name(&self, node: Node, contents: &str) -> Option<String> {
		// Function names hide inside the declarator chain
		if node.kind() == "function_definition" {
			let mut current = node.child_by_field_name("declarator");
			while let Some(decl) = current {
				if decl.kind() == "identifier"
					|| decl.kind() == "field_identifier"
					|| decl.kind() == "qualified_identifier"
				{
					if let Ok(text) = decl.utf8_text(contents.as_bytes()) {
						return Some(text.to_string());
					}
				}
				current = decl.child_by_field_name("declarator");
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
