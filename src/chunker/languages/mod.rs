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

//! Language support for the chunker.
//! Provides a common interface over the tree-sitter grammars: which node
//! kinds form fragments, which are imports, and how declarations are named.

use std::path::Path;
use tree_sitter::Node;

mod bash;
mod cpp;
mod go;
mod javascript;
mod json;
mod php;
mod python;
mod ruby;
mod rust;
mod typescript;

pub use bash::Bash;
pub use cpp::Cpp;
pub use go::Go;
pub use javascript::JavaScript;
pub use json::Json;
pub use php::Php;
pub use python::Python;
pub use ruby::Ruby;
pub use rust::Rust;
pub use typescript::TypeScript;

/// Common trait for all language grammars
pub trait Language {
	/// Name of the language
	fn name(&self) -> &'static str;

	/// Get tree-sitter language for parsing
	fn get_ts_language(&self) -> tree_sitter::Language;

	/// Node kinds that yield function fragments
	fn function_kinds(&self) -> &'static [&'static str];

	/// Node kinds that yield class-like fragments (types, traits, impls)
	fn class_kinds(&self) -> &'static [&'static str];

	/// Node kinds that are import/include statements
	fn import_kinds(&self) -> &'static [&'static str];

	/// File extensions handled by this language
	fn file_extensions(&self) -> &'static [&'static str];

	/// Name of a declaration node, used for anchor export lists and
	/// enclosing-signature preambles
	fn declaration_name(&self, node: Node, contents: &str) -> Option<String> {
		if let Some(name) = node.child_by_field_name("name") {
			if let Ok(text) = name.utf8_text(contents.as_bytes()) {
				return Some(text.to_string());
			}
		}

		// Fall back to the first identifier-ish child
		let mut cursor = node.walk();
		for child in node.children(&mut cursor) {
			if child.kind().ends_with("identifier") {
				if let Ok(text) = child.utf8_text(contents.as_bytes()) {
					return Some(text.to_string());
				}
			}
		}
		None
	}
}

/// Gets a language implementation by its name
pub fn get_language(name: &str) -> Option<Box<dyn Language>> {
	match name {
		"rust" => Some(Box::new(Rust {})),
		"javascript" => Some(Box::new(JavaScript {})),
		"typescript" => Some(Box::new(TypeScript {})),
		"python" => Some(Box::new(Python {})),
		"go" => Some(Box::new(Go {})),
		"cpp" => Some(Box::new(Cpp {})),
		"php" => Some(Box::new(Php {})),
		"bash" => Some(Box::new(Bash {})),
		"ruby" => Some(Box::new(Ruby {})),
		"json" => Some(Box::new(Json {})),
		_ => None,
	}
}

/// Detect the language for a path from its extension
pub fn language_for_path(path: &Path) -> Option<Box<dyn Language>> {
	let extension = path.extension()?.to_str()?;
	let name = match extension {
		"rs" => "rust",
		"js" | "mjs" | "cjs" | "jsx" => "javascript",
		"ts" | "mts" | "cts" | "tsx" => "typescript",
		"py" | "pyi" => "python",
		"go" => "go",
		"cpp" | "cc" | "cxx" | "hpp" | "hxx" | "c" | "h" => "cpp",
		"php" => "php",
		"sh" | "bash" => "bash",
		"rb" => "ruby",
		"json" => "json",
		_ => return None,
	};
	get_language(name)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_language_for_path() {
		assert_eq!(
			language_for_path(Path::new("src/main.rs")).unwrap().name(),
			"rust"
		);
		assert_eq!(
			language_for_path(Path::new("app/model.py")).unwrap().name(),
			"python"
		);
		assert_eq!(
			language_for_path(Path::new("web/index.tsx")).unwrap().name(),
			"typescript"
		);
		assert!(language_for_path(Path::new("README.md")).is_none());
		assert!(language_for_path(Path::new("Makefile")).is_none());
	}

	#[test]
	fn test_registry_covers_all_names() {
		for name in [
			"rust",
			"javascript",
			"typescript",
			"python",
			"go",
			"cpp",
			"php",
			"bash",
			"ruby",
			"json",
		] {
			assert!(get_language(name).is_some(), "missing language: {}", name);
		}
		assert!(get_language("cobol").is_none());
	}
}
