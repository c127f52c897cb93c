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

//! Bash language implementation for the chunker

use crate::chunker::languages::Language;

pub struct Bash {}

impl Language for Bash {
	fn name(&self) -> &'static str {
		"bash"
	}

	fn get_ts_language(&self) -> tree_sitter::Language {
		tree_sitter_bash::LANGUAGE.into()
	}

	fn function_kinds(&self) -> &'static [&'static str] {
		&["function_definition"]
	}

	fn class_kinds(&self) -> &'static [&'static str] {
		&[]
	}

	fn import_kinds(&self) -> &'static [&'static str] {
		&[]
	}

	fn file_extensions(&self) -> &'static [&'static str] {
		&["sh", "bash"]
	}
}
