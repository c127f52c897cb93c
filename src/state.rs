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

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Default)]
pub struct SyncState {
	pub root: PathBuf,
	pub processed_files: usize,
	pub indexed_files: usize,
	pub skipped_files: usize,
	pub total_files: usize,
	pub sync_complete: bool,
	pub status_message: String,
	pub quiet_mode: bool,
}

impl SyncState {
	/// Completion percentage for progress reporting, 0..=100
	pub fn progress_percent(&self) -> u8 {
		if self.sync_complete {
			return 100;
		}
		if self.total_files == 0 {
			return 0;
		}
		((self.processed_files * 100 / self.total_files).min(99)) as u8
	}
}

pub type SharedState = Arc<RwLock<SyncState>>;

pub fn create_shared_state() -> SharedState {
	Arc::new(RwLock::new(SyncState::default()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_progress_percent() {
		let state = create_shared_state();
		assert_eq!(state.read().progress_percent(), 0);

		{
			let mut guard = state.write();
			guard.total_files = 200;
			guard.processed_files = 50;
		}
		assert_eq!(state.read().progress_percent(), 25);

		// Never reports 100 until the sync is marked complete
		{
			let mut guard = state.write();
			guard.processed_files = 200;
		}
		assert_eq!(state.read().progress_percent(), 99);

		state.write().sync_complete = true;
		assert_eq!(state.read().progress_percent(), 100);
	}
}
