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

//! Process memory observation used by the worker pool recycle policy and
//! the server's self-governance. Reads procfs on Linux; other platforms
//! report zero, which disables memory-based policies.

#[cfg(target_os = "linux")]
use std::fs;

/// Resident set size of the current process in bytes
pub fn current_rss_bytes() -> u64 {
	#[cfg(target_os = "linux")]
	{
		if let Ok(statm) = fs::read_to_string("/proc/self/statm") {
			if let Some(resident_pages) = statm.split_whitespace().nth(1) {
				if let Ok(pages) = resident_pages.parse::<u64>() {
					let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
					if page_size > 0 {
						return pages * page_size as u64;
					}
				}
			}
		}
		0
	}
	#[cfg(not(target_os = "linux"))]
	{
		0
	}
}

/// Total system RAM in bytes
pub fn total_memory_bytes() -> u64 {
	#[cfg(target_os = "linux")]
	{
		if let Ok(meminfo) = fs::read_to_string("/proc/meminfo") {
			for line in meminfo.lines() {
				if let Some(rest) = line.strip_prefix("MemTotal:") {
					if let Some(kb) = rest.split_whitespace().next() {
						if let Ok(kb) = kb.parse::<u64>() {
							return kb * 1024;
						}
					}
				}
			}
		}
		0
	}
	#[cfg(not(target_os = "linux"))]
	{
		0
	}
}

/// Check whether a process is still alive
pub fn process_alive(pid: u32) -> bool {
	unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	#[cfg(target_os = "linux")]
	fn test_rss_is_nonzero_on_linux() {
		assert!(current_rss_bytes() > 0);
		assert!(total_memory_bytes() > 0);
	}

	#[test]
	fn test_own_process_is_alive() {
		assert!(process_alive(std::process::id()));
	}
}
