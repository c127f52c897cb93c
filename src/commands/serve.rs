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

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use osgrep::server;
use osgrep::Config;

#[derive(Args, Debug)]
pub struct ServeArgs {
	/// Port to bind on 127.0.0.1 (0 = pick a free port)
	#[arg(long)]
	pub port: Option<u16>,

	/// Exit when this process dies
	#[arg(long)]
	pub parent_pid: Option<u32>,

	/// Repository root to serve (defaults to the current directory)
	#[arg(long)]
	pub path: Option<PathBuf>,
}

pub async fn execute(config: Config, args: &ServeArgs) -> Result<()> {
	let root = match &args.path {
		Some(path) => path.canonicalize()?,
		None => std::env::current_dir()?,
	};

	let port = args.port.unwrap_or(config.server.port);
	server::run(config, root, port, args.parent_pid).await
}
