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

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use tracing_subscriber::EnvFilter;

use osgrep::config::Config;

mod commands;

#[derive(Parser)]
#[command(name = "osgrep")]
#[command(version)]
#[command(about = "Offline semantic code search")]
#[command(args_conflicts_with_subcommands = true)]
struct OsgrepArgs {
	#[command(subcommand)]
	command: Option<Commands>,

	/// Default command: search the current repository
	#[command(flatten)]
	search: commands::SearchArgs,
}

#[derive(Subcommand)]
enum Commands {
	/// Search the codebase with a natural language query
	Search(commands::SearchArgs),

	/// Index the repository (incremental; use --dry-run to preview)
	Index(commands::IndexArgs),

	/// Run the watcher/server over local HTTP
	Serve(commands::ServeArgs),

	/// Download model weights so the first search is fast
	Setup(commands::SetupArgs),

	/// Print environment and index diagnostics
	Doctor(commands::DoctorArgs),

	/// List known index stores
	List(commands::ListArgs),

	/// Generate shell completion scripts
	Completion {
		/// The shell to generate completion for
		#[arg(value_enum)]
		shell: Shell,
	},
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
	let args = OsgrepArgs::parse();

	// The server logs to a rolling file; everything else to stderr
	let _log_guard = match &args.command {
		Some(Commands::Serve(_)) => {
			let logs_dir = osgrep::storage::data_dir()?.join("logs");
			let appender = tracing_appender::rolling::daily(logs_dir, "server.log");
			let (writer, guard) = tracing_appender::non_blocking(appender);
			tracing_subscriber::fmt()
				.with_env_filter(EnvFilter::from_default_env())
				.with_writer(writer)
				.with_ansi(false)
				.init();
			Some(guard)
		}
		_ => {
			tracing_subscriber::fmt()
				.with_env_filter(EnvFilter::from_default_env())
				.with_writer(std::io::stderr)
				.init();
			None
		}
	};

	let config = Config::load()?;

	match args.command {
		Some(Commands::Search(search_args)) => {
			commands::search::execute(&config, &search_args).await
		}
		Some(Commands::Index(index_args)) => commands::index::execute(&config, &index_args).await,
		Some(Commands::Serve(serve_args)) => commands::serve::execute(config, &serve_args).await,
		Some(Commands::Setup(setup_args)) => commands::setup::execute(&config, &setup_args).await,
		Some(Commands::Doctor(doctor_args)) => {
			commands::doctor::execute(&config, &doctor_args).await
		}
		Some(Commands::List(list_args)) => commands::list::execute(&list_args).await,
		Some(Commands::Completion { shell }) => {
			let mut app = OsgrepArgs::command();
			let name = app.get_name().to_string();
			generate(shell, &mut app, name, &mut std::io::stdout());
			Ok(())
		}
		None => {
			// Bare `osgrep <pattern>` is a search
			if args.search.pattern.is_none() {
				OsgrepArgs::command().print_help()?;
				return Ok(());
			}
			commands::search::execute(&config, &args.search).await
		}
	}
}
