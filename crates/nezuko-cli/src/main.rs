use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nezuko::config::{default_config_path, CommandBook};
use nezuko::{sh, Error, ExitCodes, Proc, State, Template};
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::Level;

#[derive(Debug, Parser)]
#[command(name = "nezuko", version, about = "Run command templates and report how they exited")]
struct Cli {
	/// Command file (default: ~/.config/nezuko/nezuko.toml)
	#[arg(short, long, global = true)]
	config: Option<PathBuf>,

	/// Log launches and exits to stderr
	#[arg(short, long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
	/// List the commands in the command file
	List,
	/// Run a named command, appending any extra arguments
	Run {
		name: String,
		#[arg(trailing_var_arg = true, allow_hyphen_values = true)]
		args: Vec<String>,
	},
	/// Run an ad-hoc command with the current environment
	Exec {
		/// Exit codes that count as success, comma separated
		#[arg(long, value_delimiter = ',')]
		ok_exit: Vec<i32>,
		/// Print a JSON summary of the exit instead of failing on it
		#[arg(long)]
		json: bool,
		#[arg(last = true, required = true)]
		argv: Vec<String>,
	},
}

#[derive(Serialize)]
struct Summary {
	state: State,
	pid: i32,
	exit_code: i32,
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_max_level(level)
		.init();

	let code = match cli.command {
		Cmd::List => cmd_list(cli.config),
		Cmd::Run { name, args } => cmd_run(cli.config, &name, args).await,
		Cmd::Exec { ok_exit, json, argv } => cmd_exec(ok_exit, json, argv).await,
	};
	std::process::exit(code);
}

fn load_book(path: Option<PathBuf>) -> Result<CommandBook, i32> {
	let path = path.unwrap_or_else(default_config_path);
	CommandBook::load(&path).map_err(fail)
}

fn cmd_list(config: Option<PathBuf>) -> i32 {
	let book = match load_book(config) {
		Ok(book) => book,
		Err(code) => return code,
	};
	for name in book.names() {
		match book.template(name) {
			Ok(t) => println!("{}  {}", name.bold(), t.argv().join(" ").dimmed()),
			Err(e) => println!("{}  {}", name.bold(), e.to_string().red()),
		}
	}
	0
}

async fn cmd_run(config: Option<PathBuf>, name: &str, args: Vec<String>) -> i32 {
	let book = match load_book(config) {
		Ok(book) => book,
		Err(code) => return code,
	};
	let template = match book.template(name) {
		Ok(t) => Template::default_io().merge(&t.bake(args)),
		Err(e) => return fail(e),
	};
	match template.run().await {
		Ok(proc) => proc.exit_code_now(),
		Err(Error::FailureExitCode { cmdname, code, .. }) => {
			eprintln!("{} {} exited with {}", "error:".red().bold(), cmdname, code);
			code
		}
		Err(e) => fail(e),
	}
}

async fn cmd_exec(ok_exit: Vec<i32>, json: bool, argv: Vec<String>) -> i32 {
	let mut template = sh(argv).merge(&Template::default_io());
	if json {
		template = template.ok_exit(ExitCodes::any());
	} else if !ok_exit.is_empty() {
		template = template.ok_exit(ok_exit);
	}

	if !json {
		return match template.run().await {
			Ok(proc) => proc.exit_code_now(),
			Err(Error::FailureExitCode { cmdname, code, .. }) => {
				eprintln!("{} {} exited with {}", "error:".red().bold(), cmdname, code);
				code
			}
			Err(e) => fail(e),
		};
	}

	let proc = match template.start() {
		Ok(proc) => proc,
		Err(e) => return fail(e),
	};
	let exit_code = proc.exit_code().await;
	let summary = Summary {
		state: proc.state(),
		pid: proc.pid(),
		exit_code,
	};
	match serde_json::to_string(&summary) {
		Ok(line) => println!("{}", line),
		Err(e) => {
			eprintln!("{} {}", "error:".red().bold(), e);
			return 1;
		}
	}
	if proc.state() == State::Panicked {
		if let Some(err) = proc.error() {
			eprintln!("{} {}", "error:".red().bold(), err);
		}
		return 1;
	}
	0
}

fn fail(e: Error) -> i32 {
	eprintln!("{} {}", "error:".red().bold(), e);
	1
}
