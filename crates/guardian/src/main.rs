//! `supervisor`: crash-loop aware launcher for interactive shells.
//!
//! # Usage
//!
//! ```bash
//! # From the top of ~/.bashrc (see `supervisor-keeper install-hook`)
//! supervisor /bin/bash
//!
//! # Arguments after the interpreter are forwarded verbatim
//! supervisor /bin/zsh -l
//! ```
//!
//! On success this process is replaced by the interpreter (or the failsafe
//! shell), so its exit status is theirs. It only exits on its own when
//! nothing could be exec'd.

#![forbid(unsafe_code)]

use std::ffi::OsString;
use std::process::ExitCode;

use clap::Parser;
use guardian_core::config::{Config, resolve_config_path};
use guardian_core::logging::{LogConfig, init_logging};
use guardian_core::supervisor::{self, LaunchRequest};

/// Launch an interactive interpreter, diverting to a failsafe shell when it
/// keeps crashing.
#[derive(Parser, Debug)]
#[command(name = "supervisor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Interpreter to launch, followed by its arguments.
    #[arg(
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "INTERPRETER [ARGS]..."
    )]
    command: Vec<OsString>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&LogConfig::supervisor());

    let mut command = args.command.into_iter();
    let Some(program) = command.next() else {
        eprintln!("supervisor: no interpreter given");
        return ExitCode::from(2);
    };
    let request = LaunchRequest::new(program, command.collect());

    // A broken config must never block a session start
    let config = Config::load_or_default(&resolve_config_path(None));

    let code = supervisor::run(&config, &request);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
