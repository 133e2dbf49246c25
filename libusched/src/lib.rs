// Copyright 2024 Google LLC
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

use std::{env, fs, io, path::PathBuf, sync::Mutex};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::{format::FmtSpan, writer::BoxMakeWriter};

mod admin;
mod client;
mod config;
mod consts;
mod daemon;
pub mod logic;
pub mod parse;
mod sec;
mod store;
mod user;

/// Command line surface of the usched tool. It lives in the library
/// so another front end can fill it in by hand rather than going
/// through clap; such a front end must also handle `version()`
/// itself, since clap's automatic version support doesn't reach
/// into a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        help = "Write logs to this file (without it, only the daemon logs, to stderr)"
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Log more detail; repeat for trace level",
    )]
    pub verbose: u8,

    #[clap(
        short,
        long,
        action,
        help = "Unix socket to serve on or connect to [default: <runtime dir>/usched.socket]"
    )]
    pub socket: Option<String>,

    #[clap(short, long, action, help = "Path to the bootstrap config toml")]
    pub config_file: Option<String>,

    #[clap(
        short,
        long,
        action,
        help = "Talk to a remote daemon at HOST:PORT instead of the local socket"
    )]
    pub remote: Option<String>,

    #[clap(short, long, action, help = "The remote username (requires --remote)")]
    pub user: Option<String>,

    #[clap(
        long,
        action,
        long_help = "A file holding the remote password

When --remote is given and this flag is not, the password is read
from the USCHED_PASSWORD environment variable."
    )]
    pub password_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that usched supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Starts running the scheduling daemon")]
    Daemon,

    #[clap(about = "Schedule a job, e.g.
usched run 'echo hi' in 10 seconds then every 5 seconds until to time 17:00:00")]
    Run {
        #[clap(
            trailing_var_arg = true,
            help = "The request sentence: a subject followed by time clauses"
        )]
        request: Vec<String>,
    },

    #[clap(about = "Cancel scheduled jobs by id, or 'all' for every job you own")]
    Stop {
        #[clap(trailing_var_arg = true, help = "Comma separated hex ids, or 'all'")]
        request: Vec<String>,
    },

    #[clap(about = "Show scheduled jobs by id, or 'all' for every job you own")]
    Show {
        #[clap(trailing_var_arg = true, help = "Comma separated hex ids, or 'all'")]
        request: Vec<String>,
    },

    #[clap(about = "Administer the daemon configuration store

Operations: add, delete, change, show, commit, rollback over the
categories auth, core, exec, ipc, network, stat and users.")]
    Admin {
        #[clap(trailing_var_arg = true, help = "e.g. 'show network' or 'commit users'")]
        args: Vec<String>,
    },
}

impl Args {
    /// True when the wrapping binary must print its version and
    /// exit instead of calling [`run`].
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Install the tracing subscriber. Client invocations stay silent
/// unless a log file was asked for; the daemon always logs.
fn init_logging(log_file: Option<&str>, is_daemon: bool, verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    let writer = match log_file {
        Some(path) => {
            let file =
                fs::File::create(path).with_context(|| format!("creating log file {path}"))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None if is_daemon => BoxMakeWriter::new(io::stderr),
        None => return Ok(()),
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .with_target(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(writer)
        .init();
    Ok(())
}

/// Where sockets, pid files and (by default) the pool snapshot and
/// config tree live: the session runtime dir when the system
/// provides one, a dot dir in $HOME otherwise.
fn runtime_dir() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = env::var("XDG_RUNTIME_DIR") {
        return Ok(PathBuf::from(dir).join("usched"));
    }
    let home = env::var("HOME").context("neither XDG_RUNTIME_DIR nor HOME is set")?;
    Ok(PathBuf::from(home).join(".usched"))
}

/// Run the usched tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let is_daemon = matches!(args.command, Commands::Daemon);
    init_logging(args.log_file.as_deref(), is_daemon, args.verbose)?;

    let runtime_dir = runtime_dir()?;
    let socket = match &args.socket {
        Some(s) => PathBuf::from(s),
        None => runtime_dir.join(consts::SOCKET_FILE),
    };

    let config = config::read_config(&args.config_file)?;

    let res: anyhow::Result<()> = match &args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Daemon => daemon::run(config, runtime_dir, socket),
        Commands::Run { request } => client_request(&args, &config, socket, "run", request),
        Commands::Stop { request } => client_request(&args, &config, socket, "stop", request),
        Commands::Show { request } => client_request(&args, &config, socket, "show", request),
        Commands::Admin { args: admin_args } => {
            let config_base = config
                .config_base
                .clone()
                .map(PathBuf::from)
                .unwrap_or_else(|| runtime_dir.join("etc"));
            admin::run(config_base, runtime_dir, admin_args.clone())
        }
    };

    match res {
        Ok(()) => Ok(()),
        Err(err) => {
            error!("{err:?}");
            eprintln!("usched: {err}");
            std::process::exit(1);
        }
    }
}

/// Stitch the subcommand name back onto the sentence and hand the
/// whole request to the client.
fn client_request(
    args: &Args,
    config: &config::Config,
    socket: PathBuf,
    op: &str,
    request: &[String],
) -> anyhow::Result<()> {
    let mut tokens = Vec::with_capacity(request.len() + 1);
    tokens.push(String::from(op));
    tokens.extend_from_slice(request);

    let remote = args.remote.clone();
    let username = args.user.clone();
    let password_file = args.password_file.clone();
    let default_port = config.tcp_port();

    client::request(&tokens, move || match remote {
        Some(hostport) => {
            let (host, port) = match hostport.rsplit_once(':') {
                Some((host, port)) => {
                    (String::from(host), port.parse::<u16>().context("parsing remote port")?)
                }
                None => (hostport.clone(), default_port),
            };
            let username = username.ok_or_else(|| anyhow!("--remote requires --user"))?;
            let password = match password_file {
                Some(path) => fs::read_to_string(path)
                    .context("reading password file")?
                    .trim_end_matches('\n')
                    .to_string(),
                None => env::var("USCHED_PASSWORD")
                    .context("--remote needs --password-file or USCHED_PASSWORD")?,
            };
            client::Client::connect_remote(&host, port, &username, &password)
        }
        None => client::Client::connect_local(&socket),
    })
}
