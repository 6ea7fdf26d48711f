//! CLI surface for the `tm` binary: the two child-process roles of a
//! pool. The host side is the library API; there is no host subcommand.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::{ArgAction, Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::config::{self, DaemonOptions};
use crate::dispatcher::{self, DispatcherConfig};
use crate::serial;
use crate::transport::{DialUrl, TransportError};
use crate::worker::{self, BuiltinExecutor, WorkerConfig};
use crate::Result;

#[derive(Parser, Debug)]
#[command(
    name = "tm",
    version,
    about = "taskmill worker-pool runtime",
    infer_subcommands = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// More logging (-v, -vv).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Errors only.
    #[arg(
        short = 'q',
        long,
        global = true,
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve tasks: dial in to a pool and run its payloads.
    Worker(WorkerArgs),
    /// Mediate a pool: queue tasks and match them to idle daemons.
    Dispatch(DispatchArgs),
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Pool or dispatcher endpoint to dial.
    #[arg(long, value_name = "URL")]
    pub url: String,

    /// The endpoint is a dispatcher, not a direct pool socket.
    #[arg(long, default_value_t = false, num_args = 0..=1,
          default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub dispatcher: bool,

    /// Stable daemon id reported in pool events.
    #[arg(long, value_name = "ID")]
    pub id: Option<u32>,

    /// Assigned RNG stream, `s1,s2,s3,s4,s5,s6`.
    #[arg(long = "rng-seed", value_name = "SEED")]
    pub rng_seed: Option<String>,

    /// PEM file with the pool certificate to trust (tls pools).
    #[arg(long = "tls-ca", value_name = "FILE")]
    pub tls_ca: Option<PathBuf>,

    /// Capability preloaded before serving (repeatable).
    #[arg(long, value_name = "NAME")]
    pub preload: Vec<String>,

    /// Tag reported by the builtin executor (defaults to the pid).
    #[arg(long, value_name = "TAG")]
    pub tag: Option<String>,

    /// Dial without blocking on connection success.
    #[arg(long, default_value_t = false, num_args = 0..=1,
          default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub asyncdial: bool,

    /// Exit on pipe drop; `false` survives host shutdown.
    #[arg(long, default_value_t = true, num_args = 0..=1,
          default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub autoexit: bool,

    /// Free per-task state between tasks.
    #[arg(long, default_value_t = true, num_args = 0..=1,
          default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub cleanup: bool,

    /// Keep stdout/stderr attached instead of discarding.
    #[arg(long, default_value_t = false, num_args = 0..=1,
          default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub output: bool,

    /// Exit after handling this many tasks.
    #[arg(long, value_name = "N")]
    pub maxtasks: Option<u64>,

    /// Exit after this idle duration (ms).
    #[arg(long, value_name = "MS")]
    pub idletime: Option<u64>,

    /// Exit after this wall-clock duration (ms).
    #[arg(long, value_name = "MS")]
    pub walltime: Option<u64>,
}

#[derive(Args, Debug)]
pub struct DispatchArgs {
    /// The pool's control socket (the host listens here).
    #[arg(long = "host-url", value_name = "URL")]
    pub host_url: String,

    /// Where daemons dial in; defaults to a process-local endpoint.
    #[arg(long = "daemon-url", value_name = "URL")]
    pub daemon_url: Option<String>,

    /// Requeue a crashed daemon's task for the next daemon.
    #[arg(long, default_value_t = false, num_args = 0..=1,
          default_missing_value = "true", value_parser = BoolishValueParser::new())]
    pub retry: bool,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Worker(_) => "worker",
        Command::Dispatch(_) => "dispatch",
    }
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Worker(args) => run_worker(args),
        Command::Dispatch(args) => run_dispatch(args),
    }
}

fn run_worker(args: WorkerArgs) -> Result<()> {
    let config = config::load_or_default();
    let url = DialUrl::parse(&args.url).map_err(TransportError::from)?;
    let rng_seed = args.rng_seed.as_deref().map(str::parse).transpose()?;
    let tls_anchor_pem = args.tls_ca.map(std::fs::read_to_string).transpose()?;

    let worker_config = WorkerConfig {
        url,
        dispatcher: args.dispatcher,
        daemon_id: args.id,
        rng_seed,
        tls_anchor_pem,
        options: DaemonOptions {
            asyncdial: args.asyncdial,
            autoexit: args.autoexit,
            cleanup: args.cleanup,
            output: args.output,
            maxtasks: args.maxtasks,
            idletime: args.idletime,
            walltime: args.walltime,
        },
        preload: args.preload,
        limits: config.limits,
    };

    let executor = match args.tag {
        Some(tag) => BuiltinExecutor::with_tag(tag),
        None => BuiltinExecutor::new(),
    };
    let registry = serial::Registry::new();
    let exit = worker::run(worker_config, executor, &registry)?;
    tracing::info!(?exit, "worker stopped");
    Ok(())
}

fn run_dispatch(args: DispatchArgs) -> Result<()> {
    let config = config::load_or_default();
    let host_url = DialUrl::parse(&args.host_url).map_err(TransportError::from)?;
    let daemon_url = args
        .daemon_url
        .as_deref()
        .map(DialUrl::parse)
        .transpose()
        .map_err(TransportError::from)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));

    dispatcher::run(
        DispatcherConfig {
            host_url,
            daemon_url,
            retry: args.retry,
            limits: config.limits,
        },
        shutdown,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_argv_parses_the_launcher_encoding() {
        let cli = parse_from([
            "tm",
            "worker",
            "--url",
            "tcp://127.0.0.1:5555",
            "--dispatcher",
            "--id",
            "2",
            "--rng-seed",
            "1,2,3,4,5,6",
            "--autoexit",
            "false",
            "--cleanup",
            "true",
            "--maxtasks",
            "8",
            "--preload",
            "compress",
        ]);
        let Command::Worker(args) = cli.command else {
            panic!("expected worker subcommand");
        };
        assert!(args.dispatcher);
        assert_eq!(args.id, Some(2));
        assert_eq!(args.rng_seed.as_deref(), Some("1,2,3,4,5,6"));
        assert!(!args.autoexit);
        assert!(args.cleanup);
        assert_eq!(args.maxtasks, Some(8));
        assert_eq!(args.preload, vec!["compress".to_string()]);
    }

    #[test]
    fn dispatch_argv_parses() {
        let cli = parse_from([
            "tm",
            "dispatch",
            "--host-url",
            "abstract://pool-ctl",
            "--retry",
            "true",
        ]);
        let Command::Dispatch(args) = cli.command else {
            panic!("expected dispatch subcommand");
        };
        assert_eq!(args.host_url, "abstract://pool-ctl");
        assert!(args.daemon_url.is_none());
        assert!(args.retry);
    }
}
