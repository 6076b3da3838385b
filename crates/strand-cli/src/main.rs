//! Strand CLI
//!
//! Small demonstrations of the strand runtime: a TCP echo server and a
//! fan-out throughput check.

mod commands;
mod logger;

use clap::{Parser, Subcommand};
use logger::LogLevel;
use std::time::Duration;
use strand_core::RuntimeOptions;

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Strand task runtime demos", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Worker threads (default: STRAND_WORKER_THREADS, then one per CPU)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a TCP echo server
    Echo {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to bind
        #[arg(short, long, default_value_t = 7070)]
        port: u16,
        /// Stop accepting after this many connections
        #[arg(long)]
        max_connections: Option<usize>,
    },

    /// Spawn many tasks and collect their results
    Fanout {
        /// Tasks to spawn
        #[arg(short, long, default_value_t = 10_000)]
        tasks: usize,
        /// Times each task yields before reporting
        #[arg(short, long, default_value_t = 0)]
        yields: usize,
        /// Give up after this many milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger::init(cli.log_level);

    let mut options = RuntimeOptions::from_env()?;
    if let Some(workers) = cli.workers {
        options.worker_count = workers;
    }

    match cli.command {
        Commands::Echo {
            host,
            port,
            max_connections,
        } => commands::echo::execute(options, host, port, max_connections),

        Commands::Fanout {
            tasks,
            yields,
            timeout_ms,
        } => commands::fanout::execute(
            options,
            tasks,
            yields,
            Duration::from_millis(timeout_ms),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fanout() {
        let cli = Cli::parse_from(["strand", "--workers", "3", "fanout", "--tasks", "50"]);
        assert_eq!(cli.workers, Some(3));
        assert_eq!(cli.log_level, LogLevel::Info);
        match cli.command {
            Commands::Fanout {
                tasks,
                yields,
                timeout_ms,
            } => {
                assert_eq!(tasks, 50);
                assert_eq!(yields, 0);
                assert_eq!(timeout_ms, 30_000);
            }
            Commands::Echo { .. } => panic!("expected fanout"),
        }
    }

    #[test]
    fn test_parse_echo_with_global_flags_after() {
        let cli = Cli::parse_from([
            "strand",
            "echo",
            "--port",
            "0",
            "--max-connections",
            "1",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert!(matches!(
            cli.command,
            Commands::Echo {
                port: 0,
                max_connections: Some(1),
                ..
            }
        ));
    }

    #[test]
    fn test_fanout_small_run() {
        let options = RuntimeOptions {
            worker_count: 2,
            ..Default::default()
        };
        commands::fanout::execute(options, 200, 2, Duration::from_secs(10)).unwrap();
    }
}
