//! Command-line argument parsing for shell-query.

use crate::config::Config;
use crate::error::{Result, ShellQueryError};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Runs ad-hoc SQL on the remote engine through a durable job queue.
#[derive(Parser, Debug)]
#[command(name = "shell-query")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// State database path
    #[arg(long, global = true, value_name = "PATH")]
    pub state_db: Option<PathBuf>,

    /// Log to a file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Process queued execute and poll jobs
    Worker {
        /// Exit once no job is due
        #[arg(long)]
        once: bool,

        /// Use an in-memory engine instead of the gateway
        #[arg(long)]
        mock_engine: bool,

        /// Number of concurrent job loops (overrides config)
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,
    },

    /// Create a run and enqueue it for execution
    Submit {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        user: String,

        /// Business unit id
        #[arg(long)]
        mid: String,

        /// Enterprise id
        #[arg(long)]
        eid: Option<String>,

        /// SQL text, or @path to read it from a file
        #[arg(long, value_name = "SQL|@FILE")]
        sql: String,

        /// Customer key of an existing destination to write into
        #[arg(long, value_name = "KEY")]
        target: Option<String>,

        /// JSON file of field definitions keyed by table name
        #[arg(long, value_name = "PATH")]
        table_metadata: Option<PathBuf>,
    },

    /// Show a run and its latest status event
    Status {
        run_id: String,

        /// Also print every status event published for the run
        #[arg(long)]
        events: bool,
    },

    /// Mark a run canceled; the worker cleans up on its next poll
    Cancel { run_id: String },
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    /// Applies command-line overrides to a loaded config.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(path) = &self.state_db {
            config.worker.state_db = Some(path.clone());
        }
        if let Command::Worker {
            concurrency: Some(n),
            ..
        } = &self.command
        {
            config.worker.concurrency = *n;
        }
    }
}

/// Resolves a `--sql` argument: `@path` reads the file, anything else is the
/// SQL itself.
pub fn read_sql_arg(arg: &str) -> Result<String> {
    let sql = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| ShellQueryError::input(format!("Failed to read SQL file '{path}': {e}")))?,
        None => arg.to_string(),
    };
    if sql.trim().is_empty() {
        return Err(ShellQueryError::input("SQL text is empty"));
    }
    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_worker() {
        let cli = Cli::parse_from(["shell-query", "worker", "--once", "--mock-engine"]);
        assert_eq!(
            cli.command,
            Command::Worker {
                once: true,
                mock_engine: true,
                concurrency: None,
            }
        );
    }

    #[test]
    fn test_parse_submit_with_globals_after_subcommand() {
        let cli = Cli::parse_from([
            "shell-query",
            "submit",
            "--tenant",
            "t",
            "--user",
            "u",
            "--mid",
            "100",
            "--sql",
            "SELECT 1",
            "--target",
            "Target",
            "--state-db",
            "/tmp/state.db",
        ]);
        assert_eq!(cli.state_db, Some(PathBuf::from("/tmp/state.db")));
        match cli.command {
            Command::Submit { mid, target, .. } => {
                assert_eq!(mid, "100");
                assert_eq!(target.as_deref(), Some("Target"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "shell-query",
            "--state-db",
            "/tmp/x.db",
            "worker",
            "--concurrency",
            "8",
        ]);
        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.worker.state_db, Some(PathBuf::from("/tmp/x.db")));
        assert_eq!(config.worker.concurrency, 8);
    }

    #[test]
    fn test_read_sql_arg() {
        assert_eq!(read_sql_arg("SELECT 1").unwrap(), "SELECT 1");
        assert!(read_sql_arg("   ").is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "SELECT Email FROM Customers").unwrap();
        let arg = format!("@{}", file.path().display());
        assert_eq!(read_sql_arg(&arg).unwrap(), "SELECT Email FROM Customers");
    }
}
