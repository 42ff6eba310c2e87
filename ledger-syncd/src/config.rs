//! Process configuration.
//!
//! Flags and environment variables via clap; instance definitions live in
//! the YAML file named by `--config`.

use clap::{Parser, Subcommand};
use ledger_sync::{AkahuOptions, SyncDays, SyncRequest, SyncSettings};
use std::path::PathBuf;

/// Ledger Sync daemon
///
/// Keeps budget files on a ledger service in step with linked banks and Akahu.
#[derive(Parser, Debug, Clone)]
#[command(name = "ledger-syncd")]
#[command(about = "Bank feed synchronization for self-hosted budget ledgers")]
pub struct Args {
    /// Instance configuration file (YAML)
    #[arg(long, env = "LEDGER_SYNC_CONFIG", default_value = "ledger-sync.yaml")]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Directory for cursor state
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Budget refresh interval, overrides the config file
    #[arg(long, env = "SCAN_INTERVAL_SECS")]
    pub scan_interval_secs: Option<u64>,

    /// Runs allowed in parallel, overrides the config file
    #[arg(long, env = "MAX_CONCURRENT_RUNS")]
    pub max_concurrent_runs: Option<usize>,

    /// Per-request timeout, overrides the config file
    #[arg(long, env = "REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the scheduler until interrupted (default)
    Run,

    /// Validate every configured instance and exit
    Check,

    /// Sync linked bank accounts through the ledger service
    BankSync {
        /// Instance id or file name (default: all instances)
        #[arg(long)]
        instance: Option<String>,
    },

    /// Refresh budget figures
    BudgetSync {
        /// Instance id or file name (default: all instances)
        #[arg(long)]
        instance: Option<String>,
    },

    /// Sync transactions from Akahu
    AkahuSync {
        /// Instance id or file name (default: all instances)
        #[arg(long)]
        instance: Option<String>,

        /// Days to look back, or ALL
        #[arg(long, default_value = "20")]
        sync_days: String,

        /// Map Akahu category groups onto budget categories
        #[arg(long, default_value = "false")]
        sync_categories: bool,

        /// Stop paging once pages predate the last synced transaction
        #[arg(long, default_value = "false")]
        incremental: bool,
    },
}

impl Command {
    pub fn instance_filter(&self) -> Option<&str> {
        match self {
            Command::BankSync { instance }
            | Command::BudgetSync { instance }
            | Command::AkahuSync { instance, .. } => instance.as_deref(),
            Command::Run | Command::Check => None,
        }
    }

    /// The sync operation of a one-shot command.
    pub fn sync_request(&self) -> Option<SyncRequest> {
        match self {
            Command::BankSync { .. } => Some(SyncRequest::BankSync),
            Command::BudgetSync { .. } => Some(SyncRequest::BudgetSync),
            Command::AkahuSync { .. } => self.akahu_options().map(SyncRequest::AkahuBankSync),
            Command::Run | Command::Check => None,
        }
    }

    pub fn akahu_options(&self) -> Option<AkahuOptions> {
        match self {
            Command::AkahuSync {
                sync_days,
                sync_categories,
                incremental,
                ..
            } => Some(AkahuOptions {
                sync_days: SyncDays::parse_lenient(Some(sync_days)),
                sync_categories: *sync_categories,
                incremental: *incremental,
            }),
            _ => None,
        }
    }
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    /// Apply flag overrides on top of the file settings.
    pub fn apply(&self, settings: &mut SyncSettings) {
        if let Some(secs) = self.scan_interval_secs {
            settings.scan_interval_secs = secs;
        }
        if let Some(runs) = self.max_concurrent_runs {
            settings.max_concurrent_runs = runs;
        }
        if let Some(secs) = self.request_timeout_secs {
            settings.request_timeout_secs = secs;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.scan_interval_secs == Some(0) {
            return Err("SCAN_INTERVAL_SECS must be greater than zero".to_string());
        }
        if self.max_concurrent_runs == Some(0) {
            return Err("MAX_CONCURRENT_RUNS must be greater than zero".to_string());
        }
        if self.request_timeout_secs == Some(0) {
            return Err("REQUEST_TIMEOUT_SECS must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.data_dir.join("cursors.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["ledger-syncd"]);
        assert!(matches!(args.command(), Command::Run));
        assert_eq!(args.cursor_path(), PathBuf::from("./data/cursors.json"));
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_overrides_apply() {
        let args = Args::parse_from([
            "ledger-syncd",
            "--scan-interval-secs",
            "600",
            "--max-concurrent-runs",
            "2",
        ]);
        let mut settings = SyncSettings::default();
        args.apply(&mut settings);
        assert_eq!(settings.scan_interval_secs, 600);
        assert_eq!(settings.max_concurrent_runs, 2);
        assert_eq!(settings.request_timeout_secs, 30);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let args = Args::parse_from(["ledger-syncd", "--scan-interval-secs", "0"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_akahu_subcommand() {
        let args = Args::parse_from([
            "ledger-syncd",
            "akahu-sync",
            "--instance",
            "household",
            "--sync-days",
            "ALL",
            "--sync-categories",
        ]);
        let command = args.command();
        assert_eq!(command.instance_filter(), Some("household"));
        let options = command.akahu_options().unwrap();
        assert_eq!(options.sync_days, SyncDays::All);
        assert!(options.sync_categories);
        assert!(!options.incremental);
        assert!(matches!(
            command.sync_request(),
            Some(SyncRequest::AkahuBankSync(_))
        ));
        assert!(Command::Run.sync_request().is_none());
    }
}
