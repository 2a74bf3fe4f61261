//! Command line definition

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use consensus::Config;

/// Default lease file for the local backend
pub const DEFAULT_LEASE_FILE: &str = "/tmp/consensus-lease.json";

/// Default Lease object name for the Kubernetes backend
pub const DEFAULT_LEASE_NAME: &str = "consensus-worker-leader";

/// Run a leader election and do placeholder work while leader
#[derive(Parser, Debug)]
#[command(name = "consensus", version, about, long_about = None)]
pub struct Cli {
    /// Identity of this instance [default: POD_NAME, HOSTNAME, or a pid-based name]
    #[arg(long, global = true, env = "INSTANCE_ID")]
    pub identity: Option<String>,

    /// Seconds an unrenewed lease stays valid
    #[arg(long, global = true, default_value_t = 15)]
    pub lease_duration_secs: u64,

    /// Seconds between renewals while leader
    #[arg(long, global = true, default_value_t = 5)]
    pub renew_interval_secs: u64,

    /// Seconds between acquisition attempts while follower
    #[arg(long, global = true, default_value_t = 2)]
    pub retry_interval_secs: u64,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Backend selection
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Elect through a locked lease file on a shared filesystem
    File {
        /// Path to the lease record file
        #[arg(long, default_value = DEFAULT_LEASE_FILE)]
        path: PathBuf,
    },
    /// Elect through a Kubernetes Lease object (namespace from POD_NAMESPACE)
    Kubernetes {
        /// Name of the Lease object
        #[arg(long, default_value = DEFAULT_LEASE_NAME)]
        lease_name: String,
    },
}

impl Cli {
    /// Build the election configuration from the parsed flags
    pub fn config(&self) -> Config {
        Config::new(resolve_identity(self.identity.clone()))
            .with_lease_duration(Duration::from_secs(self.lease_duration_secs))
            .with_renew_interval(Duration::from_secs(self.renew_interval_secs))
            .with_retry_interval(Duration::from_secs(self.retry_interval_secs))
    }
}

/// Pick an identity: explicit flag, then `POD_NAME`, then `HOSTNAME`
fn resolve_identity(explicit: Option<String>) -> String {
    explicit
        .into_iter()
        .chain(["POD_NAME", "HOSTNAME"].iter().filter_map(|var| std::env::var(var).ok()))
        .find(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("consensus-{}", std::process::id()))
}
