//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::clients::GitSourceConfig;
use crate::controller::{ConnectivityPolicy, ControllerConfig};
use crate::store::StoreConfig;

/// fleetcd - GitOps controller for Omni machine classes and clusters
#[derive(Parser, Debug, Clone)]
#[command(name = "fleetcd", version, about)]
pub struct Args {
    /// Omni endpoint, shown to observers; omnictl reads its own credentials
    #[arg(long, env = "OMNI_ENDPOINT", default_value = "")]
    pub omni_endpoint: String,

    /// Repository holding the declarations
    #[arg(long, env = "GIT_REPO")]
    pub git_repo: String,

    #[arg(long, env = "GIT_BRANCH", default_value = "main")]
    pub git_branch: String,

    /// Token for HTTPS clones
    #[arg(long, env = "GIT_TOKEN", hide_env_values = true)]
    pub git_token: Option<String>,

    /// Seconds between soft reconciles (timer restarts after each cycle)
    #[arg(long, env = "REFRESH_INTERVAL", default_value = "300", value_parser = clap::value_parser!(u64).range(1..))]
    pub refresh_interval: u64,

    /// Seconds between hard reconciles
    #[arg(long, env = "SYNC_INTERVAL", default_value = "3600", value_parser = clap::value_parser!(u64).range(1..))]
    pub sync_interval: u64,

    /// Machine class directory inside the repository
    #[arg(long, env = "MC_PATH", default_value = "machine-classes")]
    pub mc_path: String,

    /// Cluster bundle directory inside the repository
    #[arg(long, env = "CLUSTERS_PATH", default_value = "clusters")]
    pub clusters_path: String,

    /// Initial cluster sync state; a persisted value takes precedence
    #[arg(long, env = "CLUSTERS_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub clusters_enabled: bool,

    #[arg(long, env = "STATE_FILE", default_value = "/data/omni-cd-state.json")]
    pub state_file: PathBuf,

    /// Checkout directory, recreated on every sync
    #[arg(long, env = "WORK_DIR", default_value = "/tmp/repo")]
    pub work_dir: PathBuf,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log entries kept for observers
    #[arg(long, env = "MAX_LOGS", default_value = "500")]
    pub max_logs: usize,

    #[arg(long, env = "CONNECTIVITY_POLICY", value_enum, default_value = "skip-cycle")]
    pub connectivity_policy: ConnectivityPolicy,

    /// Seconds between cluster readiness polls
    #[arg(long, env = "READINESS_INTERVAL", default_value = "5", value_parser = clap::value_parser!(u64).range(1..))]
    pub readiness_interval: u64,

    /// omnictl binary
    #[arg(long, env = "OMNICTL", default_value = "omnictl")]
    pub omnictl: String,
}

impl Args {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            omni_endpoint: self.omni_endpoint.clone(),
            clusters_enabled: self.clusters_enabled,
            max_logs: self.max_logs,
            state_file: Some(self.state_file.clone()),
        }
    }

    pub fn git_config(&self) -> GitSourceConfig {
        GitSourceConfig {
            repo: self.git_repo.clone(),
            branch: self.git_branch.clone(),
            token: self.git_token.clone().filter(|t| !t.is_empty()),
            work_dir: self.work_dir.clone(),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            mc_path: self.mc_path.clone(),
            clusters_path: self.clusters_path.clone(),
            connectivity_policy: self.connectivity_policy,
            refresh_interval: Duration::from_secs(self.refresh_interval),
            sync_interval: Duration::from_secs(self.sync_interval),
            readiness_interval: Duration::from_secs(self.readiness_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["fleetcd", "--git-repo", "https://example.com/fleet.git"]);
        assert_eq!(args.git_branch, "main");
        assert_eq!(args.mc_path, "machine-classes");
        assert!(args.clusters_enabled);
        assert_eq!(args.connectivity_policy, ConnectivityPolicy::SkipCycle);

        let controller = args.controller_config();
        assert_eq!(controller.refresh_interval, Duration::from_secs(300));
        assert_eq!(controller.sync_interval, Duration::from_secs(3600));
        assert_eq!(args.store_config().max_logs, 500);
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "fleetcd",
            "--git-repo",
            "https://example.com/fleet.git",
            "--git-token",
            "",
            "--clusters-enabled",
            "false",
            "--connectivity-policy",
            "advisory",
            "--refresh-interval",
            "30",
        ]);
        assert!(!args.clusters_enabled);
        assert_eq!(args.connectivity_policy, ConnectivityPolicy::Advisory);
        assert_eq!(args.controller_config().refresh_interval, Duration::from_secs(30));
        assert_eq!(args.git_config().token, None);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let result = Args::try_parse_from([
            "fleetcd",
            "--git-repo",
            "r",
            "--sync-interval",
            "0",
        ]);
        assert!(result.is_err());
    }
}
