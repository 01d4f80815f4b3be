//! Operator configuration
//!
//! Every flag can also be set through the environment so the operator can be
//! configured from a Deployment manifest without changing its arguments.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};

use vigil_common::telemetry::TelemetryConfig;
use vigil_common::{
    LEGACY_SCRAPER, REQUEUE_ERROR_SECS, REQUEUE_SUCCESS_MAX_SECS, REQUEUE_SUCCESS_MIN_SECS,
};
use vigil_metrics_trait::ControllerConfig;

/// vigil - keeps MetricsTraits in sync with metrics scraping
#[derive(Parser, Debug)]
#[command(name = "vigil", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Scraper (`namespace/name`) used by traits that do not name one
    #[arg(long, env = "VIGIL_SCRAPER", default_value = LEGACY_SCRAPER)]
    pub scraper: String,

    /// Namespace whose traits are never reconciled (repeatable)
    #[arg(
        long = "reserved-namespace",
        env = "VIGIL_RESERVED_NAMESPACES",
        value_delimiter = ',',
        default_value = "kube-system"
    )]
    pub reserved_namespaces: Vec<String>,

    /// Seconds to wait before retrying a failed reconcile
    #[arg(long, env = "VIGIL_ERROR_REQUEUE_SECS", default_value_t = REQUEUE_ERROR_SECS)]
    pub error_requeue_secs: u64,

    /// Path to a kubeconfig; in-cluster configuration is inferred otherwise
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(
        long,
        env = "VIGIL_JSON_LOGS",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub json_logs: bool,

    #[allow(missing_docs)]
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operator modes
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the MetricsTrait controller (default mode)
    Controller,
    /// Print the MetricsTrait CRD manifest and exit
    Crd,
}

impl OperatorConfig {
    /// Selected mode, defaulting to the controller
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Controller)
    }

    /// Settings handed to the reconciler
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            scraper: self.scraper.clone(),
            reserved_namespaces: self
                .reserved_namespaces
                .iter()
                .map(|ns| ns.trim().to_string())
                .filter(|ns| !ns.is_empty())
                .collect(),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
            success_requeue_min_secs: REQUEUE_SUCCESS_MIN_SECS,
            success_requeue_max_secs: REQUEUE_SUCCESS_MAX_SECS,
        }
    }

    /// Logging settings
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "vigil-operator".to_string(),
            json: self.json_logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> OperatorConfig {
        OperatorConfig::try_parse_from(std::iter::once("vigil").chain(args.iter().copied()))
            .expect("arguments should parse")
    }

    #[test]
    fn defaults_match_controller_defaults() {
        let config = parse(&[]);
        assert_eq!(config.command(), Command::Controller);
        assert!(config.json_logs);
        assert_eq!(config.controller_config(), ControllerConfig::default());
    }

    #[test]
    fn reserved_namespaces_accept_lists_and_repeats() {
        let config = parse(&[
            "--reserved-namespace",
            "kube-system,istio-system",
            "--reserved-namespace",
            "cattle-system",
        ]);
        let controller = config.controller_config();
        assert_eq!(
            controller.reserved_namespaces,
            vec!["kube-system", "istio-system", "cattle-system"]
        );
    }

    #[test]
    fn overrides_flow_into_controller_config() {
        let config = parse(&[
            "--scraper",
            "monitoring/prometheus",
            "--error-requeue-secs",
            "12",
            "--json-logs",
            "false",
            "crd",
        ]);
        assert_eq!(config.command(), Command::Crd);
        assert!(!config.telemetry_config().json);

        let controller = config.controller_config();
        assert_eq!(controller.scraper, "monitoring/prometheus");
        assert_eq!(controller.error_requeue, Duration::from_secs(12));
    }
}
