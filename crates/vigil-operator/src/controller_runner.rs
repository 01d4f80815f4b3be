//! Controller runner - builds the MetricsTrait controller future

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use vigil_common::crd::MetricsTrait;
use vigil_metrics_trait::{error_policy, reconcile, Context, ControllerConfig};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the MetricsTrait controller future
///
/// The future completes once the controller has shut down on SIGTERM/SIGINT.
pub fn build_metrics_trait_controller(
    client: Client,
    config: ControllerConfig,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    tracing::info!(
        scraper = %config.scraper,
        reserved_namespaces = ?config.reserved_namespaces,
        "- MetricsTrait controller"
    );

    let traits: Api<MetricsTrait> = Api::all(client.clone());
    let ctx = Arc::new(Context::from_client(client, config));

    Box::pin(
        Controller::new(traits, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("MetricsTrait")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
