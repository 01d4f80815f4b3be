//! CRD installation utilities
//!
//! The operator installs its own CRD on startup using server-side apply, so
//! the schema always matches the operator version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use vigil_common::crd::MetricsTrait;
use vigil_metrics_trait::FIELD_MANAGER;

/// Name of the MetricsTrait CRD
const METRICS_TRAIT_CRD: &str = "metricstraits.oam.verrazzano.io";

/// Ensure the MetricsTrait CRD is installed
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing MetricsTrait CRD...");
    crds.patch(
        METRICS_TRAIT_CRD,
        &params,
        &Patch::Apply(&MetricsTrait::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install MetricsTrait CRD: {}", e))?;

    tracing::info!("MetricsTrait CRD installed/updated");
    Ok(())
}

/// MetricsTrait CRD rendered as YAML
pub fn crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&MetricsTrait::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))
}
