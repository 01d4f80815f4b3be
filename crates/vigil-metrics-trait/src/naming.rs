//! Deterministic scrape job and ServiceMonitor names
//!
//! Names are derived only from the trait's identity labels, its namespace,
//! the managed cluster name and the port index, so every reconcile of the
//! same trait computes the same names.

use kube::ResourceExt;

use vigil_common::crd::MetricsTrait;
use vigil_common::Error;

/// Kubernetes name length limit that job names also respect
pub const MAX_NAME_LEN: usize = 63;

/// Scrape job name: `{app}[_{cluster}]_{namespace}_{component}[_{index}]`.
///
/// The cluster segment is present only on managed clusters and the index
/// suffix only for ports after the first. Names over the limit drop the
/// component segment first, then are cut to [`MAX_NAME_LEN`] without a
/// trailing separator.
pub fn job_name(
    metrics_trait: &MetricsTrait,
    cluster: Option<&str>,
    port_index: usize,
) -> Result<String, Error> {
    let trait_name = metrics_trait.name_any();
    let app = required_label(metrics_trait.app_name(), &trait_name, "application name")?;
    let component = required_label(
        metrics_trait.component_name(),
        &trait_name,
        "component name",
    )?;
    let namespace = metrics_trait.namespace().unwrap_or_default();

    let prefix = match cluster {
        Some(cluster) => format!("{app}_{cluster}_{namespace}"),
        None => format!("{app}_{namespace}"),
    };
    let suffix = if port_index > 0 {
        format!("_{port_index}")
    } else {
        String::new()
    };

    let full = format!("{prefix}_{component}{suffix}");
    if full.len() <= MAX_NAME_LEN {
        return Ok(full);
    }

    let shortened: String = format!("{prefix}{suffix}")
        .chars()
        .take(MAX_NAME_LEN)
        .collect();
    Ok(shortened.trim_end_matches(['_', '-']).to_string())
}

/// ServiceMonitor name: the index 0 job name with hyphens for underscores.
///
/// One ServiceMonitor covers every port of the trait.
pub fn service_monitor_name(
    metrics_trait: &MetricsTrait,
    cluster: Option<&str>,
) -> Result<String, Error> {
    Ok(job_name(metrics_trait, cluster, 0)?.replace('_', "-"))
}

fn required_label<'a>(
    value: Option<&'a str>,
    trait_name: &str,
    what: &str,
) -> Result<&'a str, Error> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::validation_for(
            trait_name,
            format!("metrics trait missing {what} label"),
        )),
    }
}
