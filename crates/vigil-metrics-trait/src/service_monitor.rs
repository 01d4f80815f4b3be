//! ServiceMonitor synthesis for operator-managed scrapers
//!
//! One ServiceMonitor per trait, in the workload namespace, with one endpoint
//! per resolved port.

use std::collections::BTreeMap;

use vigil_common::crd::{
    BasicAuth, Endpoint, LabelSelector, NamespaceSelector, PortSpec, RelabelConfig,
    SecretKeySelector, ServiceMonitor, ServiceMonitorSpec, TlsConfig,
};
use vigil_common::{LABEL_APP_NAME, LABEL_COMPONENT_NAME};

use crate::defaults::{effective_path, TraitDefaults};
use crate::relabel::{relabel_rules, AnnotationScheme, RelabelParams, RelabelRule};
use crate::scrape_config::istio_cert_files;

/// Label the Prometheus Operator instance selects ServiceMonitors by
pub const RELEASE_LABEL: (&str, &str) = ("release", "prometheus-operator");

/// Everything a ServiceMonitor depends on
#[derive(Clone, Debug)]
pub struct MonitorParams<'a> {
    /// Object name
    pub name: &'a str,
    /// Workload namespace
    pub namespace: &'a str,
    /// Application identity label value
    pub app: &'a str,
    /// Component identity label value
    pub component: &'a str,
    /// Cluster name stamped on series
    pub cluster_name: &'a str,
    /// Resolved ports, one endpoint each
    pub ports: &'a [PortSpec],
    /// Defaults for unset paths
    pub defaults: &'a TraitDefaults,
    /// Credentials secret in the workload namespace
    pub secret: Option<&'a str>,
    /// Scrape over Istio mTLS
    pub https: bool,
}

/// Build the desired ServiceMonitor
pub fn build_service_monitor(params: &MonitorParams<'_>) -> ServiceMonitor {
    let endpoints = params
        .ports
        .iter()
        .enumerate()
        .map(|(index, port)| build_endpoint(params, index, port))
        .collect();

    let mut monitor = ServiceMonitor::new(
        params.name,
        params.namespace,
        ServiceMonitorSpec {
            selector: LabelSelector {
                match_labels: BTreeMap::from([
                    (LABEL_APP_NAME.to_string(), params.app.to_string()),
                    (LABEL_COMPONENT_NAME.to_string(), params.component.to_string()),
                ]),
            },
            namespace_selector: NamespaceSelector {
                match_names: vec![params.namespace.to_string()],
            },
            endpoints,
        },
    );
    monitor.metadata.labels = Some(BTreeMap::from([(
        RELEASE_LABEL.0.to_string(),
        RELEASE_LABEL.1.to_string(),
    )]));
    monitor
}

fn build_endpoint(params: &MonitorParams<'_>, index: usize, port: &PortSpec) -> Endpoint {
    let basic_auth = params.secret.map(|secret| BasicAuth {
        username: secret_key(secret, "username"),
        password: secret_key(secret, "password"),
    });

    let tls_config = params.https.then(|| {
        let (ca_file, cert_file, key_file) = istio_cert_files();
        TlsConfig {
            ca_file: Some(ca_file),
            cert_file: Some(cert_file),
            key_file: Some(key_file),
            insecure_skip_verify: true,
        }
    });

    let relabelings = relabel_rules(&RelabelParams {
        app: params.app,
        component: params.component,
        cluster_name: params.cluster_name,
        scheme: AnnotationScheme::Managed { port_index: index },
        path_from_annotation: false,
    })
    .into_iter()
    .map(relabel_config)
    .collect();

    Endpoint {
        path: Some(effective_path(port, params.defaults).to_string()),
        scheme: Some(if params.https { "https" } else { "http" }.to_string()),
        basic_auth,
        tls_config,
        relabelings,
    }
}

fn secret_key(secret: &str, key: &str) -> SecretKeySelector {
    SecretKeySelector {
        name: secret.to_string(),
        key: key.to_string(),
        optional: Some(true),
    }
}

fn relabel_config(rule: RelabelRule) -> RelabelConfig {
    RelabelConfig {
        action: Some(rule.action.to_string()),
        source_labels: rule.source_labels,
        regex: rule.regex,
        replacement: rule.replacement,
        target_label: rule.target_label,
    }
}

/// True if the stored object already matches the desired one
pub fn is_up_to_date(existing: &ServiceMonitor, desired: &ServiceMonitor) -> bool {
    let labels_present = desired
        .metadata
        .labels
        .iter()
        .flatten()
        .all(|(k, v)| {
            existing
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(k))
                == Some(v)
        });
    labels_present && existing.spec == desired.spec
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> TraitDefaults {
        TraitDefaults {
            port: 8080,
            path: "/metrics".to_string(),
            secret: None,
            scraper: "monitoring/prometheus".to_string(),
        }
    }

    fn params<'a>(ports: &'a [PortSpec], defaults: &'a TraitDefaults) -> MonitorParams<'a> {
        MonitorParams {
            name: "app-ns-comp",
            namespace: "ns",
            app: "app",
            component: "comp",
            cluster_name: "local",
            ports,
            defaults,
            secret: None,
            https: false,
        }
    }

    #[test]
    fn one_endpoint_per_port() {
        let d = defaults();
        let ports = vec![
            PortSpec {
                port: Some(9000),
                path: Some("/a".to_string()),
            },
            PortSpec::default(),
        ];
        let sm = build_service_monitor(&params(&ports, &d));

        assert_eq!(sm.spec.endpoints.len(), 2);
        assert_eq!(sm.spec.endpoints[0].path.as_deref(), Some("/a"));
        assert_eq!(sm.spec.endpoints[1].path.as_deref(), Some("/metrics"));
        assert!(sm.spec.endpoints[1]
            .relabelings
            .iter()
            .flat_map(|r| r.source_labels.iter())
            .any(|l| l.ends_with("metricsEnabled1")));
    }

    #[test]
    fn selects_identity_labels_in_workload_namespace() {
        let d = defaults();
        let ports = [PortSpec::default()];
        let sm = build_service_monitor(&params(&ports, &d));

        assert_eq!(sm.metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(sm.spec.namespace_selector.match_names, vec!["ns"]);
        assert_eq!(sm.spec.selector.match_labels[LABEL_APP_NAME], "app");
        assert_eq!(sm.spec.selector.match_labels[LABEL_COMPONENT_NAME], "comp");
        assert_eq!(
            sm.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get("release"))
                .map(String::as_str),
            Some("prometheus-operator")
        );
    }

    #[test]
    fn secret_and_mesh_settings_apply_to_every_endpoint() {
        let d = defaults();
        let ports = [PortSpec::default(), PortSpec::default()];
        let mut p = params(&ports, &d);
        p.secret = Some("creds");
        p.https = true;
        let sm = build_service_monitor(&p);

        for endpoint in &sm.spec.endpoints {
            let auth = endpoint.basic_auth.as_ref().expect("basic auth set");
            assert_eq!(auth.username.name, "creds");
            assert_eq!(auth.username.key, "username");
            assert_eq!(auth.password.key, "password");
            assert_eq!(endpoint.scheme.as_deref(), Some("https"));
            assert!(endpoint
                .tls_config
                .as_ref()
                .is_some_and(|t| t.insecure_skip_verify));
        }
    }

    #[test]
    fn up_to_date_ignores_extra_labels() {
        let d = defaults();
        let ports = [PortSpec::default()];
        let desired = build_service_monitor(&params(&ports, &d));

        let mut existing = desired.clone();
        existing
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("extra".to_string(), "x".to_string());
        assert!(is_up_to_date(&existing, &desired));

        existing.spec.endpoints[0].path = Some("/other".to_string());
        assert!(!is_up_to_date(&existing, &desired));

        let mut unlabelled = desired.clone();
        unlabelled.metadata.labels = None;
        assert!(!is_up_to_date(&unlabelled, &desired));
    }
}
