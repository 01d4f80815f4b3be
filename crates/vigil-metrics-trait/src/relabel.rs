//! Relabel rules shared by scrape jobs and ServiceMonitor endpoints
//!
//! Both delivery modes discover pods in the workload namespace and keep only
//! those whose annotations and identity labels match the trait.

use crate::annotations::port_suffix;

/// Label carrying the logical cluster name on every scraped series
pub const CLUSTER_NAME_LABEL: &str = "verrazzano_cluster";

/// Pod label meta names for the OAM identity labels
const APP_LABEL_META: &str = "__meta_kubernetes_pod_label_app_oam_dev_name";
const COMPONENT_LABEL_META: &str = "__meta_kubernetes_pod_label_app_oam_dev_component";

/// Which pod annotations drive target selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnotationScheme {
    /// Controller-written `verrazzano.io/metrics*` annotations for a port index
    Managed {
        /// Port index; 0 selects the un-suffixed annotations
        port_index: usize,
    },
    /// `prometheus.io/*` annotations the WebLogic operator writes itself
    Prometheus,
}

impl AnnotationScheme {
    fn meta_labels(&self) -> (String, String, String) {
        match self {
            Self::Managed { port_index } => {
                let suffix = port_suffix(*port_index);
                (
                    format!("__meta_kubernetes_pod_annotation_verrazzano_io_metricsEnabled{suffix}"),
                    format!("__meta_kubernetes_pod_annotation_verrazzano_io_metricsPath{suffix}"),
                    format!("__meta_kubernetes_pod_annotation_verrazzano_io_metricsPort{suffix}"),
                )
            }
            Self::Prometheus => (
                "__meta_kubernetes_pod_annotation_prometheus_io_scrape".to_string(),
                "__meta_kubernetes_pod_annotation_prometheus_io_path".to_string(),
                "__meta_kubernetes_pod_annotation_prometheus_io_port".to_string(),
            ),
        }
    }
}

/// One relabel rule, independent of the document it ends up in
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelabelRule {
    /// Action (replace, keep, labelmap, labeldrop)
    pub action: &'static str,
    /// Source label names
    pub source_labels: Vec<String>,
    /// Regex
    pub regex: Option<String>,
    /// Replacement
    pub replacement: Option<String>,
    /// Target label
    pub target_label: Option<String>,
}

/// Inputs that vary per trait and port
#[derive(Clone, Debug)]
pub struct RelabelParams<'a> {
    /// Application identity label value
    pub app: &'a str,
    /// Component identity label value
    pub component: &'a str,
    /// Cluster name stamped on every series
    pub cluster_name: &'a str,
    /// Which annotations select and address targets
    pub scheme: AnnotationScheme,
    /// Whether to rewrite the metrics path from the path annotation
    pub path_from_annotation: bool,
}

/// Build the relabel chain for one scrape target
pub fn relabel_rules(params: &RelabelParams<'_>) -> Vec<RelabelRule> {
    let (enabled_meta, path_meta, port_meta) = params.scheme.meta_labels();
    let mut rules = vec![
        RelabelRule {
            action: "replace",
            replacement: Some(params.cluster_name.to_string()),
            target_label: Some(CLUSTER_NAME_LABEL.to_string()),
            ..Default::default()
        },
        RelabelRule {
            action: "keep",
            source_labels: vec![
                enabled_meta,
                APP_LABEL_META.to_string(),
                COMPONENT_LABEL_META.to_string(),
            ],
            regex: Some(format!("true;{};{}", params.app, params.component)),
            ..Default::default()
        },
    ];

    if params.path_from_annotation {
        rules.push(RelabelRule {
            action: "replace",
            source_labels: vec![path_meta],
            regex: Some("(.+)".to_string()),
            target_label: Some("__metrics_path__".to_string()),
            ..Default::default()
        });
    }

    rules.extend([
        RelabelRule {
            action: "replace",
            source_labels: vec!["__address__".to_string(), port_meta],
            regex: Some(r"([^:]+)(?::\d+)?;(\d+)".to_string()),
            replacement: Some("$1:$2".to_string()),
            target_label: Some("__address__".to_string()),
        },
        RelabelRule {
            action: "replace",
            source_labels: vec!["__meta_kubernetes_namespace".to_string()],
            regex: Some("(.*)".to_string()),
            replacement: Some("$1".to_string()),
            target_label: Some("namespace".to_string()),
        },
        RelabelRule {
            action: "labelmap",
            regex: Some("__meta_kubernetes_pod_label_(.+)".to_string()),
            ..Default::default()
        },
        RelabelRule {
            action: "replace",
            source_labels: vec!["__meta_kubernetes_pod_name".to_string()],
            target_label: Some("pod_name".to_string()),
            ..Default::default()
        },
        RelabelRule {
            action: "labeldrop",
            regex: Some("(controller_revision_hash)".to_string()),
            ..Default::default()
        },
        RelabelRule {
            action: "replace",
            source_labels: vec!["name".to_string()],
            regex: Some(".*/(.*)$".to_string()),
            replacement: Some("$1".to_string()),
            target_label: Some("webapp".to_string()),
        },
    ]);

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(scheme: AnnotationScheme) -> RelabelParams<'static> {
        RelabelParams {
            app: "app",
            component: "comp",
            cluster_name: "local",
            scheme,
            path_from_annotation: true,
        }
    }

    #[test]
    fn keep_rule_matches_identity_labels() {
        let rules = relabel_rules(&params(AnnotationScheme::Managed { port_index: 0 }));
        let keep = rules
            .iter()
            .find(|r| r.action == "keep")
            .expect("keep rule present");
        assert_eq!(keep.regex.as_deref(), Some("true;app;comp"));
        assert_eq!(
            keep.source_labels[0],
            "__meta_kubernetes_pod_annotation_verrazzano_io_metricsEnabled"
        );
    }

    #[test]
    fn port_index_selects_suffixed_annotations() {
        let rules = relabel_rules(&params(AnnotationScheme::Managed { port_index: 2 }));
        let address = rules
            .iter()
            .find(|r| r.target_label.as_deref() == Some("__address__"))
            .expect("address rule present");
        assert_eq!(
            address.source_labels[1],
            "__meta_kubernetes_pod_annotation_verrazzano_io_metricsPort2"
        );
    }

    #[test]
    fn prometheus_scheme_reads_prometheus_annotations() {
        let rules = relabel_rules(&params(AnnotationScheme::Prometheus));
        assert!(rules
            .iter()
            .flat_map(|r| r.source_labels.iter())
            .any(|l| l == "__meta_kubernetes_pod_annotation_prometheus_io_scrape"));
    }

    #[test]
    fn first_rule_stamps_cluster_name() {
        let rules = relabel_rules(&params(AnnotationScheme::Prometheus));
        assert_eq!(rules[0].target_label.as_deref(), Some(CLUSTER_NAME_LABEL));
        assert_eq!(rules[0].replacement.as_deref(), Some("local"));
    }

    #[test]
    fn path_rule_is_optional() {
        let mut p = params(AnnotationScheme::Managed { port_index: 0 });
        let with_path = relabel_rules(&p).len();
        p.path_from_annotation = false;
        let without_path = relabel_rules(&p);
        assert_eq!(with_path, without_path.len() + 1);
        assert!(!without_path
            .iter()
            .any(|r| r.target_label.as_deref() == Some("__metrics_path__")));
    }
}
