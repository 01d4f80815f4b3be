//! Scrape target annotation and label mutation
//!
//! Pure functions over string maps. The caller decides where the maps live
//! (pod template or pod metadata) and whether to write them back.

use std::collections::BTreeMap;

use vigil_common::crd::{MetricsTrait, PortSpec};
use vigil_common::{
    LABEL_APP_NAME, LABEL_COMPONENT_NAME, METRICS_ANNOTATION_PREFIX, METRICS_ENABLED_ANNOTATION,
    METRICS_PATH_ANNOTATION, METRICS_PORT_ANNOTATION, PROMETHEUS_PATH_ANNOTATION,
    PROMETHEUS_PORT_ANNOTATION,
};

use crate::defaults::TraitDefaults;

/// Whether managed keys are written or stripped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationMode {
    /// Write scrape annotations and copy identity labels
    Apply,
    /// Strip scrape annotations but still copy identity labels
    Disable,
    /// Strip every managed annotation; labels are left alone
    Revert,
}

impl MutationMode {
    /// Revert for deleting traits, disable for disabled ones, apply otherwise
    pub fn for_trait(metrics_trait: &MetricsTrait) -> Self {
        if metrics_trait.is_deleting() {
            Self::Revert
        } else if !metrics_trait.is_enabled() {
            Self::Disable
        } else {
            Self::Apply
        }
    }

    fn strips_annotations(self) -> bool {
        self != Self::Apply
    }
}

/// Annotation key for a port index. Index 0 is un-suffixed.
pub fn annotation_key(base: &str, port_index: usize) -> String {
    if port_index == 0 {
        base.to_string()
    } else {
        format!("{base}{port_index}")
    }
}

/// Annotation key suffix for a port index, as used in relabel source labels
pub fn port_suffix(port_index: usize) -> String {
    annotation_key("", port_index)
}

/// Compute the new annotation map for one scrape source.
///
/// In apply mode each port index gets an enabled flag, a port and a path.
/// Port and path come from the trait, else the workload's own
/// `prometheus.io/port` / `prometheus.io/path` hint, else the defaults. Indexed keys beyond the current port count are
/// removed so shrinking the port list leaves nothing behind.
pub fn mutate_annotations(
    mode: MutationMode,
    ports: &[PortSpec],
    defaults: &TraitDefaults,
    existing: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut mutated = existing.clone();

    if mode.strips_annotations() {
        mutated.retain(|key, _| !key.starts_with(METRICS_ANNOTATION_PREFIX));
        return mutated;
    }

    mutated.retain(|key, _| !is_stale_indexed_key(key, ports.len()));

    for (index, port) in ports.iter().enumerate() {
        mutated.insert(
            annotation_key(METRICS_ENABLED_ANNOTATION, index),
            "true".to_string(),
        );

        let port_value = port
            .port
            .map(|p| p.to_string())
            .or_else(|| {
                existing
                    .get(&annotation_key(PROMETHEUS_PORT_ANNOTATION, index))
                    .cloned()
            })
            .unwrap_or_else(|| defaults.port.to_string());
        mutated.insert(annotation_key(METRICS_PORT_ANNOTATION, index), port_value);

        let path_value = port
            .path
            .clone()
            .or_else(|| {
                existing
                    .get(&annotation_key(PROMETHEUS_PATH_ANNOTATION, index))
                    .cloned()
            })
            .unwrap_or_else(|| defaults.path.clone());
        mutated.insert(annotation_key(METRICS_PATH_ANNOTATION, index), path_value);
    }

    mutated
}

/// Copy the application and component labels from the trait.
///
/// Revert mode returns the labels untouched: other controllers select on
/// these labels, so they are never stripped.
pub fn mutate_labels(
    mode: MutationMode,
    metrics_trait: &MetricsTrait,
    existing: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut mutated = existing.clone();
    if mode == MutationMode::Revert {
        return mutated;
    }
    for (key, value) in [
        (LABEL_APP_NAME, metrics_trait.app_name()),
        (LABEL_COMPONENT_NAME, metrics_trait.component_name()),
    ] {
        if let Some(value) = value {
            mutated.insert(key.to_string(), value.to_string());
        }
    }
    mutated
}

fn is_stale_indexed_key(key: &str, port_count: usize) -> bool {
    [
        METRICS_ENABLED_ANNOTATION,
        METRICS_PORT_ANNOTATION,
        METRICS_PATH_ANNOTATION,
    ]
    .iter()
    .filter_map(|base| key.strip_prefix(base))
    .filter(|rest| !rest.is_empty())
    .any(|rest| rest.parse::<usize>().is_ok_and(|i| i >= port_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;
    use vigil_common::crd::MetricsTraitSpec;

    fn defaults() -> TraitDefaults {
        TraitDefaults {
            port: 8080,
            path: "/metrics".to_string(),
            secret: None,
            scraper: vigil_common::LEGACY_SCRAPER.to_string(),
        }
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn single_port_uses_unsuffixed_keys() {
        let ports = vec![PortSpec::default()];
        let out = mutate_annotations(MutationMode::Apply, &ports, &defaults(), &BTreeMap::new());
        assert_eq!(
            out,
            map(&[
                ("verrazzano.io/metricsEnabled", "true"),
                ("verrazzano.io/metricsPath", "/metrics"),
                ("verrazzano.io/metricsPort", "8080"),
            ])
        );
    }

    /// Story: Multiple ports fan out to indexed annotation keys
    #[test]
    fn multiple_ports_fan_out() {
        let ports = vec![
            PortSpec {
                port: Some(9000),
                path: Some("/a".to_string()),
            },
            PortSpec {
                port: Some(9001),
                path: None,
            },
            PortSpec {
                port: None,
                path: Some("/c".to_string()),
            },
        ];
        let out = mutate_annotations(MutationMode::Apply, &ports, &defaults(), &BTreeMap::new());
        assert_eq!(out["verrazzano.io/metricsPort"], "9000");
        assert_eq!(out["verrazzano.io/metricsPath"], "/a");
        assert_eq!(out["verrazzano.io/metricsEnabled1"], "true");
        assert_eq!(out["verrazzano.io/metricsPort1"], "9001");
        assert_eq!(out["verrazzano.io/metricsPath1"], "/metrics");
        assert_eq!(out["verrazzano.io/metricsPort2"], "8080");
        assert_eq!(out["verrazzano.io/metricsPath2"], "/c");
        assert_eq!(out.len(), 9);
    }

    #[test]
    fn workload_hints_win_over_defaults() {
        let existing = map(&[
            ("prometheus.io/port", "7777"),
            ("prometheus.io/path", "/custom"),
            ("unrelated", "keep"),
        ]);
        let out = mutate_annotations(
            MutationMode::Apply,
            &[PortSpec::default()],
            &defaults(),
            &existing,
        );
        assert_eq!(out["verrazzano.io/metricsPort"], "7777");
        assert_eq!(out["verrazzano.io/metricsPath"], "/custom");
        assert_eq!(out["prometheus.io/port"], "7777");
        assert_eq!(out["unrelated"], "keep");
    }

    /// Story: Removing an explicit port and path from the trait returns the
    /// pod to the defaults instead of keeping the previously written values
    #[test]
    fn cleared_trait_values_fall_back_to_defaults() {
        let pinned = mutate_annotations(
            MutationMode::Apply,
            &[PortSpec {
                port: Some(9090),
                path: Some("/custom".to_string()),
            }],
            &defaults(),
            &BTreeMap::new(),
        );
        assert_eq!(pinned["verrazzano.io/metricsPort"], "9090");

        let cleared = mutate_annotations(
            MutationMode::Apply,
            &[PortSpec::default()],
            &defaults(),
            &pinned,
        );
        assert_eq!(cleared["verrazzano.io/metricsPort"], "8080");
        assert_eq!(cleared["verrazzano.io/metricsPath"], "/metrics");
    }

    #[test]
    fn indexed_workload_hints_apply_per_port() {
        let existing = map(&[("prometheus.io/port1", "9100")]);
        let out = mutate_annotations(
            MutationMode::Apply,
            &[PortSpec::default(), PortSpec::default()],
            &defaults(),
            &existing,
        );
        assert_eq!(out["verrazzano.io/metricsPort"], "8080");
        assert_eq!(out["verrazzano.io/metricsPort1"], "9100");
    }

    #[test]
    fn trait_values_win_over_workload_hints() {
        let existing = map(&[("prometheus.io/port", "7777")]);
        let out = mutate_annotations(
            MutationMode::Apply,
            &[PortSpec {
                port: Some(9090),
                path: None,
            }],
            &defaults(),
            &existing,
        );
        assert_eq!(out["verrazzano.io/metricsPort"], "9090");
    }

    #[test]
    fn apply_is_idempotent() {
        let ports = vec![PortSpec::default(), PortSpec::default()];
        let once = mutate_annotations(MutationMode::Apply, &ports, &defaults(), &BTreeMap::new());
        let twice = mutate_annotations(MutationMode::Apply, &ports, &defaults(), &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn shrinking_ports_removes_stale_indices() {
        let existing = map(&[
            ("verrazzano.io/metricsEnabled", "true"),
            ("verrazzano.io/metricsEnabled1", "true"),
            ("verrazzano.io/metricsPort1", "9001"),
            ("verrazzano.io/metricsPath1", "/b"),
        ]);
        let out = mutate_annotations(
            MutationMode::Apply,
            &[PortSpec::default()],
            &defaults(),
            &existing,
        );
        assert!(!out.contains_key("verrazzano.io/metricsEnabled1"));
        assert!(!out.contains_key("verrazzano.io/metricsPort1"));
        assert!(!out.contains_key("verrazzano.io/metricsPath1"));
        assert_eq!(out["verrazzano.io/metricsEnabled"], "true");
    }

    #[test]
    fn revert_strips_every_managed_key() {
        let existing = map(&[
            ("verrazzano.io/metricsEnabled", "true"),
            ("verrazzano.io/metricsPort3", "1"),
            ("verrazzano.io/metricsSomethingElse", "x"),
            ("prometheus.io/port", "8080"),
        ]);
        let out = mutate_annotations(
            MutationMode::Revert,
            &[PortSpec::default()],
            &defaults(),
            &existing,
        );
        assert_eq!(out, map(&[("prometheus.io/port", "8080")]));
    }

    fn labelled_trait() -> MetricsTrait {
        let mut t = MetricsTrait::new("t", MetricsTraitSpec::default());
        t.labels_mut()
            .insert(LABEL_APP_NAME.to_string(), "app".to_string());
        t.labels_mut()
            .insert(LABEL_COMPONENT_NAME.to_string(), "comp".to_string());
        t
    }

    #[test]
    fn labels_copied_from_active_trait() {
        let t = labelled_trait();
        let applied = mutate_labels(MutationMode::for_trait(&t), &t, &map(&[("x", "y")]));
        assert_eq!(applied[LABEL_APP_NAME], "app");
        assert_eq!(applied[LABEL_COMPONENT_NAME], "comp");
        assert_eq!(applied["x"], "y");
    }

    /// Story: A disabled trait still stamps identity labels; only deletion skips them
    #[test]
    fn labels_copied_from_disabled_trait() {
        let mut t = labelled_trait();
        t.spec.enabled = Some(false);
        let out = mutate_labels(MutationMode::for_trait(&t), &t, &BTreeMap::new());
        assert_eq!(out[LABEL_APP_NAME], "app");
        assert_eq!(out[LABEL_COMPONENT_NAME], "comp");
    }

    #[test]
    fn deleting_trait_leaves_labels_alone() {
        let mut t = labelled_trait();
        t.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        let existing = map(&[("x", "y")]);
        assert_eq!(
            mutate_labels(MutationMode::for_trait(&t), &t, &existing),
            existing
        );
    }

    #[test]
    fn mode_follows_trait_state() {
        let mut t = MetricsTrait::new("t", MetricsTraitSpec::default());
        assert_eq!(MutationMode::for_trait(&t), MutationMode::Apply);
        t.spec.enabled = Some(false);
        assert_eq!(MutationMode::for_trait(&t), MutationMode::Disable);
        t.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        assert_eq!(MutationMode::for_trait(&t), MutationMode::Revert);
    }

    #[test]
    fn disable_strips_annotations_like_revert() {
        let existing = map(&[
            ("verrazzano.io/metricsEnabled", "true"),
            ("verrazzano.io/metricsPort", "8080"),
            ("other", "x"),
        ]);
        let out = mutate_annotations(
            MutationMode::Disable,
            &[PortSpec::default()],
            &defaults(),
            &existing,
        );
        assert_eq!(out, map(&[("other", "x")]));
    }

    #[test]
    fn port_suffix_matches_key_scheme() {
        assert_eq!(port_suffix(0), "");
        assert_eq!(port_suffix(4), "4");
    }
}
