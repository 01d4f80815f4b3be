//! Scrape sources: workload children whose pods carry scrape annotations
//!
//! Deployments and StatefulSets are mutated through their pod template so
//! the change rolls out to new pods; bare Pods are mutated directly.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use serde_json::{Map, Value};

use vigil_common::crd::{MetricsTrait, PortSpec, QualifiedResourceRelation, RelationRole};

use crate::annotations::{mutate_annotations, mutate_labels, MutationMode};
use crate::defaults::TraitDefaults;
use crate::workload::type_meta;

/// Where a kind keeps the metadata of the pods it runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PodMetadata {
    /// `spec.template.metadata`
    Template,
    /// The object's own metadata
    Own,
}

fn pod_metadata_location(kind: &str) -> Option<PodMetadata> {
    match kind {
        "Deployment" | "StatefulSet" => Some(PodMetadata::Template),
        "Pod" => Some(PodMetadata::Own),
        _ => None,
    }
}

/// True if objects of this kind can carry scrape annotations
pub fn is_source_kind(kind: &str) -> bool {
    pod_metadata_location(kind).is_some()
}

/// Source relation for a child object
pub fn source_relation(child: &DynamicObject) -> QualifiedResourceRelation {
    let (api_version, kind) = type_meta(child);
    QualifiedResourceRelation::new(
        api_version,
        kind,
        child.metadata.namespace.clone().unwrap_or_default(),
        child.metadata.name.clone().unwrap_or_default(),
        RelationRole::Source,
    )
}

/// Mutate a child's pod annotations and labels in place.
///
/// Returns `None` when the kind does not run pods, otherwise whether
/// anything changed.
pub fn mutate_source(
    child: &mut DynamicObject,
    mode: MutationMode,
    metrics_trait: &MetricsTrait,
    ports: &[PortSpec],
    defaults: &TraitDefaults,
) -> Option<bool> {
    let (_, kind) = type_meta(child);
    match pod_metadata_location(&kind)? {
        PodMetadata::Own => {
            let annotations = child.metadata.annotations.clone().unwrap_or_default();
            let labels = child.metadata.labels.clone().unwrap_or_default();
            let new_annotations = mutate_annotations(mode, ports, defaults, &annotations);
            let new_labels = mutate_labels(mode, metrics_trait, &labels);
            let changed = new_annotations != annotations || new_labels != labels;
            if changed {
                child.metadata.annotations = non_empty(new_annotations);
                child.metadata.labels = non_empty(new_labels);
            }
            Some(changed)
        }
        PodMetadata::Template => {
            let meta = template_metadata_mut(&mut child.data)?;
            let annotations = read_string_map(meta, "annotations");
            let labels = read_string_map(meta, "labels");
            let new_annotations = mutate_annotations(mode, ports, defaults, &annotations);
            let new_labels = mutate_labels(mode, metrics_trait, &labels);
            let changed = new_annotations != annotations || new_labels != labels;
            if changed {
                write_string_map(meta, "annotations", new_annotations);
                write_string_map(meta, "labels", new_labels);
            }
            Some(changed)
        }
    }
}

/// Strip every managed annotation from a child, for teardown.
///
/// Same return contract as [`mutate_source`].
pub fn revert_source(child: &mut DynamicObject, metrics_trait: &MetricsTrait) -> Option<bool> {
    mutate_source(
        child,
        MutationMode::Revert,
        metrics_trait,
        &[],
        &TraitDefaults::default(),
    )
}

fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!map.is_empty()).then_some(map)
}

fn template_metadata_mut(data: &mut Value) -> Option<&mut Map<String, Value>> {
    let template = data
        .get_mut("spec")?
        .get_mut("template")?
        .as_object_mut()?;
    template
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}

fn read_string_map(meta: &Map<String, Value>, field: &str) -> BTreeMap<String, String> {
    meta.get(field)
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn write_string_map(meta: &mut Map<String, Value>, field: &str, map: BTreeMap<String, String>) {
    if map.is_empty() {
        meta.remove(field);
        return;
    }
    let object = map.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    meta.insert(field.to_string(), Value::Object(object));
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;
    use vigil_common::crd::MetricsTraitSpec;
    use vigil_common::{LABEL_APP_NAME, LABEL_COMPONENT_NAME};

    fn defaults() -> TraitDefaults {
        TraitDefaults {
            port: 8080,
            path: "/metrics".to_string(),
            secret: None,
            scraper: vigil_common::LEGACY_SCRAPER.to_string(),
        }
    }

    fn labelled_trait() -> MetricsTrait {
        let mut t = MetricsTrait::new("t", MetricsTraitSpec::default());
        t.labels_mut()
            .insert(LABEL_APP_NAME.to_string(), "app".to_string());
        t.labels_mut()
            .insert(LABEL_COMPONENT_NAME.to_string(), "comp".to_string());
        t
    }

    fn deployment() -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "hello", "namespace": "apps"},
            "spec": {
                "template": {
                    "metadata": {"annotations": {"other": "x"}},
                    "spec": {"containers": []}
                }
            }
        }))
        .expect("deployment should parse")
    }

    #[test]
    fn deployment_template_is_mutated() {
        let mut d = deployment();
        let t = labelled_trait();
        let changed = mutate_source(
            &mut d,
            MutationMode::Apply,
            &t,
            &[PortSpec::default()],
            &defaults(),
        );
        assert_eq!(changed, Some(true));

        let meta = &d.data["spec"]["template"]["metadata"];
        assert_eq!(meta["annotations"]["verrazzano.io/metricsEnabled"], "true");
        assert_eq!(meta["annotations"]["verrazzano.io/metricsPort"], "8080");
        assert_eq!(meta["annotations"]["other"], "x");
        assert_eq!(meta["labels"][LABEL_APP_NAME], "app");

        let again = mutate_source(
            &mut d,
            MutationMode::Apply,
            &t,
            &[PortSpec::default()],
            &defaults(),
        );
        assert_eq!(again, Some(false));
    }

    #[test]
    fn revert_leaves_unrelated_annotations() {
        let mut d = deployment();
        let t = labelled_trait();
        let ports = [PortSpec::default()];
        mutate_source(&mut d, MutationMode::Apply, &t, &ports, &defaults());

        let changed = mutate_source(&mut d, MutationMode::Revert, &t, &ports, &defaults());
        assert_eq!(changed, Some(true));
        let meta = &d.data["spec"]["template"]["metadata"];
        assert_eq!(meta["annotations"], serde_json::json!({"other": "x"}));
        assert_eq!(meta["labels"][LABEL_COMPONENT_NAME], "comp");
    }

    #[test]
    fn revert_without_ports_strips_indexed_keys() {
        let mut d = deployment();
        let t = labelled_trait();
        let ports = [PortSpec::default(), PortSpec::default()];
        mutate_source(&mut d, MutationMode::Apply, &t, &ports, &defaults());

        assert_eq!(revert_source(&mut d, &t), Some(true));
        assert_eq!(
            d.data["spec"]["template"]["metadata"]["annotations"],
            serde_json::json!({"other": "x"})
        );
        assert_eq!(revert_source(&mut d, &t), Some(false));
    }

    #[test]
    fn pod_metadata_is_mutated_directly() {
        let mut pod: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p", "namespace": "apps"},
            "spec": {"containers": []}
        }))
        .expect("pod should parse");

        let changed = mutate_source(
            &mut pod,
            MutationMode::Apply,
            &labelled_trait(),
            &[PortSpec::default()],
            &defaults(),
        );
        assert_eq!(changed, Some(true));
        assert_eq!(
            pod.annotations()
                .get("verrazzano.io/metricsPath")
                .map(String::as_str),
            Some("/metrics")
        );
    }

    #[test]
    fn non_pod_kinds_are_skipped() {
        let mut svc: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "s", "namespace": "apps"},
            "spec": {}
        }))
        .expect("service should parse");
        assert!(!is_source_kind("Service"));
        assert_eq!(
            mutate_source(
                &mut svc,
                MutationMode::Apply,
                &labelled_trait(),
                &[PortSpec::default()],
                &defaults()
            ),
            None
        );
    }

    #[test]
    fn relation_identifies_child() {
        let rel = source_relation(&deployment());
        assert_eq!(rel.api_version, "apps/v1");
        assert_eq!(rel.kind, "Deployment");
        assert_eq!(rel.namespace, "apps");
        assert_eq!(rel.name, "hello");
        assert_eq!(rel.role, RelationRole::Source);
    }
}
