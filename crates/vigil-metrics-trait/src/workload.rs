//! Workload resolution: from a trait's `workloadRef` to the objects whose pods
//! get scraped

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use tracing::debug;

use vigil_common::crd::MetricsTrait;
use vigil_common::kube_utils::{parse_api_version, pluralize_kind};
use vigil_common::Error;

use crate::client::KubeClient;
use crate::source::is_source_kind;

#[cfg(test)]
use mockall::automock;

/// API version of OAM workload definitions
pub const WORKLOAD_DEFINITION_API_VERSION: &str = "core.oam.dev/v1alpha2";
/// Kind of OAM workload definitions
pub const WORKLOAD_DEFINITION_KIND: &str = "WorkloadDefinition";

/// Platform wrapper kinds whose real workload lives in `spec.template`
const WRAPPER_KINDS: &[(&str, &str)] = &[
    ("oam.verrazzano.io", "VerrazzanoCoherenceWorkload"),
    ("oam.verrazzano.io", "VerrazzanoWebLogicWorkload"),
];

/// `(apiVersion, kind)` of a dynamic object, empty when absent
pub fn type_meta(obj: &DynamicObject) -> (String, String) {
    obj.types
        .as_ref()
        .map(|t| (t.api_version.clone(), t.kind.clone()))
        .unwrap_or_default()
}

/// Resolves the workload a trait points at and its child objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadResolver: Send + Sync {
    /// Fetch the workload, unwrapping one level of platform wrapper.
    /// `None` if it does not exist yet.
    async fn resolve(&self, metrics_trait: &MetricsTrait) -> Result<Option<DynamicObject>, Error>;

    /// Objects owned by the workload that may carry scrape annotations
    async fn children(&self, workload: &DynamicObject) -> Result<Vec<DynamicObject>, Error>;
}

/// Workload resolver backed by the object store
pub struct KubeWorkloadResolver {
    kube: Arc<dyn KubeClient>,
}

impl KubeWorkloadResolver {
    /// Create a resolver reading through the given client
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

#[async_trait]
impl WorkloadResolver for KubeWorkloadResolver {
    async fn resolve(&self, metrics_trait: &MetricsTrait) -> Result<Option<DynamicObject>, Error> {
        let namespace = metrics_trait.namespace().unwrap_or_default();
        let reference = &metrics_trait.spec.workload_ref;

        let Some(workload) = self
            .kube
            .get_object(
                &reference.api_version,
                &reference.kind,
                &namespace,
                &reference.name,
            )
            .await?
        else {
            return Ok(None);
        };

        if !is_wrapper(&reference.api_version, &reference.kind) {
            return Ok(Some(workload));
        }

        let Some((api_version, kind, name)) = wrapped_reference(&workload.data) else {
            return Err(Error::validation_for(
                metrics_trait.name_any(),
                format!(
                    "{} {} has no spec.template workload",
                    reference.kind, reference.name
                ),
            ));
        };
        debug!(%kind, %name, "unwrapped platform workload");
        self.kube
            .get_object(&api_version, &kind, &namespace, &name)
            .await
    }

    async fn children(&self, workload: &DynamicObject) -> Result<Vec<DynamicObject>, Error> {
        let (api_version, kind) = type_meta(workload);
        let definition = self
            .kube
            .get_cluster_object(
                WORKLOAD_DEFINITION_API_VERSION,
                WORKLOAD_DEFINITION_KIND,
                &definition_name(&api_version, &kind),
            )
            .await?;

        let Some(definition) = definition else {
            return Ok(if is_source_kind(&kind) {
                vec![workload.clone()]
            } else {
                Vec::new()
            });
        };

        let namespace = workload.namespace().unwrap_or_default();
        let uid = workload.uid().unwrap_or_default();
        let mut children = Vec::new();
        for (child_api_version, child_kind) in child_resource_kinds(&definition.data) {
            let objects = self
                .kube
                .list_objects(&child_api_version, &child_kind, &namespace)
                .await?;
            children.extend(objects.into_iter().filter(|o| is_owned_by(o, &uid)));
        }
        Ok(children)
    }
}

fn is_wrapper(api_version: &str, kind: &str) -> bool {
    let (group, _) = parse_api_version(api_version);
    WRAPPER_KINDS
        .iter()
        .any(|(g, k)| *g == group && *k == kind)
}

fn wrapped_reference(data: &Value) -> Option<(String, String, String)> {
    let template = data.pointer("/spec/template")?;
    let field = |pointer: &str| {
        template
            .pointer(pointer)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Some((
        field("/apiVersion")?,
        field("/kind")?,
        field("/metadata/name")?,
    ))
}

/// Workload definitions are named `<plural>.<group>`, or just the plural
/// for core kinds
fn definition_name(api_version: &str, kind: &str) -> String {
    let (group, _) = parse_api_version(api_version);
    let plural = pluralize_kind(kind);
    if group.is_empty() {
        plural
    } else {
        format!("{plural}.{group}")
    }
}

fn child_resource_kinds(definition: &Value) -> Vec<(String, String)> {
    definition
        .pointer("/spec/childResourceKinds")
        .and_then(Value::as_array)
        .map(|kinds| {
            kinds
                .iter()
                .filter_map(|k| {
                    Some((
                        k.get("apiVersion")?.as_str()?.to_string(),
                        k.get("kind")?.as_str()?.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn is_owned_by(obj: &DynamicObject, uid: &str) -> bool {
    !uid.is_empty() && obj.owner_references().iter().any(|o| o.uid == uid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use mockall::predicate::eq;
    use vigil_common::crd::{MetricsTraitSpec, WorkloadReference};

    fn object(value: Value) -> DynamicObject {
        serde_json::from_value(value).expect("object should parse")
    }

    fn metrics_trait(api_version: &str, kind: &str, name: &str) -> MetricsTrait {
        let mut t = MetricsTrait::new(
            "t",
            MetricsTraitSpec {
                workload_ref: WorkloadReference {
                    api_version: api_version.to_string(),
                    kind: kind.to_string(),
                    name: name.to_string(),
                },
                ..Default::default()
            },
        );
        t.metadata.namespace = Some("apps".to_string());
        t
    }

    fn deployment(name: &str, owner_uid: Option<&str>) -> DynamicObject {
        let mut value = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "apps", "uid": format!("{name}-uid")},
            "spec": {"template": {"spec": {"containers": []}}}
        });
        if let Some(uid) = owner_uid {
            value["metadata"]["ownerReferences"] = serde_json::json!([{
                "apiVersion": "oam.verrazzano.io/v1alpha1",
                "kind": "VerrazzanoHelidonWorkload",
                "name": "owner",
                "uid": uid
            }]);
        }
        object(value)
    }

    #[test]
    fn definition_names_follow_crd_convention() {
        assert_eq!(
            definition_name("core.oam.dev/v1alpha2", "ContainerizedWorkload"),
            "containerizedworkloads.core.oam.dev"
        );
        assert_eq!(
            definition_name("coherence.oracle.com/v1", "Coherence"),
            "coherence.coherence.oracle.com"
        );
        assert_eq!(definition_name("v1", "Pod"), "pods");
    }

    #[test]
    fn wrapped_reference_requires_every_field() {
        let full = serde_json::json!({"spec": {"template": {
            "apiVersion": "weblogic.oracle/v8",
            "kind": "Domain",
            "metadata": {"name": "d"}
        }}});
        assert_eq!(
            wrapped_reference(&full),
            Some((
                "weblogic.oracle/v8".to_string(),
                "Domain".to_string(),
                "d".to_string()
            ))
        );

        let nameless = serde_json::json!({"spec": {"template": {
            "apiVersion": "weblogic.oracle/v8",
            "kind": "Domain"
        }}});
        assert_eq!(wrapped_reference(&nameless), None);
    }

    #[tokio::test]
    async fn missing_workload_resolves_to_none() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_object().returning(|_, _, _, _| Ok(None));
        let resolver = KubeWorkloadResolver::new(Arc::new(kube));

        let resolved = resolver
            .resolve(&metrics_trait("apps/v1", "Deployment", "hello"))
            .await
            .expect("resolve should succeed");
        assert!(resolved.is_none());
    }

    /// Story: A Verrazzano WebLogic wrapper resolves to the Domain it wraps
    #[tokio::test]
    async fn wrapper_is_unwrapped_once() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_object()
            .with(
                eq("oam.verrazzano.io/v1alpha1"),
                eq("VerrazzanoWebLogicWorkload"),
                eq("apps"),
                eq("wrapper"),
            )
            .returning(|_, _, _, _| {
                Ok(Some(object(serde_json::json!({
                    "apiVersion": "oam.verrazzano.io/v1alpha1",
                    "kind": "VerrazzanoWebLogicWorkload",
                    "metadata": {"name": "wrapper", "namespace": "apps"},
                    "spec": {"template": {
                        "apiVersion": "weblogic.oracle/v8",
                        "kind": "Domain",
                        "metadata": {"name": "domain"}
                    }}
                }))))
            });
        kube.expect_get_object()
            .with(eq("weblogic.oracle/v8"), eq("Domain"), eq("apps"), eq("domain"))
            .returning(|_, _, _, _| {
                Ok(Some(object(serde_json::json!({
                    "apiVersion": "weblogic.oracle/v8",
                    "kind": "Domain",
                    "metadata": {"name": "domain", "namespace": "apps"},
                    "spec": {}
                }))))
            });
        let resolver = KubeWorkloadResolver::new(Arc::new(kube));

        let resolved = resolver
            .resolve(&metrics_trait(
                "oam.verrazzano.io/v1alpha1",
                "VerrazzanoWebLogicWorkload",
                "wrapper",
            ))
            .await
            .expect("resolve should succeed")
            .expect("domain should be found");
        assert_eq!(type_meta(&resolved).1, "Domain");
        assert_eq!(resolved.name_any(), "domain");
    }

    #[tokio::test]
    async fn children_filtered_by_owner_uid() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_cluster_object()
            .with(
                eq(WORKLOAD_DEFINITION_API_VERSION),
                eq(WORKLOAD_DEFINITION_KIND),
                eq("verrazzanohelidonworkloads.oam.verrazzano.io"),
            )
            .returning(|_, _, _| {
                Ok(Some(object(serde_json::json!({
                    "apiVersion": WORKLOAD_DEFINITION_API_VERSION,
                    "kind": WORKLOAD_DEFINITION_KIND,
                    "metadata": {"name": "verrazzanohelidonworkloads.oam.verrazzano.io"},
                    "spec": {"childResourceKinds": [
                        {"apiVersion": "apps/v1", "kind": "Deployment"}
                    ]}
                }))))
            });
        kube.expect_list_objects()
            .with(eq("apps/v1"), eq("Deployment"), eq("apps"))
            .returning(|_, _, _| {
                Ok(vec![
                    deployment("mine", Some("helidon-uid")),
                    deployment("theirs", Some("other-uid")),
                    deployment("orphan", None),
                ])
            });
        let resolver = KubeWorkloadResolver::new(Arc::new(kube));

        let workload = object(serde_json::json!({
            "apiVersion": "oam.verrazzano.io/v1alpha1",
            "kind": "VerrazzanoHelidonWorkload",
            "metadata": {"name": "helidon", "namespace": "apps", "uid": "helidon-uid"},
            "spec": {}
        }));
        let children = resolver
            .children(&workload)
            .await
            .expect("children should resolve");
        let names: Vec<String> = children.iter().map(|c| c.name_any()).collect();
        assert_eq!(names, vec!["mine"]);
    }

    #[tokio::test]
    async fn undefined_source_kind_is_its_own_child() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_cluster_object()
            .returning(|_, _, _| Ok(None));
        let resolver = KubeWorkloadResolver::new(Arc::new(kube));

        let children = resolver
            .children(&deployment("plain", None))
            .await
            .expect("children should resolve");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name_any(), "plain");
    }
}
