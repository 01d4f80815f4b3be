//! Object store access for the MetricsTrait controller
//!
//! Every cluster read and write goes through [`KubeClient`] so reconcile logic
//! can be exercised against mocks. Reads of optional objects return `None`
//! on 404; writes surface every API error, including 409 conflicts.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use vigil_common::crd::{MetricsTrait, MetricsTraitStatus, ServiceMonitor};
use vigil_common::kube_utils::{build_api_resource, HasApiResource};
use vigil_common::Error;

use crate::workload::type_meta;

#[cfg(test)]
use mockall::automock;

/// Field manager for every write made by the controller
pub const FIELD_MANAGER: &str = "vigil-metrics-trait-controller";

/// Finalizer gating MetricsTrait deletion on teardown
pub const FINALIZER: &str = "metricstrait.finalizers.verrazzano.io";

/// Trait abstracting Kubernetes client operations for MetricsTrait
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Add a finalizer to a MetricsTrait if not already present
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer from a MetricsTrait; a missing trait is not an error
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Delete a MetricsTrait; a missing trait is not an error
    async fn delete_trait(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Patch the status of a MetricsTrait
    async fn patch_trait_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MetricsTraitStatus,
    ) -> Result<(), Error>;

    /// Get a Namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Get a Deployment
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error>;

    /// Get a ConfigMap
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error>;

    /// Replace a ConfigMap, guarded by the resourceVersion it was read at
    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<(), Error>;

    /// Get a namespaced object of any kind
    async fn get_object(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Get a cluster-scoped object of any kind
    async fn get_cluster_object(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// List objects of one kind in a namespace
    async fn list_objects(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Replace an object, guarded by the resourceVersion it was read at
    async fn replace_object(&self, object: &DynamicObject) -> Result<(), Error>;

    /// Get a ServiceMonitor
    async fn get_service_monitor(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceMonitor>, Error>;

    /// Server-side apply a ServiceMonitor
    async fn apply_service_monitor(&self, monitor: &ServiceMonitor) -> Result<(), Error>;

    /// Delete a ServiceMonitor. Returns false if it did not exist.
    async fn delete_service_monitor(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn traits(&self, namespace: &str) -> Api<MetricsTrait> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn dynamic(&self, api_version: &str, kind: &str, namespace: &str) -> Api<DynamicObject> {
        let ar = build_api_resource(api_version, kind);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }

    fn service_monitors(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            namespace,
            &ServiceMonitor::api_resource(),
        )
    }

    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });

        self.traits(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Get an object, mapping 404 to `None`
async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        // Get current trait to read existing finalizers
        let current = self.traits(namespace).get(name).await?;
        let mut finalizers = current.metadata.finalizers.unwrap_or_default();

        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }

        finalizers.push(finalizer.to_string());
        self.patch_finalizers(namespace, name, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let Some(current) = get_optional(&self.traits(namespace), name).await? else {
            debug!(trait_name = %name, "trait already gone, nothing to unfinalize");
            return Ok(());
        };
        let finalizers: Vec<String> = current
            .metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().filter(|s| *s != finalizer).cloned().collect())
            .unwrap_or_default();

        self.patch_finalizers(namespace, name, finalizers).await
    }

    async fn delete_trait(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .traits(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(trait_name = %name, "MetricsTrait not found (already deleted)");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_trait_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MetricsTraitStatus,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({ "status": status });

        self.traits(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;

        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        get_optional(&api, name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let namespace = config_map.namespace().unwrap_or_default();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&config_map.name_any(), &PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn get_object(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let api = self.dynamic(api_version, kind, namespace);
        get_optional(&api, name).await
    }

    async fn get_cluster_object(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let ar = build_api_resource(api_version, kind);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        get_optional(&api, name).await
    }

    async fn list_objects(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<Vec<DynamicObject>, Error> {
        let api = self.dynamic(api_version, kind, namespace);
        match api.list(&ListParams::default()).await {
            Ok(list) => Ok(list.items),
            // Kind not served by this cluster
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace_object(&self, object: &DynamicObject) -> Result<(), Error> {
        let (api_version, kind) = type_meta(object);
        let namespace = object.namespace().unwrap_or_default();
        let api = self.dynamic(&api_version, &kind, &namespace);
        api.replace(&object.name_any(), &PostParams::default(), object)
            .await?;
        Ok(())
    }

    async fn get_service_monitor(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceMonitor>, Error> {
        let Some(obj) = get_optional(&self.service_monitors(namespace), name).await? else {
            return Ok(None);
        };
        let monitor = serde_json::from_value(serde_json::to_value(obj)?)
            .map_err(|e| Error::serialization_for(ServiceMonitor::KIND, e.to_string()))?;
        Ok(Some(monitor))
    }

    async fn apply_service_monitor(&self, monitor: &ServiceMonitor) -> Result<(), Error> {
        let namespace = monitor.metadata.namespace.clone().unwrap_or_default();
        let name = monitor.metadata.name.clone().unwrap_or_default();
        self.service_monitors(&namespace)
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(monitor),
            )
            .await?;
        Ok(())
    }

    async fn delete_service_monitor(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        match self
            .service_monitors(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
