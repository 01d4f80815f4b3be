//! Logical multi-cluster name stamped into scrape configuration

use std::sync::Arc;

use async_trait::async_trait;

use vigil_common::{
    Error, CLUSTER_NAME_KEY, CLUSTER_REGISTRATION_SECRET, VERRAZZANO_SYSTEM_NAMESPACE,
};

use crate::client::KubeClient;

#[cfg(test)]
use mockall::automock;

/// Provides the managed cluster name, if this cluster is registered as one
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterNameProvider: Send + Sync {
    /// `None` on the local (admin) cluster
    async fn cluster_name(&self) -> Result<Option<String>, Error>;
}

/// Reads the cluster name from the registration secret
pub struct KubeClusterNameProvider {
    kube: Arc<dyn KubeClient>,
}

impl KubeClusterNameProvider {
    /// Create a provider reading through the given client
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

#[async_trait]
impl ClusterNameProvider for KubeClusterNameProvider {
    async fn cluster_name(&self) -> Result<Option<String>, Error> {
        let secret = self
            .kube
            .get_secret(VERRAZZANO_SYSTEM_NAMESPACE, CLUSTER_REGISTRATION_SECRET)
            .await?;
        Ok(secret
            .and_then(|s| s.data)
            .and_then(|data| data.get(CLUSTER_NAME_KEY).cloned())
            .and_then(|bytes| String::from_utf8(bytes.0).ok())
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty()))
    }
}
