//! Custom resource types managed or written by vigil

mod metrics_trait;
mod service_monitor;
mod types;

pub use metrics_trait::{
    MetricsTrait, MetricsTraitSpec, MetricsTraitStatus, PortSpec, QualifiedResourceRelation,
    RelationRole, WorkloadReference,
};
pub use service_monitor::{
    BasicAuth, Endpoint, LabelSelector, NamespaceSelector, RelabelConfig, SecretKeySelector,
    ServiceMonitor, ServiceMonitorSpec, TlsConfig,
};
pub use types::{Condition, ConditionStatus};
