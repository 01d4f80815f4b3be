//! vigil Kubernetes operator: keeps MetricsTraits in sync with metrics scraping

#![deny(missing_docs)]

/// Command line and environment configuration
pub mod config;
/// Controller construction
pub mod controller_runner;
/// Startup utilities (CRD install and generation)
pub mod startup;
