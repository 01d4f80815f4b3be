//! MetricsTrait reconciliation for vigil
//!
//! This crate keeps workloads wired into metrics scraping:
//!
//! - **Defaults**: classifies the workload and resolves scrape port, path and credentials
//! - **Sources**: writes scrape annotations onto the pods a workload runs
//! - **Scrapers**: merges jobs into the built-in scraper's document, or applies a ServiceMonitor
//! - **Reaper**: tears down whatever a trait no longer reproduces
//! - **Controller**: the MetricsTrait reconcile loop tying these together

#![deny(missing_docs)]

pub mod annotations;
pub mod client;
pub mod cluster;
pub mod controller;
pub mod defaults;
pub mod ledger;
pub mod naming;
pub mod reaper;
pub mod relabel;
pub mod scrape_config;
pub mod service_monitor;
pub mod source;
pub mod status;
pub mod sync;
pub mod workload;

pub use client::{KubeClient, KubeClientImpl, FIELD_MANAGER, FINALIZER};
pub use controller::{error_policy, reconcile, Context, ControllerConfig};
