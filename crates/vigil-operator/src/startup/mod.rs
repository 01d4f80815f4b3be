//! Startup utilities run before the controller starts

mod crds;

pub use crds::{crd_yaml, ensure_crds_installed};
