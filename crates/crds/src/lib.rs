//! OS Build CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the OS image build controller.

pub mod build_configuration;
pub mod build_record;
pub mod node_pool;
pub mod rendered_config;

pub use build_configuration::*;
pub use build_record::*;
pub use node_pool::*;
pub use rendered_config::*;

/// API group shared by every CRD in this crate
pub const API_GROUP: &str = "osbuild.microscaler.io";
