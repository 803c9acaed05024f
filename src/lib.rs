//! meshop - Kubernetes operator installing a multi-component service-mesh control plane
//!
//! A MeshControlPlane resource describes which mesh features are enabled and
//! how their components run. The operator renders one chart per enabled
//! component, applies the results in dependency order, prunes what is no
//! longer declared and reports per-feature health back on the resource.
//!
//! # Modules
//!
//! - [`tree`] - Path operations on untyped configuration trees
//! - [`translate`] - Values document to control-plane spec translation and back
//! - [`component`] - Fixed component and feature tables
//! - [`graph`] - Component dependency graph and processing order
//! - [`render`] - Chart rendering adapter
//! - [`manifest`] - Document splitting, object identity and ownership labels
//! - [`controller`] - Reconciliation engine and kube-runtime wiring
//! - [`crd`] - The MeshControlPlane custom resource
//! - [`profile`] - Named base configurations
//! - [`migrate`] - Legacy values to MeshControlPlane conversion
//! - [`retry`] - Bounded retries with backoff
//! - [`yaml`] - YAML parsing into JSON values
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod component;
pub mod controller;
pub mod crd;
pub mod error;
pub mod graph;
pub mod manifest;
pub mod migrate;
pub mod profile;
pub mod render;
pub mod retry;
pub mod translate;
pub mod tree;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Namespace components install into when nothing more specific is set
pub const DEFAULT_NAMESPACE: &str = "mesh-system";

/// Field manager recorded on every write the operator makes
pub const FIELD_MANAGER: &str = "meshop-controller";
