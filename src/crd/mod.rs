//! Custom Resource Definitions for the mesh operator

mod control_plane;
mod types;

pub use control_plane::{MeshControlPlane, MeshControlPlaneSpec, MeshControlPlaneStatus};
pub use types::{ComponentSpec, ComponentsSpec, FeatureSpec, HealthStatus, HpaSpec, K8sSpec};
