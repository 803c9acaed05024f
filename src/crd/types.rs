//! Shared types for the MeshControlPlane CRD

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, EnvVar};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::component::{ComponentName, FeatureName};

/// Schema for free-form subtrees the API server must keep verbatim.
pub(crate) fn free_form(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        Value::Bool(true),
    );
    schemars::schema::Schema::Object(schema)
}

/// Health of one feature after the last reconcile
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum HealthStatus {
    /// Every component of the feature applied cleanly
    #[default]
    Healthy,
    /// At least one component of the feature failed
    Error,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "Healthy"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// One feature of the control plane
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSpec {
    /// Feature switch; components without their own flag inherit it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Components of this feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentsSpec>,
}

/// Component settings under a feature.
///
/// Every component has a slot here; validation rejects components placed
/// under a feature that does not own them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentsSpec {
    /// Namespace shared by the feature's components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pilot: Option<ComponentSpec>,
    /// Config validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub galley: Option<ComponentSpec>,
    /// Sidecar injector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_injector: Option<ComponentSpec>,
    /// Policy enforcement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ComponentSpec>,
    /// Telemetry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<ComponentSpec>,
    /// Certificate authority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citadel: Option<ComponentSpec>,
    /// Node agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_agent: Option<ComponentSpec>,
    /// Certificate manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_manager: Option<ComponentSpec>,
    /// Ingress gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_gateway: Option<ComponentSpec>,
    /// Egress gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub egress_gateway: Option<ComponentSpec>,
}

impl ComponentsSpec {
    /// Settings of `component`, if present
    pub fn get(&self, component: ComponentName) -> Option<&ComponentSpec> {
        match component {
            ComponentName::Base => None,
            ComponentName::Pilot => self.pilot.as_ref(),
            ComponentName::Galley => self.galley.as_ref(),
            ComponentName::SidecarInjector => self.sidecar_injector.as_ref(),
            ComponentName::Policy => self.policy.as_ref(),
            ComponentName::Telemetry => self.telemetry.as_ref(),
            ComponentName::Citadel => self.citadel.as_ref(),
            ComponentName::NodeAgent => self.node_agent.as_ref(),
            ComponentName::CertManager => self.cert_manager.as_ref(),
            ComponentName::IngressGateway => self.ingress_gateway.as_ref(),
            ComponentName::EgressGateway => self.egress_gateway.as_ref(),
        }
    }

    /// Components with settings present, in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (ComponentName, &ComponentSpec)> {
        ComponentName::ALL
            .into_iter()
            .filter_map(move |c| self.get(c).map(|spec| (c, spec)))
    }
}

/// Settings of a single component
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Component switch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Namespace override for this component
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Kubernetes resource settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s: Option<K8sSpec>,

    /// Chart values passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "free_form")]
    pub values: Option<Value>,
}

/// Kubernetes settings common to every component's workloads
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct K8sSpec {
    /// Pod affinity rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Container environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,

    /// Horizontal autoscaling bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hpa_spec: Option<HpaSpec>,

    /// Image pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Node selector labels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Pod disruption budget settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "free_form")]
    pub pod_disruption_budget: Option<Value>,

    /// Extra pod annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_annotations: Option<BTreeMap<String, String>>,

    /// Priority class name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Readiness probe settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "free_form")]
    pub readiness_probe: Option<Value>,

    /// Fixed replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_count: Option<u32>,

    /// Container resource requests and limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "free_form")]
    pub resources: Option<Value>,
}

/// Autoscaler bounds
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HpaSpec {
    /// Lower replica bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<u32>,

    /// Upper replica bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,
}

impl HpaSpec {
    /// Validate that the bounds are ordered
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let (Some(min), Some(max)) = (self.min_replicas, self.max_replicas) {
            if min > max {
                return Err(crate::Error::validation(format!(
                    "hpaSpec minReplicas ({min}) exceeds maxReplicas ({max})"
                )));
            }
        }
        Ok(())
    }
}

/// Validate that `components` only holds components owned by `feature`
pub(crate) fn validate_ownership(
    feature: FeatureName,
    components: &ComponentsSpec,
) -> Result<(), crate::Error> {
    for (component, spec) in components.iter() {
        if component.feature() != Some(feature) {
            return Err(crate::Error::validation(format!(
                "component '{component}' does not belong to feature '{feature}'"
            )));
        }
        if let Some(hpa) = spec.k8s.as_ref().and_then(|k| k.hpa_spec.as_ref()) {
            hpa.validate().map_err(|e| {
                crate::Error::validation(format!("{feature}.components.{component}: {e}"))
            })?;
        }
    }
    Ok(())
}
