//! MeshControlPlane Custom Resource Definition
//!
//! One MeshControlPlane describes a complete mesh control-plane installation:
//! global settings plus one block per feature, each holding its components.

use std::collections::{BTreeMap, BTreeSet};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{free_form, validate_ownership, ComponentSpec, FeatureSpec, HealthStatus};
use crate::component::{ComponentName, FeatureName};
use crate::manifest::ObjectKind;
use crate::DEFAULT_NAMESPACE;

/// Specification for a MeshControlPlane
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "install.meshop.io",
    version = "v1alpha1",
    kind = "MeshControlPlane",
    plural = "meshcontrolplanes",
    shortname = "mcp",
    status = "MeshControlPlaneStatus",
    namespaced,
    printcolumn = r#"{"name":"Hub","type":"string","jsonPath":".spec.hub"}"#,
    printcolumn = r#"{"name":"Tag","type":"string","jsonPath":".spec.tag"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MeshControlPlaneSpec {
    /// Named base configuration this spec was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    /// Image registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub: Option<String>,

    /// Image tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Namespace for components that do not set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,

    /// Port serving control-plane metrics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_port: Option<u16>,

    /// Trust domain for workload identities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_domain: Option<String>,

    /// Traffic management feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_management: Option<FeatureSpec>,

    /// Configuration management feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_management: Option<FeatureSpec>,

    /// Sidecar auto-injection feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_injection: Option<FeatureSpec>,

    /// Policy feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<FeatureSpec>,

    /// Telemetry feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<FeatureSpec>,

    /// Security feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<FeatureSpec>,

    /// Gateways feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateways: Option<FeatureSpec>,

    /// Chart values shared by every component (`values.global`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "free_form")]
    pub values: Option<Value>,
}

impl MeshControlPlaneSpec {
    /// Settings block of `feature`
    pub fn feature(&self, feature: FeatureName) -> Option<&FeatureSpec> {
        match feature {
            FeatureName::TrafficManagement => self.traffic_management.as_ref(),
            FeatureName::ConfigManagement => self.config_management.as_ref(),
            FeatureName::AutoInjection => self.auto_injection.as_ref(),
            FeatureName::Policy => self.policy.as_ref(),
            FeatureName::Telemetry => self.telemetry.as_ref(),
            FeatureName::Security => self.security.as_ref(),
            FeatureName::Gateways => self.gateways.as_ref(),
        }
    }

    /// Settings of `component` under its owning feature
    pub fn component(&self, component: ComponentName) -> Option<&ComponentSpec> {
        self.feature(component.feature()?)?
            .components
            .as_ref()?
            .get(component)
    }

    /// Effective enablement: the component flag, else its feature flag,
    /// else disabled. Base is always enabled.
    pub fn is_enabled(&self, component: ComponentName) -> bool {
        let Some(feature) = component.feature() else {
            return true;
        };
        self.component(component)
            .and_then(|c| c.enabled)
            .or_else(|| self.feature(feature).and_then(|f| f.enabled))
            .unwrap_or(false)
    }

    /// Enabled components in declaration order, Base first
    pub fn enabled_components(&self) -> Vec<ComponentName> {
        ComponentName::ALL
            .into_iter()
            .filter(|c| self.is_enabled(*c))
            .collect()
    }

    /// Features with at least one enabled component
    pub fn enabled_features(&self) -> BTreeSet<FeatureName> {
        self.enabled_components()
            .into_iter()
            .filter_map(ComponentName::feature)
            .collect()
    }

    /// Namespace a component installs into: its own override, else the
    /// feature namespace, else `defaultNamespace`, else [`DEFAULT_NAMESPACE`].
    pub fn namespace_for(&self, component: ComponentName) -> String {
        let own = self.component(component).and_then(|c| c.namespace.clone());
        let shared = component
            .feature()
            .and_then(|f| self.feature(f))
            .and_then(|f| f.components.as_ref())
            .and_then(|c| c.namespace.clone());

        own.or(shared)
            .or_else(|| self.default_namespace.clone())
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
    }

    /// Validate the control-plane specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        for feature in FeatureName::ALL {
            if let Some(components) = self.feature(feature).and_then(|f| f.components.as_ref()) {
                validate_ownership(feature, components)?;
            }
        }

        if let Some(values) = &self.values {
            if !values.is_object() {
                return Err(crate::Error::validation("values must be a mapping"));
            }
        }

        Ok(())
    }
}

/// Status for a MeshControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshControlPlaneStatus {
    /// Health per enabled feature, keyed by feature name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, HealthStatus>,

    /// Human-readable summary of the last reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation of the spec last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Every kind the instance has ever applied. Prune and delete list
    /// these on top of the fixed prunable kinds.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub applied_kinds: BTreeSet<ObjectKind>,
}

impl MeshControlPlaneStatus {
    /// Record the health of a feature and return self for chaining
    pub fn feature(mut self, feature: FeatureName, health: HealthStatus) -> Self {
        self.features.insert(feature.spec_key().to_string(), health);
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Set the recorded kinds and return self for chaining
    pub fn applied_kinds(mut self, kinds: BTreeSet<ObjectKind>) -> Self {
        self.applied_kinds = kinds;
        self
    }

    /// Health recorded for `feature`
    pub fn health(&self, feature: FeatureName) -> Option<HealthStatus> {
        self.features.get(feature.spec_key()).copied()
    }

    /// True when every recorded feature is healthy
    pub fn is_healthy(&self) -> bool {
        self.features.values().all(|h| *h == HealthStatus::Healthy)
    }
}
