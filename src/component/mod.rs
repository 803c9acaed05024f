//! Installable components and the features that group them.
//!
//! Both sets are closed: every translation table, install tree and status
//! entry is derived from the enums below.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// A user-facing grouping of components that is enabled as a unit
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeatureName {
    /// Service discovery and traffic routing
    TrafficManagement,
    /// Configuration validation and distribution
    ConfigManagement,
    /// Automatic sidecar injection
    AutoInjection,
    /// Policy checks
    Policy,
    /// Telemetry collection
    Telemetry,
    /// Certificates and workload identity
    Security,
    /// Ingress and egress gateways
    Gateways,
}

impl FeatureName {
    /// Every feature in declaration order
    pub const ALL: [FeatureName; 7] = [
        Self::TrafficManagement,
        Self::ConfigManagement,
        Self::AutoInjection,
        Self::Policy,
        Self::Telemetry,
        Self::Security,
        Self::Gateways,
    ];

    /// Key of this feature in the control-plane spec
    pub fn spec_key(self) -> &'static str {
        match self {
            Self::TrafficManagement => "trafficManagement",
            Self::ConfigManagement => "configManagement",
            Self::AutoInjection => "autoInjection",
            Self::Policy => "policy",
            Self::Telemetry => "telemetry",
            Self::Security => "security",
            Self::Gateways => "gateways",
        }
    }
}

impl fmt::Display for FeatureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec_key())
    }
}

impl FromStr for FeatureName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.spec_key() == s)
            .ok_or_else(|| Error::validation(format!("unknown feature '{s}'")))
    }
}

/// An independently installable unit backed by one chart
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComponentName {
    /// Shared resources every other component needs
    Base,
    /// Discovery and proxy configuration
    Pilot,
    /// Configuration validation
    Galley,
    /// Sidecar injection webhook
    SidecarInjector,
    /// Policy enforcement
    Policy,
    /// Telemetry aggregation
    Telemetry,
    /// Certificate authority
    Citadel,
    /// Per-node certificate agent
    NodeAgent,
    /// ACME certificate manager
    CertManager,
    /// Ingress gateway
    IngressGateway,
    /// Egress gateway
    EgressGateway,
}

impl ComponentName {
    /// Every component in declaration order
    pub const ALL: [ComponentName; 11] = [
        Self::Base,
        Self::Pilot,
        Self::Galley,
        Self::SidecarInjector,
        Self::Policy,
        Self::Telemetry,
        Self::Citadel,
        Self::NodeAgent,
        Self::CertManager,
        Self::IngressGateway,
        Self::EgressGateway,
    ];

    /// Key of this component in the control-plane spec
    pub fn spec_key(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Pilot => "pilot",
            Self::Galley => "galley",
            Self::SidecarInjector => "sidecarInjector",
            Self::Policy => "policy",
            Self::Telemetry => "telemetry",
            Self::Citadel => "citadel",
            Self::NodeAgent => "nodeAgent",
            Self::CertManager => "certManager",
            Self::IngressGateway => "ingressGateway",
            Self::EgressGateway => "egressGateway",
        }
    }

    /// Owning feature. Base belongs to none and is always installed.
    pub fn feature(self) -> Option<FeatureName> {
        match self {
            Self::Base => None,
            Self::Pilot => Some(FeatureName::TrafficManagement),
            Self::Galley => Some(FeatureName::ConfigManagement),
            Self::SidecarInjector => Some(FeatureName::AutoInjection),
            Self::Policy => Some(FeatureName::Policy),
            Self::Telemetry => Some(FeatureName::Telemetry),
            Self::Citadel | Self::NodeAgent | Self::CertManager => Some(FeatureName::Security),
            Self::IngressGateway | Self::EgressGateway => Some(FeatureName::Gateways),
        }
    }

    /// Dotted root of this component's settings in a values document
    pub fn values_key(self) -> Option<&'static str> {
        match self {
            Self::Base => None,
            Self::Pilot => Some("pilot"),
            Self::Galley => Some("galley"),
            Self::SidecarInjector => Some("sidecarInjectorWebhook"),
            Self::Policy => Some("mixer.policy"),
            Self::Telemetry => Some("mixer.telemetry"),
            Self::Citadel => Some("citadel"),
            Self::NodeAgent => Some("nodeagent"),
            Self::CertManager => Some("certmanager"),
            Self::IngressGateway => Some("gateways.istio-ingressgateway"),
            Self::EgressGateway => Some("gateways.istio-egressgateway"),
        }
    }

    /// Chart location relative to the charts directory
    pub fn chart(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Pilot => "control/discovery",
            Self::Galley => "control/config",
            Self::SidecarInjector => "control/autoinject",
            Self::Policy => "policy",
            Self::Telemetry => "telemetry",
            Self::Citadel => "security/citadel",
            Self::NodeAgent => "security/nodeagent",
            Self::CertManager => "security/certmanager",
            Self::IngressGateway => "gateways/ingress",
            Self::EgressGateway => "gateways/egress",
        }
    }

    /// Component whose chart lives at `chart`
    pub fn from_chart(chart: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.chart() == chart)
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spec_key())
    }
}

impl FromStr for ComponentName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.spec_key() == s)
            .ok_or_else(|| Error::validation(format!("unknown component '{s}'")))
    }
}
