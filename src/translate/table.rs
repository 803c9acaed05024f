//! Translation rule tables.
//!
//! Rules are static data. Per-component K8s rules are written once as path
//! templates and expanded for every component when the table is built, so
//! the tables are immutable by the time a translation runs.

use std::collections::BTreeMap;

use crate::component::{ComponentName, FeatureName};
use crate::tree::{Path, PrefixTable};

/// Settings that need more than a structural copy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transform {
    /// `autoscaleEnabled`/`autoscaleMin`/`autoscaleMax` into `hpaSpec`
    Autoscale,
    /// name-to-value mapping into a list of name/value pairs
    EnvList,
    /// label selector list into a pod anti-affinity block
    AntiAffinity,
}

/// A per-component rule before expansion
#[derive(Clone, Copy, Debug)]
pub struct K8sTemplate {
    /// Source path template in the values document
    pub source: &'static str,
    /// Destination path template in the control-plane spec
    pub dest: &'static str,
    /// Computed conversion, `None` for a structural copy
    pub transform: Option<Transform>,
}

const fn copy(source: &'static str, dest: &'static str) -> K8sTemplate {
    K8sTemplate {
        source,
        dest,
        transform: None,
    }
}

const fn computed(source: &'static str, dest: &'static str, transform: Transform) -> K8sTemplate {
    K8sTemplate {
        source,
        dest,
        transform: Some(transform),
    }
}

/// Templates for Kubernetes settings common to every component.
pub const K8S_TEMPLATES: &[K8sTemplate] = &[
    computed(
        "{value_key}.podAntiAffinityLabelSelector",
        "{feature}.components.{component}.k8s.affinity",
        Transform::AntiAffinity,
    ),
    computed(
        "{value_key}.env",
        "{feature}.components.{component}.k8s.env",
        Transform::EnvList,
    ),
    computed(
        "{value_key}.autoscaleEnabled",
        "{feature}.components.{component}.k8s.hpaSpec",
        Transform::Autoscale,
    ),
    computed(
        "{value_key}.autoscaleMin",
        "{feature}.components.{component}.k8s.hpaSpec",
        Transform::Autoscale,
    ),
    computed(
        "{value_key}.autoscaleMax",
        "{feature}.components.{component}.k8s.hpaSpec",
        Transform::Autoscale,
    ),
    copy(
        "{value_key}.imagePullPolicy",
        "{feature}.components.{component}.k8s.imagePullPolicy",
    ),
    copy(
        "{value_key}.nodeSelector",
        "{feature}.components.{component}.k8s.nodeSelector",
    ),
    copy(
        "{value_key}.podDisruptionBudget",
        "{feature}.components.{component}.k8s.podDisruptionBudget",
    ),
    copy(
        "{value_key}.podAnnotations",
        "{feature}.components.{component}.k8s.podAnnotations",
    ),
    copy(
        "{value_key}.priorityClassName",
        "{feature}.components.{component}.k8s.priorityClassName",
    ),
    copy(
        "{value_key}.readinessProbe",
        "{feature}.components.{component}.k8s.readinessProbe",
    ),
    copy(
        "{value_key}.replicaCount",
        "{feature}.components.{component}.k8s.replicaCount",
    ),
    copy(
        "{value_key}.resources",
        "{feature}.components.{component}.k8s.resources",
    ),
];

/// Values paths copied directly into the spec, matched by longest prefix.
const API_MAPPINGS: &[(&str, &str)] = &[
    ("global.hub", "hub"),
    ("global.tag", "tag"),
    ("global.monitoringPort", "monitoringPort"),
    ("global.trustDomain", "trustDomain"),
    ("global", "values.global"),
];

/// Namespace settings and every spec location they populate. The first
/// destination is the one read back by inverse translation.
const NAMESPACE_MAPPINGS: &[(&str, &[&str])] = &[
    (
        "global.istioNamespace",
        &[
            "defaultNamespace",
            "trafficManagement.components.namespace",
            "autoInjection.components.namespace",
            "security.components.namespace",
            "gateways.components.namespace",
        ],
    ),
    (
        "global.configNamespace",
        &["configManagement.components.namespace"],
    ),
    ("global.policyNamespace", &["policy.components.namespace"]),
    (
        "global.telemetryNamespace",
        &["telemetry.components.namespace"],
    ),
];

/// Fill `{value_key}`, `{feature}` and `{component}` in a path template.
///
/// Returns `None` for components without a feature or values root.
pub fn render_template(template: &str, component: ComponentName) -> Option<String> {
    let feature = component.feature()?;
    let value_key = component.values_key()?;
    Some(
        template
            .replace("{value_key}", value_key)
            .replace("{feature}", feature.spec_key())
            .replace("{component}", component.spec_key()),
    )
}

/// Spec path of a component's subtree: `<feature>.components.<component>`
pub fn component_path(component: ComponentName) -> Option<Path> {
    let feature = component.feature()?;
    Some(
        Path::root()
            .child(feature.spec_key())
            .child("components")
            .child(component.spec_key()),
    )
}

/// Spec path of a feature's enabled flag
pub fn feature_enabled_path(feature: FeatureName) -> Path {
    Path::root().child(feature.spec_key()).child("enabled")
}

/// Values path of a component's root, e.g. `mixer.policy`
pub fn values_root(component: ComponentName) -> Option<Path> {
    component.values_key().map(Path::parse)
}

/// One expanded per-component rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct K8sRule {
    /// Source path in the values document
    pub source: Path,
    /// Destination path in the spec
    pub dest: Path,
    /// Computed conversion, `None` for a structural copy
    pub transform: Option<Transform>,
}

/// Enablement of one component
#[derive(Clone, Debug)]
pub struct EnablementRule {
    /// Component being switched
    pub component: ComponentName,
    /// `<values root>.enabled`
    pub source: Path,
    /// `<feature>.components.<component>.enabled`
    pub component_flag: Path,
    /// `<feature>.enabled`
    pub feature_flag: Path,
}

/// All rule tables used by translation, built once and shared read-only.
#[derive(Clone, Debug)]
pub struct TranslationTable {
    api: PrefixTable<Path>,
    namespaces: Vec<(Path, Vec<Path>)>,
    enablement: Vec<EnablementRule>,
    k8s: BTreeMap<ComponentName, Vec<K8sRule>>,
    component_roots: PrefixTable<ComponentName>,
}

impl Default for TranslationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationTable {
    /// Build the tables for every known component
    pub fn new() -> Self {
        let api = API_MAPPINGS
            .iter()
            .map(|(src, dst)| (Path::parse(src), Path::parse(dst)))
            .collect();

        let namespaces = NAMESPACE_MAPPINGS
            .iter()
            .map(|(src, dests)| {
                (
                    Path::parse(src),
                    dests.iter().map(|d| Path::parse(d)).collect(),
                )
            })
            .collect();

        let mut enablement = Vec::new();
        let mut k8s = BTreeMap::new();
        let mut component_roots = PrefixTable::new();

        for component in ComponentName::ALL {
            let (Some(feature), Some(root), Some(spec_root)) = (
                component.feature(),
                values_root(component),
                component_path(component),
            ) else {
                continue;
            };

            enablement.push(EnablementRule {
                component,
                source: root.child("enabled"),
                component_flag: spec_root.child("enabled"),
                feature_flag: feature_enabled_path(feature),
            });
            k8s.insert(component, expand_templates(K8S_TEMPLATES, component));
            component_roots.insert(root, component);
        }

        Self {
            api,
            namespaces,
            enablement,
            k8s,
            component_roots,
        }
    }

    /// Direct values-to-spec mappings
    pub fn api(&self) -> &PrefixTable<Path> {
        &self.api
    }

    /// Namespace fan-out mappings
    pub fn namespaces(&self) -> &[(Path, Vec<Path>)] {
        &self.namespaces
    }

    /// One enablement rule per component that has a feature
    pub fn enablement(&self) -> &[EnablementRule] {
        &self.enablement
    }

    /// Expanded K8s rules for `component`
    pub fn k8s_rules(&self, component: ComponentName) -> &[K8sRule] {
        self.k8s.get(&component).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Values roots of every component, for residual ownership lookup
    pub fn component_roots(&self) -> &PrefixTable<ComponentName> {
        &self.component_roots
    }
}

/// Expand path templates for one component. Components without a feature
/// expand to nothing.
pub fn expand_templates(templates: &[K8sTemplate], component: ComponentName) -> Vec<K8sRule> {
    templates
        .iter()
        .filter_map(|t| {
            Some(K8sRule {
                source: Path::parse(&render_template(t.source, component)?),
                dest: Path::parse(&render_template(t.dest, component)?),
                transform: t.transform,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_render_per_component() {
        assert_eq!(
            render_template("{value_key}.env", ComponentName::Policy).as_deref(),
            Some("mixer.policy.env")
        );
        assert_eq!(
            render_template(
                "{feature}.components.{component}.k8s.env",
                ComponentName::IngressGateway
            )
            .as_deref(),
            Some("gateways.components.ingressGateway.k8s.env")
        );
        assert_eq!(render_template("{value_key}", ComponentName::Base), None);
    }

    #[test]
    fn expansion_covers_every_template_for_each_component() {
        let table = TranslationTable::new();
        assert!(table.k8s_rules(ComponentName::Base).is_empty());

        let rules = table.k8s_rules(ComponentName::Pilot);
        assert_eq!(rules.len(), K8S_TEMPLATES.len());
        let replica = rules
            .iter()
            .find(|r| r.source == Path::parse("pilot.replicaCount"))
            .unwrap();
        assert_eq!(
            replica.dest,
            Path::parse("trafficManagement.components.pilot.k8s.replicaCount")
        );
        assert_eq!(replica.transform, None);
    }

    #[test]
    fn autoscale_keys_share_one_destination() {
        let table = TranslationTable::new();
        let hpa: Vec<_> = table
            .k8s_rules(ComponentName::Galley)
            .iter()
            .filter(|r| r.transform == Some(Transform::Autoscale))
            .collect();
        assert_eq!(hpa.len(), 3);
        assert!(hpa
            .iter()
            .all(|r| r.dest == Path::parse("configManagement.components.galley.k8s.hpaSpec")));
    }

    #[test]
    fn enablement_rules_exist_for_all_featured_components() {
        let table = TranslationTable::new();
        assert_eq!(table.enablement().len(), ComponentName::ALL.len() - 1);
        let egress = table
            .enablement()
            .iter()
            .find(|r| r.component == ComponentName::EgressGateway)
            .unwrap();
        assert_eq!(egress.source.to_string(), "gateways.istio-egressgateway.enabled");
        assert_eq!(
            egress.component_flag.to_string(),
            "gateways.components.egressGateway.enabled"
        );
        assert_eq!(egress.feature_flag.to_string(), "gateways.enabled");
    }

    #[test]
    fn component_roots_resolve_nested_keys() {
        let table = TranslationTable::new();
        let roots = table.component_roots();
        assert_eq!(
            roots.longest_prefix(&Path::parse("mixer.telemetry.reportBatchMaxEntries")),
            Some((2, &ComponentName::Telemetry))
        );
        assert_eq!(roots.longest_prefix(&Path::parse("mixer.enabled")), None);
        assert_eq!(roots.longest_prefix(&Path::parse("gateways.enabled")), None);
    }

    #[test]
    fn api_table_falls_back_to_global_passthrough() {
        let table = TranslationTable::new();
        let (len, dest) = table
            .api()
            .longest_prefix(&Path::parse("global.proxy.image"))
            .unwrap();
        assert_eq!(len, 1);
        assert_eq!(dest.to_string(), "values.global");
    }
}
