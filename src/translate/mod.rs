//! Values-to-spec translation.
//!
//! A legacy values document is converted into a control-plane spec tree in
//! four passes over a working copy of the source. Each pass removes what it
//! consumed, so later passes only see what is left:
//!
//! 1. Enablement and namespaces: component flags, feature flags (logical OR
//!    of their components) and namespace fan-out.
//! 2. Direct API mappings: leaves matched by longest prefix against
//!    [`TranslationTable::api`]. Empty strings and zero are skipped.
//! 3. Per-component K8s settings for enabled components, including the
//!    computed autoscale, env and anti-affinity conversions.
//! 4. Residual leaves under an enabled component's root land in that
//!    component's `values` bucket. Anything else is dropped.
//!
//! Translation is all-or-nothing: any malformed input returns an error and
//! no partial tree.

mod table;
pub mod transform;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::component::ComponentName;
use crate::crd::MeshControlPlaneSpec;
use crate::tree::{self, is_unset, type_name, Path};
use crate::Error;

pub use table::{
    component_path, expand_templates, feature_enabled_path, render_template, values_root,
    EnablementRule, K8sRule, K8sTemplate, Transform, TranslationTable, K8S_TEMPLATES,
};

/// Whether a component without an explicit `enabled` key is installed.
pub const DEFAULT_COMPONENT_ENABLED: bool = false;

/// Translates between values documents and control-plane spec trees.
///
/// Holds only the immutable rule tables, so one instance can be shared by
/// any number of concurrent callers.
#[derive(Clone, Debug)]
pub struct Translator {
    table: Arc<TranslationTable>,
}

impl Default for Translator {
    fn default() -> Self {
        Self::new(Arc::new(TranslationTable::new()))
    }
}

impl Translator {
    /// Translator over prebuilt tables
    pub fn new(table: Arc<TranslationTable>) -> Self {
        Self { table }
    }

    /// Rule tables in use
    pub fn table(&self) -> &TranslationTable {
        &self.table
    }

    /// Translate a values tree into a control-plane spec tree.
    pub fn translate(&self, source: &Value) -> Result<Value, Error> {
        if !source.is_object() {
            return Err(Error::translation(
                "",
                format!("values document must be a mapping, found {}", type_name(source)),
            ));
        }

        let mut remaining = source.clone();
        let mut out = Value::Object(Map::new());

        let enabled = self.translate_enablement(&mut remaining, &mut out)?;
        self.translate_namespaces(&mut remaining, &mut out)?;
        self.translate_api(&mut remaining, &mut out)?;
        self.translate_k8s(&mut remaining, &mut out, &enabled)?;
        self.translate_residuals(&remaining, &mut out, &enabled)?;

        debug!(enabled = enabled.len(), "translated values document");
        Ok(out)
    }

    /// Translate a values tree and decode it into the typed spec.
    pub fn translate_spec(&self, source: &Value) -> Result<MeshControlPlaneSpec, Error> {
        let tree = self.translate(source)?;
        serde_json::from_value(tree)
            .map_err(|e| Error::translation("", format!("translated spec is not well formed: {e}")))
    }

    /// Render a control-plane spec tree back into the values shape.
    ///
    /// The first destination of each namespace mapping is treated as the
    /// canonical one. Computed K8s settings are converted back to their
    /// source settings and each component's `values` bucket is merged under
    /// its values root.
    pub fn to_values(&self, spec: &Value) -> Result<Value, Error> {
        let mut out = Value::Object(Map::new());

        // Shorter sources first so passthrough subtrees never overwrite the
        // specific settings placed inside them.
        let mut api: Vec<(&Path, &Path)> = self.table.api().iter().collect();
        api.sort_by_key(|(src, _)| src.len());
        for (src, dest) in api {
            if let Some(value) = tree::get(spec, dest) {
                tree::set(&mut out, src, value.clone())?;
            }
        }

        for (src, dests) in self.table.namespaces() {
            let canonical = dests.first().and_then(|d| tree::get(spec, d));
            if let Some(Value::String(ns)) = canonical {
                if !ns.is_empty() {
                    tree::set(&mut out, src, Value::String(ns.clone()))?;
                }
            }
        }

        for rule in self.table.enablement() {
            if let Some(Value::Bool(flag)) = tree::get(spec, &rule.component_flag) {
                tree::set(&mut out, &rule.source, Value::Bool(*flag))?;
            }
            self.component_to_values(spec, rule.component, &mut out)?;
        }

        Ok(out)
    }

    fn component_to_values(
        &self,
        spec: &Value,
        component: ComponentName,
        out: &mut Value,
    ) -> Result<(), Error> {
        let (Some(spec_root), Some(root)) = (component_path(component), values_root(component))
        else {
            return Ok(());
        };

        for rule in self.table.k8s_rules(component) {
            let Some(value) = tree::get(spec, &rule.dest) else {
                continue;
            };
            match rule.transform {
                None => tree::set(out, &rule.source, value.clone())?,
                Some(Transform::Autoscale) => {
                    if rule.source.last() == Some(transform::AUTOSCALE_ENABLED) {
                        for (key, setting) in transform::autoscale_settings(value) {
                            tree::set(out, &root.child(key), setting)?;
                        }
                    }
                }
                Some(Transform::EnvList) => {
                    tree::set(out, &rule.source, transform::env_mapping(value))?
                }
                Some(Transform::AntiAffinity) => tree::set(
                    out,
                    &rule.source,
                    transform::anti_affinity_selectors(value),
                )?,
            }
        }

        if let Some(bucket) = tree::get(spec, &spec_root.child("values")) {
            let mut overlay = Value::Null;
            tree::set(&mut overlay, &root, bucket.clone())?;
            tree::merge(out, overlay);
        }
        Ok(())
    }

    fn translate_enablement(
        &self,
        remaining: &mut Value,
        out: &mut Value,
    ) -> Result<BTreeSet<ComponentName>, Error> {
        let mut enabled = BTreeSet::new();

        for rule in self.table.enablement() {
            let on = match tree::get(remaining, &rule.source) {
                None | Some(Value::Null) => DEFAULT_COMPONENT_ENABLED,
                Some(Value::Bool(b)) => *b,
                Some(other) => {
                    return Err(Error::translation(
                        rule.source.to_string(),
                        format!("expected a boolean, found {}", type_name(other)),
                    ))
                }
            };
            tree::delete(remaining, &rule.source);

            tree::set(out, &rule.component_flag, Value::Bool(on))?;
            let feature_on = tree::get(out, &rule.feature_flag)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            tree::set(out, &rule.feature_flag, Value::Bool(feature_on || on))?;

            if on {
                enabled.insert(rule.component);
            }
        }

        Ok(enabled)
    }

    fn translate_namespaces(&self, remaining: &mut Value, out: &mut Value) -> Result<(), Error> {
        for (src, dests) in self.table.namespaces() {
            match tree::get(remaining, src) {
                None => continue,
                Some(Value::String(ns)) if !ns.is_empty() => {
                    let ns = Value::String(ns.clone());
                    for dest in dests {
                        tree::set(out, dest, ns.clone())?;
                    }
                }
                Some(v) if is_unset(v) => {}
                Some(other) => {
                    return Err(Error::translation(
                        src.to_string(),
                        format!("expected a namespace name, found {}", type_name(other)),
                    ))
                }
            }
            tree::delete(remaining, src);
        }
        Ok(())
    }

    fn translate_api(&self, remaining: &mut Value, out: &mut Value) -> Result<(), Error> {
        for (path, value) in tree::leaves(remaining) {
            let Some((matched, dest)) = self.table.api().longest_prefix(&path) else {
                continue;
            };
            if is_unset(&value) {
                trace!(path = %path, "skipping unset value");
                continue;
            }
            tree::set(out, &dest.join(&path[matched..]), value)?;
            tree::delete(remaining, &path);
        }
        Ok(())
    }

    fn translate_k8s(
        &self,
        remaining: &mut Value,
        out: &mut Value,
        enabled: &BTreeSet<ComponentName>,
    ) -> Result<(), Error> {
        for &component in enabled {
            for rule in self.table.k8s_rules(component) {
                let Some(value) = tree::get(remaining, &rule.source).cloned() else {
                    continue;
                };

                let written = match rule.transform {
                    Some(Transform::Autoscale) => Self::take_autoscale(remaining, &rule.source)?,
                    _ if is_unset(&value) => None,
                    None => Some(value),
                    Some(Transform::EnvList) => transform::env_list(&rule.source, &value)?,
                    Some(Transform::AntiAffinity) => {
                        transform::anti_affinity(&rule.source, &value)?
                    }
                };
                tree::delete(remaining, &rule.source);

                if let Some(value) = written {
                    tree::set(out, &rule.dest, value)?;
                }
            }
        }
        Ok(())
    }

    /// Read and consume all three autoscale settings of the component that
    /// owns `source`.
    fn take_autoscale(remaining: &mut Value, source: &Path) -> Result<Option<Value>, Error> {
        let root = source.parent().unwrap_or_default();
        let keys = [
            transform::AUTOSCALE_ENABLED,
            transform::AUTOSCALE_MIN,
            transform::AUTOSCALE_MAX,
        ]
        .map(|key| root.child(key));

        let hpa = transform::autoscale(
            &root,
            tree::get(remaining, &keys[0]),
            tree::get(remaining, &keys[1]),
            tree::get(remaining, &keys[2]),
        )?;
        for key in &keys {
            tree::delete(remaining, key);
        }
        Ok(hpa)
    }

    fn translate_residuals(
        &self,
        remaining: &Value,
        out: &mut Value,
        enabled: &BTreeSet<ComponentName>,
    ) -> Result<(), Error> {
        for (path, value) in tree::leaves(remaining) {
            let Some((matched, component)) = self.table.component_roots().longest_prefix(&path)
            else {
                trace!(path = %path, "dropping values leaf with no owner");
                continue;
            };
            if !enabled.contains(component) {
                trace!(path = %path, component = %component, "dropping setting of disabled component");
                continue;
            }
            let Some(bucket) = component_path(*component).map(|p| p.child("values")) else {
                continue;
            };
            tree::set(out, &bucket.join(&path[matched..]), value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn translate(source: Value) -> Value {
        Translator::default().translate(&source).unwrap()
    }

    #[test]
    fn enabled_component_sets_component_and_feature_flags() {
        let out = translate(json!({"pilot": {"enabled": true}}));
        assert_eq!(out["trafficManagement"]["enabled"], true);
        assert_eq!(out["trafficManagement"]["components"]["pilot"]["enabled"], true);
        // Everything else defaults to disabled
        assert_eq!(out["configManagement"]["enabled"], false);
        assert_eq!(out["configManagement"]["components"]["galley"]["enabled"], false);
    }

    #[test]
    fn feature_flag_is_the_or_of_its_components() {
        let out = translate(json!({
            "citadel": {"enabled": false},
            "nodeagent": {"enabled": true},
            "certmanager": {"enabled": false}
        }));
        assert_eq!(out["security"]["enabled"], true);
        assert_eq!(out["security"]["components"]["citadel"]["enabled"], false);
        assert_eq!(out["security"]["components"]["nodeAgent"]["enabled"], true);

        let out = translate(json!({"citadel": {"enabled": false}}));
        assert_eq!(out["security"]["enabled"], false);
    }

    #[test]
    fn non_boolean_enabled_is_rejected() {
        let err = Translator::default()
            .translate(&json!({"galley": {"enabled": "yes"}}))
            .unwrap_err();
        assert!(matches!(err, Error::Translation { ref path, .. } if path == "galley.enabled"));
    }

    #[test]
    fn non_mapping_document_is_rejected() {
        assert!(Translator::default().translate(&json!(["pilot"])).is_err());
    }

    #[test]
    fn global_settings_map_by_longest_prefix() {
        let out = translate(json!({
            "global": {
                "hub": "docker.io/mesh",
                "tag": "1.4.0",
                "monitoringPort": 15014,
                "proxy": {"image": "proxyv2"}
            }
        }));
        assert_eq!(out["hub"], "docker.io/mesh");
        assert_eq!(out["tag"], "1.4.0");
        assert_eq!(out["monitoringPort"], 15014);
        assert_eq!(out["values"]["global"], json!({"proxy": {"image": "proxyv2"}}));
    }

    #[test]
    fn empty_and_zero_values_are_not_written() {
        let out = translate(json!({"global": {"hub": "", "monitoringPort": 0}}));
        assert!(out.get("hub").is_none());
        assert!(out.get("monitoringPort").is_none());
        assert!(out.get("values").is_none());
    }

    #[test]
    fn namespaces_fan_out() {
        let out = translate(json!({
            "global": {"istioNamespace": "mesh-system", "telemetryNamespace": "mesh-telemetry"}
        }));
        assert_eq!(out["defaultNamespace"], "mesh-system");
        assert_eq!(out["trafficManagement"]["components"]["namespace"], "mesh-system");
        assert_eq!(out["gateways"]["components"]["namespace"], "mesh-system");
        assert_eq!(out["telemetry"]["components"]["namespace"], "mesh-telemetry");
        assert!(out["configManagement"]["components"].get("namespace").is_none());
        // consumed, so not duplicated into the global passthrough
        assert!(out.get("values").is_none());
    }

    #[test]
    fn k8s_settings_are_mapped_for_enabled_components() {
        let out = translate(json!({
            "pilot": {
                "enabled": true,
                "replicaCount": 2,
                "autoscaleEnabled": true,
                "autoscaleMin": 1,
                "autoscaleMax": 3,
                "env": {"GODEBUG": "gctrace=1"},
                "resources": {"requests": {"cpu": "500m"}}
            }
        }));
        let k8s = &out["trafficManagement"]["components"]["pilot"]["k8s"];
        assert_eq!(k8s["replicaCount"], 2);
        assert_eq!(k8s["hpaSpec"], json!({"minReplicas": 1, "maxReplicas": 3}));
        assert_eq!(k8s["env"], json!([{"name": "GODEBUG", "value": "gctrace=1"}]));
        assert_eq!(k8s["resources"]["requests"]["cpu"], "500m");
        // consumed settings never reach the values bucket
        assert!(out["trafficManagement"]["components"]["pilot"].get("values").is_none());
    }

    #[test]
    fn disabled_autoscale_consumes_all_three_keys() {
        let out = translate(json!({
            "galley": {"enabled": true, "autoscaleEnabled": false, "autoscaleMin": 1, "autoscaleMax": 3}
        }));
        let galley = &out["configManagement"]["components"]["galley"];
        assert!(galley.get("k8s").is_none());
        assert!(galley.get("values").is_none());
    }

    #[test]
    fn env_sequence_fails_the_whole_translation() {
        let err = Translator::default()
            .translate(&json!({"pilot": {"enabled": true, "env": ["A=1"]}}))
            .unwrap_err();
        assert!(err.to_string().contains("pilot.env"));
    }

    #[test]
    fn residual_settings_land_in_the_values_bucket() {
        let out = translate(json!({
            "pilot": {"enabled": true, "traceSampling": 1.5, "keepaliveMaxServerConnectionAge": "30m"},
            "mixer": {"enabled": true, "policy": {"enabled": true, "adapters": {"stdio": true}}}
        }));
        assert_eq!(
            out["trafficManagement"]["components"]["pilot"]["values"],
            json!({"traceSampling": 1.5, "keepaliveMaxServerConnectionAge": "30m"})
        );
        assert_eq!(
            out["policy"]["components"]["policy"]["values"],
            json!({"adapters": {"stdio": true}})
        );
    }

    #[test]
    fn disabled_components_keep_nothing_but_their_flag() {
        let out = translate(json!({
            "galley": {"enabled": false, "replicaCount": 3, "image": "galley"}
        }));
        assert_eq!(
            out["configManagement"]["components"]["galley"],
            json!({"enabled": false})
        );
    }

    #[test]
    fn inverse_restores_the_values_shape() {
        let translator = Translator::default();
        let spec = translator
            .translate(&json!({
                "global": {"hub": "h", "istioNamespace": "mesh-system", "proxy": {"image": "p"}},
                "pilot": {"enabled": true, "autoscaleMin": 2, "traceSampling": 1.5}
            }))
            .unwrap();
        let values = translator.to_values(&spec).unwrap();

        assert_eq!(values["global"]["hub"], "h");
        assert_eq!(values["global"]["istioNamespace"], "mesh-system");
        assert_eq!(values["global"]["proxy"]["image"], "p");
        assert_eq!(values["pilot"]["enabled"], true);
        assert_eq!(values["pilot"]["autoscaleEnabled"], true);
        assert_eq!(values["pilot"]["autoscaleMin"], 2);
        assert_eq!(values["pilot"]["traceSampling"], 1.5);
        assert_eq!(values["galley"]["enabled"], false);
    }

    #[test]
    fn typed_spec_decodes_translated_tree() {
        let spec = Translator::default()
            .translate_spec(&json!({
                "global": {"hub": "h", "tag": "t"},
                "sidecarInjectorWebhook": {"enabled": true, "replicaCount": 2}
            }))
            .unwrap();
        assert_eq!(spec.hub.as_deref(), Some("h"));
        let injector = spec
            .component(ComponentName::SidecarInjector)
            .expect("component present");
        assert_eq!(injector.enabled, Some(true));
        assert_eq!(injector.k8s.as_ref().and_then(|k| k.replica_count), Some(2));
    }
}
