//! Legacy values to MeshControlPlane conversion
//!
//! The values document comes from a file or from a ConfigMap already in the
//! cluster. The translated spec is layered over an optional profile and an
//! optional base resource, in that order, and validated before it is
//! returned.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info};

use crate::crd::{MeshControlPlane, MeshControlPlaneSpec};
use crate::profile::spec_of;
use crate::translate::Translator;
use crate::tree;
use crate::yaml::parse_yaml;
use crate::Error;

/// ConfigMap entry holding the values document
pub const DEFAULT_VALUES_KEY: &str = "values";

/// A ConfigMap named as `<namespace>/<name>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigMapRef {
    /// Namespace of the ConfigMap
    pub namespace: String,
    /// Name of the ConfigMap
    pub name: String,
}

impl FromStr for ConfigMapRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(Error::validation(format!(
                "ConfigMap reference '{s}' is not <namespace>/<name>"
            ))),
        }
    }
}

impl fmt::Display for ConfigMapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Values document stored under `key` of a ConfigMap. The entry may hold
/// YAML or JSON.
pub fn values_from_configmap(configmap: &ConfigMap, key: &str) -> Result<Value, Error> {
    let text = configmap
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| {
            Error::validation(format!(
                "ConfigMap {}/{} has no '{key}' entry",
                configmap.namespace().unwrap_or_default(),
                configmap.name_any()
            ))
        })?;

    let values = parse_yaml(text)?;
    if !values.is_object() {
        return Err(Error::validation(format!(
            "'{key}' of ConfigMap {} is not a mapping",
            configmap.name_any()
        )));
    }
    Ok(values)
}

/// One conversion of a values document
#[derive(Clone, Debug, Default)]
pub struct Migration {
    profile: Option<(String, Value)>,
    base: Option<Value>,
}

impl Migration {
    /// Conversion with no layers below the translation
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer the translation over the loaded spec of profile `name`. The
    /// result records `name` as its profile.
    pub fn profile(mut self, name: impl Into<String>, spec: Value) -> Self {
        self.profile = Some((name.into(), spec));
        self
    }

    /// Layer the translation over an existing resource or bare spec. The
    /// base itself sits over the profile.
    pub fn base(mut self, doc: Value) -> Self {
        self.base = Some(spec_of(doc));
        self
    }

    /// Translate `values` and layer the result.
    pub fn run(&self, translator: &Translator, values: &Value) -> Result<MeshControlPlaneSpec, Error> {
        let translated = translator.translate(values)?;

        let mut layered = Value::Object(Default::default());
        if let Some((name, spec)) = &self.profile {
            debug!(profile = %name, "layering over profile");
            tree::merge(&mut layered, spec.clone());
        }
        if let Some(base) = &self.base {
            tree::merge(&mut layered, base.clone());
        }
        tree::merge(&mut layered, translated);

        let mut spec: MeshControlPlaneSpec = serde_json::from_value(layered).map_err(|e| {
            Error::validation(format!("translated spec is not a valid MeshControlPlane: {e}"))
        })?;
        if let Some((name, _)) = &self.profile {
            spec.profile.get_or_insert_with(|| name.clone());
        }
        spec.validate()?;

        info!(components = spec.enabled_components().len(), "values migrated");
        Ok(spec)
    }

    /// [`Migration::run`] wrapped into a resource
    pub fn resource(
        &self,
        translator: &Translator,
        values: &Value,
        name: &str,
        namespace: &str,
    ) -> Result<MeshControlPlane, Error> {
        let mut resource = MeshControlPlane::new(name, self.run(translator, values)?);
        resource.metadata.namespace = Some(namespace.to_string());
        Ok(resource)
    }
}
