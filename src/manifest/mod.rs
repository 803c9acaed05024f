//! Rendered manifest handling
//!
//! Splitting renderer output into documents, identifying objects, stamping
//! ownership labels, and comparing two manifest sets.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::component::ComponentName;
use crate::tree;
use crate::yaml::parse_yaml;
use crate::Error;

/// Label naming the owning control-plane instance
pub const OWNER_NAME_LABEL: &str = "meshop.io/owner-name";
/// Label naming the owning instance's namespace
pub const OWNER_NAMESPACE_LABEL: &str = "meshop.io/owner-namespace";
/// Label naming the component that rendered the object
pub const COMPONENT_LABEL: &str = "meshop.io/component";

/// Kinds checked for stale objects on every prune.
///
/// CustomResourceDefinitions are never listed here: removing one deletes
/// every custom resource of that type.
pub const PRUNABLE_KINDS: &[(&str, &str)] = &[
    ("v1", "ConfigMap"),
    ("v1", "Secret"),
    ("v1", "Service"),
    ("v1", "ServiceAccount"),
    ("v1", "Endpoints"),
    ("apps/v1", "Deployment"),
    ("apps/v1", "DaemonSet"),
    ("apps/v1", "StatefulSet"),
    ("batch/v1", "Job"),
    ("autoscaling/v2", "HorizontalPodAutoscaler"),
    ("policy/v1", "PodDisruptionBudget"),
    ("rbac.authorization.k8s.io/v1", "ClusterRole"),
    ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding"),
    ("rbac.authorization.k8s.io/v1", "Role"),
    ("rbac.authorization.k8s.io/v1", "RoleBinding"),
    (
        "admissionregistration.k8s.io/v1",
        "MutatingWebhookConfiguration",
    ),
    (
        "admissionregistration.k8s.io/v1",
        "ValidatingWebhookConfiguration",
    ),
];

/// Kind never removed by prune
pub const CRD_KIND: &str = "CustomResourceDefinition";

/// Split a multi-document stream on `---` boundary lines, dropping
/// documents that hold only whitespace or comments.
pub fn split_documents(text: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if is_boundary(line) {
            push_document(&mut docs, std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    push_document(&mut docs, current);
    docs
}

fn is_boundary(line: &str) -> bool {
    match line.strip_prefix("---") {
        Some(rest) => rest.trim().is_empty() || rest.trim_start().starts_with('#'),
        None => false,
    }
}

fn push_document(docs: &mut Vec<String>, doc: String) {
    let has_content = doc.lines().any(|l| {
        let l = l.trim();
        !l.is_empty() && !l.starts_with('#')
    });
    if has_content {
        docs.push(doc);
    }
}

/// Top-level `kind` of a YAML document, found without a full parse.
///
/// Only unindented `kind:` lines count, so nested kinds such as owner
/// references are ignored. Returns "" when absent.
pub fn extract_kind(doc: &str) -> &str {
    for line in doc.lines() {
        if let Some(value) = line.strip_prefix("kind:") {
            return value.trim().trim_matches('"').trim_matches('\'');
        }
    }
    ""
}

/// Apply order within one chart (lower first).
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        CRD_KIND => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" | "Endpoints" => 6,
        "Deployment" | "DaemonSet" | "StatefulSet" | "Job" => 7,
        "HorizontalPodAutoscaler" | "PodDisruptionBudget" => 8,
        // Webhooks last: they point at services that must already exist.
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => 10,
        _ => 9,
    }
}

/// Split an apiVersion into (group, version). The core group is "".
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// An object type
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectKind {
    /// group/version, or just the version for the core group
    pub api_version: String,
    /// Kind name
    pub kind: String,
}

impl ObjectKind {
    /// Kind from its parts
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// The fixed prunable set
    pub fn prunable() -> BTreeSet<ObjectKind> {
        PRUNABLE_KINDS
            .iter()
            .map(|(api_version, kind)| Self::new(*api_version, *kind))
            .collect()
    }
}

/// Identity of one object in the cluster
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// group/version
    pub api_version: String,
    /// Kind name
    pub kind: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Identity of a decoded object
    pub fn from_value(obj: &Value) -> Result<Self, Error> {
        let field = |pointer: &str| -> Result<String, Error> {
            obj.pointer(pointer)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::serialization(format!("manifest is missing {}", &pointer[1..]))
                })
        };

        Ok(Self {
            api_version: field("/apiVersion")?,
            kind: field("/kind")?,
            namespace: obj
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            name: field("/metadata/name")?,
        })
    }

    /// Type of this object
    pub fn object_kind(&self) -> ObjectKind {
        ObjectKind::new(self.api_version.clone(), self.kind.clone())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// The control-plane instance that owns rendered objects
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    /// Instance name
    pub name: String,
    /// Instance namespace
    pub namespace: String,
}

impl Owner {
    /// Owner from its parts
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Label selector matching every object this owner applied
    pub fn selector(&self) -> String {
        format!(
            "{OWNER_NAME_LABEL}={},{OWNER_NAMESPACE_LABEL}={}",
            self.name, self.namespace
        )
    }

    /// Stamp ownership labels on `obj` and default its namespace.
    pub fn claim(
        &self,
        obj: &mut Value,
        component: Option<ComponentName>,
        default_namespace: &str,
    ) -> Result<(), Error> {
        let mut labels = vec![
            (OWNER_NAME_LABEL, self.name.clone()),
            (OWNER_NAMESPACE_LABEL, self.namespace.clone()),
        ];
        if let Some(component) = component {
            labels.push((COMPONENT_LABEL, component.to_string()));
        }
        for (key, value) in labels {
            let path = [
                "metadata".to_string(),
                "labels".to_string(),
                key.to_string(),
            ];
            tree::set(obj, &path, Value::String(value))?;
        }

        let ns_path = ["metadata".to_string(), "namespace".to_string()];
        let has_namespace = tree::get(obj, &ns_path)
            .and_then(Value::as_str)
            .is_some_and(|ns| !ns.is_empty());
        if !has_namespace {
            tree::set(obj, &ns_path, Value::String(default_namespace.to_string()))?;
        }
        Ok(())
    }
}

/// Component recorded in an object's labels
pub fn component_of(obj: &Value) -> Option<ComponentName> {
    obj.pointer("/metadata/labels")
        .and_then(|labels| labels.get(COMPONENT_LABEL))
        .and_then(Value::as_str)
        .and_then(|name| name.parse().ok())
}

/// Parse every object in a manifest stream, keyed by identity.
pub fn parse_objects(text: &str) -> Result<BTreeMap<ObjectKey, Value>, Error> {
    let mut objects = BTreeMap::new();
    for doc in split_documents(text) {
        let obj = parse_yaml(&doc)?;
        if obj.is_null() {
            continue;
        }
        objects.insert(ObjectKey::from_value(&obj)?, obj);
    }
    Ok(objects)
}

/// Compare two manifest streams object by object.
///
/// Returns an empty string when both contain the same objects with the same
/// content. Otherwise one line per difference.
pub fn diff_manifests(left: &str, right: &str) -> Result<String, Error> {
    let left = parse_objects(left)?;
    let right = parse_objects(right)?;
    let mut out = Vec::new();

    for (key, obj) in &left {
        match right.get(key) {
            None => out.push(format!("only in left: {key}")),
            Some(other) if other != obj => {
                out.push(format!("changed: {key}"));
                out.extend(diff_leaves(obj, other));
            }
            Some(_) => {}
        }
    }
    for key in right.keys().filter(|k| !left.contains_key(*k)) {
        out.push(format!("only in right: {key}"));
    }

    Ok(out.join("\n"))
}

fn diff_leaves(left: &Value, right: &Value) -> Vec<String> {
    let flatten = |v: &Value| -> BTreeMap<String, Value> {
        tree::leaves(v)
            .into_iter()
            .map(|(path, leaf)| (path.to_string(), leaf))
            .collect()
    };
    let left = flatten(left);
    let right = flatten(right);
    let paths: BTreeSet<&String> = left.keys().chain(right.keys()).collect();

    paths
        .into_iter()
        .filter_map(|path| match (left.get(path), right.get(path)) {
            (Some(a), Some(b)) if a == b => None,
            (Some(a), Some(b)) => Some(format!("  {path}: {a} -> {b}")),
            (Some(a), None) => Some(format!("  {path}: {a} -> <absent>")),
            (None, Some(b)) => Some(format!("  {path}: <absent> -> {b}")),
            (None, None) => None,
        })
        .collect()
}

/// Copy `resourceVersion` from a live object into the desired one so an
/// update passes optimistic concurrency checks.
pub fn carry_resource_version(desired: &mut Value, live: &Value) {
    let Some(version) = live.pointer("/metadata/resourceVersion").cloned() else {
        return;
    };
    if let Some(metadata) = desired
        .as_object_mut()
        .map(|obj| obj.entry("metadata").or_insert_with(|| Value::Object(Map::new())))
        .and_then(Value::as_object_mut)
    {
        metadata.insert("resourceVersion".to_string(), version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TWO_OBJECTS: &str = r#"# Source: discovery/templates/serviceaccount.yaml
apiVersion: v1
kind: ServiceAccount
metadata:
  name: discovery
---
# Source: discovery/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: discovery
  namespace: mesh-system
  ownerReferences:
  - kind: Ignored
spec:
  replicas: 1
---
# Source: discovery/templates/empty.yaml
---
"#;

    #[test]
    fn documents_split_on_boundaries_and_skip_comment_only() {
        let docs = split_documents(TWO_OBJECTS);
        assert_eq!(docs.len(), 2);
        assert_eq!(extract_kind(&docs[0]), "ServiceAccount");
        assert_eq!(extract_kind(&docs[1]), "Deployment");
        assert!(split_documents("").is_empty());
        assert!(split_documents("---\n# nothing\n---\n").is_empty());
    }

    #[test]
    fn boundary_must_start_the_line() {
        let docs = split_documents("data:\n  script: |\n    a --- b\nkind: ConfigMap\n");
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn kind_extraction_ignores_nested_kinds() {
        assert_eq!(extract_kind("metadata:\n  kind: Nested\nkind: Service\n"), "Service");
        assert_eq!(extract_kind("kind: \"Secret\"\n"), "Secret");
        assert_eq!(extract_kind("apiVersion: v1\n"), "");
    }

    #[test]
    fn kind_priority_orders_rbac_before_workloads_before_webhooks() {
        assert!(kind_priority("ServiceAccount") < kind_priority("Deployment"));
        assert!(kind_priority(CRD_KIND) < kind_priority("ConfigMap"));
        assert!(kind_priority("Deployment") < kind_priority("MutatingWebhookConfiguration"));
        assert!(kind_priority("Gateway") < kind_priority("ValidatingWebhookConfiguration"));
    }

    #[test]
    fn api_version_splits_group_and_version() {
        assert_eq!(parse_api_version("apps/v1"), ("apps".into(), "v1".into()));
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".into()));
    }

    #[test]
    fn object_key_requires_identity_fields() {
        let key = ObjectKey::from_value(&json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": "discovery", "namespace": "mesh-system"}
        }))
        .unwrap();
        assert_eq!(key.to_string(), "Service/mesh-system/discovery");
        assert_eq!(key.object_kind(), ObjectKind::new("v1", "Service"));

        let err = ObjectKey::from_value(&json!({"apiVersion": "v1", "kind": "Service"})).unwrap_err();
        assert!(err.to_string().contains("metadata/name"));
    }

    #[test]
    fn claim_labels_and_defaults_namespace() {
        let owner = Owner::new("default", "mesh-operator");
        let mut obj = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "mesh"}});
        owner
            .claim(&mut obj, Some(ComponentName::Pilot), "mesh-system")
            .unwrap();

        assert_eq!(obj["metadata"]["namespace"], "mesh-system");
        assert_eq!(obj["metadata"]["labels"][OWNER_NAME_LABEL], "default");
        assert_eq!(obj["metadata"]["labels"][OWNER_NAMESPACE_LABEL], "mesh-operator");
        assert_eq!(component_of(&obj), Some(ComponentName::Pilot));

        let mut explicit = json!({"metadata": {"name": "x", "namespace": "edge"}});
        owner.claim(&mut explicit, None, "mesh-system").unwrap();
        assert_eq!(explicit["metadata"]["namespace"], "edge");
        assert_eq!(component_of(&explicit), None);
    }

    #[test]
    fn selector_matches_both_owner_labels() {
        assert_eq!(
            Owner::new("cp", "ops").selector(),
            "meshop.io/owner-name=cp,meshop.io/owner-namespace=ops"
        );
    }

    #[test]
    fn prunable_kinds_exclude_crds() {
        let kinds = ObjectKind::prunable();
        assert!(kinds.iter().all(|k| k.kind != CRD_KIND));
        assert!(kinds.contains(&ObjectKind::new("apps/v1", "Deployment")));
    }

    #[test]
    fn identical_manifests_have_no_diff() {
        assert_eq!(diff_manifests(TWO_OBJECTS, TWO_OBJECTS).unwrap(), "");
    }

    #[test]
    fn diff_reports_changed_and_missing_objects() {
        let right = TWO_OBJECTS.replace("replicas: 1", "replicas: 2");
        let right = format!(
            "{right}---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: extra\n  namespace: mesh-system\n"
        );
        let diff = diff_manifests(TWO_OBJECTS, &right).unwrap();
        assert!(diff.contains("changed: Deployment/mesh-system/discovery"));
        assert!(diff.contains("  spec.replicas: 1 -> 2"));
        assert!(diff.contains("only in right: ConfigMap/mesh-system/extra"));
        assert!(!diff.contains("only in left"));
    }

    #[test]
    fn resource_version_is_carried_to_updates() {
        let mut desired = json!({"metadata": {"name": "x"}});
        carry_resource_version(&mut desired, &json!({"metadata": {"resourceVersion": "42"}}));
        assert_eq!(desired["metadata"]["resourceVersion"], "42");

        let mut untouched = json!({"metadata": {"name": "x"}});
        carry_resource_version(&mut untouched, &json!({"metadata": {}}));
        assert!(untouched["metadata"].get("resourceVersion").is_none());
    }
}
