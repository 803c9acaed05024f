//! Manifest rendering
//!
//! The chart renderer itself is an external collaborator behind the
//! [`ChartRenderer`] trait. [`ManifestRenderer`] turns a control-plane spec
//! into the per-component values the renderer needs, calls it for every
//! enabled component, and groups the resulting documents by chart.

mod helm;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::component::ComponentName;
use crate::crd::MeshControlPlaneSpec;
use crate::manifest::{extract_kind, kind_priority, split_documents};
use crate::translate::{values_root, Translator};
use crate::tree;
use crate::Error;

pub use helm::{HelmRenderer, DEFAULT_CHARTS_DIR, DEFAULT_HELM_BIN};

/// Input for rendering one component's chart
#[derive(Clone, Debug, PartialEq)]
pub struct RenderRequest {
    /// Component being rendered
    pub component: ComponentName,
    /// Chart location relative to the charts directory
    pub chart: String,
    /// Namespace the component installs into
    pub namespace: String,
    /// Values subtree for the chart
    pub values: Value,
}

/// Renders a chart into a multi-document manifest stream
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    /// Render one component's chart
    async fn render(&self, request: &RenderRequest) -> Result<String, Error>;
}

/// One rendered object document, tagged with where it came from
#[derive(Clone, Debug, PartialEq)]
pub struct ChartManifest {
    /// Chart that produced it
    pub chart: String,
    /// Component owning the chart, `None` for charts outside the known set
    pub component: Option<ComponentName>,
    /// Namespace for objects that do not set one
    pub namespace: String,
    /// Top-level kind of the document
    pub kind: String,
    /// Document text
    pub content: String,
}

/// Rendered manifests grouped by chart
pub type ChartManifestsMap = BTreeMap<String, Vec<ChartManifest>>;

/// Renders every enabled component of a spec
pub struct ManifestRenderer {
    renderer: Arc<dyn ChartRenderer>,
    translator: Arc<Translator>,
}

impl ManifestRenderer {
    /// Adapter over `renderer`
    pub fn new(renderer: Arc<dyn ChartRenderer>, translator: Arc<Translator>) -> Self {
        Self {
            renderer,
            translator,
        }
    }

    /// Render all enabled components of `spec`.
    ///
    /// Components that render nothing are omitted from the result. Any
    /// renderer failure fails the whole render.
    pub async fn render(&self, spec: &MeshControlPlaneSpec) -> Result<ChartManifestsMap, Error> {
        let values = self.translator.to_values(&serde_json::to_value(spec)?)?;
        let mut rendered = ChartManifestsMap::new();

        for component in spec.enabled_components() {
            let request = RenderRequest {
                component,
                chart: component.chart().to_string(),
                namespace: spec.namespace_for(component),
                values: component_values(&values, component),
            };

            let text = self.renderer.render(&request).await?;
            let manifests = to_chart_manifests(&request, &text);
            if manifests.is_empty() {
                debug!(component = %component, "chart rendered no objects");
                continue;
            }

            debug!(component = %component, objects = manifests.len(), "rendered chart");
            rendered.insert(request.chart, manifests);
        }

        info!(charts = rendered.len(), "rendered control plane");
        Ok(rendered)
    }
}

/// Values handed to a component's chart: `global` plus the component's own
/// subtree, with `enabled` forced on.
pub fn component_values(values: &Value, component: ComponentName) -> Value {
    let mut out = Map::new();
    if let Some(global) = values.get("global") {
        out.insert("global".to_string(), global.clone());
    }
    if let Some(Value::Object(own)) = values_root(component).and_then(|root| tree::get(values, &root))
    {
        out.extend(own.clone());
    }
    if component.values_key().is_some() {
        out.insert("enabled".to_string(), Value::Bool(true));
    }
    Value::Object(out)
}

/// Split renderer output into tagged documents in apply order.
pub fn to_chart_manifests(request: &RenderRequest, text: &str) -> Vec<ChartManifest> {
    let mut manifests: Vec<ChartManifest> = split_documents(text)
        .into_iter()
        .map(|content| ChartManifest {
            chart: request.chart.clone(),
            component: Some(request.component),
            namespace: request.namespace.clone(),
            kind: extract_kind(&content).to_string(),
            content,
        })
        .collect();
    manifests.sort_by_key(|m| kind_priority(&m.kind));
    manifests
}
