//! Lifecycle hooks around a reconcile pass
//!
//! Every hook defaults to doing nothing, so a listener only implements the
//! points it cares about. [`StatusListener`] is the one the controller always
//! installs: it turns the pass outcome into per-feature health.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::client::InstanceClient;
use crate::component::FeatureName;
use crate::crd::{HealthStatus, MeshControlPlane, MeshControlPlaneSpec, MeshControlPlaneStatus};
use crate::error::AggregateError;
use crate::manifest::{ObjectKind, CRD_KIND};
use crate::render::ChartManifest;
use crate::Error;

/// Hooks invoked at fixed points of a reconcile or delete pass
#[async_trait]
pub trait ReconcileListener: Send + Sync {
    /// Before rendering. A failure aborts the pass with nothing applied.
    async fn begin_reconcile(&self, _instance: &MeshControlPlane) -> Result<(), Error> {
        Ok(())
    }

    /// Before a chart's objects are applied. May rewrite `manifests`.
    async fn begin_chart(
        &self,
        _chart: &str,
        _manifests: &mut Vec<ChartManifest>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// After a chart's objects were applied
    async fn end_chart(&self, _chart: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Before stale objects are removed. `all` is set when deleting the
    /// instance, in which case every owned object goes.
    async fn begin_prune(&self, _all: bool) -> Result<(), Error> {
        Ok(())
    }

    /// After pruning
    async fn end_prune(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Before owned objects are removed for a deleted instance
    async fn begin_delete(&self, _instance: &MeshControlPlane) -> Result<(), Error> {
        Ok(())
    }

    /// After owned objects were removed for a deleted instance
    async fn end_delete(&self, _instance: &MeshControlPlane) -> Result<(), Error> {
        Ok(())
    }

    /// After the pass, with the kinds it declared and its failures if there
    /// were any
    async fn end_reconcile(
        &self,
        _instance: &MeshControlPlane,
        _applied: &BTreeSet<ObjectKind>,
        _outcome: Option<&AggregateError>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Listener that does nothing
pub struct NoopListener;

impl ReconcileListener for NoopListener {}

/// Runs several listeners in order.
///
/// Every listener sees every hook even if an earlier one failed; the
/// failures come back together.
#[derive(Default)]
pub struct CompositeListener {
    listeners: Vec<Arc<dyn ReconcileListener>>,
}

impl CompositeListener {
    /// Compose `listeners`, invoked in the given order
    pub fn new(listeners: Vec<Arc<dyn ReconcileListener>>) -> Self {
        Self { listeners }
    }

    /// Number of composed listeners
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// True when nothing is composed
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

fn collect(results: Vec<Result<(), Error>>) -> Result<(), Error> {
    let mut failures = AggregateError::new();
    for result in results {
        if let Err(e) = result {
            failures.push(None, e);
        }
    }
    match failures.len() {
        0 => Ok(()),
        1 => Err(failures
            .into_failures()
            .into_iter()
            .next()
            .map(|f| f.error)
            .unwrap_or_else(|| Error::internal("listener", "lost failure"))),
        _ => failures.into_result(),
    }
}

#[async_trait]
impl ReconcileListener for CompositeListener {
    async fn begin_reconcile(&self, instance: &MeshControlPlane) -> Result<(), Error> {
        let mut results = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            results.push(listener.begin_reconcile(instance).await);
        }
        collect(results)
    }

    async fn begin_chart(
        &self,
        chart: &str,
        manifests: &mut Vec<ChartManifest>,
    ) -> Result<(), Error> {
        let mut results = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            results.push(listener.begin_chart(chart, manifests).await);
        }
        collect(results)
    }

    async fn end_chart(&self, chart: &str) -> Result<(), Error> {
        let mut results = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            results.push(listener.end_chart(chart).await);
        }
        collect(results)
    }

    async fn begin_prune(&self, all: bool) -> Result<(), Error> {
        let mut results = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            results.push(listener.begin_prune(all).await);
        }
        collect(results)
    }

    async fn end_prune(&self) -> Result<(), Error> {
        let mut results = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            results.push(listener.end_prune().await);
        }
        collect(results)
    }

    async fn begin_delete(&self, instance: &MeshControlPlane) -> Result<(), Error> {
        let mut results = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            results.push(listener.begin_delete(instance).await);
        }
        collect(results)
    }

    async fn end_delete(&self, instance: &MeshControlPlane) -> Result<(), Error> {
        let mut results = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            results.push(listener.end_delete(instance).await);
        }
        collect(results)
    }

    async fn end_reconcile(
        &self,
        instance: &MeshControlPlane,
        applied: &BTreeSet<ObjectKind>,
        outcome: Option<&AggregateError>,
    ) -> Result<(), Error> {
        let mut results = Vec::with_capacity(self.listeners.len());
        for listener in &self.listeners {
            results.push(listener.end_reconcile(instance, applied, outcome).await);
        }
        collect(results)
    }
}

/// Health of every enabled feature after a pass.
///
/// A failure counts against the feature of the component that produced it.
/// Failures with no feature (render, listener, Base) count against all of
/// them.
pub fn feature_health(
    spec: &MeshControlPlaneSpec,
    outcome: Option<&AggregateError>,
) -> MeshControlPlaneStatus {
    let enabled = spec.enabled_features();
    let mut failed: BTreeSet<FeatureName> = BTreeSet::new();

    for failure in outcome.map(AggregateError::failures).unwrap_or_default() {
        match failure.component.and_then(|c| c.feature()) {
            Some(feature) => {
                failed.insert(feature);
            }
            None => failed.extend(enabled.iter().copied()),
        }
    }

    let mut status = MeshControlPlaneStatus::default();
    for feature in enabled {
        let health = if failed.contains(&feature) {
            HealthStatus::Error
        } else {
            HealthStatus::Healthy
        };
        status = status.feature(feature, health);
    }

    match outcome {
        Some(errors) => status.message(errors.to_string()),
        None => status.message("reconciled"),
    }
}

/// Kinds to record after a pass: everything recorded before plus what the
/// pass declared, CustomResourceDefinitions excepted.
fn recorded_kinds(
    instance: &MeshControlPlane,
    applied: &BTreeSet<ObjectKind>,
) -> BTreeSet<ObjectKind> {
    let mut kinds = instance
        .status
        .as_ref()
        .map(|s| s.applied_kinds.clone())
        .unwrap_or_default();
    kinds.extend(applied.iter().filter(|k| k.kind != CRD_KIND).cloned());
    kinds
}

/// Writes per-feature health onto the instance at the end of each pass
pub struct StatusListener {
    instances: Arc<dyn InstanceClient>,
}

impl StatusListener {
    /// Listener writing through `instances`
    pub fn new(instances: Arc<dyn InstanceClient>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl ReconcileListener for StatusListener {
    async fn end_reconcile(
        &self,
        instance: &MeshControlPlane,
        applied: &BTreeSet<ObjectKind>,
        outcome: Option<&AggregateError>,
    ) -> Result<(), Error> {
        let name = instance.name_any();
        let namespace = instance
            .namespace()
            .ok_or_else(|| Error::listener("end_reconcile", "instance has no namespace"))?;

        let status = feature_health(&instance.spec, outcome)
            .observed_generation(instance.metadata.generation)
            .applied_kinds(recorded_kinds(instance, applied));

        if instance.status.as_ref() == Some(&status) {
            debug!(instance = %name, "status unchanged");
            return Ok(());
        }

        self.instances
            .patch_status(&namespace, &name, &status)
            .await
            .map_err(|e| {
                warn!(instance = %name, error = %e, "failed to record status");
                Error::listener("end_reconcile", e.to_string())
            })
    }
}
