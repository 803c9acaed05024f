//! MeshControlPlane controller
//!
//! [`reconcile`] and [`error_policy`] plug into `kube::runtime::Controller`.
//! Each invocation does exactly one of: register the finalizer, run the
//! delete path, record a validation failure, or run a full reconcile pass.
//! An instance naming a profile is reconciled with its spec layered over
//! that profile.

mod client;
mod engine;
mod listener;

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, info, instrument, warn};

pub use client::{InstanceClient, KubeInstanceClient, KubeResourceClient, ResourceClient};
pub use engine::ControlPlaneReconciler;
pub use listener::{
    feature_health, CompositeListener, NoopListener, ReconcileListener, StatusListener,
};

#[cfg(test)]
pub use client::{MockInstanceClient, MockResourceClient};

use crate::crd::MeshControlPlane;
use crate::error::AggregateError;
use crate::graph::DependencyGraph;
use crate::profile::ProfileStore;
use crate::render::{
    ChartRenderer, HelmRenderer, ManifestRenderer, DEFAULT_CHARTS_DIR, DEFAULT_HELM_BIN,
};
use crate::retry::{retry_when, RetryConfig};
use crate::translate::Translator;
use crate::{tree, Error};

/// Finalizer guarding cleanup of owned objects
pub const FINALIZER: &str = "meshop.io/control-plane";

/// Requeue delay after a failed pass
pub const ERROR_REQUEUE: Duration = Duration::from_secs(10);

/// Default delay between successful passes
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(300);

/// Requeue delay after registering the finalizer
const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);

/// Runtime settings for the controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Directory holding the component charts
    pub charts_dir: PathBuf,
    /// helm binary used for rendering
    pub helm_bin: String,
    /// Delay between successful passes
    pub resync_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            charts_dir: PathBuf::from(DEFAULT_CHARTS_DIR),
            helm_bin: DEFAULT_HELM_BIN.to_string(),
            resync_interval: DEFAULT_RESYNC,
        }
    }
}

/// Shared state for every reconcile invocation
pub struct Context {
    /// Access to MeshControlPlane instances
    pub instances: Arc<dyn InstanceClient>,
    /// The reconcile pass itself
    pub reconciler: ControlPlaneReconciler,
    /// Lifecycle hooks, status recording included
    pub listener: Arc<dyn ReconcileListener>,
    /// Budget for finalizer removal conflicts
    pub finalizer_retry: RetryConfig,
    /// Delay between successful passes
    pub resync_interval: Duration,
    /// Profiles named by `spec.profile`; without a store the field is ignored
    pub profiles: Option<ProfileStore>,
}

impl Context {
    /// Context over a live cluster
    pub fn new(client: Client, config: &ControllerConfig) -> Self {
        let renderer = HelmRenderer::new(config.helm_bin.clone(), config.charts_dir.clone());
        Self::from_parts(
            Arc::new(KubeInstanceClient::new(client.clone())),
            Arc::new(KubeResourceClient::new(client)),
            Arc::new(renderer),
            config.resync_interval,
        )
        .with_profiles(ProfileStore::in_charts_dir(&config.charts_dir))
    }

    /// Context from explicit collaborators. Status is recorded through
    /// `instances`.
    pub fn from_parts(
        instances: Arc<dyn InstanceClient>,
        resources: Arc<dyn ResourceClient>,
        renderer: Arc<dyn ChartRenderer>,
        resync_interval: Duration,
    ) -> Self {
        let translator = Arc::new(Translator::default());
        let reconciler = ControlPlaneReconciler::new(
            resources,
            ManifestRenderer::new(renderer, translator),
            Arc::new(DependencyGraph::standard()),
        );

        Self {
            listener: Arc::new(StatusListener::new(instances.clone())),
            instances,
            reconciler,
            finalizer_retry: RetryConfig::finalizer_conflicts(),
            resync_interval,
            profiles: None,
        }
    }

    /// Layer specs over the profiles in `store`
    pub fn with_profiles(mut self, store: ProfileStore) -> Self {
        self.profiles = Some(store);
        self
    }

    /// Add a listener that runs after status recording
    pub fn with_listener(mut self, extra: Arc<dyn ReconcileListener>) -> Self {
        self.listener = Arc::new(CompositeListener::new(vec![self.listener, extra]));
        self
    }

    /// Replace the finalizer conflict budget
    pub fn with_finalizer_retry(mut self, retry: RetryConfig) -> Self {
        self.finalizer_retry = retry;
        self
    }
}

fn has_finalizer(instance: &MeshControlPlane) -> bool {
    instance.finalizers().iter().any(|f| f == FINALIZER)
}

/// Reconcile a MeshControlPlane
#[instrument(skip(instance, ctx), fields(instance = %instance.name_any()))]
pub async fn reconcile(instance: Arc<MeshControlPlane>, ctx: Arc<Context>) -> Result<Action, Error> {
    if instance.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&instance, &ctx).await;
    }

    if !has_finalizer(&instance) {
        add_finalizer(&instance, &ctx).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    let instance = match with_profile(&instance, &ctx).await {
        Ok(instance) => instance,
        Err(e) => {
            warn!(error = %e, "profile could not be applied");
            let mut outcome = AggregateError::new();
            outcome.push(None, e);
            ctx.listener
                .end_reconcile(&instance, &BTreeSet::new(), Some(&outcome))
                .await?;
            return Err(Error::Aggregate(outcome));
        }
    };

    if let Err(e) = instance.spec.validate() {
        warn!(error = %e, "control plane validation failed");
        let mut outcome = AggregateError::new();
        outcome.push(None, e);
        ctx.listener
            .end_reconcile(&instance, &BTreeSet::new(), Some(&outcome))
            .await?;
        // Only a spec change can fix this.
        return Ok(Action::await_change());
    }

    Box::pin(ctx.reconciler.reconcile(&instance, ctx.listener.as_ref())).await?;
    Ok(Action::requeue(ctx.resync_interval))
}

/// The instance with its spec layered over the profile it names
async fn with_profile<'a>(
    instance: &'a MeshControlPlane,
    ctx: &Context,
) -> Result<Cow<'a, MeshControlPlane>, Error> {
    let (Some(store), Some(profile)) = (&ctx.profiles, instance.spec.profile.as_deref()) else {
        return Ok(Cow::Borrowed(instance));
    };

    let mut layered = store.load(profile).await?;
    tree::merge(&mut layered, serde_json::to_value(&instance.spec)?);

    let mut effective = instance.clone();
    effective.spec = serde_json::from_value(layered)
        .map_err(|e| Error::profile(profile, format!("layered spec is invalid: {e}")))?;
    Ok(Cow::Owned(effective))
}

/// Requeue after a failed pass
pub fn error_policy(instance: Arc<MeshControlPlane>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        %error,
        instance = %instance.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

async fn add_finalizer(instance: &MeshControlPlane, ctx: &Context) -> Result<(), Error> {
    let mut updated = instance.clone();
    updated
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(FINALIZER.to_string());
    ctx.instances.replace(&updated).await?;
    info!("finalizer added");
    Ok(())
}

async fn handle_deletion(instance: &MeshControlPlane, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(instance) {
        return Ok(Action::await_change());
    }

    let ignored = Box::pin(ctx.reconciler.delete(instance, ctx.listener.as_ref())).await;
    if !ignored.is_empty() {
        warn!(errors = %ignored, "ignoring failures while removing owned objects");
    }

    match Box::pin(remove_finalizer(instance, ctx)).await {
        Ok(()) => {
            info!("finalizer removed");
            Ok(Action::await_change())
        }
        Err(e) if e.is_conflict() => {
            warn!(error = %e, "finalizer removal kept conflicting, retrying later");
            Ok(Action::requeue(ERROR_REQUEUE))
        }
        Err(e) => Err(e),
    }
}

/// Drop the finalizer, re-reading the instance after each conflict.
async fn remove_finalizer(instance: &MeshControlPlane, ctx: &Context) -> Result<(), Error> {
    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_default();
    let (name, namespace) = (name.as_str(), namespace.as_str());
    let mut first = true;

    retry_when(&ctx.finalizer_retry, "remove_finalizer", Error::is_conflict, || {
        let refetch = !std::mem::replace(&mut first, false);
        async move {
            let current = if refetch {
                match ctx.instances.get(namespace, name).await? {
                    Some(latest) => latest,
                    None => return Ok(()),
                }
            } else {
                instance.clone()
            };
            if !has_finalizer(&current) {
                return Ok(());
            }

            let mut updated = current;
            if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != FINALIZER);
            }
            ctx.instances.replace(&updated).await.map(|_| ())
        }
    })
    .await
}
