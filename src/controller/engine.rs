//! The reconcile pass: render, order, apply, prune, report
//!
//! Per-object failures never stop the pass. They are collected, attributed
//! to the component that rendered the object, and handed to the listener
//! (which records feature health) before being returned together.

use std::collections::BTreeSet;
use std::sync::Arc;

use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::client::ResourceClient;
use super::listener::ReconcileListener;
use crate::component::ComponentName;
use crate::crd::MeshControlPlane;
use crate::error::AggregateError;
use crate::graph::DependencyGraph;
use crate::manifest::{carry_resource_version, component_of, ObjectKey, ObjectKind, Owner, CRD_KIND};
use crate::render::{ChartManifest, ChartManifestsMap, ManifestRenderer};
use crate::yaml::parse_yaml;
use crate::Error;

/// Drives one MeshControlPlane towards its rendered state
pub struct ControlPlaneReconciler {
    resources: Arc<dyn ResourceClient>,
    renderer: ManifestRenderer,
    graph: Arc<DependencyGraph>,
}

impl ControlPlaneReconciler {
    /// Reconciler applying through `resources`
    pub fn new(
        resources: Arc<dyn ResourceClient>,
        renderer: ManifestRenderer,
        graph: Arc<DependencyGraph>,
    ) -> Self {
        Self {
            resources,
            renderer,
            graph,
        }
    }

    /// Run one full pass for `instance`.
    ///
    /// Nothing is applied if the begin hook or rendering fails. Otherwise
    /// every chart is applied in dependency order and stale objects are
    /// pruned, collecting failures as they happen. The end hook always sees
    /// the outcome once the begin hook passed; its own failure wins over the
    /// collected ones.
    pub async fn reconcile(
        &self,
        instance: &MeshControlPlane,
        listener: &dyn ReconcileListener,
    ) -> Result<(), Error> {
        let owner = owner_of(instance)?;
        listener.begin_reconcile(instance).await?;

        let mut outcome = AggregateError::new();
        let mut applied = BTreeSet::new();
        match self.renderer.render(&instance.spec).await {
            Ok(rendered) => {
                let declared =
                    Box::pin(self.apply_all(&owner, rendered, listener, &mut outcome)).await;
                let sweep = Sweep {
                    declared: &declared,
                    recorded: &recorded_kinds(instance),
                    all: false,
                };
                Box::pin(self.prune(&owner, sweep, listener, &mut outcome)).await;
                applied = declared.kinds();
            }
            Err(e) => {
                warn!(error = %e, "render failed, nothing applied");
                outcome.push(None, e);
            }
        }

        let failed = (!outcome.is_empty()).then_some(&outcome);
        listener.end_reconcile(instance, &applied, failed).await?;

        if outcome.is_empty() {
            info!(instance = %owner.name, "control plane reconciled");
        }
        outcome.into_result()
    }

    /// Remove every object owned by `instance`.
    ///
    /// Best effort: failures are returned for logging but never stop the
    /// sweep. Kinds recorded in the instance status are swept along with the
    /// fixed prunable ones.
    pub async fn delete(
        &self,
        instance: &MeshControlPlane,
        listener: &dyn ReconcileListener,
    ) -> AggregateError {
        let mut outcome = AggregateError::new();
        let owner = match owner_of(instance) {
            Ok(owner) => owner,
            Err(e) => {
                outcome.push(None, e);
                return outcome;
            }
        };

        if let Err(e) = listener.begin_delete(instance).await {
            outcome.push(None, e);
        }
        let sweep = Sweep {
            declared: &Declared::default(),
            recorded: &recorded_kinds(instance),
            all: true,
        };
        Box::pin(self.prune(&owner, sweep, listener, &mut outcome)).await;
        if let Err(e) = listener.end_delete(instance).await {
            outcome.push(None, e);
        }

        info!(instance = %owner.name, failures = outcome.len(), "owned objects removed");
        outcome
    }

    /// Apply every chart in processing order.
    ///
    /// Returns the identity of every object the charts declare, applied or
    /// not. A chart whose hook fails, or that holds a document which cannot
    /// be decoded, has its component held back from prune for this pass.
    async fn apply_all(
        &self,
        owner: &Owner,
        mut rendered: ChartManifestsMap,
        listener: &dyn ReconcileListener,
        outcome: &mut AggregateError,
    ) -> Declared {
        let mut declared = Declared::default();

        for chart in self.graph.processing_order(&rendered) {
            let Some(mut manifests) = rendered.remove(&chart) else {
                continue;
            };
            let component = ComponentName::from_chart(&chart);

            if let Err(e) = listener.begin_chart(&chart, &mut manifests).await {
                warn!(chart = %chart, error = %e, "chart hook failed, holding its objects");
                outcome.push(component, e);
                declared.held.insert(component);
                for manifest in &manifests {
                    match desired_object(owner, manifest) {
                        Ok((key, _)) => {
                            declared.keys.insert(key);
                        }
                        Err(_) => {
                            declared.held.insert(manifest.component);
                        }
                    }
                }
                continue;
            }
            if manifests.is_empty() {
                debug!(chart = %chart, "no objects to apply");
                continue;
            }

            for manifest in &manifests {
                let (key, obj) = match desired_object(owner, manifest) {
                    Ok(desired) => desired,
                    Err(e) => {
                        declared.held.insert(manifest.component);
                        outcome.push(manifest.component, e);
                        continue;
                    }
                };
                declared.keys.insert(key.clone());

                if let Err(e) = self.apply_object(&key, obj).await {
                    warn!(object = %key, error = %e, "apply failed");
                    outcome.push(
                        manifest.component,
                        Error::apply("apply", &key.kind, &key.name, e.to_string()),
                    );
                }
            }

            if let Err(e) = listener.end_chart(&chart).await {
                outcome.push(component, e);
            }
            info!(chart = %chart, objects = manifests.len(), "chart applied");
        }

        declared
    }

    /// Create the object, or update it carrying the live resourceVersion.
    async fn apply_object(&self, key: &ObjectKey, mut obj: Value) -> Result<(), Error> {
        if let Some(live) = self.resources.get(key).await? {
            carry_resource_version(&mut obj, &live);
            self.resources.update(&obj).await?;
            debug!(object = %key, "updated");
            return Ok(());
        }

        match self.resources.create(&obj).await {
            Ok(()) => {
                debug!(object = %key, "created");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                // Someone created it between our get and create.
                let live = self.resources.get(key).await?.ok_or(e)?;
                carry_resource_version(&mut obj, &live);
                self.resources.update(&obj).await
            }
            Err(e) => Err(e),
        }
    }

    /// Delete owned objects that are neither declared nor held.
    ///
    /// Checks the fixed prunable kinds, the kinds recorded in status and
    /// every kind declared this pass, never CustomResourceDefinitions.
    async fn prune(
        &self,
        owner: &Owner,
        sweep: Sweep<'_>,
        listener: &dyn ReconcileListener,
        outcome: &mut AggregateError,
    ) {
        if let Err(e) = listener.begin_prune(sweep.all).await {
            outcome.push(None, e);
            return;
        }

        let mut kinds = ObjectKind::prunable();
        kinds.extend(sweep.recorded.iter().cloned());
        kinds.extend(sweep.declared.kinds());
        kinds.retain(|k| k.kind != CRD_KIND);

        let selector = owner.selector();
        let mut pruned = 0usize;
        for kind in kinds {
            let live = match self.resources.list(&kind, &selector).await {
                Ok(live) => live,
                Err(e) => {
                    outcome.push(None, Error::apply("list", &kind.kind, "*", e.to_string()));
                    continue;
                }
            };

            for obj in live {
                let key = match ObjectKey::from_value(&obj) {
                    Ok(key) => key,
                    Err(e) => {
                        outcome.push(component_of(&obj), e);
                        continue;
                    }
                };
                if is_declared(&sweep.declared.keys, &key) {
                    continue;
                }
                let component = component_of(&obj);
                if sweep.declared.held.contains(&component) {
                    debug!(object = %key, "keeping object of held component");
                    continue;
                }

                info!(object = %key, "pruning stale object");
                match self.resources.delete(&key).await {
                    Ok(()) => pruned += 1,
                    Err(e) => outcome.push(
                        component,
                        Error::apply("prune", &key.kind, &key.name, e.to_string()),
                    ),
                }
            }
        }

        if let Err(e) = listener.end_prune().await {
            outcome.push(None, e);
        }
        debug!(pruned, "prune finished");
    }
}

/// What one pass declared
#[derive(Debug, Default)]
struct Declared {
    /// Every object the rendered charts declare
    keys: BTreeSet<ObjectKey>,
    /// Components whose objects prune must leave alone this pass
    held: BTreeSet<Option<ComponentName>>,
}

impl Declared {
    fn kinds(&self) -> BTreeSet<ObjectKind> {
        self.keys.iter().map(ObjectKey::object_kind).collect()
    }
}

/// Inputs of one prune
#[derive(Clone, Copy)]
struct Sweep<'a> {
    declared: &'a Declared,
    recorded: &'a BTreeSet<ObjectKind>,
    /// Set when deleting the instance
    all: bool,
}

/// Kinds recorded on the instance by earlier passes
fn recorded_kinds(instance: &MeshControlPlane) -> BTreeSet<ObjectKind> {
    instance
        .status
        .as_ref()
        .map(|s| s.applied_kinds.clone())
        .unwrap_or_default()
}

/// Ownership of objects applied for `instance`
fn owner_of(instance: &MeshControlPlane) -> Result<Owner, Error> {
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::validation("MeshControlPlane has no namespace"))?;
    Ok(Owner::new(instance.name_any(), namespace))
}

/// Decode a rendered document and stamp ownership on it.
fn desired_object(owner: &Owner, manifest: &ChartManifest) -> Result<(ObjectKey, Value), Error> {
    let decode = |message: String| Error::apply("decode", &manifest.kind, &manifest.chart, message);

    let mut obj = parse_yaml(&manifest.content).map_err(|e| decode(e.to_string()))?;
    if !obj.is_object() {
        return Err(decode("document is not a mapping".to_string()));
    }
    owner
        .claim(&mut obj, manifest.component, &manifest.namespace)
        .map_err(|e| decode(e.to_string()))?;
    let key = ObjectKey::from_value(&obj).map_err(|e| decode(e.to_string()))?;
    Ok((key, obj))
}

/// Live objects of cluster-scoped kinds come back without the namespace
/// the desired copy was stamped with.
fn is_declared(declared: &BTreeSet<ObjectKey>, live: &ObjectKey) -> bool {
    declared.contains(live)
        || (live.namespace.is_none()
            && declared.iter().any(|d| {
                d.api_version == live.api_version && d.kind == live.kind && d.name == live.name
            }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::client::MockResourceClient;
    use crate::controller::listener::NoopListener;
    use crate::crd::{MeshControlPlaneSpec, MeshControlPlaneStatus};
    use crate::manifest::{COMPONENT_LABEL, OWNER_NAME_LABEL};
    use crate::render::{MockChartRenderer, RenderRequest};
    use crate::translate::Translator;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    const BASE: &str = "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: mesh-reader\n---\napiVersion: rbac.authorization.k8s.io/v1\nkind: ClusterRole\nmetadata:\n  name: mesh-reader\n";
    const PILOT: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: discovery\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: discovery\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: discovery-mesh\n";

    fn instance() -> MeshControlPlane {
        let spec: MeshControlPlaneSpec =
            serde_json::from_value(json!({"trafficManagement": {"enabled": true}})).unwrap();
        let mut mcp = MeshControlPlane::new("mesh", spec);
        mcp.metadata.namespace = Some("mesh-system".to_string());
        mcp
    }

    fn renderer(charts: Vec<(ComponentName, &'static str)>) -> ManifestRenderer {
        let mut mock = MockChartRenderer::new();
        mock.expect_render().returning(move |r: &RenderRequest| {
            Ok(charts
                .iter()
                .find(|(c, _)| *c == r.component)
                .map(|(_, text)| text.to_string())
                .unwrap_or_default())
        });
        ManifestRenderer::new(Arc::new(mock), Arc::new(Translator::default()))
    }

    fn reconciler(resources: MockResourceClient, renderer: ManifestRenderer) -> ControlPlaneReconciler {
        ControlPlaneReconciler::new(
            Arc::new(resources),
            renderer,
            Arc::new(DependencyGraph::standard()),
        )
    }

    fn name_of(obj: &Value) -> String {
        obj["metadata"]["name"].as_str().unwrap_or_default().to_string()
    }

    fn owned(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Value {
        owned_by("pilot", api_version, kind, namespace, name)
    }

    fn owned_by(
        component: &str,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Value {
        let mut metadata = json!({
            "name": name,
            "labels": {OWNER_NAME_LABEL: "mesh", COMPONENT_LABEL: component}
        });
        if let Some(ns) = namespace {
            metadata["namespace"] = json!(ns);
        }
        json!({"apiVersion": api_version, "kind": kind, "metadata": metadata})
    }

    /// Records the lifecycle so hook order is observable
    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<String>>,
        applied: Mutex<BTreeSet<ObjectKind>>,
    }

    #[async_trait]
    impl ReconcileListener for Journal {
        async fn begin_reconcile(&self, _: &MeshControlPlane) -> Result<(), Error> {
            self.events.lock().unwrap().push("begin".into());
            Ok(())
        }
        async fn begin_chart(&self, chart: &str, _: &mut Vec<ChartManifest>) -> Result<(), Error> {
            self.events.lock().unwrap().push(format!("chart:{chart}"));
            Ok(())
        }
        async fn begin_prune(&self, all: bool) -> Result<(), Error> {
            self.events.lock().unwrap().push(format!("prune:{all}"));
            Ok(())
        }
        async fn end_reconcile(
            &self,
            _: &MeshControlPlane,
            applied: &BTreeSet<ObjectKind>,
            outcome: Option<&AggregateError>,
        ) -> Result<(), Error> {
            let n = outcome.map(AggregateError::len).unwrap_or(0);
            self.events.lock().unwrap().push(format!("end:{n}"));
            *self.applied.lock().unwrap() = applied.clone();
            Ok(())
        }
    }

    // =========================================================================
    // Story: a pass applies everything it can
    // =========================================================================

    #[tokio::test]
    async fn story_fresh_install_creates_every_object_in_order() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let mut resources = MockResourceClient::new();
        resources.expect_get().returning(|_| Ok(None));
        let log = created.clone();
        resources.expect_create().times(5).returning(move |obj| {
            log.lock().unwrap().push(obj.clone());
            Ok(())
        });
        resources.expect_list().returning(|_, _| Ok(Vec::new()));

        let journal = Journal::default();
        reconciler(
            resources,
            renderer(vec![(ComponentName::Base, BASE), (ComponentName::Pilot, PILOT)]),
        )
        .reconcile(&instance(), &journal)
        .await
        .unwrap();

        let created = created.lock().unwrap();
        let names: Vec<String> = created
            .iter()
            .map(|o| format!("{}/{}", o["kind"].as_str().unwrap(), name_of(o)))
            .collect();
        assert_eq!(
            names,
            vec![
                "ServiceAccount/mesh-reader",
                "ClusterRole/mesh-reader",
                "ConfigMap/discovery-mesh",
                "Service/discovery",
                "Deployment/discovery",
            ]
        );
        assert_eq!(created[2]["metadata"]["labels"][OWNER_NAME_LABEL], "mesh");
        assert_eq!(created[2]["metadata"]["labels"][COMPONENT_LABEL], "pilot");
        assert_eq!(created[2]["metadata"]["namespace"], "mesh-system");
        assert_eq!(
            *journal.events.lock().unwrap(),
            vec!["begin", "chart:base", "chart:control/discovery", "prune:false", "end:0"]
        );
        let applied: Vec<String> = journal
            .applied
            .lock()
            .unwrap()
            .iter()
            .map(|k| k.kind.clone())
            .collect();
        assert_eq!(
            applied,
            vec!["Deployment", "ClusterRole", "ConfigMap", "Service", "ServiceAccount"]
        );
    }

    #[tokio::test]
    async fn story_one_failed_object_does_not_stop_the_others() {
        let mut resources = MockResourceClient::new();
        resources.expect_get().returning(|_| Ok(None));
        resources.expect_create().times(5).returning(|obj| {
            if name_of(obj) == "discovery" && obj["kind"] == "Service" {
                Err(Error::validation("port 0 is invalid"))
            } else {
                Ok(())
            }
        });
        resources.expect_list().returning(|_, _| Ok(Vec::new()));

        let err = reconciler(
            resources,
            renderer(vec![(ComponentName::Base, BASE), (ComponentName::Pilot, PILOT)]),
        )
        .reconcile(&instance(), &NoopListener)
        .await
        .unwrap_err();

        let Error::Aggregate(failures) = err else {
            panic!("expected aggregate error, got {err}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures.failures()[0].component, Some(ComponentName::Pilot));
        let message = failures.to_string();
        assert!(message.contains("Service/discovery"));
        assert!(!message.contains("Deployment"));
    }

    #[tokio::test]
    async fn existing_objects_are_updated_with_live_version() {
        let mut resources = MockResourceClient::new();
        resources.expect_get().returning(|key| {
            Ok(Some(json!({
                "apiVersion": key.api_version.clone(),
                "kind": key.kind.clone(),
                "metadata": {"name": key.name.clone(), "resourceVersion": "42"}
            })))
        });
        resources.expect_create().never();
        resources
            .expect_update()
            .withf(|obj| obj["metadata"]["resourceVersion"] == "42")
            .times(2)
            .returning(|_| Ok(()));
        resources.expect_list().returning(|_, _| Ok(Vec::new()));

        reconciler(resources, renderer(vec![(ComponentName::Base, BASE)]))
            .reconcile(&instance(), &NoopListener)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_race_falls_back_to_update() {
        let mut resources = MockResourceClient::new();
        let gets = Arc::new(Mutex::new(0u32));
        let counter = gets.clone();
        resources.expect_get().returning(move |key| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n == 1 {
                return Ok(None);
            }
            Ok(Some(json!({"metadata": {"name": key.name.clone(), "resourceVersion": "7"}})))
        });
        resources.expect_create().times(1).returning(|_| {
            Err(Error::AlreadyExists {
                kind: "ServiceAccount".into(),
                name: "mesh-reader".into(),
            })
        });
        resources.expect_update().times(1).returning(|_| Ok(()));
        resources.expect_list().returning(|_, _| Ok(Vec::new()));

        let single = "apiVersion: v1\nkind: ServiceAccount\nmetadata:\n  name: mesh-reader\n";
        reconciler(resources, renderer(vec![(ComponentName::Base, single)]))
            .reconcile(&instance(), &NoopListener)
            .await
            .unwrap();
        assert_eq!(*gets.lock().unwrap(), 2);
    }

    // =========================================================================
    // Story: prune removes what the spec no longer declares
    // =========================================================================

    #[tokio::test]
    async fn story_prune_deletes_only_stale_objects() {
        let mut resources = MockResourceClient::new();
        resources.expect_get().returning(|_| Ok(None));
        resources.expect_create().returning(|_| Ok(()));
        resources.expect_list().returning(|kind, selector| {
            assert_eq!(selector, "meshop.io/owner-name=mesh,meshop.io/owner-namespace=mesh-system");
            Ok(match kind.kind.as_str() {
                "Deployment" => vec![
                    owned("apps/v1", "Deployment", Some("mesh-system"), "discovery"),
                    owned("apps/v1", "Deployment", Some("mesh-system"), "mixer-policy"),
                ],
                // cluster-scoped: the live copy has no namespace
                "ClusterRole" => vec![owned(
                    "rbac.authorization.k8s.io/v1",
                    "ClusterRole",
                    None,
                    "mesh-reader",
                )],
                _ => Vec::new(),
            })
        });
        resources
            .expect_delete()
            .withf(|key| key.kind == "Deployment" && key.name == "mixer-policy")
            .times(1)
            .returning(|_| Ok(()));

        reconciler(
            resources,
            renderer(vec![(ComponentName::Base, BASE), (ComponentName::Pilot, PILOT)]),
        )
        .reconcile(&instance(), &NoopListener)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn prune_failures_are_attributed_and_aggregated() {
        let mut resources = MockResourceClient::new();
        resources.expect_get().returning(|_| Ok(None));
        resources.expect_create().returning(|_| Ok(()));
        resources.expect_list().returning(|kind, _| {
            Ok(match kind.kind.as_str() {
                "Secret" => vec![owned("v1", "Secret", Some("mesh-system"), "old-cert")],
                _ => Vec::new(),
            })
        });
        resources
            .expect_delete()
            .returning(|_| Err(Error::validation("forbidden")));

        let err = reconciler(resources, renderer(vec![(ComponentName::Base, BASE)]))
            .reconcile(&instance(), &NoopListener)
            .await
            .unwrap_err();
        let Error::Aggregate(failures) = err else {
            panic!("expected aggregate error");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures.failures()[0].component, Some(ComponentName::Pilot));
        assert!(failures.to_string().contains("failed to prune Secret/old-cert"));
    }

    #[tokio::test]
    async fn failed_chart_hook_keeps_that_components_objects() {
        struct RefusePilot;
        #[async_trait]
        impl ReconcileListener for RefusePilot {
            async fn begin_chart(&self, chart: &str, _: &mut Vec<ChartManifest>) -> Result<(), Error> {
                if chart == "control/discovery" {
                    return Err(Error::listener("begin_chart", "pilot frozen"));
                }
                Ok(())
            }
        }

        let mut resources = MockResourceClient::new();
        resources.expect_get().returning(|_| Ok(None));
        resources.expect_create().times(2).returning(|_| Ok(()));
        resources.expect_list().returning(|kind, _| {
            Ok(match kind.kind.as_str() {
                "Deployment" => vec![
                    owned("apps/v1", "Deployment", Some("mesh-system"), "discovery"),
                    owned("apps/v1", "Deployment", Some("mesh-system"), "discovery-canary"),
                    owned_by("telemetry", "apps/v1", "Deployment", Some("mesh-system"), "telemetry"),
                ],
                _ => Vec::new(),
            })
        });
        resources
            .expect_delete()
            .withf(|key| key.name == "telemetry")
            .times(1)
            .returning(|_| Ok(()));

        let err = reconciler(
            resources,
            renderer(vec![(ComponentName::Base, BASE), (ComponentName::Pilot, PILOT)]),
        )
        .reconcile(&instance(), &RefusePilot)
        .await
        .unwrap_err();

        let Error::Aggregate(failures) = err else {
            panic!("expected aggregate error, got {err}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures.failures()[0].component, Some(ComponentName::Pilot));
    }

    #[tokio::test]
    async fn undecodable_document_keeps_its_components_objects() {
        let broken = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: discovery\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  labels: {}\n";

        let mut resources = MockResourceClient::new();
        resources.expect_get().returning(|_| Ok(None));
        resources.expect_create().times(3).returning(|_| Ok(()));
        resources.expect_list().returning(|kind, _| {
            Ok(match kind.kind.as_str() {
                "ConfigMap" => vec![owned("v1", "ConfigMap", Some("mesh-system"), "discovery-mesh")],
                "Secret" => vec![owned_by("base", "v1", "Secret", Some("mesh-system"), "old-cert")],
                _ => Vec::new(),
            })
        });
        resources
            .expect_delete()
            .withf(|key| key.kind == "Secret" && key.name == "old-cert")
            .times(1)
            .returning(|_| Ok(()));

        let err = reconciler(
            resources,
            renderer(vec![(ComponentName::Base, BASE), (ComponentName::Pilot, broken)]),
        )
        .reconcile(&instance(), &NoopListener)
        .await
        .unwrap_err();
        assert!(err.to_string().contains("failed to decode"));
    }

    #[tokio::test]
    async fn kinds_recorded_in_status_are_pruned() {
        let gateway = ObjectKind::new("networking.istio.io/v1alpha3", "Gateway");
        let mut mcp = instance();
        mcp.status = Some(MeshControlPlaneStatus::default().applied_kinds(
            [gateway.clone(), ObjectKind::new("apiextensions.k8s.io/v1", CRD_KIND)]
                .into_iter()
                .collect(),
        ));

        let mut resources = MockResourceClient::new();
        resources.expect_get().returning(|_| Ok(None));
        resources.expect_create().returning(|_| Ok(()));
        resources.expect_list().returning(|kind, _| {
            assert_ne!(kind.kind, CRD_KIND);
            Ok(match kind.kind.as_str() {
                "Gateway" => vec![owned_by(
                    "ingressGateway",
                    "networking.istio.io/v1alpha3",
                    "Gateway",
                    Some("mesh-system"),
                    "ingress-gw",
                )],
                _ => Vec::new(),
            })
        });
        resources
            .expect_delete()
            .withf(|key| key.kind == "Gateway" && key.name == "ingress-gw")
            .times(1)
            .returning(|_| Ok(()));

        reconciler(resources, renderer(vec![(ComponentName::Base, BASE)]))
            .reconcile(&mcp, &NoopListener)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_sweeps_kinds_recorded_in_status() {
        let mut mcp = instance();
        mcp.status = Some(MeshControlPlaneStatus::default().applied_kinds(
            [ObjectKind::new("networking.istio.io/v1alpha3", "Gateway")]
                .into_iter()
                .collect(),
        ));

        let listed = Arc::new(Mutex::new(Vec::new()));
        let log = listed.clone();
        let mut resources = MockResourceClient::new();
        resources.expect_list().returning(move |kind, _| {
            log.lock().unwrap().push(kind.kind.clone());
            Ok(match kind.kind.as_str() {
                "Gateway" => vec![owned("networking.istio.io/v1alpha3", "Gateway", Some("mesh-system"), "ingress-gw")],
                _ => Vec::new(),
            })
        });
        resources.expect_delete().times(1).returning(|_| Ok(()));

        let ignored = reconciler(resources, renderer(Vec::new()))
            .delete(&mcp, &NoopListener)
            .await;

        assert!(ignored.is_empty());
        assert!(listed.lock().unwrap().contains(&"Gateway".to_string()));
    }

    // =========================================================================
    // Story: nothing is applied when the pass cannot start
    // =========================================================================

    #[tokio::test]
    async fn render_failure_applies_nothing_but_reports() {
        let mut mock = MockChartRenderer::new();
        mock.expect_render()
            .returning(|r| Err(Error::render(r.component, "chart not found")));
        let renderer = ManifestRenderer::new(Arc::new(mock), Arc::new(Translator::default()));

        let mut resources = MockResourceClient::new();
        resources.expect_get().never();
        resources.expect_create().never();
        resources.expect_list().never();
        resources.expect_delete().never();

        let journal = Journal::default();
        let err = reconciler(resources, renderer)
            .reconcile(&instance(), &journal)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("chart not found"));
        assert_eq!(*journal.events.lock().unwrap(), vec!["begin", "end:1"]);
    }

    #[tokio::test]
    async fn begin_hook_failure_aborts_before_render() {
        struct Refuse;
        #[async_trait]
        impl ReconcileListener for Refuse {
            async fn begin_reconcile(&self, _: &MeshControlPlane) -> Result<(), Error> {
                Err(Error::listener("begin_reconcile", "maintenance window"))
            }
        }

        let mut mock = MockChartRenderer::new();
        mock.expect_render().never();
        let renderer = ManifestRenderer::new(Arc::new(mock), Arc::new(Translator::default()));

        let err = reconciler(MockResourceClient::new(), renderer)
            .reconcile(&instance(), &Refuse)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Listener { hook: "begin_reconcile", .. }));
    }

    #[tokio::test]
    async fn end_hook_failure_is_the_final_error() {
        struct BrokenStatus;
        #[async_trait]
        impl ReconcileListener for BrokenStatus {
            async fn end_reconcile(
                &self,
                _: &MeshControlPlane,
                _: &BTreeSet<ObjectKind>,
                _: Option<&AggregateError>,
            ) -> Result<(), Error> {
                Err(Error::listener("end_reconcile", "status write refused"))
            }
        }

        let mut resources = MockResourceClient::new();
        resources.expect_get().returning(|_| Ok(None));
        resources.expect_create().times(2).returning(|_| Ok(()));
        resources.expect_list().returning(|_, _| Ok(Vec::new()));

        let err = reconciler(resources, renderer(vec![(ComponentName::Base, BASE)]))
            .reconcile(&instance(), &BrokenStatus)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Listener { hook: "end_reconcile", .. }));
    }

    // =========================================================================
    // Story: deleting the instance removes everything it owns
    // =========================================================================

    #[tokio::test]
    async fn story_delete_removes_all_owned_objects_ignoring_failures() {
        let mut resources = MockResourceClient::new();
        resources.expect_list().returning(|kind, _| {
            Ok(match kind.kind.as_str() {
                "Deployment" => vec![
                    owned("apps/v1", "Deployment", Some("mesh-system"), "discovery"),
                    owned("apps/v1", "Deployment", Some("mesh-system"), "galley"),
                ],
                "Service" => vec![owned("v1", "Service", Some("mesh-system"), "discovery")],
                _ => Vec::new(),
            })
        });
        resources.expect_delete().times(3).returning(|key| {
            if key.name == "galley" {
                Err(Error::validation("finalizer stuck"))
            } else {
                Ok(())
            }
        });

        let journal = Journal::default();
        let ignored = reconciler(resources, renderer(Vec::new()))
            .delete(&instance(), &journal)
            .await;

        assert_eq!(ignored.len(), 1);
        assert_eq!(*journal.events.lock().unwrap(), vec!["prune:true"]);
    }

    #[test]
    fn cluster_scoped_live_objects_match_namespaced_declarations() {
        let declared: BTreeSet<ObjectKey> = [ObjectKey {
            api_version: "rbac.authorization.k8s.io/v1".into(),
            kind: "ClusterRole".into(),
            namespace: Some("mesh-system".into()),
            name: "mesh-reader".into(),
        }]
        .into_iter()
        .collect();

        let live = ObjectKey {
            namespace: None,
            ..declared.iter().next().unwrap().clone()
        };
        assert!(is_declared(&declared, &live));

        let other = ObjectKey {
            namespace: Some("other".into()),
            ..live.clone()
        };
        assert!(!is_declared(&declared, &other));
    }

    #[test]
    fn undecodable_documents_are_decode_errors() {
        let manifest = ChartManifest {
            chart: "base".into(),
            component: Some(ComponentName::Base),
            namespace: "mesh-system".into(),
            kind: "".into(),
            content: "- just\n- a list\n".into(),
        };
        let err = desired_object(&Owner::new("mesh", "mesh-system"), &manifest).unwrap_err();
        assert!(err.to_string().contains("failed to decode"));
    }
}
