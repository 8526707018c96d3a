//! Resource controllers driving the engine

use futures::StreamExt;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::{controller::Action, watcher, Controller};
use serde::de::DeserializeOwned;
use std::error::Error;
use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use van_api::names::TYPE_PROXY_SELECTOR;
use van_core::{ControllerConfig, Engine, ResourceKind};
use van_kube::SiteClient;

#[derive(Debug)]
pub struct ReconcileError(pub String);

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reconciliation error: {}", self.0)
    }
}

impl Error for ReconcileError {}

struct Context {
    engine: Engine,
    kind: ResourceKind,
}

/// Start one controller per resource class
pub fn spawn_controllers(
    client: &SiteClient,
    config: &ControllerConfig,
    engine: &Engine,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let config_source = watcher::Config::default()
        .fields(&format!("metadata.name={}", config.config_source));
    let proxies = watcher::Config::default().labels(TYPE_PROXY_SELECTOR);

    vec![
        tokio::spawn(run_controller(
            client.config_maps(),
            config_source,
            context(engine, ResourceKind::ConfigSource),
            shutdown.clone(),
        )),
        tokio::spawn(run_controller(
            client.deployments(),
            proxies,
            context(engine, ResourceKind::ProxyWorkloads),
            shutdown.clone(),
        )),
        tokio::spawn(run_controller(
            client.services(),
            watcher::Config::default(),
            context(engine, ResourceKind::ServiceResources),
            shutdown,
        )),
    ]
}

fn context(engine: &Engine, kind: ResourceKind) -> Arc<Context> {
    Arc::new(Context {
        engine: engine.clone(),
        kind,
    })
}

fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

async fn reconcile<K: Resource>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let key = object_key(obj.as_ref());
    debug!("Reconciling {} after change to {}", ctx.kind, key);
    ctx.engine
        .refresh_and_reconcile(ctx.kind)
        .await
        .map_err(|e| ReconcileError(e.to_string()))?;
    ctx.engine.requeue_succeeded(ctx.kind, &key);
    Ok(Action::await_change())
}

fn error_policy<K: Resource>(obj: Arc<K>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let key = object_key(obj.as_ref());
    warn!("Error reconciling {} for {}: {}", ctx.kind, key, error);
    match ctx.engine.requeue_after_failure(ctx.kind, &key) {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    }
}

async fn run_controller<K>(
    api: Api<K>,
    config: watcher::Config,
    ctx: Arc<Context>,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Debug + Unpin,
{
    let kind = ctx.kind;
    info!("Starting {} controller", kind);
    let mut stream = Controller::new(api, config)
        .run(reconcile, error_policy, ctx)
        .boxed();

    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = shutdown.changed() => break,
        };
        match item {
            Some(Ok((obj, _))) => debug!("Reconciled {} {}", kind, obj.name),
            Some(Err(e)) => warn!("Error in {} reconciliation stream: {}", kind, e),
            None => break,
        }
    }
    info!("{} controller stopped", kind);
}
