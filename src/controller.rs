use crate::config::NamespaceFilter;
use crate::credentials::SecretSource;
use crate::evaluator::Evaluator;
use crate::oci_registry::RegistryAccess;
use crate::state::ControllerContext;
use crate::workload::{Workload, WorkloadStore};
use anyhow::Context;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, ResourceExt};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Builds the cluster client from the first usable source: the configured kubeconfig,
/// `$HOME/.kube/config`, then the in-cluster service account.
pub async fn create_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    info!("Initializing K8s controller");
    let config = load_kube_config(kubeconfig).await?;
    let client = Client::try_from(config).context("Failed to create Kubernetes client")?;

    match client.apiserver_version().await {
        Ok(api_server_info) => info!(
            "Connected to Kubernetes API server with version {}.{}",
            api_server_info.major, api_server_info.minor
        ),
        Err(e) => warn!("Could not query Kubernetes API server version: {}", e),
    }
    Ok(client)
}

fn kubeconfig_candidates(configured: Option<&Path>, home: Option<PathBuf>) -> Vec<PathBuf> {
    configured
        .map(Path::to_path_buf)
        .into_iter()
        .chain(home.map(|home| home.join(".kube").join("config")))
        .collect()
}

async fn load_kube_config(configured: Option<&Path>) -> anyhow::Result<kube::Config> {
    let home = env::var_os("HOME").map(PathBuf::from);
    for path in kubeconfig_candidates(configured, home) {
        if !path.exists() {
            debug!("No kubeconfig at {}", path.display());
            continue;
        }
        let kubeconfig = match Kubeconfig::read_from(&path) {
            Ok(kubeconfig) => kubeconfig,
            Err(e) => {
                debug!("Failed to read kubeconfig {}: {}", path.display(), e);
                continue;
            }
        };
        match kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await
        {
            Ok(config) => {
                info!("Using kubeconfig {}", path.display());
                return Ok(config);
            }
            Err(e) => debug!("Failed to load kubeconfig {}: {}", path.display(), e),
        }
    }

    let config = kube::Config::incluster()
        .context("No usable kubeconfig found and not running inside a cluster")?;
    info!("Using in-cluster configuration");
    Ok(config)
}

/// Runs one pass per interval tick until `token` is cancelled. The first pass starts immediately.
pub async fn run(ctx: ControllerContext, token: CancellationToken) {
    info!(
        "Starting image updater with interval {:?}",
        ctx.config.updater.interval
    );
    let ctx = &ctx;
    let passes = run_passes(ctx.config.updater.interval, &token, move || reconcile_all(ctx)).await;
    info!("Image updater stopped after {} passes", passes);
}

/// Ticks every `period` and awaits `pass` to completion before the next tick is considered.
/// Cancellation is checked before each pass; returns the number of passes run.
async fn run_passes<F, Fut>(period: Duration, token: &CancellationToken, mut pass: F) -> usize
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut passes = 0;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        if token.is_cancelled() {
            break;
        }
        pass().await;
        passes += 1;
    }
    passes
}

pub async fn reconcile_all(ctx: &ControllerContext) {
    let resolver = ctx.credential_resolver();
    let evaluator = Evaluator::new(&ctx.registry, &resolver);
    reconcile_all_kinds(&ctx.workload_store(), &ctx.namespace_filter, &evaluator).await;
}

async fn reconcile_all_kinds<St, R, S>(
    store: &St,
    namespace_filter: &NamespaceFilter,
    evaluator: &Evaluator<'_, R, S>,
) where
    St: WorkloadStore,
    R: RegistryAccess,
    S: SecretSource,
{
    debug!("Starting reconciliation pass");
    reconcile_kind::<Deployment, _, _, _>(store, namespace_filter, evaluator).await;
    reconcile_kind::<StatefulSet, _, _, _>(store, namespace_filter, evaluator).await;
    reconcile_kind::<DaemonSet, _, _, _>(store, namespace_filter, evaluator).await;
    debug!("Reconciliation pass finished");
}

async fn reconcile_kind<W, St, R, S>(
    store: &St,
    namespace_filter: &NamespaceFilter,
    evaluator: &Evaluator<'_, R, S>,
) where
    W: Workload,
    St: WorkloadStore,
    R: RegistryAccess,
    S: SecretSource,
{
    let items = match store.list::<W>().await {
        Ok(items) => items,
        Err(e) => {
            error!("{:#}", e);
            return;
        }
    };
    debug!("Found {} {} objects", items.len(), W::kind_name());

    for mut workload in items {
        let namespace = workload.namespace().unwrap_or_default();
        let name = workload.name_any();
        if !namespace_filter.allows(&namespace) {
            debug!(
                "Skipping {} {}/{}, namespace not allowed",
                W::kind_name(),
                namespace,
                name
            );
            continue;
        }
        if !workload.update_enabled() {
            continue;
        }

        if !reconcile_workload(evaluator, &mut workload).await {
            debug!("{} {}/{} is up to date", W::kind_name(), namespace, name);
            continue;
        }

        match store.replace(&workload).await {
            Ok(()) => info!("Updated {} {}/{}", W::kind_name(), namespace, name),
            Err(e) => error!("{:#}", e),
        }
    }
}

/// Evaluates every container of `workload` and applies the resulting mutations to it.
/// Returns whether anything changed, i.e. whether a write-back is needed.
pub async fn reconcile_workload<W, R, S>(
    evaluator: &Evaluator<'_, R, S>,
    workload: &mut W,
) -> bool
where
    W: Workload,
    R: RegistryAccess,
    S: SecretSource,
{
    let namespace = workload.namespace().unwrap_or_default();
    let name = workload.name_any();
    let containers = workload.containers().to_vec();
    let mut changed = false;

    for container in containers {
        // Derived from the working copy, so earlier mutations of this pass are visible
        let policy = workload.update_policy();
        match evaluator.evaluate(&container, &policy, &namespace).await {
            Ok(Some(mutation)) => {
                if mutation.restart_required() {
                    info!(
                        "Restarting {} {}/{} for container {}",
                        W::kind_name(),
                        namespace,
                        name,
                        container.name
                    );
                }
                workload.apply_mutation(&container.name, &mutation);
                changed = true;
            }
            Ok(None) => {}
            Err(e) if e.is_malformed_input() => warn!(
                "Skipping container {} of {} {}/{}: {}",
                container.name,
                W::kind_name(),
                namespace,
                name,
                e
            ),
            Err(e) => error!(
                "Failed to evaluate container {} of {} {}/{}: {}",
                container.name,
                W::kind_name(),
                namespace,
                name,
                e
            ),
        }
    }
    changed
}
