//! The reconciler: owns lifecycle, merges watch signals, normalizes cluster
//! state and fans the resulting entries out to updaters.

use crate::{
    entry::IngressEntry,
    k8s::KubernetesClient,
    normalize,
    watch::{
        self,
        CombinedHealth,
        CombinedWatcher,
    },
};
use async_trait::async_trait;
use eyre::{
    bail,
    eyre,
    Context as _,
    Result,
};
use std::{
    any::Any,
    panic::{
        catch_unwind,
        AssertUnwindSafe,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
};
use tokio::{
    sync::watch as signal,
    task::JoinHandle,
};

/// A consumer of normalized ingress entries. Updaters are started in
/// registration order, stopped in reverse order, and receive every entry
/// snapshot in registration order within a tick.
///
/// `health` must be cheap; long-running checks are the implementer's
/// responsibility to run out-of-band.
#[async_trait]
pub trait Updater: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn update(&self, entries: &[IngressEntry]) -> Result<()>;
    fn health(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Ingress class handled by this controller instance.
    pub ingress_class: String,
    /// Whether ingresses without any class annotation are also handled.
    pub include_classless: bool,
    /// When set, only ingresses in namespaces matching this label selector
    /// are considered. Mutually exclusive with watching all namespaces.
    pub namespace_selector: Option<String>,
    pub default_allow: Vec<String>,
    pub default_scheme: String,
    pub default_strip_paths: bool,
    pub default_exact_paths: bool,
    pub default_backend_timeout_seconds: u32,
    pub default_backend_max_connections: u32,
    pub default_proxy_buffer_size: u32,
    pub default_proxy_buffer_blocks: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ingress_class: "edge".to_string(),
            include_classless: false,
            namespace_selector: None,
            default_allow: Vec::new(),
            default_scheme: "internal".to_string(),
            default_strip_paths: false,
            default_exact_paths: false,
            default_backend_timeout_seconds: 10,
            default_backend_max_connections: 1024,
            default_proxy_buffer_size: 8,
            default_proxy_buffer_blocks: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Stopped,
}

struct State {
    lifecycle: Lifecycle,
    last_error: Option<String>,
    watch_health: Option<CombinedHealth>,
    stop_tx: Option<signal::Sender<()>>,
    loop_task: Option<JoinHandle<()>>,
}

pub struct Controller {
    client: Arc<dyn KubernetesClient>,
    updaters: Vec<Arc<dyn Updater>>,
    config: ControllerConfig,
    state: Arc<Mutex<State>>,
}

impl Controller {
    pub fn new(
        client: Arc<dyn KubernetesClient>,
        updaters: Vec<Arc<dyn Updater>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            updaters,
            config,
            state: Arc::new(Mutex::new(State {
                lifecycle: Lifecycle::Created,
                last_error: None,
                watch_health: None,
                stop_tx: None,
                loop_task: None,
            })),
        }
    }

    /// Start every updater in registration order, begin watching cluster
    /// state and spawn the reconcile loop. Returns without waiting for the
    /// first reconciliation. A failed updater start unwinds the already
    /// started updaters in reverse order before returning the error.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match state.lifecycle {
                Lifecycle::Created => state.lifecycle = Lifecycle::Started,
                Lifecycle::Started => bail!("controller is already started"),
                Lifecycle::Stopped => bail!("cannot restart a stopped controller"),
            }
        }

        let mut started: Vec<&Arc<dyn Updater>> = Vec::new();
        for updater in &self.updaters {
            if let Err(err) = updater.start().await {
                for other in started.iter().rev() {
                    if let Err(stop_err) = other.stop().await {
                        warn!(
                            "failed to stop updater {} while unwinding: {stop_err}",
                            other.name()
                        );
                    }
                }
                lock(&self.state).lifecycle = Lifecycle::Stopped;
                return Err(err).with_context(|| format!("failed to start updater {}", updater.name()));
            }
            debug!("started updater {}", updater.name());
            started.push(updater);
        }

        let watchers = vec![
            self.client.watch_ingresses(),
            self.client.watch_services(),
            self.client.watch_namespaces(),
        ];
        let (stop_tx, stop_rx) = signal::channel(());
        let combined = watch::combine(watchers, stop_rx.clone());
        let watch_health = combined.health_handle();

        let task = tokio::spawn(reconcile_loop(
            combined,
            stop_rx,
            self.client.clone(),
            self.updaters.clone(),
            self.config.clone(),
            self.state.clone(),
        ));

        let mut state = lock(&self.state);
        state.watch_health = Some(watch_health);
        state.stop_tx = Some(stop_tx);
        state.loop_task = Some(task);

        info!("controller started with {} updaters", self.updaters.len());
        Ok(())
    }

    /// Stop watching, wait for the reconcile loop to exit, then stop every
    /// updater in reverse registration order. Individual updater stop
    /// failures are logged, not returned. Terminal: the controller cannot
    /// be started again.
    pub async fn stop(&self) -> Result<()> {
        let (stop_tx, loop_task) = {
            let mut state = lock(&self.state);
            if state.lifecycle != Lifecycle::Started {
                bail!("controller is not started");
            }
            state.lifecycle = Lifecycle::Stopped;
            (state.stop_tx.take(), state.loop_task.take())
        };

        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }
        if let Some(task) = loop_task {
            if let Err(err) = task.await {
                warn!("reconcile loop ended abnormally: {err}");
            }
        }

        for updater in self.updaters.iter().rev() {
            if let Err(err) = updater.stop().await {
                warn!("failed to stop updater {}: {err}", updater.name());
            } else {
                debug!("stopped updater {}", updater.name());
            }
        }

        info!("controller stopped");
        Ok(())
    }

    /// Aggregate health: lifecycle state, then the first failing updater,
    /// then the watch channels, then the last reconciliation outcome.
    pub fn health(&self) -> Result<()> {
        let state = lock(&self.state);
        match state.lifecycle {
            Lifecycle::Created => bail!("controller has not been started"),
            Lifecycle::Stopped => bail!("controller has been stopped"),
            Lifecycle::Started => {}
        }

        for updater in &self.updaters {
            if let Err(err) = updater.health() {
                bail!("updater {} is unhealthy: {err}", updater.name());
            }
        }

        if let Some(watch_health) = &state.watch_health {
            watch_health.check()?;
        }

        if let Some(err) = &state.last_error {
            bail!("{err}");
        }

        Ok(())
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single serial reconcile loop: one full fetch-normalize-fanout pass per
/// combined watch signal, never two passes concurrently.
async fn reconcile_loop(
    mut combined: CombinedWatcher,
    mut stop_rx: signal::Receiver<()>,
    client: Arc<dyn KubernetesClient>,
    updaters: Vec<Arc<dyn Updater>>,
    config: ControllerConfig,
    state: Arc<Mutex<State>>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                debug!("reconcile loop received stop signal");
                return;
            }
            signal = combined.recv() => {
                if signal.is_none() {
                    warn!("combined watch channel closed, reconcile loop exiting");
                    return;
                }
                let outcome = reconcile(&*client, &updaters, &config)
                    .await
                    .context("updates failed to apply");
                let last_error = match outcome {
                    Ok(()) => None,
                    Err(err) => {
                        let message = format!("{err:#}");
                        error!("{message}");
                        Some(message)
                    }
                };
                lock(&state).last_error = last_error;
            }
        }
    }
}

async fn reconcile(
    client: &dyn KubernetesClient,
    updaters: &[Arc<dyn Updater>],
    config: &ControllerConfig,
) -> Result<()> {
    let ingresses = match &config.namespace_selector {
        Some(selector) => client.ingresses_matching(selector).await?,
        None => client.all_ingresses().await?,
    };
    if ingresses.is_empty() {
        bail!("found 0 ingresses");
    }

    let services = client.services().await?;
    if services.is_empty() {
        bail!("found 0 services");
    }

    // Normalization must never take the loop down; a panic becomes an
    // ordinary reconcile failure.
    let entries = catch_unwind(AssertUnwindSafe(|| {
        normalize::build_entries(config, &ingresses, &services)
    }))
    .map_err(|panic| eyre!("normalization panicked: {}", panic_message(panic.as_ref())))?;

    debug!(
        "normalized {} entries from {} ingresses",
        entries.len(),
        ingresses.len()
    );

    for updater in updaters {
        updater
            .update(&entries)
            .await
            .with_context(|| format!("updater {} failed", updater.name()))?;
    }

    Ok(())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
