//! Fan-in of independent watch channels into a single "something changed"
//! signal with combined health.
//!
//! Consumers always re-read full cluster state on a signal, so dropping
//! redundant signals is safe; losing the last one is not. Forwarding is
//! therefore unbounded and never coalesces on the send side.

use eyre::{
    bail,
    Result,
};
use std::sync::{
    Arc,
    Mutex,
    PoisonError,
};
use tokio::{
    sync::{
        mpsc,
        watch as signal,
    },
    task::JoinHandle,
};

/// Health slot shared between a watch task and health checks.
#[derive(Clone, Debug, Default)]
pub struct HealthFlag(Arc<Mutex<Option<String>>>);

impl HealthFlag {
    pub fn set(&self, error: Option<String>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// A single watch source: a lazy, unbounded sequence of opaque update
/// signals plus a health flag maintained by whatever task feeds it.
pub struct Watcher {
    kind: &'static str,
    rx: mpsc::UnboundedReceiver<()>,
    health: HealthFlag,
    task: Option<JoinHandle<()>>,
}

/// Producer half of a [`Watcher`], held by the feeding task.
#[derive(Clone)]
pub struct WatcherFeed {
    tx: mpsc::UnboundedSender<()>,
    health: HealthFlag,
}

impl WatcherFeed {
    pub fn signal(&self) {
        let _ = self.tx.send(());
    }

    pub fn healthy(&self) {
        self.health.set(None);
    }

    pub fn unhealthy(&self, error: impl ToString) {
        self.health.set(Some(error.to_string()));
    }
}

impl Watcher {
    pub fn new(kind: &'static str) -> (Self, WatcherFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let health = HealthFlag::default();
        let watcher = Watcher {
            kind,
            rx,
            health: health.clone(),
            task: None,
        };
        (watcher, WatcherFeed { tx, health })
    }

    /// Record the task feeding this watcher so it is aborted when the
    /// combined watcher shuts down.
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }
}

/// Health view over all children of a combined watcher, readable without
/// access to the signal channel.
#[derive(Clone)]
pub struct CombinedHealth(Vec<(&'static str, HealthFlag)>);

impl CombinedHealth {
    /// The first unhealthy child, so a sick branch is visible.
    pub fn check(&self) -> Result<()> {
        for (kind, flag) in &self.0 {
            if let Some(err) = flag.get() {
                bail!("{kind} watcher failing: {err}");
            }
        }
        Ok(())
    }
}

pub struct CombinedWatcher {
    rx: mpsc::UnboundedReceiver<()>,
    health: CombinedHealth,
}

impl CombinedWatcher {
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    pub fn health_handle(&self) -> CombinedHealth {
        self.health.clone()
    }
}

/// Merge watchers into one signal source. A forwarding task per child
/// copies signals into the combined channel until `done` fires or the
/// child channel closes, then aborts the child's feeding task.
pub fn combine(watchers: Vec<Watcher>, done: signal::Receiver<()>) -> CombinedWatcher {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut healths = Vec::with_capacity(watchers.len());

    for mut watcher in watchers {
        healths.push((watcher.kind, watcher.health.clone()));
        let tx = tx.clone();
        let mut done = done.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.changed() => break,
                    signal = watcher.rx.recv() => match signal {
                        Some(()) => {
                            if tx.send(()).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            if let Some(task) = watcher.task.take() {
                task.abort();
            }
            debug!("stopped forwarding {} watch signals", watcher.kind);
        });
    }

    CombinedWatcher {
        rx,
        health: CombinedHealth(healths),
    }
}
