//! Kubernetes API boundary: listing ingresses/services and producing watch
//! signals for the reconcile loop.

use crate::watch::Watcher;
use async_trait::async_trait;
use eyre::{
    Context as _,
    Result,
};
use futures::StreamExt as _;
use k8s_openapi::api::{
    core::v1::{
        Namespace,
        Service,
    },
    networking::v1::Ingress,
};
use kube::{
    api::ListParams,
    runtime::watcher,
    Api,
};

/// Cluster state consumed by the reconciler. Listing and watching are
/// separate concerns: listings return full current state, watchers only
/// signal that state may have changed.
#[async_trait]
pub trait KubernetesClient: Send + Sync {
    async fn all_ingresses(&self) -> Result<Vec<Ingress>>;

    /// Ingresses in every namespace matching a label selector.
    async fn ingresses_matching(&self, namespace_selector: &str) -> Result<Vec<Ingress>>;

    async fn services(&self) -> Result<Vec<Service>>;

    fn watch_ingresses(&self) -> Watcher;
    fn watch_services(&self) -> Watcher;
    fn watch_namespaces(&self) -> Watcher;
}

pub struct KubeApi {
    client: kube::Client,
}

impl KubeApi {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubernetesClient for KubeApi {
    async fn all_ingresses(&self) -> Result<Vec<Ingress>> {
        let ingresses = Api::<Ingress>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .context("failed to list ingresses")?;
        Ok(ingresses.items)
    }

    async fn ingresses_matching(&self, namespace_selector: &str) -> Result<Vec<Ingress>> {
        let namespaces = Api::<Namespace>::all(self.client.clone())
            .list(&ListParams::default().labels(namespace_selector))
            .await
            .context("failed to list namespaces")?;

        let mut ingresses = Vec::new();
        for namespace in namespaces.items {
            let Some(name) = namespace.metadata.name else {
                continue;
            };
            let list = Api::<Ingress>::namespaced(self.client.clone(), &name)
                .list(&ListParams::default())
                .await
                .with_context(|| format!("failed to list ingresses in namespace {name}"))?;
            ingresses.extend(list.items);
        }
        Ok(ingresses)
    }

    async fn services(&self) -> Result<Vec<Service>> {
        let services = Api::<Service>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .context("failed to list services")?;
        Ok(services.items)
    }

    fn watch_ingresses(&self) -> Watcher {
        watch_resource::<Ingress>(self.client.clone(), "ingresses")
    }

    fn watch_services(&self) -> Watcher {
        watch_resource::<Service>(self.client.clone(), "services")
    }

    fn watch_namespaces(&self) -> Watcher {
        watch_resource::<Namespace>(self.client.clone(), "namespaces")
    }
}

/// Project a kube watch stream onto an opaque signal channel. Stream errors
/// mark the watcher unhealthy until the next successful event; the stream
/// itself re-establishes the watch internally.
fn watch_resource<K>(client: kube::Client, kind: &'static str) -> Watcher
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default,
{
    let (mut handle, feed) = Watcher::new(kind);
    let task = tokio::spawn(async move {
        let api = Api::<K>::all(client);
        let mut stream = watcher::watcher(api, watcher::Config::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(_) => {
                    feed.healthy();
                    feed.signal();
                }
                Err(err) => {
                    warn!("{kind} watch stream error: {err}");
                    feed.unhealthy(format!("{kind} watch failed: {err}"));
                }
            }
        }
        debug!("{kind} watch stream ended");
    });
    handle.attach(task);
    handle
}
