//! Turns raw ingress and service listings into the canonical, validated,
//! ordered entry set handed to updaters.

use crate::{
    annotations,
    controller::ControllerConfig,
    entry::{
        IngressEntries,
        IngressEntry,
    },
    metrics,
};
use k8s_openapi::api::{
    core::v1::Service,
    networking::v1::Ingress,
};
use std::collections::{
    BTreeMap,
    HashMap,
};

/// Build the entry set for one reconcile tick. Pure and synchronous so the
/// reconcile loop can wrap it in a panic-recovery boundary.
pub fn build_entries(
    config: &ControllerConfig,
    ingresses: &[Ingress],
    services: &[Service],
) -> IngressEntries {
    let service_addresses = cluster_ips_by_service(services);
    let empty_annotations = BTreeMap::new();
    let mut entries = Vec::new();

    for ingress in ingresses {
        let namespace = ingress.metadata.namespace.as_deref().unwrap_or("default");
        let name = ingress.metadata.name.as_deref().unwrap_or_default();
        let annotations = ingress
            .metadata
            .annotations
            .as_ref()
            .unwrap_or(&empty_annotations);

        let Some(spec) = &ingress.spec else {
            continue;
        };

        let class = annotations
            .get(annotations::INGRESS_CLASS)
            .or(spec.ingress_class_name.as_ref());
        if !class_matches(config, class) {
            debug!(
                ingress = %format!("{namespace}/{name}"),
                class = ?class,
                "skipping ingress with non-matching class"
            );
            metrics::skipped("ingress-class");
            continue;
        }

        let Some(rules) = &spec.rules else {
            continue;
        };

        for rule in rules {
            let host = rule.host.clone().unwrap_or_default();
            let Some(http) = &rule.http else {
                continue;
            };

            for path in &http.paths {
                let Some(backend) = &path.backend.service else {
                    continue;
                };
                let service_port = backend
                    .port
                    .as_ref()
                    .and_then(|port| port.number)
                    .unwrap_or_default();

                let Some(service_address) =
                    service_addresses.get(&(namespace.to_string(), backend.name.clone()))
                else {
                    warn!(
                        ingress = %format!("{namespace}/{name}"),
                        service = %backend.name,
                        %host,
                        "skipping entry: backend service has no cluster ip"
                    );
                    metrics::skipped("missing-service");
                    continue;
                };

                let mut entry = IngressEntry {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    host: host.clone(),
                    path: path.path.clone().unwrap_or_else(|| "/".to_string()),
                    service_address: service_address.clone(),
                    service_port,
                    allow: config.default_allow.clone(),
                    lb_scheme: config.default_scheme.clone(),
                    strip_paths: config.default_strip_paths,
                    exact_path: config.default_exact_paths,
                    backend_timeout_seconds: config.default_backend_timeout_seconds,
                    backend_max_connections: config.default_backend_max_connections,
                    proxy_buffer_size: config.default_proxy_buffer_size,
                    proxy_buffer_blocks: config.default_proxy_buffer_blocks,
                    ingress_class: class.cloned(),
                    creation_timestamp: ingress.metadata.creation_timestamp.as_ref().map(|t| t.0),
                };
                annotations::apply_overrides(&mut entry, annotations);

                match entry.validate() {
                    Ok(()) => entries.push(entry),
                    Err(reason) => {
                        warn!(
                            ingress = %format!("{namespace}/{name}"),
                            %host,
                            "skipping invalid entry: {reason}"
                        );
                        metrics::skipped("invalid-entry");
                    }
                }
            }
        }
    }

    // Stable order so diffs and tests are deterministic.
    entries.sort_by(|a, b| {
        (&a.namespace, &a.name, &a.host, &a.path).cmp(&(&b.namespace, &b.name, &b.host, &b.path))
    });
    entries
}

fn class_matches(config: &ControllerConfig, class: Option<&String>) -> bool {
    match class {
        Some(class) => *class == config.ingress_class,
        None => config.include_classless,
    }
}

/// (namespace, name) -> cluster IP, rebuilt from scratch every tick.
fn cluster_ips_by_service(services: &[Service]) -> HashMap<(String, String), String> {
    let mut addresses = HashMap::new();
    for service in services {
        let (Some(namespace), Some(name)) = (
            service.metadata.namespace.as_ref(),
            service.metadata.name.as_ref(),
        ) else {
            continue;
        };
        let Some(cluster_ip) = service.spec.as_ref().and_then(|spec| spec.cluster_ip.clone())
        else {
            continue;
        };
        // Headless services carry the literal string "None".
        if cluster_ip.is_empty() || cluster_ip == "None" {
            continue;
        }
        addresses.insert((namespace.clone(), name.clone()), cluster_ip);
    }
    addresses
}
