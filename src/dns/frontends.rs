//! Frontend discovery: which load balancers (or static hostnames) front the
//! cluster's edge nodes, keyed by scheme.

use super::{
    DnsDetails,
    FrontendResolver,
};
use async_trait::async_trait;
use eyre::{
    bail,
    ensure,
    Context as _,
    Result,
};
use std::collections::HashMap;

/// Tag marking a classic ELB as a frontend for a named cluster.
pub const FRONTEND_TAG: &str = "edge.io/cluster-frontend";

/// DescribeTags accepts at most 20 load balancer names per request.
const DESCRIBE_TAGS_BATCH: usize = 20;

/// Frontend discovery configuration. Exactly one source must be set; the
/// check happens on first resolution so a misconfiguration fails the
/// updater's start.
pub struct FrontendDiscovery {
    pub elb: aws_sdk_elasticloadbalancing::Client,
    pub alb: aws_sdk_elasticloadbalancingv2::Client,
    pub elb_cluster_label: Option<String>,
    pub alb_names: Vec<String>,
    pub static_hostnames: HashMap<String, String>,
}

enum Mode<'a> {
    ElbLabel(&'a str),
    AlbNames(&'a [String]),
    Static(&'a HashMap<String, String>),
}

#[async_trait]
impl FrontendResolver for FrontendDiscovery {
    async fn resolve(&self) -> Result<HashMap<String, DnsDetails>> {
        match discovery_mode(
            self.elb_cluster_label.as_deref(),
            &self.alb_names,
            &self.static_hostnames,
        )? {
            Mode::ElbLabel(label) => self.resolve_elbs(label).await,
            Mode::AlbNames(names) => self.resolve_albs(names).await,
            Mode::Static(hostnames) => Ok(static_details(hostnames)),
        }
    }
}

fn discovery_mode<'a>(
    elb_cluster_label: Option<&'a str>,
    alb_names: &'a [String],
    static_hostnames: &'a HashMap<String, String>,
) -> Result<Mode<'a>> {
    let configured = [
        elb_cluster_label.is_some(),
        !alb_names.is_empty(),
        !static_hostnames.is_empty(),
    ]
    .iter()
    .filter(|set| **set)
    .count();
    ensure!(
        configured == 1,
        "exactly one of elb label, alb names or static hostnames must be configured, found {configured}"
    );

    if let Some(label) = elb_cluster_label {
        Ok(Mode::ElbLabel(label))
    } else if !alb_names.is_empty() {
        Ok(Mode::AlbNames(alb_names))
    } else {
        Ok(Mode::Static(static_hostnames))
    }
}

/// One discovered load balancer, already projected off the provider types.
struct DiscoveredFrontend {
    name: String,
    scheme: String,
    dns_name: String,
    hosted_zone_id: String,
}

impl FrontendDiscovery {
    /// Enumerate every classic ELB, fetch tags in bounded batches and keep
    /// those tagged as frontends of this cluster.
    async fn resolve_elbs(&self, cluster_label: &str) -> Result<HashMap<String, DnsDetails>> {
        let mut described = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let response = self
                .elb
                .describe_load_balancers()
                .set_marker(marker.take())
                .send()
                .await
                .context("DescribeLoadBalancers failed")?;

            for lb in response.load_balancer_descriptions() {
                let (Some(name), Some(dns_name), Some(scheme), Some(hosted_zone_id)) = (
                    lb.load_balancer_name(),
                    lb.dns_name(),
                    lb.scheme(),
                    lb.canonical_hosted_zone_name_id(),
                ) else {
                    continue;
                };
                described.push(DiscoveredFrontend {
                    name: name.to_string(),
                    scheme: scheme.to_string(),
                    dns_name: dns_name.to_string(),
                    hosted_zone_id: hosted_zone_id.to_string(),
                });
            }

            marker = response.next_marker().map(str::to_string);
            if marker.is_none() {
                break;
            }
        }

        let names: Vec<String> = described.iter().map(|lb| lb.name.clone()).collect();
        let mut tagged = std::collections::HashSet::new();
        for batch in names.chunks(DESCRIBE_TAGS_BATCH) {
            let response = self
                .elb
                .describe_tags()
                .set_load_balancer_names(Some(batch.to_vec()))
                .send()
                .await
                .context("DescribeTags failed")?;
            for description in response.tag_descriptions() {
                let Some(name) = description.load_balancer_name() else {
                    continue;
                };
                let matches = description
                    .tags()
                    .iter()
                    .any(|tag| tag.key() == FRONTEND_TAG && tag.value() == Some(cluster_label));
                if matches {
                    tagged.insert(name.to_string());
                }
            }
        }

        info!(
            "discovered {} tagged frontends among {} load balancers",
            tagged.len(),
            described.len()
        );
        frontends_from(described.into_iter().filter(|lb| tagged.contains(&lb.name)))
    }

    /// Look up the named ALBs directly, paginating on the marker token.
    async fn resolve_albs(&self, names: &[String]) -> Result<HashMap<String, DnsDetails>> {
        let mut discovered = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let response = self
                .alb
                .describe_load_balancers()
                .set_names(Some(names.to_vec()))
                .set_marker(marker.take())
                .send()
                .await
                .context("DescribeLoadBalancers failed")?;

            for lb in response.load_balancers() {
                let (Some(name), Some(dns_name), Some(scheme), Some(hosted_zone_id)) = (
                    lb.load_balancer_name(),
                    lb.dns_name(),
                    lb.scheme(),
                    lb.canonical_hosted_zone_id(),
                ) else {
                    continue;
                };
                discovered.push(DiscoveredFrontend {
                    name: name.to_string(),
                    scheme: scheme.as_str().to_string(),
                    dns_name: dns_name.to_string(),
                    hosted_zone_id: hosted_zone_id.to_string(),
                });
            }

            marker = response.next_marker().map(str::to_string);
            if marker.is_none() {
                break;
            }
        }

        frontends_from(discovered)
    }
}

/// Build the scheme map, rejecting trailing dots (a symptom of
/// double-qualification bugs further down) and duplicate schemes.
fn frontends_from(
    discovered: impl IntoIterator<Item = DiscoveredFrontend>,
) -> Result<HashMap<String, DnsDetails>> {
    let mut frontends = HashMap::new();
    for lb in discovered {
        ensure!(
            !lb.dns_name.ends_with('.'),
            "frontend {} has dns name {:?} with an unexpected trailing dot",
            lb.name,
            lb.dns_name
        );
        if frontends.contains_key(&lb.scheme) {
            bail!("multiple frontends found for scheme {:?}", lb.scheme);
        }
        frontends.insert(
            lb.scheme,
            DnsDetails {
                dns_name: lb.dns_name,
                hosted_zone_id: Some(lb.hosted_zone_id),
            },
        );
    }
    Ok(frontends)
}

fn static_details(hostnames: &HashMap<String, String>) -> HashMap<String, DnsDetails> {
    hostnames
        .iter()
        .map(|(scheme, hostname)| {
            (
                scheme.clone(),
                DnsDetails {
                    dns_name: hostname.clone(),
                    hosted_zone_id: None,
                },
            )
        })
        .collect()
}
