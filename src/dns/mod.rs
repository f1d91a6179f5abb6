//! DNS reconciliation engine: diffs desired ingress entries against the
//! hosted zone and applies the minimal idempotent change-set.

pub mod frontends;
pub mod route53;

use crate::{
    controller::Updater,
    entry::IngressEntry,
    metrics,
};
use async_trait::async_trait;
use aws_sdk_route53::types::{
    AliasTarget,
    Change,
    ChangeAction,
    ResourceRecord,
    ResourceRecordSet,
    RrType,
};
use eyre::{
    Context as _,
    OptionExt as _,
    Result,
};
use std::{
    collections::{
        btree_map,
        BTreeMap,
        HashMap,
    },
    sync::{
        Arc,
        OnceLock,
    },
};

/// TTL for CNAME records pointing at statically configured frontends.
const CNAME_TTL: i64 = 300;

/// DNS name and hosted zone of one frontend. A missing hosted zone id marks
/// a statically configured hostname addressed by CNAME instead of alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsDetails {
    pub dns_name: String,
    pub hosted_zone_id: Option<String>,
}

impl DnsDetails {
    /// The record value this frontend is addressed by. Alias targets are
    /// fully qualified; static CNAME targets keep their configured form.
    pub fn target(&self) -> String {
        if self.hosted_zone_id.is_some() {
            format!("{}.", self.dns_name)
        } else {
            self.dns_name.clone()
        }
    }
}

/// Resolves the set of valid frontend targets, keyed by scheme. Resolved
/// once at updater start; immutable afterwards.
#[async_trait]
pub trait FrontendResolver: Send + Sync {
    async fn resolve(&self) -> Result<HashMap<String, DnsDetails>>;
}

/// The provider boundary: full paginated reads, batched atomic writes and
/// zone domain lookup.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn records(&self) -> Result<Vec<ResourceRecordSet>>;
    async fn apply(&self, changes: Vec<Change>) -> Result<()>;
    async fn zone_domain(&self) -> Result<String>;
}

/// Uniform projection of alias and CNAME record sets, so the diff is
/// representation-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    name: String,
    points_to: String,
    alias_hosted_zone: Option<String>,
    ttl: Option<i64>,
}

pub struct DnsUpdater {
    provider: Arc<dyn DnsProvider>,
    resolver: Box<dyn FrontendResolver>,
    frontends: OnceLock<HashMap<String, DnsDetails>>,
    domain: OnceLock<String>,
}

impl DnsUpdater {
    pub fn new(provider: Arc<dyn DnsProvider>, resolver: Box<dyn FrontendResolver>) -> Self {
        Self {
            provider,
            resolver,
            frontends: OnceLock::new(),
            domain: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Updater for DnsUpdater {
    fn name(&self) -> &'static str {
        "dns"
    }

    async fn start(&self) -> Result<()> {
        let frontends = self
            .resolver
            .resolve()
            .await
            .context("failed to resolve frontends")?;
        let domain = self
            .provider
            .zone_domain()
            .await
            .context("failed to look up hosted zone domain")?;

        info!(
            "dns updater managing zone {domain} with {} frontends",
            frontends.len()
        );
        for (scheme, details) in &frontends {
            debug!(%scheme, dns_name = %details.dns_name, "resolved frontend");
        }

        let _ = self.frontends.set(frontends);
        let _ = self.domain.set(domain);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, entries: &[IngressEntry]) -> Result<()> {
        let frontends = self
            .frontends
            .get()
            .ok_or_eyre("dns updater has not been started")?;
        let domain = self
            .domain
            .get()
            .ok_or_eyre("dns updater has not been started")?;

        let records = self
            .provider
            .records()
            .await
            .context("failed to list resource record sets")?;
        let managed = managed_records(&records, frontends);
        let desired = index_by_host(entries, domain);
        let changes = compute_changes(&desired, &managed, frontends)?;

        if changes.is_empty() {
            debug!("zone already in sync, no changes to apply");
            return Ok(());
        }

        info!("applying {} dns changes", changes.len());
        let count = changes.len() as u64;
        if let Err(err) = self.provider.apply(changes).await {
            metrics::DNS_UPDATE_FAILURES.inc();
            return Err(err).context("failed to apply dns changes");
        }
        metrics::DNS_CHANGES_APPLIED.inc_by(count);
        Ok(())
    }

    fn health(&self) -> Result<()> {
        self.frontends
            .get()
            .map(|_| ())
            .ok_or_eyre("dns updater has not been started")
    }
}

fn flatten(record_set: &ResourceRecordSet) -> Option<Record> {
    match record_set.r#type() {
        RrType::A => record_set.alias_target().map(|alias| Record {
            name: record_set.name().to_string(),
            points_to: alias.dns_name().to_string(),
            alias_hosted_zone: Some(alias.hosted_zone_id().to_string()),
            ttl: None,
        }),
        RrType::Cname => record_set.resource_records().first().map(|value| Record {
            name: record_set.name().to_string(),
            points_to: value.value().to_string(),
            alias_hosted_zone: None,
            ttl: record_set.ttl(),
        }),
        _ => None,
    }
}

/// Keep only records pointing at one of our frontends. Everything else is
/// foreign and must never be modified or deleted.
fn managed_records(
    records: &[ResourceRecordSet],
    frontends: &HashMap<String, DnsDetails>,
) -> Vec<Record> {
    records
        .iter()
        .filter_map(flatten)
        .filter(|record| {
            frontends
                .values()
                .any(|details| details.target() == record.points_to)
        })
        .collect()
}

/// Index desired entries by fully-qualified host. Out-of-zone hosts are
/// rejected; on a scheme conflict for the same host the first entry wins.
fn index_by_host(entries: &[IngressEntry], domain: &str) -> BTreeMap<String, IngressEntry> {
    let mut by_host = BTreeMap::new();
    for entry in entries {
        let fqdn = format!("{}.", entry.host);
        if !fqdn.ends_with(domain) {
            warn!(
                host = %entry.host,
                %domain,
                ingress = %entry.name_with_namespace(),
                "skipping entry outside the hosted zone"
            );
            metrics::skipped("out-of-zone");
            continue;
        }

        match by_host.entry(fqdn) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
            btree_map::Entry::Occupied(existing) => {
                if existing.get().lb_scheme != entry.lb_scheme {
                    warn!(
                        host = %entry.host,
                        kept = %existing.get().lb_scheme,
                        skipped = %entry.lb_scheme,
                        "conflicting schemes for host, keeping the first entry"
                    );
                    metrics::DNS_HOST_CONFLICTS.inc();
                }
            }
        }
    }
    by_host
}

fn compute_changes(
    desired: &BTreeMap<String, IngressEntry>,
    managed: &[Record],
    frontends: &HashMap<String, DnsDetails>,
) -> Result<Vec<Change>> {
    let mut changes = Vec::new();

    for (fqdn, entry) in desired {
        let Some(details) = frontends.get(&entry.lb_scheme) else {
            warn!(
                host = %entry.host,
                scheme = %entry.lb_scheme,
                "no frontend for scheme, skipping host"
            );
            metrics::skipped("no-frontend");
            continue;
        };

        let target = details.target();
        let up_to_date = managed.iter().any(|record| {
            record.name == *fqdn
                && record.points_to == target
                && (details.hosted_zone_id.is_some() || record.ttl == Some(CNAME_TTL))
        });
        if !up_to_date {
            changes.push(frontend_change(ChangeAction::Upsert, fqdn, details)?);
        }
    }

    for record in managed {
        if !desired.contains_key(&record.name) {
            changes.push(delete_change(record)?);
        }
    }

    Ok(changes)
}

fn frontend_change(action: ChangeAction, name: &str, details: &DnsDetails) -> Result<Change> {
    let record_set = match &details.hosted_zone_id {
        Some(hosted_zone_id) => ResourceRecordSet::builder()
            .name(name)
            .r#type(RrType::A)
            .alias_target(
                AliasTarget::builder()
                    .dns_name(details.target())
                    .hosted_zone_id(hosted_zone_id)
                    // Only one target is ever pointed to, so there is
                    // nothing to fail over to.
                    .evaluate_target_health(false)
                    .build()?,
            )
            .build()?,
        None => ResourceRecordSet::builder()
            .name(name)
            .r#type(RrType::Cname)
            .ttl(CNAME_TTL)
            .resource_records(ResourceRecord::builder().value(&details.dns_name).build()?)
            .build()?,
    };

    Ok(Change::builder()
        .action(action)
        .resource_record_set(record_set)
        .build()?)
}

/// Deletes must resubmit the record exactly as it exists in the zone.
fn delete_change(record: &Record) -> Result<Change> {
    let record_set = match &record.alias_hosted_zone {
        Some(hosted_zone_id) => ResourceRecordSet::builder()
            .name(&record.name)
            .r#type(RrType::A)
            .alias_target(
                AliasTarget::builder()
                    .dns_name(&record.points_to)
                    .hosted_zone_id(hosted_zone_id)
                    .evaluate_target_health(false)
                    .build()?,
            )
            .build()?,
        None => ResourceRecordSet::builder()
            .name(&record.name)
            .r#type(RrType::Cname)
            .ttl(record.ttl.unwrap_or(CNAME_TTL))
            .resource_records(ResourceRecord::builder().value(&record.points_to).build()?)
            .build()?,
    };

    Ok(Change::builder()
        .action(ChangeAction::Delete)
        .resource_record_set(record_set)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::bail;
    use std::sync::Mutex;

    struct FakeProvider {
        domain: &'static str,
        records: Mutex<Vec<ResourceRecordSet>>,
        applied: Mutex<Vec<Vec<Change>>>,
    }

    impl FakeProvider {
        fn new(domain: &'static str, records: Vec<ResourceRecordSet>) -> Arc<Self> {
            Arc::new(Self {
                domain,
                records: Mutex::new(records),
                applied: Mutex::new(Vec::new()),
            })
        }

        fn applied(&self) -> Vec<Vec<Change>> {
            self.applied.lock().expect("applied lock").clone()
        }

        fn set_records(&self, records: Vec<ResourceRecordSet>) {
            *self.records.lock().expect("records lock") = records;
        }
    }

    #[async_trait]
    impl DnsProvider for FakeProvider {
        async fn records(&self) -> Result<Vec<ResourceRecordSet>> {
            Ok(self.records.lock().expect("records lock").clone())
        }

        async fn apply(&self, changes: Vec<Change>) -> Result<()> {
            self.applied.lock().expect("applied lock").push(changes);
            Ok(())
        }

        async fn zone_domain(&self) -> Result<String> {
            Ok(self.domain.to_string())
        }
    }

    struct FakeResolver {
        frontends: HashMap<String, DnsDetails>,
        fail: bool,
    }

    impl FakeResolver {
        fn with_alias_frontends() -> Box<Self> {
            let mut frontends = HashMap::new();
            frontends.insert(
                "internal".to_string(),
                DnsDetails {
                    dns_name: "internal-alb-dns-name".to_string(),
                    hosted_zone_id: Some("Z0000ALB".to_string()),
                },
            );
            frontends.insert(
                "internet-facing".to_string(),
                DnsDetails {
                    dns_name: "public-alb-dns-name".to_string(),
                    hosted_zone_id: Some("Z0000ALB".to_string()),
                },
            );
            Box::new(Self {
                frontends,
                fail: false,
            })
        }

        fn with_static_frontend() -> Box<Self> {
            let mut frontends = HashMap::new();
            frontends.insert(
                "internal".to_string(),
                DnsDetails {
                    dns_name: "edge.example.org".to_string(),
                    hosted_zone_id: None,
                },
            );
            Box::new(Self {
                frontends,
                fail: false,
            })
        }

        fn failing() -> Box<Self> {
            Box::new(Self {
                frontends: HashMap::new(),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl FrontendResolver for FakeResolver {
        async fn resolve(&self) -> Result<HashMap<String, DnsDetails>> {
            if self.fail {
                bail!("both elb and alb discovery configured");
            }
            Ok(self.frontends.clone())
        }
    }

    fn entry(host: &str, scheme: &str) -> IngressEntry {
        IngressEntry {
            namespace: "default".to_string(),
            name: host.split('.').next().unwrap_or("app").to_string(),
            host: host.to_string(),
            path: "/".to_string(),
            service_address: "10.254.0.10".to_string(),
            service_port: 80,
            allow: Vec::new(),
            lb_scheme: scheme.to_string(),
            strip_paths: false,
            exact_path: false,
            backend_timeout_seconds: 10,
            backend_max_connections: 1024,
            proxy_buffer_size: 8,
            proxy_buffer_blocks: 4,
            ingress_class: None,
            creation_timestamp: None,
        }
    }

    fn alias_record(name: &str, points_to: &str) -> ResourceRecordSet {
        ResourceRecordSet::builder()
            .name(name)
            .r#type(RrType::A)
            .alias_target(
                AliasTarget::builder()
                    .dns_name(points_to)
                    .hosted_zone_id("Z0000ALB")
                    .evaluate_target_health(false)
                    .build()
                    .expect("alias target"),
            )
            .build()
            .expect("record set")
    }

    fn cname_record(name: &str, points_to: &str, ttl: i64) -> ResourceRecordSet {
        ResourceRecordSet::builder()
            .name(name)
            .r#type(RrType::Cname)
            .ttl(ttl)
            .resource_records(
                ResourceRecord::builder()
                    .value(points_to)
                    .build()
                    .expect("resource record"),
            )
            .build()
            .expect("record set")
    }

    async fn started_updater(provider: Arc<FakeProvider>, resolver: Box<FakeResolver>) -> DnsUpdater {
        let updater = DnsUpdater::new(provider, resolver);
        updater.start().await.expect("start");
        updater
    }

    fn single_change(applied: &[Vec<Change>]) -> &Change {
        assert_eq!(applied.len(), 1, "expected one batch: {applied:?}");
        assert_eq!(applied[0].len(), 1, "expected one change: {applied:?}");
        &applied[0][0]
    }

    #[tokio::test]
    async fn creates_alias_record_for_new_host() {
        let provider = FakeProvider::new("james.com.", Vec::new());
        let updater = started_updater(provider.clone(), FakeResolver::with_alias_frontends()).await;

        updater
            .update(&[entry("cats.james.com", "internal")])
            .await
            .expect("update");

        let applied = provider.applied();
        let change = single_change(&applied);
        assert_eq!(change.action(), &ChangeAction::Upsert);
        let record_set = change.resource_record_set().expect("record set");
        assert_eq!(record_set.name(), "cats.james.com.");
        assert_eq!(record_set.r#type(), &RrType::A);
        let alias = record_set.alias_target().expect("alias target");
        assert_eq!(alias.dns_name(), "internal-alb-dns-name.");
        assert!(!alias.evaluate_target_health());
    }

    #[tokio::test]
    async fn creates_cname_record_for_static_frontend() {
        let provider = FakeProvider::new("james.com.", Vec::new());
        let updater = started_updater(provider.clone(), FakeResolver::with_static_frontend()).await;

        updater
            .update(&[entry("cats.james.com", "internal")])
            .await
            .expect("update");

        let applied = provider.applied();
        let change = single_change(&applied);
        let record_set = change.resource_record_set().expect("record set");
        assert_eq!(record_set.r#type(), &RrType::Cname);
        assert_eq!(record_set.ttl(), Some(300));
        assert_eq!(record_set.resource_records()[0].value(), "edge.example.org");
    }

    #[tokio::test]
    async fn update_is_idempotent() {
        let provider = FakeProvider::new(
            "james.com.",
            vec![alias_record("cats.james.com.", "internal-alb-dns-name.")],
        );
        let updater = started_updater(provider.clone(), FakeResolver::with_alias_frontends()).await;

        updater
            .update(&[entry("cats.james.com", "internal")])
            .await
            .expect("update");

        assert!(provider.applied().is_empty(), "no changes expected");
    }

    #[tokio::test]
    async fn deletes_managed_record_for_absent_host() {
        let provider = FakeProvider::new(
            "james.com.",
            vec![alias_record("bar.james.com.", "internal-alb-dns-name.")],
        );
        let updater = started_updater(provider.clone(), FakeResolver::with_alias_frontends()).await;

        updater.update(&[]).await.expect("update");

        let applied = provider.applied();
        let change = single_change(&applied);
        assert_eq!(change.action(), &ChangeAction::Delete);
        assert_eq!(change.resource_record_set().expect("record set").name(), "bar.james.com.");
    }

    #[tokio::test]
    async fn never_touches_foreign_records() {
        let provider = FakeProvider::new(
            "james.com.",
            vec![
                alias_record("foreign.james.com.", "someone-elses-target."),
                cname_record("other.james.com.", "unrelated.example.net", 60),
            ],
        );
        let updater = started_updater(provider.clone(), FakeResolver::with_alias_frontends()).await;

        updater.update(&[]).await.expect("update");

        assert!(provider.applied().is_empty(), "foreign records must be left alone");
    }

    #[tokio::test]
    async fn foreign_record_with_desired_host_is_not_deleted() {
        // The host collides with a desired entry, but the record points at
        // an unrecognized target, so it is foreign: upsert may replace it,
        // delete must never name it.
        let provider = FakeProvider::new(
            "james.com.",
            vec![cname_record("cats.james.com.", "unrelated.example.net", 60)],
        );
        let updater = started_updater(provider.clone(), FakeResolver::with_alias_frontends()).await;

        updater
            .update(&[entry("cats.james.com", "internal")])
            .await
            .expect("update");

        let applied = provider.applied();
        let change = single_change(&applied);
        assert_eq!(change.action(), &ChangeAction::Upsert);
    }

    #[tokio::test]
    async fn first_entry_wins_on_scheme_conflict() {
        let provider = FakeProvider::new("james.com.", Vec::new());
        let updater = started_updater(provider.clone(), FakeResolver::with_alias_frontends()).await;

        updater
            .update(&[
                entry("cats.james.com", "internal"),
                entry("cats.james.com", "internet-facing"),
            ])
            .await
            .expect("update");

        let applied = provider.applied();
        let change = single_change(&applied);
        let alias = change.resource_record_set().expect("record set").alias_target().expect("alias");
        assert_eq!(alias.dns_name(), "internal-alb-dns-name.");
    }

    #[tokio::test]
    async fn skips_hosts_outside_the_zone() {
        let provider = FakeProvider::new("james.com.", Vec::new());
        let updater = started_updater(provider.clone(), FakeResolver::with_alias_frontends()).await;

        updater
            .update(&[entry("cats.elsewhere.org", "internal")])
            .await
            .expect("update");

        assert!(provider.applied().is_empty());
    }

    #[tokio::test]
    async fn skips_hosts_with_unknown_scheme() {
        let provider = FakeProvider::new("james.com.", Vec::new());
        let updater = started_updater(provider.clone(), FakeResolver::with_alias_frontends()).await;

        updater
            .update(&[entry("cats.james.com", "no-such-scheme")])
            .await
            .expect("update");

        assert!(provider.applied().is_empty());
    }

    #[tokio::test]
    async fn repoints_record_when_scheme_changes() {
        let provider = FakeProvider::new(
            "james.com.",
            vec![alias_record("cats.james.com.", "internal-alb-dns-name.")],
        );
        let updater = started_updater(provider.clone(), FakeResolver::with_alias_frontends()).await;

        updater
            .update(&[entry("cats.james.com", "internet-facing")])
            .await
            .expect("update");

        let applied = provider.applied();
        let change = single_change(&applied);
        assert_eq!(change.action(), &ChangeAction::Upsert);
        let alias = change.resource_record_set().expect("record set").alias_target().expect("alias");
        assert_eq!(alias.dns_name(), "public-alb-dns-name.");
    }

    #[tokio::test]
    async fn second_update_after_convergence_is_empty() {
        let provider = FakeProvider::new("james.com.", Vec::new());
        let updater = started_updater(provider.clone(), FakeResolver::with_alias_frontends()).await;
        let entries = vec![entry("cats.james.com", "internal")];

        updater.update(&entries).await.expect("first update");
        assert_eq!(provider.applied().len(), 1);

        // Simulate the provider now returning what we just wrote.
        provider.set_records(vec![alias_record("cats.james.com.", "internal-alb-dns-name.")]);
        updater.update(&entries).await.expect("second update");
        assert_eq!(provider.applied().len(), 1, "second update must be a no-op");
    }

    #[tokio::test]
    async fn failed_resolution_fails_start() {
        let provider = FakeProvider::new("james.com.", Vec::new());
        let updater = DnsUpdater::new(provider, FakeResolver::failing());
        let err = updater.start().await.expect_err("start should fail");
        assert!(err.to_string().contains("failed to resolve frontends"));
    }

    #[tokio::test]
    async fn update_before_start_errors() {
        let provider = FakeProvider::new("james.com.", Vec::new());
        let updater = DnsUpdater::new(provider, FakeResolver::with_alias_frontends());
        assert!(updater.health().is_err());
        let err = updater.update(&[]).await.expect_err("update unstarted");
        assert!(err.to_string().contains("has not been started"));
    }
}
