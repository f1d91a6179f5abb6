//! Thin Route53 client: paginated reads, batched writes, domain lookup.

use super::DnsProvider;
use async_trait::async_trait;
use aws_sdk_route53::{
    types::{
        Change,
        ChangeBatch,
        ResourceRecordSet,
        RrType,
    },
    Client,
};
use eyre::{
    Context as _,
    OptionExt as _,
    Result,
};

/// Route53 rejects ChangeResourceRecordSets requests above a change count
/// limit, so large converges are split into multiple atomic batches.
const MAX_CHANGES_PER_BATCH: usize = 100;

pub struct Route53Provider {
    client: Client,
    hosted_zone_id: String,
}

impl Route53Provider {
    pub fn new(client: Client, hosted_zone_id: String) -> Self {
        Self {
            client,
            hosted_zone_id,
        }
    }
}

#[async_trait]
impl DnsProvider for Route53Provider {
    async fn records(&self) -> Result<Vec<ResourceRecordSet>> {
        let mut records = Vec::new();
        let mut start_name: Option<String> = None;
        let mut start_type: Option<RrType> = None;

        loop {
            let response = self
                .client
                .list_resource_record_sets()
                .hosted_zone_id(&self.hosted_zone_id)
                .set_start_record_name(start_name.take())
                .set_start_record_type(start_type.take())
                .send()
                .await
                .context("ListResourceRecordSets failed")?;

            records.extend(response.resource_record_sets().iter().cloned());

            if !response.is_truncated() {
                break;
            }
            start_name = response.next_record_name().map(str::to_string);
            start_type = response.next_record_type().cloned();
        }

        debug!(
            "listed {} record sets in zone {}",
            records.len(),
            self.hosted_zone_id
        );
        Ok(records)
    }

    async fn apply(&self, changes: Vec<Change>) -> Result<()> {
        for batch in changes.chunks(MAX_CHANGES_PER_BATCH) {
            let change_batch = ChangeBatch::builder()
                .set_changes(Some(batch.to_vec()))
                .build()?;
            self.client
                .change_resource_record_sets()
                .hosted_zone_id(&self.hosted_zone_id)
                .change_batch(change_batch)
                .send()
                .await
                .with_context(|| {
                    format!("ChangeResourceRecordSets failed for a batch of {}", batch.len())
                })?;
        }
        Ok(())
    }

    async fn zone_domain(&self) -> Result<String> {
        let response = self
            .client
            .get_hosted_zone()
            .id(&self.hosted_zone_id)
            .send()
            .await
            .context("GetHostedZone failed")?;
        let zone = response
            .hosted_zone()
            .ok_or_eyre("hosted zone lookup returned no zone")?;
        Ok(zone.name().to_string())
    }
}
