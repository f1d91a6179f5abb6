use chrono::{
    DateTime,
    Utc,
};
use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

/// One normalized, routable ingress rule: host + path + backend plus the
/// per-entry policy resolved from controller defaults and annotations.
///
/// Entries are built fresh on every reconcile tick and handed to updaters
/// as an immutable snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct IngressEntry {
    pub namespace: String,
    pub name: String,
    pub host: String,
    pub path: String,
    pub service_address: String,
    pub service_port: i32,
    /// IPs/CIDRs allowed to reach this entry. An empty list denies all
    /// traffic; the controller default applies when no annotation is set.
    pub allow: Vec<String>,
    /// Which class of frontend (e.g. "internal", "internet-facing") this
    /// entry is exposed on.
    pub lb_scheme: String,
    pub strip_paths: bool,
    pub exact_path: bool,
    pub backend_timeout_seconds: u32,
    pub backend_max_connections: u32,
    pub proxy_buffer_size: u32,
    pub proxy_buffer_blocks: u32,
    pub ingress_class: Option<String>,
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// An ordered snapshot of all valid entries from one reconcile tick.
pub type IngressEntries = Vec<IngressEntry>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing host")]
    MissingHost,
    #[error("missing service address")]
    MissingServiceAddress,
    #[error("service port is 0")]
    MissingServicePort,
    #[error("invalid allow addresses: {}", .0.join(", "))]
    InvalidAllowAddresses(Vec<String>),
}

impl IngressEntry {
    pub fn name_with_namespace(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// An entry is valid iff it has a host, a resolved service address, a
    /// non-zero port, and every allow token parses as an IP or CIDR. The
    /// error names every offending allow token.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::MissingHost);
        }
        if self.service_address.is_empty() {
            return Err(ValidationError::MissingServiceAddress);
        }
        if self.service_port == 0 {
            return Err(ValidationError::MissingServicePort);
        }

        let invalid: Vec<String> = self
            .allow
            .iter()
            .filter(|token| !is_address_or_cidr(token))
            .cloned()
            .collect();
        if !invalid.is_empty() {
            return Err(ValidationError::InvalidAllowAddresses(invalid));
        }

        Ok(())
    }
}

fn is_address_or_cidr(token: &str) -> bool {
    token.parse::<IpAddr>().is_ok() || token.parse::<IpNet>().is_ok()
}
