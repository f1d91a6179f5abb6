//! Ingress annotations recognized by the entry normalizer.
//!
//! Overrides are applied as an ordered rule table. Deprecated keys appear
//! before their canonical replacements, so the canonical key wins whenever
//! both are set on the same ingress. A malformed value never aborts
//! normalization; the entry keeps its previous (default) value.

use crate::entry::IngressEntry;
use std::collections::BTreeMap;

pub const ALLOW: &str = "edge.io/allow";
pub const FRONTEND_SCHEME: &str = "edge.io/frontend-scheme";
/// Deprecated in favour of [`FRONTEND_SCHEME`].
pub const FRONTEND_ELB_SCHEME: &str = "edge.io/frontend-elb-scheme";
pub const STRIP_PATH: &str = "edge.io/strip-path";
pub const EXACT_PATH: &str = "edge.io/exact-path";
pub const BACKEND_TIMEOUT_SECONDS: &str = "edge.io/backend-timeout-seconds";
/// Deprecated in favour of [`BACKEND_TIMEOUT_SECONDS`].
pub const BACKEND_KEEPALIVE_SECONDS: &str = "edge.io/backend-keepalive-seconds";
pub const BACKEND_MAX_CONNECTIONS: &str = "edge.io/backend-max-connections";
pub const PROXY_BUFFER_SIZE: &str = "edge.io/proxy-buffer-size-in-kb";
pub const PROXY_BUFFER_BLOCKS: &str = "edge.io/proxy-buffer-blocks";
pub const INGRESS_CLASS: &str = "kubernetes.io/ingress.class";

pub const MAX_PROXY_BUFFER_SIZE: u32 = 32;
pub const MAX_PROXY_BUFFER_BLOCKS: u32 = 8;

struct Override {
    key: &'static str,
    apply: fn(&mut IngressEntry, &str) -> Result<(), String>,
}

// Deprecated keys first; later rules overwrite earlier ones.
const OVERRIDES: &[Override] = &[
    Override {
        key: FRONTEND_ELB_SCHEME,
        apply: set_scheme,
    },
    Override {
        key: FRONTEND_SCHEME,
        apply: set_scheme,
    },
    Override {
        key: ALLOW,
        apply: set_allow,
    },
    Override {
        key: STRIP_PATH,
        apply: set_strip_paths,
    },
    Override {
        key: EXACT_PATH,
        apply: set_exact_path,
    },
    Override {
        key: BACKEND_KEEPALIVE_SECONDS,
        apply: set_backend_timeout,
    },
    Override {
        key: BACKEND_TIMEOUT_SECONDS,
        apply: set_backend_timeout,
    },
    Override {
        key: BACKEND_MAX_CONNECTIONS,
        apply: set_backend_max_connections,
    },
    Override {
        key: PROXY_BUFFER_SIZE,
        apply: set_proxy_buffer_size,
    },
    Override {
        key: PROXY_BUFFER_BLOCKS,
        apply: set_proxy_buffer_blocks,
    },
];

/// Apply all recognized annotation overrides to an entry seeded with
/// controller defaults. Unrecognized annotations are ignored.
pub fn apply_overrides(entry: &mut IngressEntry, annotations: &BTreeMap<String, String>) {
    for rule in OVERRIDES {
        let Some(value) = annotations.get(rule.key) else {
            continue;
        };
        if let Err(err) = (rule.apply)(entry, value) {
            warn!(
                ingress = %entry.name_with_namespace(),
                key = rule.key,
                %value,
                "keeping previous value for malformed annotation: {err}"
            );
        }
    }
}

fn set_scheme(entry: &mut IngressEntry, value: &str) -> Result<(), String> {
    entry.lb_scheme = value.to_string();
    Ok(())
}

fn set_allow(entry: &mut IngressEntry, value: &str) -> Result<(), String> {
    // An explicitly empty value means deny-all, not "no override".
    entry.allow = if value.trim().is_empty() {
        Vec::new()
    } else {
        value.split(',').map(|token| token.trim().to_string()).collect()
    };
    Ok(())
}

fn set_strip_paths(entry: &mut IngressEntry, value: &str) -> Result<(), String> {
    entry.strip_paths = parse_bool(value)?;
    Ok(())
}

fn set_exact_path(entry: &mut IngressEntry, value: &str) -> Result<(), String> {
    entry.exact_path = parse_bool(value)?;
    Ok(())
}

fn set_backend_timeout(entry: &mut IngressEntry, value: &str) -> Result<(), String> {
    entry.backend_timeout_seconds = parse_u32(value)?;
    Ok(())
}

fn set_backend_max_connections(entry: &mut IngressEntry, value: &str) -> Result<(), String> {
    entry.backend_max_connections = parse_u32(value)?;
    Ok(())
}

fn set_proxy_buffer_size(entry: &mut IngressEntry, value: &str) -> Result<(), String> {
    entry.proxy_buffer_size = parse_u32(value)?.min(MAX_PROXY_BUFFER_SIZE);
    Ok(())
}

fn set_proxy_buffer_blocks(entry: &mut IngressEntry, value: &str) -> Result<(), String> {
    entry.proxy_buffer_blocks = parse_u32(value)?.min(MAX_PROXY_BUFFER_BLOCKS);
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    value.parse::<bool>().map_err(|err| err.to_string())
}

fn parse_u32(value: &str) -> Result<u32, String> {
    value.parse::<u32>().map_err(|err| err.to_string())
}
