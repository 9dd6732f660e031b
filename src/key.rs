//! Registration key codec.
//!
//! Instances register under `<prefix>/<service>/<instance>`. The service is a
//! single path segment; the instance is everything after it and may itself
//! contain `/`.

use crate::{Error, Result};

pub const DEFAULT_PREFIX: &str = "/services";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub service: String,
    pub instance: String,
}

/// Split a raw key into its service and instance parts.
pub fn decode(prefix: &str, key: &[u8]) -> Result<ServiceKey> {
    let path = std::str::from_utf8(key).map_err(|_| malformed(key, "key is not valid utf-8"))?;

    let rest = path
        .strip_prefix(prefix.trim_end_matches('/'))
        .ok_or_else(|| malformed(key, "key outside watched prefix"))?;
    let rest = rest
        .strip_prefix('/')
        .ok_or_else(|| malformed(key, "missing separator after prefix"))?;

    let (service, instance) = rest
        .split_once('/')
        .ok_or_else(|| malformed(key, "missing instance segment"))?;
    if service.is_empty() {
        return Err(malformed(key, "empty service segment"));
    }
    if instance.is_empty() {
        return Err(malformed(key, "empty instance segment"));
    }

    Ok(ServiceKey {
        service: service.to_string(),
        instance: instance.to_string(),
    })
}

/// Build the key an instance registers under.
pub fn encode(prefix: &str, service: &str, instance: &str) -> String {
    format!("{}/{}/{}", prefix.trim_end_matches('/'), service, instance)
}

fn malformed(key: &[u8], reason: &'static str) -> Error {
    Error::MalformedKey {
        key: String::from_utf8_lossy(key).into_owned(),
        reason,
    }
}
