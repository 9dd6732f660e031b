//! etcd v3 implementation of the coordination store.

use std::time::Duration;

use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, WatchOptions, WatchStream as EtcdWatchStream,
    Watcher,
};
use log::{debug, info};

use crate::store::{Change, ChangeKind, CoordinationStore, Seed, WatchStream};
use crate::{Error, Result};

pub const DEFAULT_ENDPOINTS: &str = "127.0.0.1:2379";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
}

impl StoreConfig {
    /// Build from a comma-separated endpoint list.
    pub fn new(endpoints: &str, dial_timeout: Duration) -> Self {
        Self {
            endpoints: parse_endpoints(endpoints),
            dial_timeout,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINTS, DEFAULT_DIAL_TIMEOUT)
    }
}

pub fn parse_endpoints(endpoints: &str) -> Vec<String> {
    endpoints
        .split(',')
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the cluster. Only this step is bounded by the dial timeout.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        info!("connecting to etcd at {}", config.endpoints.join(","));
        let options = ConnectOptions::new().with_connect_timeout(config.dial_timeout);
        let client = tokio::time::timeout(
            config.dial_timeout,
            Client::connect(&config.endpoints, Some(options)),
        )
        .await
        .map_err(|_| Error::ConnectTimeout(config.dial_timeout))??;
        Ok(Self { client })
    }
}

impl CoordinationStore for EtcdStore {
    type Watch = EtcdWatch;

    async fn load(&mut self, prefix: &str) -> Result<Seed> {
        let resp = self
            .client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map_or(0, |header| header.revision());
        let changes = resp
            .kvs()
            .iter()
            .map(|kv| Change::put(kv.key(), kv.value()))
            .collect::<Vec<_>>();
        debug!("loaded {} keys under {prefix} at revision {revision}", changes.len());
        Ok(Seed { changes, revision })
    }

    async fn watch(&mut self, prefix: &str, start_revision: i64) -> Result<EtcdWatch> {
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let (watcher, stream) = self.client.watch(prefix, Some(options)).await?;
        debug!("watching {prefix} from revision {start_revision}");
        Ok(EtcdWatch {
            _watcher: watcher,
            stream,
        })
    }
}

pub struct EtcdWatch {
    // Dropping the watcher closes the request side of the subscription.
    _watcher: Watcher,
    stream: EtcdWatchStream,
}

impl WatchStream for EtcdWatch {
    async fn next_batch(&mut self) -> Result<Option<Vec<Change>>> {
        loop {
            let Some(resp) = self.stream.message().await? else {
                return Ok(None);
            };
            if resp.canceled() {
                let reason = if resp.compact_revision() > 0 {
                    format!("revision compacted at {}", resp.compact_revision())
                } else {
                    resp.cancel_reason().to_string()
                };
                return Err(Error::WatchCanceled { reason });
            }
            // Creation acks and progress notifications carry no events.
            if resp.events().is_empty() {
                continue;
            }

            let batch = resp
                .events()
                .iter()
                .filter_map(|event| {
                    let kv = event.kv()?;
                    let kind = match event.event_type() {
                        EventType::Put => ChangeKind::Put,
                        EventType::Delete => ChangeKind::Delete,
                    };
                    Some(Change {
                        kind,
                        key: kv.key().to_vec(),
                        value: kv.value().to_vec(),
                    })
                })
                .collect();
            return Ok(Some(batch));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            parse_endpoints("10.0.0.1:2379, 10.0.0.2:2379,,"),
            vec!["10.0.0.1:2379".to_string(), "10.0.0.2:2379".to_string()]
        );
        assert!(parse_endpoints("").is_empty());
    }

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.endpoints, vec![DEFAULT_ENDPOINTS.to_string()]);
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
    }
}
