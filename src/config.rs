//! Node configuration.
//!
//! Every field has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! connect_timeout_ms = 3000
//!
//! [dht]
//! k = 16
//! provider_ttl_ms = 3600000
//!
//! [floodsub]
//! seen_cache_size = 50000
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::dht::DhtConfig;
use crate::floodsub::FloodSubConfig;

/// Default bound on outbound connection establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a single request/response round trip.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(rename = "rpc_timeout_ms", with = "duration_ms")]
    pub rpc_timeout: Duration,
    pub dht: DhtConfig,
    pub floodsub: FloodSubConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            dht: DhtConfig::default(),
            floodsub: FloodSubConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid node config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to encode node config")
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.connect_timeout.is_zero(), "connect_timeout_ms must be > 0");
        ensure!(!self.rpc_timeout.is_zero(), "rpc_timeout_ms must be > 0");
        self.dht.validate().context("[dht]")?;
        self.floodsub.validate().context("[floodsub]")?;
        Ok(())
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
