//! Transport configuration and process-startup initialisation.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{OpError, OpResult};
use crate::transport::{LocalWorld, TransportAvailability};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportBackend {
    /// No transport: the loader works, transfer nodes cannot be built.
    #[default]
    Disabled,
    /// In-process ranks connected through a [`LocalWorld`].
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub backend: TransportBackend,
    pub world_size: usize,
    /// Sends of at most this many bytes complete without waiting for the receiver.
    pub eager_limit: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: TransportBackend::Disabled,
            world_size: 1,
            eager_limit: 0,
        }
    }
}

impl TransportConfig {
    pub fn local(world_size: usize) -> Self {
        Self {
            backend: TransportBackend::Local,
            world_size,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> OpResult<Self> {
        let config: TransportConfig = serde_json::from_str(json)
            .map_err(|err| OpError::config(format!("invalid transport config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> OpResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> OpResult<()> {
        if self.world_size == 0 {
            return Err(OpError::config("world_size must be >= 1"));
        }
        Ok(())
    }

    /// Initialises the transport, returning one availability entry per rank.
    ///
    /// A disabled backend still succeeds: every entry is
    /// [`TransportAvailability::Unavailable`].
    pub fn connect(&self) -> OpResult<Vec<TransportAvailability>> {
        self.validate()?;
        match self.backend {
            TransportBackend::Disabled => {
                warn!("transport disabled; send/receive operations are unavailable");
                Ok((0..self.world_size)
                    .map(|_| {
                        TransportAvailability::unavailable("transport disabled by configuration")
                    })
                    .collect())
            }
            TransportBackend::Local => {
                let world = LocalWorld::with_eager_limit(self.world_size, self.eager_limit)?;
                info!(world_size = self.world_size, "local transport initialised");
                Ok(world
                    .into_contexts()
                    .into_iter()
                    .map(TransportAvailability::Available)
                    .collect())
            }
        }
    }
}
