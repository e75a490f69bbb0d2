use std::path::{Path, PathBuf};

use anyhow::Context;
use cas_p2p::{DecoderKind, TcpTransportOptions, DEFAULT_INBOUND_CAPACITY, MAX_FRAME_SIZE};
use cas_store::{
    ContentAddressedTransform, IdentityTransform, StoreOptions, DEFAULT_BLOCK_SIZE,
    DEFAULT_ROOT_FOLDER_NAME,
};
use serde::{Deserialize, Serialize};

/// How keys map to paths on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    #[default]
    Content,
    Identity,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen_addr: String,
    pub storage_root: PathBuf,
    pub transform: TransformKind,
    pub block_size: usize,
    pub decoder: DecoderKind,
    pub max_frame_size: usize,
    pub inbound_capacity: usize,
    pub max_connections: Option<usize>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".into(),
            storage_root: PathBuf::from(DEFAULT_ROOT_FOLDER_NAME),
            transform: TransformKind::Content,
            block_size: DEFAULT_BLOCK_SIZE,
            decoder: DecoderKind::LengthPrefixed,
            max_frame_size: MAX_FRAME_SIZE,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            max_connections: None,
        }
    }
}

impl NodeConfig {
    /// Parse a TOML config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Defaults, overlaid with `path` when given.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        match self.transform {
            TransformKind::Content => StoreOptions::new(
                self.storage_root.clone(),
                ContentAddressedTransform::new(self.block_size),
            ),
            TransformKind::Identity => StoreOptions::new(self.storage_root.clone(), IdentityTransform),
        }
    }

    pub fn transport_options(&self) -> TcpTransportOptions {
        let mut options = TcpTransportOptions::new(self.listen_addr.clone())
            .with_inbound_capacity(self.inbound_capacity);
        options.decoder = self.decoder.decoder(self.max_frame_size);
        options.max_connections = self.max_connections;
        options
    }
}
