use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::TokenCodec;
use crate::error::{CodecError, Result};
use crate::registry::DirectoryRegistry;

/// Which vocabulary to load and where the registry lives.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct CodecConfig {
    /// Root of a [`DirectoryRegistry`].
    #[serde(alias = "registry_dir")]
    pub registry: PathBuf,
    #[serde(alias = "model_name")]
    pub vocabulary: String,
}

impl CodecConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(config_path).map_err(|source| CodecError::Io {
            path: config_path.to_path_buf(),
            source,
        })?;
        let mut config: CodecConfig = serde_json::from_str(&contents)?;
        // relative registry paths are taken from the config file's directory
        if config.registry.is_relative() {
            if let Some(parent) = config_path.parent() {
                config.registry = parent.join(&config.registry);
            }
        }
        Ok(config)
    }

    pub fn registry(&self) -> DirectoryRegistry {
        DirectoryRegistry::new(&self.registry)
    }

    pub fn open(&self) -> Result<TokenCodec> {
        TokenCodec::new(&self.vocabulary, &self.registry())
    }
}
