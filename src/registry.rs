//! Resolution of vocabulary names to loaded tokenizers.
//!
//! A registry is handed to [`TokenCodec::new`](crate::TokenCodec::new)
//! explicitly; nothing here is process-wide.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind};
use std::path::{Component, Path, PathBuf};

use indexmap::IndexMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::base::{Token, Tokenizer};
use crate::error::{CodecError, Result};
use crate::gpt4::GPT4Tokenizer;
use crate::regex::{BpeModel, RegexTokenizer};

/// File describing a vocabulary inside its registry directory.
pub const MANIFEST_FILE: &str = "tokenizer.json";

pub trait VocabularyRegistry: Send + Sync {
    /// Load the tokenizer registered under `name`.
    fn resolve(&self, name: &str) -> Result<Box<dyn Tokenizer>>;
}

/// Contents of a vocabulary manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Manifest {
    /// A byte-level BPE model stored inline.
    Bpe(BpeModel),
    /// tiktoken ranks stored next to the manifest.
    Tiktoken(TiktokenManifest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiktokenManifest {
    /// Ranks file name, relative to the vocabulary directory.
    pub ranks: String,
    #[serde(default)]
    pub special_tokens: IndexMap<String, Token>,
    #[serde(default)]
    pub bos_token: Option<String>,
}

/// Vocabularies stored under a local directory, one subdirectory per name.
///
/// Names may be nested (`org/model`) but cannot leave the root.
#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryRegistry { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `name`, or `None` when the name is not a plain relative path.
    fn vocabulary_dir(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains('\\') {
            return None;
        }
        let relative = Path::new(name);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        plain.then(|| self.root.join(relative))
    }

    /// Names of every vocabulary under the root, nested ones as `org/model`.
    pub fn names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            let entries = fs::read_dir(&dir).map_err(|source| CodecError::Io {
                path: dir.clone(),
                source,
            })?;
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("skipping unreadable entry in {}: {e}", dir.display());
                        continue;
                    }
                };
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let file_name = match entry.file_name().into_string() {
                    Ok(file_name) => file_name,
                    Err(raw) => {
                        warn!("skipping non UTF-8 vocabulary name {raw:?}");
                        continue;
                    }
                };
                let name = if prefix.is_empty() {
                    file_name
                } else {
                    format!("{prefix}/{file_name}")
                };
                if path.join(MANIFEST_FILE).is_file() {
                    names.push(name.clone());
                }
                pending.push((path, name));
            }
        }
        names.sort();
        Ok(names)
    }

    /// Write `tokenizer` under `name`, replacing any existing manifest.
    pub fn install(&self, name: &str, tokenizer: &RegexTokenizer) -> Result<PathBuf> {
        let dir = self
            .vocabulary_dir(name)
            .ok_or_else(|| CodecError::InvalidConfig(format!("invalid vocabulary name {name:?}")))?;
        fs::create_dir_all(&dir).map_err(|source| CodecError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(&Manifest::Bpe(tokenizer.to_model()))?;
        fs::write(&path, json).map_err(|source| CodecError::Io {
            path: path.clone(),
            source,
        })?;
        info!("installed vocabulary {name} at {}", dir.display());
        Ok(path)
    }

    fn load_tiktoken(
        &self,
        name: &str,
        dir: &Path,
        manifest: TiktokenManifest,
    ) -> Result<Box<dyn Tokenizer>> {
        let ranks_path = self
            .vocabulary_dir(&manifest.ranks)
            .and_then(|_| {
                let file = Path::new(&manifest.ranks);
                (file.components().count() == 1).then(|| dir.join(file))
            })
            .ok_or_else(|| {
                let reason = format!("ranks file {:?} must be a plain file name", manifest.ranks);
                CodecError::load(name, reason)
            })?;
        let file = File::open(&ranks_path)
            .map_err(|e| CodecError::load(name, format!("{}: {e}", ranks_path.display())))?;
        let tokenizer = GPT4Tokenizer::from_tiktoken(
            name,
            BufReader::new(file),
            manifest.special_tokens,
            manifest.bos_token.as_deref(),
        )?;
        Ok(Box::new(tokenizer))
    }
}

impl VocabularyRegistry for DirectoryRegistry {
    fn resolve(&self, name: &str) -> Result<Box<dyn Tokenizer>> {
        let not_found = || CodecError::ResourceNotFound {
            name: name.to_string(),
        };
        let dir = self.vocabulary_dir(name).ok_or_else(not_found)?;
        let manifest_path = dir.join(MANIFEST_FILE);
        match fs::metadata(&manifest_path) {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Err(not_found()),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                return Err(not_found());
            }
            Err(e) => {
                let reason = format!("{}: {e}", manifest_path.display());
                return Err(CodecError::load(name, reason));
            }
        }

        let contents = fs::read_to_string(&manifest_path).map_err(|e| CodecError::load(name, e))?;
        let manifest: Manifest =
            serde_json::from_str(&contents).map_err(|e| CodecError::load(name, e))?;
        let tokenizer = match manifest {
            Manifest::Bpe(model) => {
                let tokenizer =
                    RegexTokenizer::from_model(model).map_err(|e| CodecError::load(name, e))?;
                Box::new(tokenizer) as Box<dyn Tokenizer>
            }
            Manifest::Tiktoken(manifest) => self.load_tiktoken(name, &dir, manifest)?,
        };
        info!(
            "resolved vocabulary {name} from {} ({} tokens)",
            dir.display(),
            tokenizer.vocab_size()
        );
        Ok(tokenizer)
    }
}

type Factory = Box<dyn Fn() -> Result<Box<dyn Tokenizer>> + Send + Sync>;

/// Registry backed by constructor closures, for embedding and tests.
#[derive(Default)]
pub struct MemoryRegistry {
    factories: HashMap<String, Factory>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Box<dyn Tokenizer>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl VocabularyRegistry for MemoryRegistry {
    fn resolve(&self, name: &str) -> Result<Box<dyn Tokenizer>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| CodecError::ResourceNotFound {
                name: name.to_string(),
            })?;
        factory()
    }
}
