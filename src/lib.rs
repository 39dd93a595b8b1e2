//! Bidirectional text / token id conversion over named vocabularies.
//!
//! ```no_run
//! use tokcodec::{DirectoryRegistry, TokenCodec};
//!
//! let registry = DirectoryRegistry::new("vocabs");
//! let codec = TokenCodec::new("cl100k_base", &registry)?;
//! let ids = codec.encode("hello world")?;
//! assert_eq!(codec.decode(&ids)?, "hello world");
//! # Ok::<(), tokcodec::CodecError>(())
//! ```

pub mod base;
pub mod codec;
pub mod config;
pub mod error;
pub mod gpt4;
pub mod regex;
pub mod registry;

pub use base::{Token, TokenSequence, Tokenizer};
pub use codec::TokenCodec;
pub use config::CodecConfig;
pub use error::{CodecError, Result};
pub use gpt4::GPT4Tokenizer;
pub use regex::{BpeModel, RegexTokenizer};
pub use registry::{DirectoryRegistry, Manifest, MemoryRegistry, VocabularyRegistry};
