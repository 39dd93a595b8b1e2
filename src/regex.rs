use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use fancy_regex::Regex;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::base::{Segment, Token, TokenSequence, Tokenizer, get_stats, merge, split_special};
use crate::error::{CodecError, Result};

pub const GPT2_SPLIT_PATTERN: &str =
    r"'(?:[sdmt]|ll|ve|re)| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+";
pub const GPT4_SPLIT_PATTERN: &str = r"'(?i:[sdmt]|ll|ve|re)|[^\r\n\p{L}\p{N}]?+\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]++[\r\n]*|\s*[\r\n]|\s+(?!\S)|\s+";

lazy_static! {
    pub(crate) static ref GPT4_SPLIT_COMPILED_PATTERN: Regex =
        Regex::new(GPT4_SPLIT_PATTERN).expect("GPT-4 split pattern compiles");
}

const CACHE_CAPACITY: usize = 4096;

/// On-disk form of a [`RegexTokenizer`].
///
/// Merge `i` in `merges` produces token `256 + i`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BpeModel {
    pub pattern: String,
    pub merges: Vec<(Token, Token)>,
    #[serde(default)]
    pub special_tokens: IndexMap<String, Token>,
    #[serde(default)]
    pub bos_token: Option<String>,
}

/// Byte-level BPE over regex-split chunks.
pub struct RegexTokenizer {
    merges: IndexMap<(Token, Token), Token>,
    vocab: HashMap<Token, Vec<u8>>,
    pattern: String,
    compiled_pattern: Regex,
    special_tokens: HashMap<String, Token>,
    inverse_special_tokens: HashMap<Token, String>,
    /// Literal of the special token that leads every sequence.
    bos_literal: Option<String>,
    cache: Mutex<HashMap<String, Vec<Token>>>,
}

impl Default for RegexTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RegexTokenizer {
    /// An untrained tokenizer using the GPT-4 split pattern.
    pub fn new() -> Self {
        Self::from_parts(GPT4_SPLIT_PATTERN.to_string(), GPT4_SPLIT_COMPILED_PATTERN.clone())
    }

    pub fn with_pattern(pattern: &str) -> Result<Self> {
        let compiled = Regex::new(pattern)
            .map_err(|e| CodecError::InvalidConfig(format!("bad split pattern: {e}")))?;
        Ok(Self::from_parts(pattern.to_string(), compiled))
    }

    fn from_parts(pattern: String, compiled_pattern: Regex) -> Self {
        RegexTokenizer {
            merges: IndexMap::new(),
            vocab: base_vocab(),
            pattern,
            compiled_pattern,
            special_tokens: HashMap::new(),
            inverse_special_tokens: HashMap::new(),
            bos_literal: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild a tokenizer from its saved model.
    pub fn from_model(model: BpeModel) -> Result<Self> {
        let mut tokenizer = Self::with_pattern(&model.pattern)?;
        for (i, &(p0, p1)) in model.merges.iter().enumerate() {
            let idx = 256 + i as Token;
            let (Some(left), Some(right)) = (tokenizer.vocab.get(&p0), tokenizer.vocab.get(&p1))
            else {
                return Err(CodecError::InvalidConfig(format!(
                    "merge {i} ({p0}, {p1}) references a token not yet defined"
                )));
            };
            let bytes = [left.as_slice(), right.as_slice()].concat();
            if tokenizer.merges.insert((p0, p1), idx).is_some() {
                return Err(CodecError::InvalidConfig(format!(
                    "merge {i} ({p0}, {p1}) is listed twice"
                )));
            }
            tokenizer.vocab.insert(idx, bytes);
        }
        tokenizer.register_special_tokens(model.special_tokens)?;
        if let Some(bos) = model.bos_token {
            tokenizer.set_bos_token(&bos)?;
        }
        Ok(tokenizer)
    }

    pub fn to_model(&self) -> BpeModel {
        let mut special_tokens: IndexMap<String, Token> = self
            .special_tokens
            .iter()
            .map(|(literal, &id)| (literal.clone(), id))
            .collect();
        special_tokens.sort_by(|_, a, _, b| a.cmp(b));
        BpeModel {
            pattern: self.pattern.clone(),
            merges: self.merges.keys().copied().collect(),
            special_tokens,
            bos_token: self.bos_literal.clone(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|source| CodecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model: BpeModel = serde_json::from_str(&contents)?;
        Self::from_model(model)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.to_model())?;
        fs::write(path, json).map_err(|source| CodecError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn num_merges(&self) -> usize {
        self.merges.len()
    }

    /// Learn merges from `text` until the vocabulary holds `vocab_size` tokens.
    ///
    /// Replaces any previously learned merges. Training stops early once no
    /// adjacent pair is left to merge.
    pub fn train(&mut self, text: &str, vocab_size: usize) -> Result<()> {
        if vocab_size < 256 {
            return Err(CodecError::InvalidConfig(format!(
                "vocab size must be at least 256, got {vocab_size}"
            )));
        }
        if let Some((literal, id)) = self
            .special_tokens
            .iter()
            .find(|&(_, &id)| (id as usize) < vocab_size)
        {
            return Err(CodecError::InvalidConfig(format!(
                "special token {literal} ({id}) collides with the trained range"
            )));
        }
        let num_merges = vocab_size - 256;

        let mut chunks: Vec<Vec<Token>> = self
            .split(text)?
            .into_iter()
            .map(|chunk| chunk.bytes().map(Token::from).collect())
            .collect();

        self.merges.clear();
        self.vocab = base_vocab();
        self.clear_cache();

        for i in 0..num_merges {
            let mut stats = HashMap::new();
            for chunk in &chunks {
                get_stats(chunk, &mut stats);
            }
            // most frequent pair, smallest pair on ties
            let Some((&pair, &count)) = stats
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            else {
                debug!("no pairs left after {i} merges");
                break;
            };
            let idx = 256 + i as Token;
            chunks = chunks
                .iter()
                .map(|chunk| merge(chunk, pair, idx))
                .collect();
            let bytes = [self.vocab[&pair.0].as_slice(), self.vocab[&pair.1].as_slice()].concat();
            debug!(
                "merge {}/{}: {:?} -> {} ({:?}) had {} occurrences",
                i + 1,
                num_merges,
                pair,
                idx,
                String::from_utf8_lossy(&bytes),
                count
            );
            self.merges.insert(pair, idx);
            self.vocab.insert(idx, bytes);
        }
        info!("trained {} merges", self.merges.len());
        Ok(())
    }

    /// Register special tokens. Ids must lie outside the byte and merge range.
    ///
    /// Either every entry is registered or, on error, none is. Giving a
    /// registered literal a new id moves it, BOS included.
    pub fn register_special_tokens(
        &mut self,
        special_tokens: impl IntoIterator<Item = (String, Token)>,
    ) -> Result<()> {
        let regular = 256 + self.merges.len();
        let mut special = self.special_tokens.clone();
        let mut inverse = self.inverse_special_tokens.clone();
        for (literal, id) in special_tokens {
            if literal.is_empty() {
                return Err(CodecError::InvalidConfig("empty special token".to_string()));
            }
            if (id as usize) < regular {
                return Err(CodecError::InvalidConfig(format!(
                    "special token {literal} ({id}) overlaps the regular vocabulary"
                )));
            }
            if let Some(existing) = inverse.get(&id) {
                if *existing != literal {
                    return Err(CodecError::InvalidConfig(format!(
                        "special token id {id} already used by {existing}"
                    )));
                }
            }
            if let Some(old_id) = special.insert(literal.clone(), id) {
                inverse.remove(&old_id);
            }
            inverse.insert(id, literal);
        }
        self.special_tokens = special;
        self.inverse_special_tokens = inverse;
        Ok(())
    }

    /// Mark a registered special token as the mandatory sequence prefix.
    pub fn set_bos_token(&mut self, literal: &str) -> Result<()> {
        if !self.special_tokens.contains_key(literal) {
            return Err(CodecError::InvalidConfig(format!(
                "bos token {literal} is not a special token"
            )));
        }
        self.bos_literal = Some(literal.to_string());
        Ok(())
    }

    fn split<'a>(&self, text: &'a str) -> Result<Vec<&'a str>> {
        self.compiled_pattern
            .find_iter(text)
            .map(|m| {
                m.map(|m| m.as_str())
                    .map_err(|e| CodecError::RegexMatch(e.to_string()))
            })
            .collect()
    }

    fn encode_chunk(&self, chunk: &str) -> Vec<Token> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.get(chunk) {
            return cached.clone();
        }
        drop(cache);

        let mut ids: Vec<Token> = chunk.bytes().map(Token::from).collect();
        while ids.len() >= 2 {
            // the pair with the lowest merge index goes first
            let pair = ids
                .windows(2)
                .map(|w| (w[0], w[1]))
                .filter_map(|pair| self.merges.get(&pair).map(|&idx| (pair, idx)))
                .min_by_key(|&(_, idx)| idx);
            match pair {
                None => break,
                Some((pair, idx)) => ids = merge(&ids, pair, idx),
            }
        }

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= CACHE_CAPACITY {
            cache.clear();
        }
        cache.insert(chunk.to_string(), ids.clone());
        ids
    }

    fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Tokenizer for RegexTokenizer {
    fn encode_ordinary(&self, text: &str) -> Result<TokenSequence> {
        let mut ids = Vec::with_capacity(text.len() / 2);
        for chunk in self.split(text)? {
            ids.extend(self.encode_chunk(chunk));
        }
        Ok(ids)
    }

    fn encode_with_special(&self, text: &str) -> Result<TokenSequence> {
        let mut ids = Vec::new();
        for segment in split_special(text, &self.special_tokens) {
            match segment {
                Segment::Text(part) => ids.extend(self.encode_ordinary(part)?),
                Segment::Special(id) => ids.push(id),
            }
        }
        Ok(ids)
    }

    fn decode_bytes(&self, ids: &[Token], skip_special: bool) -> Result<Vec<u8>> {
        let mut text_bytes = Vec::with_capacity(ids.len() * 2);
        for &id in ids {
            if let Some(bytes) = self.vocab.get(&id) {
                text_bytes.extend_from_slice(bytes);
            } else if let Some(literal) = self.inverse_special_tokens.get(&id) {
                if !skip_special {
                    text_bytes.extend_from_slice(literal.as_bytes());
                }
            } else {
                return Err(CodecError::InvalidTokenId {
                    id,
                    vocab_size: self.vocab_size(),
                });
            }
        }
        Ok(text_bytes)
    }

    fn vocab_size(&self) -> usize {
        let regular = 256 + self.merges.len();
        self.inverse_special_tokens
            .keys()
            .map(|&id| id as usize + 1)
            .fold(regular, usize::max)
    }

    fn special_tokens(&self) -> &HashMap<String, Token> {
        &self.special_tokens
    }

    fn bos_token(&self) -> Option<Token> {
        self.bos_literal
            .as_ref()
            .and_then(|literal| self.special_tokens.get(literal).copied())
    }

    fn is_special(&self, id: Token) -> bool {
        self.inverse_special_tokens.contains_key(&id)
    }
}

fn base_vocab() -> HashMap<Token, Vec<u8>> {
    (0..=255u8).map(|b| (Token::from(b), vec![b])).collect()
}
