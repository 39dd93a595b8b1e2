use log::debug;

use crate::base::{Token, TokenSequence, Tokenizer};
use crate::error::{CodecError, Result};
use crate::registry::VocabularyRegistry;

/// Text to token id conversion over one named vocabulary.
///
/// The vocabulary is loaded once in [`TokenCodec::new`] and never changes
/// afterwards, so a codec can be shared between threads behind an `Arc`.
pub struct TokenCodec {
    name: String,
    tokenizer: Box<dyn Tokenizer>,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("name", &self.name)
            .field("vocab_size", &self.tokenizer.vocab_size())
            .finish()
    }
}

impl TokenCodec {
    /// Resolve `name` through `registry` and load its vocabulary.
    ///
    /// Fails with [`CodecError::ResourceNotFound`] when the registry does not
    /// know the name and [`CodecError::ResourceLoad`] when the resource is
    /// unreadable or corrupt.
    pub fn new<R>(name: &str, registry: &R) -> Result<Self>
    where
        R: VocabularyRegistry + ?Sized,
    {
        let tokenizer = registry.resolve(name)?;
        Ok(Self::from_tokenizer(name, tokenizer))
    }

    pub fn from_tokenizer(name: impl Into<String>, tokenizer: Box<dyn Tokenizer>) -> Self {
        TokenCodec {
            name: name.into(),
            tokenizer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.vocab_size()
    }

    pub fn is_special(&self, id: Token) -> bool {
        self.tokenizer.is_special(id)
    }

    /// Id of a special token literal such as `<|endoftext|>`.
    pub fn special_token_id(&self, literal: &str) -> Option<Token> {
        self.tokenizer.special_tokens().get(literal).copied()
    }

    /// Encode `text`. Special-token literals in `text` are treated as plain text.
    ///
    /// The empty string encodes to an empty sequence, or to just the BOS token
    /// for vocabularies that require one.
    pub fn encode(&self, text: &str) -> Result<TokenSequence> {
        Ok(self.with_bos(self.tokenizer.encode_ordinary(text)?))
    }

    /// Encode `text`, turning special-token literals into their ids.
    pub fn encode_with_special(&self, text: &str) -> Result<TokenSequence> {
        Ok(self.with_bos(self.tokenizer.encode_with_special(text)?))
    }

    fn with_bos(&self, ids: TokenSequence) -> TokenSequence {
        match self.tokenizer.bos_token() {
            Some(bos) => std::iter::once(bos).chain(ids).collect(),
            None => ids,
        }
    }

    /// Decode `ids`, dropping special tokens.
    ///
    /// Byte sequences that are not valid UTF-8 decode to U+FFFD.
    pub fn decode(&self, ids: &[Token]) -> Result<String> {
        self.decode_inner(ids, true)
    }

    /// Decode `ids`, rendering special tokens as their literal text.
    pub fn decode_with_special(&self, ids: &[Token]) -> Result<String> {
        self.decode_inner(ids, false)
    }

    fn decode_inner(&self, ids: &[Token], skip_special: bool) -> Result<String> {
        let vocab_size = self.tokenizer.vocab_size();
        if let Some(&id) = ids.iter().find(|&&id| id as usize >= vocab_size) {
            return Err(CodecError::InvalidTokenId { id, vocab_size });
        }
        let bytes = self.tokenizer.decode_bytes(ids, skip_special)?;
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                debug!("{}: decoded bytes are not valid UTF-8, replacing", self.name);
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        Ok(text)
    }

    pub fn encode_batch<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<TokenSequence>> {
        texts.iter().map(|text| self.encode(text.as_ref())).collect()
    }

    pub fn decode_batch<T: AsRef<[Token]>>(&self, sequences: &[T]) -> Result<Vec<String>> {
        sequences.iter().map(|ids| self.decode(ids.as_ref())).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::regex::RegexTokenizer;

    /// Whitespace-separated word vocabulary with a few control tokens.
    struct WordTokenizer {
        words: Vec<(&'static str, Token)>,
        special: HashMap<String, Token>,
        size: usize,
    }

    impl WordTokenizer {
        fn new() -> Self {
            let special = [("<pad>".to_string(), 0), ("<eos>".to_string(), 1)]
                .into_iter()
                .collect();
            WordTokenizer {
                words: vec![("the", 464), ("cat", 15496), ("sat", 3332)],
                special,
                size: 50257,
            }
        }
    }

    impl Tokenizer for WordTokenizer {
        fn encode_ordinary(&self, text: &str) -> Result<TokenSequence> {
            text.split_whitespace()
                .map(|word| {
                    self.words
                        .iter()
                        .find(|(w, _)| *w == word)
                        .map(|&(_, id)| id)
                        .ok_or_else(|| CodecError::InvalidConfig(format!("no token for {word}")))
                })
                .collect()
        }

        fn encode_with_special(&self, text: &str) -> Result<TokenSequence> {
            self.encode_ordinary(text)
        }

        fn decode_bytes(&self, ids: &[Token], skip_special: bool) -> Result<Vec<u8>> {
            let mut words = Vec::new();
            for &id in ids {
                if let Some((literal, _)) = self.special.iter().find(|&(_, &s)| s == id) {
                    if !skip_special {
                        words.push(literal.as_str());
                    }
                } else if let Some(&(word, _)) = self.words.iter().find(|&&(_, w)| w == id) {
                    words.push(word);
                }
            }
            Ok(words.join(" ").into_bytes())
        }

        fn vocab_size(&self) -> usize {
            self.size
        }

        fn special_tokens(&self) -> &HashMap<String, Token> {
            &self.special
        }
    }

    fn registry() -> MemoryRegistry {
        let mut registry = MemoryRegistry::new();
        registry.register("words", || Ok(Box::new(WordTokenizer::new()) as Box<dyn Tokenizer>));
        registry.register("bytes-bos", || {
            let mut tokenizer = RegexTokenizer::new();
            tokenizer.register_special_tokens([("<s>".to_string(), 256)])?;
            tokenizer.set_bos_token("<s>")?;
            Ok(Box::new(tokenizer) as Box<dyn Tokenizer>)
        });
        registry
    }

    #[test]
    fn cat_maps_to_its_id_and_back() {
        let codec = TokenCodec::new("words", &registry()).unwrap();
        assert_eq!(codec.encode("cat").unwrap(), vec![15496]);
        assert_eq!(codec.decode(&[15496]).unwrap(), "cat");
        assert_eq!(codec.name(), "words");
    }

    #[test]
    fn unknown_name_is_not_found() {
        let err = TokenCodec::new("nope", &registry()).unwrap_err();
        assert!(matches!(err, CodecError::ResourceNotFound { name } if name == "nope"));
    }

    #[test]
    fn empty_input_and_output() {
        let codec = TokenCodec::new("words", &registry()).unwrap();
        assert!(codec.encode("").unwrap().is_empty());
        assert_eq!(codec.decode(&[]).unwrap(), "");
    }

    #[test]
    fn bos_is_the_only_token_for_empty_text() {
        let codec = TokenCodec::new("bytes-bos", &registry()).unwrap();
        assert_eq!(codec.encode("").unwrap(), vec![256]);
        assert_eq!(codec.encode("hi").unwrap(), vec![256, 104, 105]);
        assert_eq!(codec.decode(&[256, 104, 105]).unwrap(), "hi");
        assert_eq!(codec.decode_with_special(&[256, 104, 105]).unwrap(), "<s>hi");
    }

    #[test]
    fn special_tokens_are_stripped() {
        let codec = TokenCodec::new("words", &registry()).unwrap();
        let ids = [0, 464, 15496, 3332, 1, 0];
        assert_eq!(codec.decode(&ids).unwrap(), "the cat sat");
        assert_eq!(codec.decode_with_special(&ids).unwrap(), "<pad> the cat sat <eos> <pad>");
        assert!(codec.is_special(1));
        assert_eq!(codec.special_token_id("<eos>"), Some(1));
    }

    #[test]
    fn out_of_range_id_is_rejected() {
        let codec = TokenCodec::new("words", &registry()).unwrap();
        let err = codec.decode(&[15496, 50257]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::InvalidTokenId { id: 50257, vocab_size: 50257 }
        ));
    }

    #[test]
    fn partial_utf8_is_replaced() {
        let codec = TokenCodec::new("bytes-bos", &registry()).unwrap();
        // first two bytes of "é" (0xC3 0xA9) plus an orphan continuation byte
        assert_eq!(codec.decode(&[0xC3, 0xA9, 0xA9]).unwrap(), "é\u{FFFD}");
    }

    #[test]
    fn batches_fail_fast() {
        let codec = TokenCodec::new("words", &registry()).unwrap();
        let encoded = codec.encode_batch(&["the cat", "sat"]).unwrap();
        assert_eq!(encoded, vec![vec![464, 15496], vec![3332]]);
        assert_eq!(codec.decode_batch(&encoded).unwrap(), vec!["the cat", "sat"]);
        let bad: Vec<TokenSequence> = vec![vec![464], vec![99999]];
        assert!(codec.decode_batch(&bad).is_err());
    }

    #[test]
    fn codec_is_shareable_across_threads() {
        let mut tokenizer = RegexTokenizer::new();
        tokenizer.train("shared shared vocabulary vocabulary", 280).unwrap();
        let codec = Arc::new(TokenCodec::from_tokenizer("shared", Box::new(tokenizer)));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let codec = Arc::clone(&codec);
                std::thread::spawn(move || {
                    let ids = codec.encode("shared vocabulary").unwrap();
                    codec.decode(&ids).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "shared vocabulary");
        }
    }
}
