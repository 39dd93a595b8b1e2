use std::collections::{HashMap, HashSet};
use std::io::BufRead;

use base64::{Engine as _, engine::general_purpose};
use indexmap::IndexMap;
use log::info;

use crate::base::{Segment, Token, TokenSequence, Tokenizer, merge, split_special};
use crate::error::{CodecError, Result};
use crate::regex::GPT4_SPLIT_COMPILED_PATTERN;

/// Parse tiktoken ranks: one `<base64 token> <rank>` pair per line.
///
/// Every token and every rank has to be unique.
fn parse_ranks(name: &str, reader: impl BufRead) -> Result<IndexMap<Vec<u8>, Token>> {
    let mut ranks = IndexMap::new();
    let mut seen_ranks = HashSet::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| CodecError::load(name, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(raw), Some(rank), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(CodecError::load(
                name,
                format!("line {}: expected `<token> <rank>`", line_num + 1),
            ));
        };
        let token = general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| CodecError::load(name, format!("line {}: {e}", line_num + 1)))?;
        let rank: Token = rank
            .parse()
            .map_err(|e| CodecError::load(name, format!("line {}: {e}", line_num + 1)))?;
        if !seen_ranks.insert(rank) {
            return Err(CodecError::load(
                name,
                format!("line {}: rank {rank} is already taken", line_num + 1),
            ));
        }
        if ranks.insert(token, rank).is_some() {
            return Err(CodecError::load(
                name,
                format!("line {}: token {raw} is listed twice", line_num + 1),
            ));
        }
    }
    Ok(ranks)
}

/// Split `token` into the parts BPE would produce using only ranks below `max_rank`.
fn bpe(
    mergeable_ranks: &IndexMap<Vec<u8>, Token>,
    token: &[u8],
    max_rank: Option<Token>,
) -> Vec<Vec<u8>> {
    let mut parts: Vec<Vec<u8>> = token.iter().map(|&b| vec![b]).collect();
    loop {
        let mut best: Option<(usize, Token)> = None;
        for (i, pair) in parts.windows(2).enumerate() {
            let joined = [pair[0].as_slice(), pair[1].as_slice()].concat();
            if let Some(&rank) = mergeable_ranks.get(&joined) {
                if best.is_none_or(|(_, min_rank)| rank < min_rank) {
                    best = Some((i, rank));
                }
            }
        }
        let Some((idx, rank)) = best else { break };
        if max_rank.is_some_and(|max| rank >= max) {
            break;
        }
        let right = parts.remove(idx + 1);
        parts[idx].extend(right);
    }
    parts
}

fn recover_merges(
    name: &str,
    mergeable_ranks: &IndexMap<Vec<u8>, Token>,
) -> Result<IndexMap<(Token, Token), Token>> {
    let mut merges = IndexMap::new();
    for (token, &rank) in mergeable_ranks {
        if token.len() == 1 {
            continue;
        }
        let pair = bpe(mergeable_ranks, token, Some(rank));
        let [left, right] = pair.as_slice() else {
            return Err(CodecError::load(
                name,
                format!("rank {rank} does not split into exactly two known tokens"),
            ));
        };
        merges.insert((mergeable_ranks[left], mergeable_ranks[right]), rank);
    }
    Ok(merges)
}

/// Tokenizer over tiktoken-style mergeable ranks (cl100k_base and friends).
///
/// Single bytes carry ranks that differ from their byte values, so input
/// bytes are permuted into rank space before merging and permuted back after
/// decoding.
pub struct GPT4Tokenizer {
    merges: IndexMap<(Token, Token), Token>,
    vocab: HashMap<Token, Vec<u8>>,

    byte_shuffle: [u8; 256],
    inverse_byte_shuffle: [u8; 256],

    special_tokens: HashMap<String, Token>,
    inverse_special_tokens: HashMap<Token, String>,
    bos_token: Option<Token>,
    vocab_size: usize,
}

impl GPT4Tokenizer {
    pub fn from_tiktoken(
        name: &str,
        reader: impl BufRead,
        special_tokens: impl IntoIterator<Item = (String, Token)>,
        bos_token: Option<&str>,
    ) -> Result<Self> {
        let mergeable_ranks = parse_ranks(name, reader)?;

        let mut byte_shuffle = [0u8; 256];
        for b in 0..=255u8 {
            let rank = *mergeable_ranks
                .get([b].as_slice())
                .ok_or_else(|| CodecError::load(name, format!("no rank for byte {b}")))?;
            byte_shuffle[b as usize] = u8::try_from(rank).map_err(|_| {
                CodecError::load(name, format!("rank {rank} for byte {b} does not fit in u8"))
            })?;
        }
        let mut inverse_byte_shuffle = [0u8; 256];
        let mut seen = [false; 256];
        for (b, &shuffled) in byte_shuffle.iter().enumerate() {
            if std::mem::replace(&mut seen[shuffled as usize], true) {
                return Err(CodecError::load(name, format!("byte rank {shuffled} is shared")));
            }
            inverse_byte_shuffle[shuffled as usize] = b as u8;
        }

        let mut merges = recover_merges(name, &mergeable_ranks)?;
        // parts always rank below the token they form
        merges.sort_by(|_, a, _, b| a.cmp(b));
        let mut vocab: HashMap<Token, Vec<u8>> =
            (0..=255u8).map(|b| (Token::from(b), vec![b])).collect();
        for (&(p0, p1), &idx) in &merges {
            let (Some(left), Some(right)) = (vocab.get(&p0), vocab.get(&p1)) else {
                return Err(CodecError::load(
                    name,
                    format!("rank {idx} is built from undefined ranks ({p0}, {p1})"),
                ));
            };
            let token = [left.as_slice(), right.as_slice()].concat();
            if vocab.insert(idx, token).is_some() {
                return Err(CodecError::load(name, format!("rank {idx} is defined twice")));
            }
        }

        let mut special: HashMap<String, Token> = HashMap::new();
        let mut inverse_special_tokens = HashMap::new();
        for (literal, id) in special_tokens {
            if vocab.contains_key(&id) || inverse_special_tokens.contains_key(&id) {
                return Err(CodecError::load(
                    name,
                    format!("special token {literal} reuses id {id}"),
                ));
            }
            inverse_special_tokens.insert(id, literal.clone());
            special.insert(literal, id);
        }
        let bos_token = match bos_token {
            Some(literal) => Some(special.get(literal).copied().ok_or_else(|| {
                CodecError::load(name, format!("bos token {literal} is not a special token"))
            })?),
            None => None,
        };

        let vocab_size = vocab
            .keys()
            .chain(inverse_special_tokens.keys())
            .map(|&id| id as usize + 1)
            .max()
            .unwrap_or(0);
        info!(
            "loaded {name}: {} ranks, {} merges, {} special tokens",
            mergeable_ranks.len(),
            merges.len(),
            special.len()
        );

        Ok(GPT4Tokenizer {
            merges,
            vocab,
            byte_shuffle,
            inverse_byte_shuffle,
            special_tokens: special,
            inverse_special_tokens,
            bos_token,
            vocab_size,
        })
    }

    fn encode_chunk(&self, text_bytes: &[u8]) -> Vec<Token> {
        let mut ids: Vec<Token> = text_bytes
            .iter()
            .map(|&b| Token::from(self.byte_shuffle[b as usize]))
            .collect();
        while ids.len() >= 2 {
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
        ids
    }
}

impl Tokenizer for GPT4Tokenizer {
    fn encode_ordinary(&self, text: &str) -> Result<TokenSequence> {
        let mut ids = Vec::new();
        for m in GPT4_SPLIT_COMPILED_PATTERN.find_iter(text) {
            let m = m.map_err(|e| CodecError::RegexMatch(e.to_string()))?;
            ids.extend(self.encode_chunk(m.as_str().as_bytes()));
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
        let mut text_bytes = Vec::new();
        for &id in ids {
            if let Some(bytes) = self.vocab.get(&id) {
                text_bytes.extend(bytes.iter().map(|&b| self.inverse_byte_shuffle[b as usize]));
            } else if let Some(literal) = self.inverse_special_tokens.get(&id) {
                if !skip_special {
                    text_bytes.extend_from_slice(literal.as_bytes());
                }
            } else {
                return Err(CodecError::InvalidTokenId {
                    id,
                    vocab_size: self.vocab_size,
                });
            }
        }
        Ok(text_bytes)
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn special_tokens(&self) -> &HashMap<String, Token> {
        &self.special_tokens
    }

    fn bos_token(&self) -> Option<Token> {
        self.bos_token
    }

    fn is_special(&self, id: Token) -> bool {
        self.inverse_special_tokens.contains_key(&id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small ranks file with shuffled single bytes plus a few merges.
    ///
    /// Bytes `a` and `b` swap ranks so the byte shuffle is exercised.
    pub(crate) fn sample_ranks() -> String {
        let mut lines = Vec::new();
        for b in 0..=255u8 {
            let rank = match b {
                b'a' => u32::from(b'b'),
                b'b' => u32::from(b'a'),
                other => u32::from(other),
            };
            lines.push(format!("{} {rank}", general_purpose::STANDARD.encode([b])));
        }
        for (i, token) in ["at", "ca", "cat", " c", " cat", "ab"].iter().enumerate() {
            lines.push(format!(
                "{} {}",
                general_purpose::STANDARD.encode(token.as_bytes()),
                256 + i
            ));
        }
        lines.join("\n")
    }

    fn no_special() -> Vec<(String, Token)> {
        Vec::new()
    }

    fn sample() -> GPT4Tokenizer {
        GPT4Tokenizer::from_tiktoken(
            "sample",
            sample_ranks().as_bytes(),
            [("<|endoftext|>".to_string(), 300)],
            None,
        )
        .unwrap()
    }

    #[test]
    fn recovers_merges_from_ranks() {
        let tokenizer = sample();
        assert_eq!(tokenizer.merges.len(), 6);
        assert_eq!(tokenizer.vocab_size(), 301);
        // "cat" is built from "c" + "at", not "ca" + "t"
        let c = u32::from(b'c');
        assert_eq!(tokenizer.merges.get(&(c, 256)), Some(&258));
    }

    #[test]
    fn encodes_with_merges_and_byte_shuffle() {
        let tokenizer = sample();
        assert_eq!(tokenizer.encode_ordinary("cat").unwrap(), vec![258]);
        assert_eq!(tokenizer.encode_ordinary("a cat").unwrap(), vec![98, 260]);
        assert_eq!(tokenizer.encode_ordinary("ab").unwrap(), vec![261]);
        assert_eq!(tokenizer.encode_ordinary("b").unwrap(), vec![97]);
    }

    #[test]
    fn decode_undoes_byte_shuffle() {
        let tokenizer = sample();
        let text = "a cat sat on abba";
        let ids = tokenizer.encode_ordinary(text).unwrap();
        assert_eq!(tokenizer.decode_bytes(&ids, true).unwrap(), text.as_bytes());
    }

    #[test]
    fn special_tokens_are_kept_or_stripped() {
        let tokenizer = sample();
        let ids = tokenizer.encode_with_special("cat<|endoftext|>").unwrap();
        assert_eq!(ids, vec![258, 300]);
        assert_eq!(tokenizer.decode_bytes(&ids, true).unwrap(), b"cat");
        assert_eq!(
            tokenizer.decode_bytes(&ids, false).unwrap(),
            b"cat<|endoftext|>"
        );
        assert!(tokenizer.is_special(300));
        assert!(!tokenizer.is_special(258));
    }

    #[test]
    fn rejects_unknown_ids() {
        let tokenizer = sample();
        assert!(matches!(
            tokenizer.decode_bytes(&[299], true),
            Err(CodecError::InvalidTokenId { id: 299, .. })
        ));
    }

    #[test]
    fn malformed_ranks_fail_to_load() {
        let missing_bytes = "YQ== 0\n";
        assert!(matches!(
            GPT4Tokenizer::from_tiktoken("bad", missing_bytes.as_bytes(), no_special(), None),
            Err(CodecError::ResourceLoad { .. })
        ));

        let garbage = format!("{}\n!!!notbase64 999\n", sample_ranks());
        assert!(matches!(
            GPT4Tokenizer::from_tiktoken("bad", garbage.as_bytes(), no_special(), None),
            Err(CodecError::ResourceLoad { .. })
        ));

        let short = format!("{}\nYWJj\n", sample_ranks());
        assert!(
            GPT4Tokenizer::from_tiktoken("bad", short.as_bytes(), no_special(), None).is_err()
        );
    }

    /// Every byte at its own rank, followed by `extra` lines.
    pub(crate) fn identity_ranks(extra: &[(&str, u32)]) -> String {
        let mut lines: Vec<String> = (0..=255u8)
            .map(|b| format!("{} {b}", general_purpose::STANDARD.encode([b])))
            .collect();
        for (token, rank) in extra {
            lines.push(format!(
                "{} {rank}",
                general_purpose::STANDARD.encode(token.as_bytes())
            ));
        }
        lines.join("\n")
    }

    #[test]
    fn ranks_may_be_listed_out_of_order() {
        // "cat" comes before the "at" it is built from
        let ranks = identity_ranks(&[("cat", 257), ("at", 256)]);
        let tokenizer =
            GPT4Tokenizer::from_tiktoken("unsorted", ranks.as_bytes(), no_special(), None)
                .unwrap();
        assert_eq!(tokenizer.encode_ordinary("cat").unwrap(), vec![257]);
        assert_eq!(tokenizer.decode_bytes(&[257, 256], true).unwrap(), b"catat");
    }

    #[test]
    fn shared_ranks_fail_to_load() {
        // "at" claims the rank of byte 5
        let ranks = identity_ranks(&[("at", 5)]);
        assert!(matches!(
            GPT4Tokenizer::from_tiktoken("shared", ranks.as_bytes(), no_special(), None),
            Err(CodecError::ResourceLoad { .. })
        ));

        let ranks = identity_ranks(&[("at", 256), ("ca", 256)]);
        assert!(matches!(
            GPT4Tokenizer::from_tiktoken("shared", ranks.as_bytes(), no_special(), None),
            Err(CodecError::ResourceLoad { .. })
        ));

        let ranks = identity_ranks(&[("at", 256), ("at", 257)]);
        assert!(matches!(
            GPT4Tokenizer::from_tiktoken("shared", ranks.as_bytes(), no_special(), None),
            Err(CodecError::ResourceLoad { .. })
        ));
    }

    #[test]
    fn bos_has_to_be_registered() {
        let result = GPT4Tokenizer::from_tiktoken(
            "sample",
            sample_ranks().as_bytes(),
            no_special(),
            Some("<s>"),
        );
        assert!(result.is_err());
    }
}
