use std::collections::HashMap;

use crate::error::Result;

pub type Token = u32;

/// Token ids in source text order.
pub type TokenSequence = Vec<Token>;

/// A loaded vocabulary that converts text to token ids and back.
///
/// Implementations are immutable once built; every method takes `&self`
/// so a single instance can serve concurrent readers.
pub trait Tokenizer: Send + Sync {
    /// Encode `text`, treating special-token literals as plain text.
    fn encode_ordinary(&self, text: &str) -> Result<TokenSequence>;

    /// Encode `text`, emitting registered special tokens as their ids.
    fn encode_with_special(&self, text: &str) -> Result<TokenSequence>;

    /// Raw bytes for `ids`. Special tokens are dropped when `skip_special`
    /// is set, otherwise rendered as their literal text.
    fn decode_bytes(&self, ids: &[Token], skip_special: bool) -> Result<Vec<u8>>;

    /// One past the largest valid id.
    fn vocab_size(&self) -> usize;

    fn special_tokens(&self) -> &HashMap<String, Token>;

    /// Token that must lead every encoded sequence, if the vocabulary has one.
    fn bos_token(&self) -> Option<Token> {
        None
    }

    fn is_special(&self, id: Token) -> bool {
        self.special_tokens().values().any(|&t| t == id)
    }
}

/// A run of ordinary text, or one special token found between such runs.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Segment<'a> {
    Text(&'a str),
    Special(Token),
}

/// Cut `text` at every special-token literal it contains.
pub(crate) fn split_special<'a>(
    text: &'a str,
    specials: &HashMap<String, Token>,
) -> Vec<Segment<'a>> {
    let mut segments = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        // earliest match first, longest literal on ties
        let next = specials
            .iter()
            .filter(|(literal, _)| !literal.is_empty())
            .filter_map(|(literal, &id)| {
                rest.find(literal.as_str())
                    .map(|pos| (pos, literal.len(), id))
            })
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
        match next {
            Some((pos, len, id)) => {
                if pos > 0 {
                    segments.push(Segment::Text(&rest[..pos]));
                }
                segments.push(Segment::Special(id));
                rest = &rest[pos + len..];
            }
            None => {
                segments.push(Segment::Text(rest));
                break;
            }
        }
    }
    segments
}

/// Count adjacent pairs in `ids`.
pub(crate) fn get_stats(ids: &[Token], counts: &mut HashMap<(Token, Token), usize>) {
    for pair in ids.windows(2) {
        *counts.entry((pair[0], pair[1])).or_insert(0) += 1;
    }
}

/// Replace every consecutive occurrence of `pair` in `ids` with `new_token`.
pub(crate) fn merge(ids: &[Token], pair: (Token, Token), new_token: Token) -> Vec<Token> {
    let mut new_ids = Vec::with_capacity(ids.len());
    let mut i = 0;
    while i < ids.len() {
        if i + 1 < ids.len() && ids[i] == pair.0 && ids[i + 1] == pair.1 {
            new_ids.push(new_token);
            i += 2;
        } else {
            new_ids.push(ids[i]);
            i += 1;
        }
    }
    new_ids
}
