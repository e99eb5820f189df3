//! Token budget enforcement for encoder input.
//!
//! Token counting prefers `tiktoken-rs`: the configured model's encoding when it is known,
//! `cl100k_base` otherwise. If no encoding can be loaded the budget falls back to counting
//! whitespace-separated words.

use std::borrow::Cow;
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base, get_bpe_from_model};

/// Truncates text to a fixed number of tokens.
#[derive(Clone)]
pub struct TokenBudget {
    max_tokens: usize,
    encoding: Option<Arc<CoreBPE>>,
}

impl TokenBudget {
    /// Build a budget for `model`, resolving its tokenizer.
    pub fn for_model(model: &str, max_tokens: usize) -> Self {
        let encoding = match get_bpe_from_model(model.trim()) {
            Ok(encoding) => Some(encoding),
            Err(model_err) => {
                tracing::debug!(
                    model,
                    error = %model_err,
                    "Tokenizer model lookup failed; using cl100k_base"
                );
                match cl100k_base() {
                    Ok(encoding) => Some(encoding),
                    Err(error) => {
                        tracing::warn!(
                            error = %error,
                            "BPE tokenizer unavailable; falling back to whitespace counting"
                        );
                        None
                    }
                }
            }
        };

        Self {
            max_tokens: max_tokens.max(1),
            encoding: encoding.map(Arc::new),
        }
    }

    /// Budget that always counts whitespace-separated words.
    pub fn whitespace(max_tokens: usize) -> Self {
        Self {
            max_tokens: max_tokens.max(1),
            encoding: None,
        }
    }

    /// Maximum number of tokens kept.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Return `text` unchanged when it fits, otherwise its leading `max_tokens` tokens.
    pub fn truncate<'a>(&self, text: &'a str) -> Cow<'a, str> {
        match &self.encoding {
            Some(encoding) => self.truncate_bpe(encoding, text),
            None => self.truncate_words(text),
        }
    }

    fn truncate_bpe<'a>(&self, encoding: &CoreBPE, text: &'a str) -> Cow<'a, str> {
        let tokens = encoding.encode_ordinary(text);
        if tokens.len() <= self.max_tokens {
            return Cow::Borrowed(text);
        }

        // A cut can land inside a multi-byte character; back off until the prefix decodes.
        let mut end = self.max_tokens;
        while end > 0 {
            if let Ok(prefix) = encoding.decode(tokens[..end].to_vec()) {
                tracing::debug!(
                    tokens = tokens.len(),
                    kept = end,
                    "Truncated embedding input to token budget"
                );
                return Cow::Owned(prefix);
            }
            end -= 1;
        }
        self.truncate_words(text)
    }

    fn truncate_words<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut words = text.split_whitespace();
        let kept: Vec<&str> = words.by_ref().take(self.max_tokens).collect();
        if words.next().is_none() {
            Cow::Borrowed(text)
        } else {
            Cow::Owned(kept.join(" "))
        }
    }
}

impl std::fmt::Debug for TokenBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBudget")
            .field("max_tokens", &self.max_tokens)
            .field("bpe", &self.encoding.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_borrowed_unchanged() {
        let budget = TokenBudget::for_model("BAAI/bge-m3", 512);
        let text = "{\"title\":\"Dune\"}";
        assert!(matches!(budget.truncate(text), Cow::Borrowed(t) if t == text));
    }

    #[test]
    fn long_text_is_cut_to_budget() {
        let budget = TokenBudget::for_model("text-embedding-3-small", 8);
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let truncated = budget.truncate(text);
        assert!(truncated.len() < text.len());
        assert!(text.starts_with(truncated.as_ref()));
    }

    #[test]
    fn whitespace_fallback_counts_words() {
        let budget = TokenBudget::whitespace(3);
        assert_eq!(budget.truncate("one two three four five"), "one two three");
        assert_eq!(budget.truncate("one two"), "one two");
    }

    #[test]
    fn zero_budget_is_clamped() {
        assert_eq!(TokenBudget::whitespace(0).max_tokens(), 1);
    }
}
