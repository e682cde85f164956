use crate::error::{TrainingError, TrainingResult};
use crate::template::ChatTemplate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
pub const TOKENIZER_VOCAB_FILE: &str = "tokenizer.json";

const BYTE_VOCAB: u32 = 256;

/// Persisted tokenizer state, saved next to the adapter weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerConfig {
    pub tokenizer_class: String,
    pub chat_template: ChatTemplate,
    pub eos_token: String,
    /// Padding reuses the end-of-sequence token.
    pub pad_token: String,
    pub special_tokens: Vec<String>,
    pub model_max_length: usize,
}

impl TokenizerConfig {
    #[must_use]
    pub fn for_template(chat_template: ChatTemplate, model_max_length: usize) -> Self {
        let eos = chat_template.eos_token().to_string();
        Self {
            tokenizer_class: "ByteLevelTokenizer".to_string(),
            chat_template,
            eos_token: eos.clone(),
            pad_token: eos,
            special_tokens: chat_template.special_tokens().into_iter().map(str::to_string).collect(),
            model_max_length,
        }
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        BYTE_VOCAB as usize + self.special_tokens.len()
    }

    /// Writes `tokenizer_config.json` and `tokenizer.json` into `dir`.
    pub fn save(&self, dir: &Path) -> TrainingResult<()> {
        std::fs::write(dir.join(TOKENIZER_CONFIG_FILE), serde_json::to_vec_pretty(self)?)?;

        let tokenizer = ByteTokenizer::new(self.clone());
        let vocab: BTreeMap<u32, String> =
            (0..tokenizer.vocab_size() as u32).map(|id| (id, tokenizer.token_text(id))).collect();
        let doc = serde_json::json!({
            "model": { "type": "byte_level", "vocab": vocab },
            "added_tokens": self.special_tokens,
            "pad_token": self.pad_token,
        });
        std::fs::write(dir.join(TOKENIZER_VOCAB_FILE), serde_json::to_vec_pretty(&doc)?)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> TrainingResult<Self> {
        let path = dir.join(TOKENIZER_CONFIG_FILE);
        let bytes = std::fs::read(&path)
            .map_err(|e| TrainingError::Artifact(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Byte-level tokenizer with atomic chat special tokens.
///
/// Ids `0..256` are raw bytes; special tokens follow in declaration order.
#[derive(Debug, Clone)]
pub struct ByteTokenizer {
    config: TokenizerConfig,
}

impl ByteTokenizer {
    #[must_use]
    pub fn new(config: TokenizerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &TokenizerConfig {
        &self.config
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size()
    }

    #[must_use]
    pub fn eos_id(&self) -> u32 {
        self.special_id(&self.config.eos_token).unwrap_or(0)
    }

    fn special_id(&self, token: &str) -> Option<u32> {
        self.config
            .special_tokens
            .iter()
            .position(|t| t == token)
            .map(|i| BYTE_VOCAB + i as u32)
    }

    #[must_use]
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let bytes = text.as_bytes();
        let mut ids = Vec::with_capacity(bytes.len());
        let mut pos = 0;

        'outer: while pos < bytes.len() {
            if bytes[pos] == b'<' {
                // Longest special token wins.
                let mut best: Option<(usize, u32)> = None;
                for (i, tok) in self.config.special_tokens.iter().enumerate() {
                    if bytes[pos..].starts_with(tok.as_bytes())
                        && best.is_none_or(|(len, _)| tok.len() > len)
                    {
                        best = Some((tok.len(), BYTE_VOCAB + i as u32));
                    }
                }
                if let Some((len, id)) = best {
                    ids.push(id);
                    pos += len;
                    continue 'outer;
                }
            }
            ids.push(u32::from(bytes[pos]));
            pos += 1;
        }
        ids
    }

    /// Encodes and truncates to the configured maximum length.
    #[must_use]
    pub fn encode_truncated(&self, text: &str, max_len: usize) -> Vec<u32> {
        let mut ids = self.encode(text);
        ids.truncate(max_len.min(self.config.model_max_length));
        ids
    }

    #[must_use]
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            if id < BYTE_VOCAB {
                bytes.push(id as u8);
            } else if let Some(tok) = self.config.special_tokens.get((id - BYTE_VOCAB) as usize) {
                bytes.extend_from_slice(tok.as_bytes());
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Printable form of a vocabulary entry (`<0xNN>` for bytes).
    #[must_use]
    pub fn token_text(&self, id: u32) -> String {
        if id < BYTE_VOCAB {
            format!("<0x{id:02X}>")
        } else {
            self.config
                .special_tokens
                .get((id - BYTE_VOCAB) as usize)
                .cloned()
                .unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn phi3() -> ByteTokenizer {
        ByteTokenizer::new(TokenizerConfig::for_template(ChatTemplate::Phi3, 1024))
    }

    #[test]
    fn test_special_tokens_are_atomic() {
        let tok = phi3();
        let ids = tok.encode("<|user|>\nhi<|end|>");
        assert_eq!(ids.len(), 5);
        assert!(ids[0] >= 256);
        assert!(ids[4] >= 256);
        assert_eq!(tok.decode(&ids), "<|user|>\nhi<|end|>");
    }

    #[test]
    fn test_plain_angle_bracket_is_a_byte() {
        let tok = phi3();
        assert_eq!(tok.encode("a<b"), vec![97, 60, 98]);
    }

    #[test]
    fn test_pad_token_is_eos() {
        let tok = phi3();
        assert_eq!(tok.config().pad_token, tok.config().eos_token);
        assert_eq!(tok.token_text(tok.eos_id()), "<|endoftext|>");
    }

    #[test]
    fn test_truncation_respects_limit() {
        let tok = phi3();
        assert_eq!(tok.encode_truncated(&"x".repeat(50), 16).len(), 16);
    }

    #[test]
    fn test_save_and_load_config() {
        let temp = TempDir::new().unwrap();
        let config = TokenizerConfig::for_template(ChatTemplate::ChatMl, 512);
        config.save(temp.path()).unwrap();
        assert!(temp.path().join(TOKENIZER_VOCAB_FILE).exists());
        assert_eq!(TokenizerConfig::load(temp.path()).unwrap(), config);
    }
}
