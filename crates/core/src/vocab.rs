use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tokenizers::{AddedToken, Tokenizer, models::bpe::BPE, pre_tokenizers::byte_level::ByteLevel};
use tracing::{debug, info};

use crate::{
    decode::{SpecialTokens, Vocabulary},
    hub::HubModel,
};

/// Literal forms of the special tokens, RoBERTa-style by default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialTokenNames {
    pub bos: String,
    pub eos: String,
    pub pad: String,
}

impl Default for SpecialTokenNames {
    fn default() -> Self {
        Self {
            bos: "<s>".to_string(),
            eos: "</s>".to_string(),
            pad: "<pad>".to_string(),
        }
    }
}

/// Where to load the tokenizer from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizerSource {
    /// A `tokenizer.json` file, or a directory holding either `tokenizer.json`
    /// or a `vocab.json` + `merges.txt` pair.
    Local(PathBuf),
    Hub(HubModel),
}

/// [`Vocabulary`] backed by a `tokenizers` tokenizer.
#[derive(Clone)]
pub struct TokenizerVocabulary {
    tokenizer: Tokenizer,
    specials: SpecialTokens,
}

impl std::fmt::Debug for TokenizerVocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerVocabulary")
            .field("specials", &self.specials)
            .field("size", &self.len())
            .finish()
    }
}

impl TokenizerVocabulary {
    pub fn from_tokenizer(tokenizer: Tokenizer, names: &SpecialTokenNames) -> Result<Self> {
        let specials = SpecialTokens {
            bos: token_id(&tokenizer, &names.bos)?,
            eos: token_id(&tokenizer, &names.eos)?,
            pad: token_id(&tokenizer, &names.pad)?,
        };
        Ok(Self {
            tokenizer,
            specials,
        })
    }

    pub fn load(source: &TokenizerSource, names: &SpecialTokenNames) -> Result<Self> {
        let tokenizer = match source {
            TokenizerSource::Local(path) => load_local(path, names)?,
            TokenizerSource::Hub(model) => load_from_hub(model, names)?,
        };
        let vocab = Self::from_tokenizer(tokenizer, names)?;
        info!(
            size = vocab.len(),
            bos = vocab.specials.bos,
            eos = vocab.specials.eos,
            pad = vocab.specials.pad,
            "tokenizer loaded"
        );
        Ok(vocab)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn len(&self) -> usize {
        self.tokenizer.get_vocab(true).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn token(&self, id: u32) -> Option<String> {
        self.tokenizer.id_to_token(id)
    }

    /// Full vocabulary including added tokens, keyed by token text.
    pub fn vocab(&self) -> BTreeMap<String, u32> {
        self.tokenizer.get_vocab(true).into_iter().collect()
    }

    /// `(id, token)` pairs in ascending id order.
    pub fn tokens_by_id(&self) -> Vec<(u32, String)> {
        let mut entries: Vec<(u32, String)> = self
            .tokenizer
            .get_vocab(true)
            .into_iter()
            .map(|(token, id)| (id, token))
            .collect();
        entries.sort();
        entries
    }

    /// Write the vocabulary as pretty JSON and return the number of entries.
    pub fn dump_json(&self, path: &Path) -> Result<usize> {
        let vocab = self.vocab();
        let json = serde_json::to_string_pretty(&vocab)?;
        fs::write(path, json)
            .with_context(|| format!("failed to write vocabulary to {}", path.display()))?;
        Ok(vocab.len())
    }
}

impl Vocabulary for TokenizerVocabulary {
    fn special_tokens(&self) -> SpecialTokens {
        self.specials
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|err| anyhow!("failed to detokenize {} ids: {err}", ids.len()))
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("tokenizer missing `{token}` special token"))
}

fn load_local(path: &Path, names: &SpecialTokenNames) -> Result<Tokenizer> {
    if path.is_file() {
        return load_tokenizer_json(path);
    }
    let json = path.join("tokenizer.json");
    if json.is_file() {
        return load_tokenizer_json(&json);
    }
    let vocab = path.join("vocab.json");
    let merges = path.join("merges.txt");
    if vocab.is_file() && merges.is_file() {
        return build_byte_level_bpe(&vocab, &merges, names);
    }
    Err(anyhow!(
        "no tokenizer.json or vocab.json/merges.txt found at {}",
        path.display()
    ))
}

fn load_from_hub(model: &HubModel, names: &SpecialTokenNames) -> Result<Tokenizer> {
    match model.fetch("tokenizer.json") {
        Ok(path) => load_tokenizer_json(&path),
        Err(err) => {
            debug!(repo = %model.repo_id, error = %err, "no tokenizer.json, falling back to BPE files");
            let vocab = model.fetch("vocab.json")?;
            let merges = model.fetch("merges.txt")?;
            build_byte_level_bpe(&vocab, &merges, names)
        }
    }
}

fn load_tokenizer_json(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(|err| anyhow!("failed to load tokenizer from {}: {err}", path.display()))
}

fn build_byte_level_bpe(vocab: &Path, merges: &Path, names: &SpecialTokenNames) -> Result<Tokenizer> {
    let vocab = vocab
        .to_str()
        .with_context(|| format!("non UTF-8 vocab path {}", vocab.display()))?;
    let merges = merges
        .to_str()
        .with_context(|| format!("non UTF-8 merges path {}", merges.display()))?;
    let bpe = BPE::from_file(vocab, merges)
        .build()
        .map_err(|err| anyhow!("failed to build BPE model from {vocab}: {err}"))?;
    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer.with_pre_tokenizer(Some(ByteLevel::new(false, true, true)));
    tokenizer.with_decoder(Some(ByteLevel::default()));
    let specials = [&names.bos, &names.eos, &names.pad]
        .into_iter()
        .map(|token| AddedToken::from(token.clone(), true))
        .collect::<Vec<_>>();
    tokenizer.add_special_tokens(&specials);
    Ok(tokenizer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const TOKENIZER_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "<s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": "<pad>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 2, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<s>": 0, "<pad>": 1, "</s>": 2, "<unk>": 3, "hello": 4, "world": 5},
            "unk_token": "<unk>"
        }
    }"#;

    fn vocabulary() -> TokenizerVocabulary {
        let tokenizer = Tokenizer::from_str(TOKENIZER_JSON).expect("tokenizer json");
        TokenizerVocabulary::from_tokenizer(tokenizer, &SpecialTokenNames::default())
            .expect("special tokens")
    }

    #[test]
    fn resolves_roberta_special_tokens() {
        let vocab = vocabulary();
        assert_eq!(
            vocab.special_tokens(),
            SpecialTokens {
                bos: 0,
                eos: 2,
                pad: 1
            }
        );
    }

    #[test]
    fn decode_skips_special_tokens() -> Result<()> {
        let vocab = vocabulary();
        assert_eq!(vocab.decode(&[0, 4, 5, 2])?, "hello world");
        Ok(())
    }

    #[test]
    fn tokens_are_listed_in_id_order() {
        let vocab = vocabulary();
        let ids: Vec<u32> = vocab.tokens_by_id().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(vocab.token(4).as_deref(), Some("hello"));
    }

    #[test]
    fn missing_special_token_is_reported() {
        let tokenizer = Tokenizer::from_str(TOKENIZER_JSON).expect("tokenizer json");
        let names = SpecialTokenNames {
            bos: "[CLS]".to_string(),
            ..SpecialTokenNames::default()
        };
        let err = TokenizerVocabulary::from_tokenizer(tokenizer, &names).unwrap_err();
        assert!(err.to_string().contains("[CLS]"));
    }

    #[test]
    fn dump_writes_every_entry() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let out = tmp.path().join("vocab_dump.json");
        let written = vocabulary().dump_json(&out)?;
        assert_eq!(written, 6);
        let parsed: BTreeMap<String, u32> = serde_json::from_str(&fs::read_to_string(&out)?)?;
        assert_eq!(parsed.get("world"), Some(&5));
        Ok(())
    }

    #[test]
    fn local_directory_prefers_tokenizer_json() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        fs::write(tmp.path().join("tokenizer.json"), TOKENIZER_JSON)?;
        let vocab = TokenizerVocabulary::load(
            &TokenizerSource::Local(tmp.path().to_path_buf()),
            &SpecialTokenNames::default(),
        )?;
        assert_eq!(vocab.len(), 6);
        Ok(())
    }

    #[test]
    fn local_directory_without_tokenizer_files_fails() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let result = TokenizerVocabulary::load(
            &TokenizerSource::Local(tmp.path().to_path_buf()),
            &SpecialTokenNames::default(),
        );
        assert!(result.is_err());
        Ok(())
    }
}
