use anyhow::{Context, Result, bail, ensure};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    session::{InputBindings, ModelSession, input_name, run_first_output},
    tensor::{last_position_logits, token_ids_tensor},
};

/// Special token ids every decoder vocabulary exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub bos: u32,
    pub eos: u32,
    pub pad: u32,
}

/// Maps token ids back to text.
pub trait Vocabulary {
    fn special_tokens(&self) -> SpecialTokens;

    /// Detokenize `ids`, dropping special tokens.
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

impl<V: Vocabulary + ?Sized> Vocabulary for &V {
    fn special_tokens(&self) -> SpecialTokens {
        (**self).special_tokens()
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        (**self).decode(ids)
    }
}

pub const DEFAULT_MAX_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    /// Upper bound on decoder invocations for one sequence.
    pub max_length: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndOfSequence,
    MaxLength,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeOutcome {
    /// Generated ids without the leading BOS and without EOS.
    pub tokens: Vec<u32>,
    pub steps: usize,
    pub finish_reason: FinishReason,
}

/// Greedy autoregressive loop over a decoder that takes
/// `(input_ids, encoder_hidden_states)` and returns `[batch, seq, vocab]` logits.
///
/// The whole token prefix is re-fed on every step; there is no KV cache.
pub struct GreedyDecoder<S> {
    session: S,
    input_ids_name: String,
    encoder_states_name: String,
    specials: SpecialTokens,
    options: DecodeOptions,
}

impl<S: ModelSession> GreedyDecoder<S> {
    pub fn new(session: S, specials: SpecialTokens, options: DecodeOptions) -> Result<Self> {
        let input_ids_name = input_name(&session, 0).context("decoder must take input ids")?;
        let encoder_states_name =
            input_name(&session, 1).context("decoder must take encoder hidden states")?;
        Ok(Self {
            session,
            input_ids_name,
            encoder_states_name,
            specials,
            options,
        })
    }

    pub fn options(&self) -> DecodeOptions {
        self.options
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Decode one sequence against a fixed encoder output.
    ///
    /// Any decoder failure aborts the whole sequence.
    pub fn decode(&self, encoder_states: &Tensor) -> Result<DecodeOutcome> {
        let device = encoder_states.device();
        let mut tokens = vec![self.specials.bos];
        let mut steps = 0usize;
        let mut finish_reason = FinishReason::MaxLength;

        while steps < self.options.max_length {
            let mut inputs = InputBindings::with_capacity(2);
            inputs.insert(self.input_ids_name.clone(), token_ids_tensor(&tokens, device)?);
            inputs.insert(self.encoder_states_name.clone(), encoder_states.clone());
            let logits = run_first_output(&self.session, inputs)
                .with_context(|| format!("decoder step {} failed", steps + 1))?;
            steps += 1;

            let mut scores = last_position_logits(&logits)?;
            // BOS only ever opens the sequence.
            if let Some(score) = scores.get_mut(self.specials.bos as usize) {
                *score = f32::NAN;
            }
            let next = select_greedy(&scores)?;
            trace!(step = steps, token = next, "greedy step");
            if next == self.specials.eos {
                finish_reason = FinishReason::EndOfSequence;
                break;
            }
            tokens.push(next);
        }

        debug!(
            steps,
            generated = tokens.len() - 1,
            reason = ?finish_reason,
            "decode finished"
        );
        tokens.remove(0);
        Ok(DecodeOutcome {
            tokens,
            steps,
            finish_reason,
        })
    }
}

/// Index of the highest score; the lowest index wins ties and NaN never wins.
pub fn select_greedy(scores: &[f32]) -> Result<u32> {
    ensure!(!scores.is_empty(), "cannot select a token from empty logits");
    let mut best: Option<(usize, f32)> = None;
    for (idx, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if score <= current => {}
            _ => best = Some((idx, score)),
        }
    }
    let Some((idx, _)) = best else {
        bail!("logits contain only NaN values");
    };
    u32::try_from(idx).context("token index exceeds u32")
}
