use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;
use serde::Serialize;
use tracing::info;

use crate::{
    decode::{DecodeOptions, FinishReason, GreedyDecoder, Vocabulary},
    preprocess::Preprocessor,
    session::{ModelSession, run_encoder},
};

/// Text recognized from one image, with the decode bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub text: String,
    pub tokens: Vec<u32>,
    pub steps: usize,
    pub finish_reason: FinishReason,
    pub encoder_shape: Vec<usize>,
}

/// Encoder + greedy decoder pipeline over an explicit set of collaborators.
pub struct TrOcrRecognizer<E, D, P, V> {
    encoder: E,
    decoder: GreedyDecoder<D>,
    preprocessor: P,
    vocab: V,
}

impl<E, D, P, V> TrOcrRecognizer<E, D, P, V>
where
    E: ModelSession,
    D: ModelSession,
    P: Preprocessor,
    V: Vocabulary,
{
    pub fn new(
        encoder: E,
        decoder: D,
        preprocessor: P,
        vocab: V,
        options: DecodeOptions,
    ) -> Result<Self> {
        let decoder = GreedyDecoder::new(decoder, vocab.special_tokens(), options)?;
        Ok(Self {
            encoder,
            decoder,
            preprocessor,
            vocab,
        })
    }

    pub fn recognize_path(&self, path: &Path) -> Result<Recognition> {
        let image = image::open(path)
            .with_context(|| format!("failed to open image at {}", path.display()))?;
        let recognition = self
            .recognize(&image)
            .with_context(|| format!("recognition failed for {}", path.display()))?;
        info!(
            image = %path.display(),
            steps = recognition.steps,
            reason = ?recognition.finish_reason,
            "recognized"
        );
        Ok(recognition)
    }

    pub fn recognize(&self, image: &DynamicImage) -> Result<Recognition> {
        let pixel_values = self.preprocessor.preprocess(image)?;
        let encoder_states = run_encoder(&self.encoder, &pixel_values)?;
        let encoder_shape = encoder_states.dims().to_vec();
        let outcome = self.decoder.decode(&encoder_states)?;
        let text = self.vocab.decode(&outcome.tokens)?;
        Ok(Recognition {
            text,
            tokens: outcome.tokens,
            steps: outcome.steps,
            finish_reason: outcome.finish_reason,
            encoder_shape,
        })
    }
}
