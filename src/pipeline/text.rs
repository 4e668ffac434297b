//! Prompt tokenization and CLIP text encoding.

use std::path::Path;

use ndarray::{Array3, Ix3};
use tokenizers::Tokenizer;

use crate::error::{Error, Result};
use crate::model::session::{self, SharedSession};

/// CLIP context length.
pub const MAX_TOKENS: usize = 77;

const START_TOKEN: &str = "<|startoftext|>";
const END_TOKEN: &str = "<|endoftext|>";

/// Turns prompts into the hidden states the `UNet` cross-attends to.
pub struct PromptEncoder {
    tokenizer: Tokenizer,
    encoder: SharedSession,
    bos: u32,
    eos: u32,
}

impl PromptEncoder {
    /// Load the tokenizer from `tokenizer_path` and pair it with the encoder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tokenizer`] if the tokenizer cannot be loaded or lacks
    /// the CLIP special tokens.
    pub fn load(tokenizer_path: &Path, encoder: SharedSession) -> Result<Self> {
        let tokenizer =
            Tokenizer::from_file(tokenizer_path).map_err(|source| Error::Tokenizer { source })?;
        Self::new(tokenizer, encoder)
    }

    /// Pair a tokenizer with the text encoder session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tokenizer`] if the tokenizer lacks the CLIP special tokens.
    pub fn new(tokenizer: Tokenizer, encoder: SharedSession) -> Result<Self> {
        let special = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| Error::Tokenizer {
                    source: format!("missing special token {token}").into(),
                })
        };
        let bos = special(START_TOKEN)?;
        let eos = special(END_TOKEN)?;

        Ok(Self {
            tokenizer,
            encoder,
            bos,
            eos,
        })
    }

    /// Token ids of `prompt`, framed and padded to [`MAX_TOKENS`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tokenizer`] if tokenization fails.
    pub fn token_ids(&self, prompt: &str) -> Result<Vec<i64>> {
        let encoding = self
            .tokenizer
            .encode(prompt, false)
            .map_err(|source| Error::Tokenizer { source })?;

        Ok(frame_tokens(encoding.get_ids(), self.bos, self.eos))
    }

    /// Encode `prompt` to hidden states of shape (1, 77, hidden).
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or the text encoder fails.
    pub fn encode(&self, prompt: &str) -> Result<Array3<f32>> {
        let ids = self.token_ids(prompt)?;
        let model = self.encoder.name();

        let mut session = self.encoder.lock()?;
        let input_name = session::input_names(&session)
            .into_iter()
            .next()
            .unwrap_or_else(|| "input_ids".to_string());
        let element_type = session::input_element_type(&session, &input_name);
        let input = session::integer_input(model, element_type, &[1, MAX_TOKENS], &ids)?;

        let hidden = session::run_locked(model, &mut session, vec![(input_name, input)])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::ShapeMismatch {
                expected: "last_hidden_state output".to_string(),
                actual: "no output".to_string(),
            })?;

        let ndim = hidden.ndim();
        hidden
            .into_dimensionality::<Ix3>()
            .map_err(|_| Error::ShapeMismatch {
                expected: "3D hidden states".to_string(),
                actual: format!("{ndim}D tensor"),
            })
    }
}

/// Frame ids with start/end tokens, truncating and padding to [`MAX_TOKENS`].
fn frame_tokens(ids: &[u32], bos: u32, eos: u32) -> Vec<i64> {
    let body = ids.len().min(MAX_TOKENS - 2);

    let mut framed = Vec::with_capacity(MAX_TOKENS);
    framed.push(i64::from(bos));
    framed.extend(ids[..body].iter().map(|&id| i64::from(id)));
    framed.push(i64::from(eos));
    // CLIP pads with the end token
    framed.resize(MAX_TOKENS, i64::from(eos));

    framed
}
