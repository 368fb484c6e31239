use super::*;

/// Token embedding plus a learned positional table sliced to the sequence length.
pub struct TextEmbedding {
    pub token_embedding: Embedding,
    pub positional_embedding: Tensor,
}

impl TextEmbedding {
    pub fn new(vb: &VarBuilder, c: &ClipTextConfig) -> Result<Self> {
        let token_embedding = embedding(c.vocab_size, c.hidden_size, vb.pp("token_embedding"))?;
        let positional_embedding = vb.get_with_hints(
            (c.max_position_embeddings, c.hidden_size),
            "positional_embedding",
            Init::Randn {
                mean: 0.,
                stdev: 0.01,
            },
        )?;
        Ok(Self {
            token_embedding,
            positional_embedding,
        })
    }

    pub fn max_positions(&self) -> usize {
        self.positional_embedding.dims()[0]
    }

    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (b, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_positions() {
            return Err(ClipError::shape(
                "positional_embedding",
                &[b, self.max_positions()],
                input_ids.dims(),
            ));
        }
        let tok_emb = self.token_embedding.forward(input_ids)?;
        let pos_emb = self.positional_embedding.narrow(0, 0, seq_len)?;
        Ok(tok_emb.broadcast_add(&pos_emb)?)
    }
}

/// Causal text transformer pooled at the end-of-text token.
pub struct TextTransformer {
    pub embeddings: TextEmbedding,
    pub transformer: TransformerStack,
    pub ln_final: LayerNorm,
}

impl TextTransformer {
    pub fn new(vb: &VarBuilder, c: &ClipTextConfig) -> Result<Self> {
        let embeddings = TextEmbedding::new(vb, c)?;
        let transformer = TransformerStack::new(&vb.pp("transformer"), &c.stack())?;
        let ln_final = layer_norm(c.hidden_size, c.layer_norm_eps, vb.pp("ln_final"))?;
        tracing::debug!(
            vocab_size = c.vocab_size,
            context_length = c.max_position_embeddings,
            width = c.hidden_size,
            "text transformer assembled"
        );
        Ok(Self {
            embeddings,
            transformer,
            ln_final,
        })
    }

    pub fn width(&self) -> usize {
        self.embeddings.positional_embedding.dims()[1]
    }

    /// Final-normed hidden states (B, L, width).
    ///
    /// Without a `mask` the causal mask for the input length is built here.
    pub fn forward_hidden(&self, input_ids: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let x = self.embeddings.forward(input_ids)?;

        let built;
        let mask = match mask {
            Some(mask) => {
                if mask.dims() != [seq_len, seq_len] {
                    return Err(ClipError::shape("mask", &[seq_len, seq_len], mask.dims()));
                }
                mask
            }
            None => {
                built = causal_mask(seq_len, input_ids.device())?;
                &built
            }
        };

        let x = self.transformer.forward(&x, Some(mask))?;
        Ok(self.ln_final.forward_t(&x, false)?)
    }

    /// Picks, for every row, the hidden state at `argmax(input_ids)`, the end-of-text position.
    pub fn pool_eot(hidden: &Tensor, input_ids: &Tensor) -> Result<Tensor> {
        let (b, _, width) = hidden.dims3()?;
        let eot = input_ids.argmax(D::Minus1)?;
        let index = eot.reshape((b, 1, 1))?.expand((b, 1, width))?.contiguous()?;
        Ok(hidden.gather(&index, 1)?.squeeze(1)?)
    }

    /// (B, L) token ids -> (B, width)
    pub fn forward(&self, input_ids: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let hidden = self.forward_hidden(input_ids, mask)?;
        let pooled = Self::pool_eot(&hidden, input_ids)?;
        tracing::trace!(shape = ?pooled.dims(), "text pooled");
        Ok(pooled)
    }
}
