//! Token embedding layer and optional tied readout head.

use candle_core::{bail, DType, Device, Error, Result, Tensor};
use layers::{checks, PrecisionPolicy};

/// Configuration for building a token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbeddingConfig {
    /// Size of the vocabulary (number of distinct tokens).
    pub vocab_size: usize,
    /// Dimensionality of each embedding vector.
    pub hidden_dim: usize,
    /// Storage dtype used for the underlying parameters and outputs.
    pub dtype: DType,
    /// Device hosting the parameters.
    pub device: Device,
}

/// Token embedding table with a tied projection head.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Tensor,
}

impl TokenEmbedding {
    /// Builds a new token embedding table and samples the parameters from `N(0, 1)`.
    pub fn new(config: TokenEmbeddingConfig) -> Result<Self> {
        Self::validate_config(&config)?;
        let shape = (config.vocab_size, config.hidden_dim);
        let weight = Tensor::randn(0f32, 1f32, shape, &config.device)?.to_dtype(config.dtype)?;
        Ok(Self { config, weight })
    }

    /// Wraps an existing `(vocab_size, hidden_dim)` table.
    pub fn from_weight(config: TokenEmbeddingConfig, weight: Tensor) -> Result<Self> {
        Self::validate_config(&config)?;
        checks::expect_shape(
            "embedding.weight",
            &weight,
            &[config.vocab_size, config.hidden_dim],
        )?;
        let weight = weight.to_dtype(config.dtype)?;
        Ok(Self { config, weight })
    }

    /// Returns the embedding configuration.
    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    /// Returns the underlying weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Looks up embeddings for the provided token ids.
    ///
    /// Inputs must be shaped `(batch, seq)` with an integer dtype. Outputs follow the
    /// `(batch, seq, hidden)` layout using the configured storage dtype.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.validate_token_ids(token_ids)?;
        let dims = token_ids.dims();

        let flat = token_ids.to_dtype(DType::I64)?.flatten_all()?;
        self.ensure_id_range(&flat)?;

        let gathered = self.weight.index_select(&flat, 0)?;
        let mut output_dims = dims.to_vec();
        output_dims.push(self.config.hidden_dim);
        gathered.reshape(output_dims)
    }

    /// Returns the parameters for this embedding with an optional scope prefix.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Tensor)> {
        let prefix = if scope.is_empty() {
            "embedding".to_string()
        } else {
            scope.to_string()
        };
        vec![(format!("{}.weight", prefix), self.weight.clone())]
    }

    /// Applies a tied linear projection using the transpose of the embedding weight.
    ///
    /// Logits always come back in at least `f32`, whatever the storage dtype.
    pub fn linear_out(&self, hidden: &Tensor) -> Result<Tensor> {
        let (batch, seq, hidden_dim) = match hidden.dims() {
            [batch, seq, hidden_dim] => (*batch, *seq, *hidden_dim),
            _ => {
                return Err(Error::Msg(
                    "linear_out expects input shaped [batch, seq, hidden]".into(),
                ))
            }
        };

        if hidden_dim != self.config.hidden_dim {
            return Err(Error::Msg(format!(
                "linear_out expected hidden dim {} but received {}",
                self.config.hidden_dim, hidden_dim
            )));
        }

        let policy = PrecisionPolicy::from_parameter_dtype(self.config.dtype).for_logits();
        let input = policy.cast_for_matmul(hidden)?;
        let weight = policy.cast_for_matmul(&self.weight)?;

        let flat = input.reshape((batch * seq, hidden_dim))?;
        let logits = flat.matmul(&weight.t()?)?;
        let logits = logits.reshape((batch, seq, self.config.vocab_size))?;
        policy.cast_to_storage(&logits)
    }

    fn validate_config(config: &TokenEmbeddingConfig) -> Result<()> {
        if config.vocab_size == 0 {
            bail!("token embedding requires vocab_size > 0");
        }
        if config.hidden_dim == 0 {
            bail!("token embedding requires hidden_dim > 0");
        }
        Ok(())
    }

    fn validate_token_ids(&self, token_ids: &Tensor) -> Result<()> {
        match token_ids.dims() {
            [batch, seq] => {
                if *batch == 0 || *seq == 0 {
                    return Err(Error::Msg(
                        "token_ids must have non-zero batch and seq dimensions".into(),
                    ));
                }
            }
            _ => return Err(Error::Msg("token_ids must be shaped [batch, seq]".into())),
        }

        if !token_ids.dtype().is_int() {
            Err(Error::Msg(format!(
                "token_ids expected integer dtype but received {:?}",
                token_ids.dtype()
            )))
        } else {
            Ok(())
        }
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        if flat_ids.elem_count() == 0 {
            return Ok(());
        }

        let min_id = flat_ids.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            return Err(Error::Msg(format!(
                "encountered negative token id {} (minimum)",
                min_id
            )));
        }

        let max_id = flat_ids.max_all()?.to_scalar::<i64>()?;
        let vocab = self.config.vocab_size as i64;
        if max_id >= vocab {
            return Err(Error::Msg(format!(
                "token id {} exceeds vocab size {}",
                max_id, vocab
            )));
        }
        Ok(())
    }
}
