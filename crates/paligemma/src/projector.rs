//! Projection from the vision tower's width into the text embedding space.

use candle_core::{DType, Device, Result, Tensor};
use layers::{
    checks,
    linear::{Linear, LinearConfig, LinearInit, LinearLayer},
    PrecisionPolicy,
};

/// Affine map `(batch, patches, vision_hidden) -> (batch, patches, projection_dim)`.
#[derive(Debug, Clone)]
pub struct MultiModalProjector {
    linear: Linear,
}

impl MultiModalProjector {
    pub fn new(
        vision_hidden: usize,
        projection_dim: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let linear = Linear::with_init(
            LinearConfig::new(vision_hidden, projection_dim),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        Ok(Self { linear })
    }

    /// Wraps checkpoint tensors: `weight` `(projection_dim, vision_hidden)` and `bias` `(projection_dim,)`.
    pub fn from_weights(weight: Tensor, bias: Tensor) -> Result<Self> {
        let (projection_dim, vision_hidden) = weight.dims2()?;
        let linear = Linear::new(
            LinearConfig::new(vision_hidden, projection_dim),
            weight,
            Some(bias),
        )?;
        Ok(Self { linear })
    }

    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        self.linear.named_parameters("multi_modal_projector.linear")
    }

    pub fn forward(&self, image_features: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_rank("projector.input", image_features, 3)?;
        self.linear.forward(image_features, policy)
    }
}
