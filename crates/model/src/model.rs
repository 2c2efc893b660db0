use std::{cell::Cell, collections::HashMap, path::Path};

use candle_core::{bail, DType, Error, Module, Result, Tensor, Var};
use candle_nn::{conv2d, ops, Conv2d, Conv2dConfig, VarBuilder, VarMap};

use crate::{
    block::{ConvBlock, Encoder},
    config::{FusionForm, ModelConfig},
};

/// Interface the training loop drives: a two-input segmentation network with
/// named, mutable parameters.
pub trait ChangeDetector {
    /// Produces logits shaped `(batch, classes, height, width)`.
    fn forward(&self, pre: &Tensor, post: &Tensor) -> Result<Tensor>;

    /// Trainable parameters sorted by name.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;
}

const SHARED_ENCODER: &str = "encoder";
const POST_ENCODER: &str = "encoder_post";

/// U-Net whose encoder runs on both images; skip features are fused before decoding.
pub struct SiameseUnet {
    config: ModelConfig,
    varmap: VarMap,
    encoder: Encoder,
    post_encoder: Option<Encoder>,
    decoder: Vec<ConvBlock>,
    head: Conv2d,
    training: Cell<bool>,
}

impl SiameseUnet {
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let encoder = Encoder::new(
            config.in_channels,
            &config.encoder_channels,
            vb.pp(SHARED_ENCODER),
        )?;
        let post_encoder = if config.siam_encoder {
            None
        } else {
            Some(Encoder::new(
                config.in_channels,
                &config.encoder_channels,
                vb.pp(POST_ENCODER),
            )?)
        };

        let fused: Vec<usize> = config
            .encoder_channels
            .iter()
            .map(|&c| config.fusion_form.fused_channels(c))
            .collect();
        let depth = config.depth();
        let mut decoder = Vec::with_capacity(depth.saturating_sub(1));
        let mut incoming = fused[depth - 1];
        for level in (0..depth - 1).rev() {
            let out = config.encoder_channels[level];
            decoder.push(ConvBlock::new(
                incoming + fused[level],
                out,
                vb.pp(format!("decoder.{level}")),
            )?);
            incoming = out;
        }

        let head = conv2d(
            incoming,
            config.classes,
            1,
            Conv2dConfig::default(),
            vb.pp("head"),
        )?;

        Ok(Self {
            config,
            varmap,
            encoder,
            post_encoder,
            decoder,
            head,
            training: Cell::new(true),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Initialises every encoder from a safetensors file keyed relative to the
    /// encoder (`stages.0.conv1.weight`, ...).
    pub fn load_encoder_weights(&self, path: &Path) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, &self.config.device)?;
        let prefixes: &[&str] = if self.post_encoder.is_some() {
            &[SHARED_ENCODER, POST_ENCODER]
        } else {
            &[SHARED_ENCODER]
        };
        for prefix in prefixes {
            let scope = format!("{prefix}.");
            for (name, var) in self.parameters() {
                let Some(key) = name.strip_prefix(&scope) else {
                    continue;
                };
                let Some(tensor) = tensors.get(key) else {
                    bail!("encoder weights {} missing tensor {key}", path.display());
                };
                if tensor.dims() != var.as_tensor().dims() {
                    bail!(
                        "encoder tensor {key} has shape {:?}, expected {:?}",
                        tensor.dims(),
                        var.as_tensor().dims()
                    );
                }
                var.set(&tensor.to_dtype(DType::F32)?)?;
            }
        }
        Ok(())
    }

    fn check_inputs(&self, pre: &Tensor, post: &Tensor) -> Result<()> {
        if pre.dims() != post.dims() {
            bail!(
                "pre/post images must share a shape, got {:?} and {:?}",
                pre.dims(),
                post.dims()
            );
        }
        let dims = pre.dims();
        if dims.len() != 4 {
            bail!("expected [batch, channels, height, width] input, got {dims:?}");
        }
        if dims[1] != self.config.in_channels {
            bail!(
                "model expects {} input channels, got {}",
                self.config.in_channels,
                dims[1]
            );
        }
        let divisor = self.config.size_divisor();
        if dims[2] % divisor != 0 || dims[3] % divisor != 0 {
            bail!(
                "input size {}x{} must be divisible by {divisor}",
                dims[2],
                dims[3]
            );
        }
        Ok(())
    }

    fn fuse(&self, pre: &Tensor, post: &Tensor) -> Result<Tensor> {
        match self.config.fusion_form {
            FusionForm::Concat => Tensor::cat(&[pre, post], 1),
            FusionForm::Sum => pre + post,
            FusionForm::Diff => post - pre,
            FusionForm::AbsDiff => (post - pre)?.abs(),
        }
    }
}

impl ChangeDetector for SiameseUnet {
    fn forward(&self, pre: &Tensor, post: &Tensor) -> Result<Tensor> {
        self.check_inputs(pre, post)?;

        let pre_features = self.encoder.forward(pre)?;
        let post_features = match &self.post_encoder {
            Some(encoder) => encoder.forward(post)?,
            None => self.encoder.forward(post)?,
        };

        let fused = pre_features
            .iter()
            .zip(post_features.iter())
            .map(|(a, b)| self.fuse(a, b))
            .collect::<Result<Vec<_>>>()?;

        let depth = fused.len();
        let mut hidden = fused[depth - 1].clone();
        for (block, level) in self.decoder.iter().zip((0..depth - 1).rev()) {
            let skip = &fused[level];
            let (_, _, h, w) = skip.dims4()?;
            hidden = hidden.upsample_nearest2d(h, w)?;
            hidden = Tensor::cat(&[&hidden, skip], 1)?;
            hidden = block.forward(&hidden)?;
            if let Some(p) = self.config.decoder_dropout_p {
                if self.training.get() && p > 0.0 {
                    hidden = ops::dropout(&hidden, p)?;
                }
            }
        }

        self.head.forward(&hidden)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn is_training(&self) -> bool {
        self.training.get()
    }
}

/// Copies the current parameter values into a name -> tensor map.
pub fn snapshot_parameters<M: ChangeDetector + ?Sized>(model: &M) -> Result<HashMap<String, Tensor>> {
    let params = model.parameters();
    if params.is_empty() {
        return Err(Error::Msg("model contains no parameters".into()));
    }
    let mut tensors = HashMap::with_capacity(params.len());
    for (name, var) in params {
        tensors.insert(name, var.as_tensor().copy()?);
    }
    Ok(tensors)
}
