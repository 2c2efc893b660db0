use std::fmt;

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

fn same_padding() -> Conv2dConfig {
    Conv2dConfig {
        padding: 1,
        ..Default::default()
    }
}

/// Two 3x3 convolutions with ReLU activations, preserving spatial size.
pub struct ConvBlock {
    in_channels: usize,
    out_channels: usize,
    first: Conv2d,
    second: Conv2d,
}

impl fmt::Debug for ConvBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvBlock")
            .field("in_channels", &self.in_channels)
            .field("out_channels", &self.out_channels)
            .finish()
    }
}

impl ConvBlock {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let first = conv2d(in_channels, out_channels, 3, same_padding(), vb.pp("conv1"))?;
        let second = conv2d(out_channels, out_channels, 3, same_padding(), vb.pp("conv2"))?;
        Ok(Self {
            in_channels,
            out_channels,
            first,
            second,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

impl Module for ConvBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = self.first.forward(xs)?.relu()?;
        self.second.forward(&hidden)?.relu()
    }
}

/// Stack of [`ConvBlock`]s separated by 2x2 max pooling.
///
/// `forward` returns one feature map per stage, shallowest first, which the
/// decoder consumes as skip connections.
#[derive(Debug)]
pub struct Encoder {
    stages: Vec<ConvBlock>,
}

impl Encoder {
    pub fn new(in_channels: usize, channels: &[usize], vb: VarBuilder) -> Result<Self> {
        let mut stages = Vec::with_capacity(channels.len());
        let mut previous = in_channels;
        for (idx, &width) in channels.iter().enumerate() {
            stages.push(ConvBlock::new(previous, width, vb.pp(format!("stages.{idx}")))?);
            previous = width;
        }
        Ok(Self { stages })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Vec<Tensor>> {
        let mut features = Vec::with_capacity(self.stages.len());
        let mut hidden = xs.clone();
        for (idx, stage) in self.stages.iter().enumerate() {
            if idx > 0 {
                hidden = hidden.max_pool2d(2)?;
            }
            hidden = stage.forward(&hidden)?;
            features.push(hidden.clone());
        }
        Ok(features)
    }
}
