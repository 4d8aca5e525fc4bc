use std::{borrow::Cow, sync::Arc};

use derive_more::From;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::transfer::TransferFunction;
use crate::loom::{
    desc::Dims,
    layout::{Block, ChannelBlocked, Format},
    node::Node,
    num::DataType,
    tensor::{Tensor, TensorRef},
};

/// A broken construction-time contract between a node and its tensors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{node}: expected format {expected}, found {found}")]
    Format {
        node: &'static str,
        expected: Format,
        found: Format,
    },
    #[error("{node}: expected data type {expected}, found {found}")]
    Type {
        node: &'static str,
        expected: DataType,
        found: DataType,
    },
    #[error("{node}: batch size must be 1, found dims {dims}")]
    Batch { node: &'static str, dims: Dims },
    #[error("{node}: {what} must be {expected}, found {found}")]
    Shape {
        node: &'static str,
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{node}: {what} {found} exceeds {limit}")]
    Exceeds {
        node: &'static str,
        what: &'static str,
        found: usize,
        limit: usize,
    },
    #[error("{node}: source and destination are the same tensor")]
    Alias { node: &'static str },
    #[error("{node}: {reason}")]
    Invalid {
        node: &'static str,
        reason: &'static str,
    },
}

/// Contract checks on behalf of one node type.
#[derive(Debug, Clone, Copy)]
struct Check(&'static str);

impl Check {
    fn format(self, tensor: &Tensor, expected: Format) -> Result<(), NodeError> {
        match tensor.format() {
            found if found == expected => Ok(()),
            found => Err(NodeError::Format {
                node: self.0,
                expected,
                found,
            }),
        }
    }

    fn r#type(self, tensor: &Tensor) -> Result<(), NodeError> {
        match tensor.data_type() {
            DataType::F32 => Ok(()),
            found => Err(NodeError::Type {
                node: self.0,
                expected: DataType::F32,
                found,
            }),
        }
    }

    fn shape(self, what: &'static str, expected: usize, found: usize) -> Result<(), NodeError> {
        match expected == found {
            true => Ok(()),
            false => Err(NodeError::Shape {
                node: self.0,
                what,
                expected,
                found,
            }),
        }
    }

    fn within(self, what: &'static str, found: usize, limit: usize) -> Result<(), NodeError> {
        match found <= limit {
            true => Ok(()),
            false => Err(NodeError::Exceeds {
                node: self.0,
                what,
                found,
                limit,
            }),
        }
    }

    fn distinct(self, src: &Tensor, dst: &Tensor) -> Result<(), NodeError> {
        match src.id() == dst.id() {
            true => Err(NodeError::Alias { node: self.0 }),
            false => Ok(()),
        }
    }

    fn invalid(self, reason: &'static str) -> NodeError {
        NodeError::Invalid {
            node: self.0,
            reason,
        }
    }

    /// A single-image `f32` activation in the `nChwKc` format of `block`.
    fn activation(self, tensor: &Tensor, block: Block) -> Result<ChannelBlocked, NodeError> {
        self.format(tensor, block.activations())?;
        self.r#type(tensor)?;
        tensor
            .desc()
            .channel_blocked()
            .ok_or_else(|| NodeError::Batch {
                node: self.0,
                dims: tensor.dims().clone(),
            })
    }

    /// The four extents of a rank-4 tensor.
    fn dims4(self, tensor: &Tensor) -> Result<[usize; 4], NodeError> {
        tensor
            .dims()
            .to_array()
            .ok_or_else(|| self.invalid("expected a rank-4 tensor"))
    }
}

/// Output extent of a sliding window along one axis, or `None` if the window never fits.
#[inline]
fn window(input: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    (input + 2 * padding)
        .checked_sub(kernel)
        .map(|span| span / stride + 1)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Activation {
    #[default]
    None,
    Relu,
}

/// Hyperparameters of a direct convolution. The kernel size comes from the weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConvDesc {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub activation: Activation,
}

impl Default for ConvDesc {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            padding: [1, 1],
            activation: Activation::None,
        }
    }
}

impl ConvDesc {
    #[inline]
    pub fn with_relu(self) -> Self {
        let activation = Activation::Relu;
        Self { activation, ..self }
    }

    /// Output extent `[height, width]` for an input extent and kernel size.
    pub fn output(&self, input: [usize; 2], kernel: [usize; 2]) -> Option<[usize; 2]> {
        let [h, w] = input;
        let [kh, kw] = kernel;
        let [sh, sw] = self.stride;
        let [ph, pw] = self.padding;
        if sh == 0 || sw == 0 {
            return None;
        }
        Some([window(h, kh, sh, ph)?, window(w, kw, sw, pw)?])
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PoolKind {
    #[default]
    Max,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolDesc {
    pub kind: PoolKind,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
}

impl Default for PoolDesc {
    fn default() -> Self {
        Self {
            kind: PoolKind::Max,
            kernel: [2, 2],
            stride: [2, 2],
            padding: [0, 0],
        }
    }
}

impl PoolDesc {
    /// Output extent `[height, width]` for an input extent.
    pub fn output(&self, input: [usize; 2]) -> Option<[usize; 2]> {
        let [h, w] = input;
        let [kh, kw] = self.kernel;
        let [sh, sw] = self.stride;
        let [ph, pw] = self.padding;
        if sh == 0 || sw == 0 || kh == 0 || kw == 0 {
            return None;
        }
        Some([window(h, kh, sh, ph)?, window(w, kw, sw, pw)?])
    }
}

/// Direct convolution of a blocked activation with padded weights and bias.
#[derive(Debug, Clone)]
pub struct ConvNode {
    pub(crate) block: Block,
    pub(crate) desc: ConvDesc,
    pub(crate) src: TensorRef,
    pub(crate) weights: TensorRef,
    pub(crate) bias: TensorRef,
    pub(crate) dst: TensorRef,
    pub(crate) input: ChannelBlocked,
    pub(crate) output: ChannelBlocked,
    pub(crate) kernel: [usize; 2],
}

impl ConvNode {
    pub const NAME: &'static str = "conv";

    /// Weights are `[OC', IC', KH, KW]` in padded `oihw` or in the `OIhwKiKo` format of `block`,
    /// with `IC'` the padded source channels and `OC'` the padded destination channels.
    /// Bias is `x` with `OC'` entries.
    pub fn new(
        block: Block,
        desc: ConvDesc,
        src: TensorRef,
        weights: TensorRef,
        bias: TensorRef,
        dst: TensorRef,
    ) -> Result<Self, NodeError> {
        let check = Check(Self::NAME);
        let input = check.activation(&src, block)?;
        let output = check.activation(&dst, block)?;
        check.distinct(&src, &dst)?;

        match weights.format() {
            Format::Oihw => {}
            format if format == block.weights() => {}
            found => {
                return Err(NodeError::Format {
                    node: Self::NAME,
                    expected: block.weights(),
                    found,
                });
            }
        }
        check.r#type(&weights)?;
        check.format(&bias, Format::X)?;
        check.r#type(&bias)?;
        check.distinct(&weights, &dst)?;
        check.distinct(&bias, &dst)?;

        let [oc, ic, kh, kw] = check.dims4(&weights)?;
        check.shape("weight input channels", input.channels(), ic)?;
        check.shape("weight output channels", output.channels(), oc)?;
        check.shape("bias extent", oc, bias.dims()[0])?;

        let [oh, ow] = desc
            .output([input.height, input.width], [kh, kw])
            .ok_or_else(|| check.invalid("kernel does not fit the padded source, or stride is 0"))?;
        check.shape("destination height", oh, output.height)?;
        check.shape("destination width", ow, output.width)?;

        log::debug!(
            "{}: {} * {} -> {} ({desc:?})",
            Self::NAME,
            src.desc(),
            weights.desc(),
            dst.desc()
        );
        Ok(Self {
            block,
            desc,
            src,
            weights,
            bias,
            dst,
            input,
            output,
            kernel: [kh, kw],
        })
    }
}

/// Window pooling of a blocked activation, channel by channel.
#[derive(Debug, Clone)]
pub struct PoolNode {
    pub(crate) block: Block,
    pub(crate) desc: PoolDesc,
    pub(crate) src: TensorRef,
    pub(crate) dst: TensorRef,
    pub(crate) input: ChannelBlocked,
    pub(crate) output: ChannelBlocked,
}

impl PoolNode {
    pub const NAME: &'static str = "pool";

    pub fn new(
        block: Block,
        desc: PoolDesc,
        src: TensorRef,
        dst: TensorRef,
    ) -> Result<Self, NodeError> {
        let check = Check(Self::NAME);
        let input = check.activation(&src, block)?;
        let output = check.activation(&dst, block)?;
        check.distinct(&src, &dst)?;
        check.shape("destination channels", src.dims()[1], dst.dims()[1])?;

        let [oh, ow] = desc
            .output([input.height, input.width])
            .ok_or_else(|| check.invalid("window does not fit the padded source, or is empty"))?;
        check.shape("destination height", oh, output.height)?;
        check.shape("destination width", ow, output.width)?;

        log::debug!("{}: {} -> {} ({desc:?})", Self::NAME, src.desc(), dst.desc());
        Ok(Self {
            block,
            desc,
            src,
            dst,
            input,
            output,
        })
    }
}

/// 2x nearest-neighbor upsampling that stays in the blocked layout.
#[derive(Debug, Clone)]
pub struct UpsampleNode {
    pub(crate) src: TensorRef,
    pub(crate) dst: TensorRef,
    pub(crate) input: ChannelBlocked,
    pub(crate) output: ChannelBlocked,
}

impl UpsampleNode {
    pub const NAME: &'static str = "upsample";

    pub fn new(block: Block, src: TensorRef, dst: TensorRef) -> Result<Self, NodeError> {
        let check = Check(Self::NAME);
        let input = check.activation(&src, block)?;
        let output = check.activation(&dst, block)?;
        check.distinct(&src, &dst)?;
        check.shape("destination channels", src.dims()[1], dst.dims()[1])?;
        check.shape("destination height", input.height * 2, output.height)?;
        check.shape("destination width", input.width * 2, output.width)?;

        log::debug!("{}: {} -> {}", Self::NAME, src.desc(), dst.desc());
        Ok(Self {
            src,
            dst,
            input,
            output,
        })
    }
}

/// Pads dense `oihw` weights with zero channels up to multiples of `K`.
#[derive(Debug, Clone)]
pub struct WeightsReorderNode {
    pub(crate) src: TensorRef,
    pub(crate) dst: TensorRef,
    pub(crate) src_dims: [usize; 4],
    pub(crate) dst_dims: [usize; 4],
}

impl WeightsReorderNode {
    pub const NAME: &'static str = "weights_reorder";

    /// The destination is `[pad(OC), pad(IC), H, W]` in padded `oihw` or in `OIhwKiKo`.
    pub fn new(block: Block, src: TensorRef, dst: TensorRef) -> Result<Self, NodeError> {
        let check = Check(Self::NAME);
        check.format(&src, Format::Oihw)?;
        check.r#type(&src)?;
        match dst.format() {
            Format::Oihw => {}
            format if format == block.weights() => {}
            found => {
                return Err(NodeError::Format {
                    node: Self::NAME,
                    expected: Format::Oihw,
                    found,
                });
            }
        }
        check.r#type(&dst)?;
        check.distinct(&src, &dst)?;

        let src_dims @ [oc, ic, h, w] = check.dims4(&src)?;
        let dst_dims = check.dims4(&dst)?;
        check.shape("destination output channels", block.pad(oc), dst_dims[0])?;
        check.shape("destination input channels", block.pad(ic), dst_dims[1])?;
        check.shape("destination kernel height", h, dst_dims[2])?;
        check.shape("destination kernel width", w, dst_dims[3])?;

        log::debug!("{}: {} -> {}", Self::NAME, src.desc(), dst.desc());
        Ok(Self {
            src,
            dst,
            src_dims,
            dst_dims,
        })
    }
}

/// Gathers interleaved images into one blocked activation.
#[derive(Debug, Clone)]
pub struct InputReorderNode {
    pub(crate) srcs: Vec<TensorRef>,
    pub(crate) dst: TensorRef,
    pub(crate) transfer: Arc<dyn TransferFunction>,
    pub(crate) output: ChannelBlocked,
    /// Image extent `[height, width]` shared by every source.
    pub(crate) image: [usize; 2],
    /// For every logical destination channel, the source image and its channel.
    pub(crate) channels: Vec<(usize, usize)>,
}

impl InputReorderNode {
    pub const NAME: &'static str = "input_reorder";

    /// The first source is the color image and goes through `transfer`; the rest are copied.
    pub fn new(
        block: Block,
        srcs: Vec<TensorRef>,
        dst: TensorRef,
        transfer: Arc<dyn TransferFunction>,
    ) -> Result<Self, NodeError> {
        let check = Check(Self::NAME);
        let output = check.activation(&dst, block)?;

        let Some(color) = srcs.first() else {
            return Err(check.invalid("at least one source image is required"));
        };
        check.format(color, Format::Hwc)?;
        let [height, width, _] = color
            .dims()
            .to_array()
            .ok_or_else(|| check.invalid("expected a rank-3 image"))?;

        let mut channels = vec![];
        for (index, src) in srcs.iter().enumerate() {
            check.format(src, Format::Hwc)?;
            check.r#type(src)?;
            check.distinct(src, &dst)?;
            let [h, w, c] = src
                .dims()
                .to_array()
                .ok_or_else(|| check.invalid("expected a rank-3 image"))?;
            check.shape("source image height", height, h)?;
            check.shape("source image width", width, w)?;
            channels.extend((0..c).map(|channel| (index, channel)));
        }

        check.shape("destination channels", channels.len(), dst.dims()[1])?;
        check.within("image height", height, output.height)?;
        check.within("image width", width, output.width)?;

        log::debug!(
            "{}: {} images [{height}, {width}] -> {}",
            Self::NAME,
            srcs.len(),
            dst.desc()
        );
        Ok(Self {
            srcs,
            dst,
            transfer,
            output,
            image: [height, width],
            channels,
        })
    }
}

/// Converts the final blocked activation into an interleaved 3-channel image.
#[derive(Debug, Clone)]
pub struct OutputReorderNode {
    pub(crate) src: TensorRef,
    pub(crate) dst: TensorRef,
    pub(crate) transfer: Arc<dyn TransferFunction>,
    pub(crate) input: ChannelBlocked,
    /// Destination extent `[height, width, channels]`.
    pub(crate) image: [usize; 3],
}

impl OutputReorderNode {
    pub const NAME: &'static str = "output_reorder";

    /// Number of image channels written.
    pub const CHANNELS: usize = 3;

    /// `dst` is an `hwc` image `[H, W, 3]` no larger than the source's spatial extent.
    pub fn new(
        block: Block,
        src: TensorRef,
        dst: TensorRef,
        transfer: Arc<dyn TransferFunction>,
    ) -> Result<Self, NodeError> {
        let check = Check(Self::NAME);
        let input = check.activation(&src, block)?;
        check.within("source channels", src.dims()[1], block.k())?;
        check.format(&dst, Format::Hwc)?;
        check.r#type(&dst)?;
        check.distinct(&src, &dst)?;

        let image @ [height, width, channels] = dst
            .dims()
            .to_array()
            .ok_or_else(|| check.invalid("expected a rank-3 image"))?;
        check.shape("image channels", Self::CHANNELS, channels)?;
        check.within("image height", height, input.height)?;
        check.within("image width", width, input.width)?;

        log::debug!("{}: {} -> {}", Self::NAME, src.desc(), dst.desc());
        Ok(Self {
            src,
            dst,
            transfer,
            input,
            image,
        })
    }
}

/// The closed set of nodes an execution graph can hold.
#[derive(Debug, Clone, From)]
pub enum AnyNode {
    Conv(ConvNode),
    Pool(PoolNode),
    Upsample(UpsampleNode),
    InputReorder(InputReorderNode),
    WeightsReorder(WeightsReorderNode),
    OutputReorder(OutputReorderNode),
}

macro_rules! dispatch {
    ($node:expr, $inner:ident => $body:expr) => {
        match $node {
            AnyNode::Conv($inner) => $body,
            AnyNode::Pool($inner) => $body,
            AnyNode::Upsample($inner) => $body,
            AnyNode::InputReorder($inner) => $body,
            AnyNode::WeightsReorder($inner) => $body,
            AnyNode::OutputReorder($inner) => $body,
        }
    };
}

impl Node for AnyNode {
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        dispatch!(self, node => node.name())
    }

    #[inline]
    fn inputs(&self) -> Vec<TensorRef> {
        dispatch!(self, node => node.inputs())
    }

    #[inline]
    fn output(&self) -> Option<TensorRef> {
        dispatch!(self, node => node.output())
    }

    #[inline]
    fn execute(&self) {
        dispatch!(self, node => node.execute())
    }
}
