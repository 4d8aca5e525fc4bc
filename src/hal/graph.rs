use std::sync::Arc;

use rustc_hash::FxHashSet as HashSet;
use thiserror::Error;

use super::{
    ops::{
        AnyNode, ConvDesc, ConvNode, InputReorderNode, NodeError, OutputReorderNode, PoolDesc,
        PoolNode, UpsampleNode, WeightsReorderNode,
    },
    transfer::TransferFunction,
};
use crate::loom::{
    desc::{Desc, DescError},
    engine::Engine,
    layout::{Block, Format, pad_to},
    node::Node,
    tensor::{Tensor, TensorError, TensorRef},
};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Desc(#[from] DescError),
    #[cfg(feature = "rayon")]
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("graph error: {0}")]
    Build(&'static str),
}

#[derive(Debug, Clone)]
pub struct GraphBuilder {
    engine: Engine,
    block: Block,
    threads: Option<usize>,
    alignment: usize,
}

impl GraphBuilder {
    pub const DEFAULT_ALIGNMENT: usize = 16;

    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            block: Block::default(),
            threads: None,
            alignment: Self::DEFAULT_ALIGNMENT,
        }
    }

    /// Channel blocking factor of every activation in the graph.
    pub fn block(mut self, block: Block) -> Self {
        self.block = block;
        self
    }

    /// Number of worker threads. Without it, kernels run on the global pool.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Spatial multiple the input activation is padded to.
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        if self.alignment == 0 {
            return Err(GraphError::Build("alignment must be positive"));
        }

        #[cfg(feature = "rayon")]
        let pool = match self.threads {
            Some(threads) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|index| format!("denoise-{index}"))
                    .build()?,
            ),
            None => None,
        };
        #[cfg(not(feature = "rayon"))]
        if let Some(threads) = self.threads {
            log::warn!("ignoring {threads} threads: built without `rayon`");
        }

        log::info!(
            "graph on {}: block {}, alignment {}, threads {:?}",
            self.engine,
            self.block,
            self.alignment,
            self.threads
        );
        Ok(Graph {
            engine: self.engine,
            block: self.block,
            alignment: self.alignment,
            nodes: vec![],
            #[cfg(feature = "rayon")]
            pool,
        })
    }
}

/// An ordered list of nodes sharing tensors, plus the allocator for those tensors.
///
/// Nodes run in insertion order, so a node must be added after the nodes producing its inputs.
#[derive(Debug)]
pub struct Graph {
    engine: Engine,
    block: Block,
    alignment: usize,
    nodes: Vec<AnyNode>,
    #[cfg(feature = "rayon")]
    pool: Option<rayon::ThreadPool>,
}

impl Graph {
    #[inline]
    pub fn engine(&self) -> Engine {
        self.engine
    }

    #[inline]
    pub fn block(&self) -> Block {
        self.block
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn nodes(&self) -> &[AnyNode] {
        &self.nodes
    }

    /// Allocates a zeroed tensor on the engine of the graph.
    pub fn alloc(&self, desc: Desc) -> Result<TensorRef, GraphError> {
        let tensor = Tensor::zeros(&self.engine, desc)?;
        Ok(tensor.into_ref())
    }

    /// Allocates a zeroed activation in the blocked format of the graph.
    pub fn alloc_activation(
        &self,
        channels: usize,
        height: usize,
        width: usize,
    ) -> Result<TensorRef, GraphError> {
        self.alloc(Desc::activation(self.block, channels, height, width)?)
    }

    /// Appends a prebuilt node.
    pub fn push(&mut self, node: impl Into<AnyNode>) {
        let node = node.into();
        log::debug!("graph node {}: {}", self.nodes.len(), node.name());
        self.nodes.push(node);
    }

    /// Gathers `hwc` images into a new activation whose extent is rounded up to the alignment.
    ///
    /// The first image is the color input and goes through `transfer`.
    pub fn add_input_reorder(
        &mut self,
        srcs: Vec<TensorRef>,
        transfer: Arc<dyn TransferFunction>,
    ) -> Result<TensorRef, GraphError> {
        let [height, width, _] = srcs
            .first()
            .and_then(|src| src.dims().to_array())
            .ok_or(GraphError::Build("input reorder needs a rank-3 color image"))?;
        let channels = srcs.iter().filter_map(|src| src.dims().last()).sum();

        let dst = self.alloc_activation(
            channels,
            pad_to(height, self.alignment),
            pad_to(width, self.alignment),
        )?;
        let node = InputReorderNode::new(self.block, srcs, dst.clone(), transfer)?;
        self.push(node);
        Ok(dst)
    }

    fn reorder_weights(&self, src: TensorRef, format: Format) -> Result<TensorRef, GraphError> {
        let [oc, ic, h, w] = src
            .dims()
            .to_array()
            .ok_or(GraphError::Build("weights must have rank 4"))?;
        let dims = [self.block.pad(oc), self.block.pad(ic), h, w];
        let dst = self.alloc(Desc::f32(dims, format)?)?;

        let node = WeightsReorderNode::new(self.block, src, dst.clone())?;
        let start = instant::Instant::now();
        node.execute();
        log::debug!("{}: {} in {:?}", node.name(), dst.desc(), start.elapsed());
        Ok(dst)
    }

    /// Pads `oihw` weights to whole channel blocks. Runs once, right away.
    pub fn add_weights_reorder(&mut self, src: TensorRef) -> Result<TensorRef, GraphError> {
        self.reorder_weights(src, Format::Oihw)
    }

    /// Pads a bias to whole channel blocks, unless it already is.
    fn pad_bias(&self, bias: TensorRef) -> Result<TensorRef, GraphError> {
        let extent = bias.dims().first().copied().unwrap_or_default();
        let padded = self.block.pad(extent);
        if bias.format() != Format::X || extent == padded {
            return Ok(bias);
        }

        let dst = self.alloc(Desc::f32([padded], Format::X)?)?;
        dst.write()[..extent].copy_from_slice(&bias.read());
        Ok(dst)
    }

    /// Adds a convolution of `src` with `oihw` weights `[OC, IC, KH, KW]` and an `OC` bias.
    ///
    /// Raw weights and bias are padded once here. Weights already in the blocked weight format
    /// of the graph are used as they are.
    pub fn add_conv(
        &mut self,
        src: TensorRef,
        weights: TensorRef,
        bias: TensorRef,
        desc: ConvDesc,
    ) -> Result<TensorRef, GraphError> {
        let [oc, ic, kh, kw] = weights
            .dims()
            .to_array()
            .ok_or(GraphError::Build("weights must have rank 4"))?;
        let [_, c, h, w] = src
            .dims()
            .to_array()
            .ok_or(GraphError::Build("convolution source must have rank 4"))?;

        let weights = match weights.format() {
            Format::Oihw => {
                if ic != c {
                    return Err(NodeError::Shape {
                        node: ConvNode::NAME,
                        what: "weight input channels",
                        expected: c,
                        found: ic,
                    }
                    .into());
                }
                self.reorder_weights(weights, self.block.weights())?
            }
            _ => weights,
        };
        let bias = self.pad_bias(bias)?;

        let [oh, ow] = desc
            .output([h, w], [kh, kw])
            .ok_or(GraphError::Build("convolution kernel does not fit its source"))?;
        let dst = self.alloc_activation(oc, oh, ow)?;

        let node = ConvNode::new(self.block, desc, src, weights, bias, dst.clone())?;
        self.push(node);
        Ok(dst)
    }

    pub fn add_pool(&mut self, src: TensorRef, desc: PoolDesc) -> Result<TensorRef, GraphError> {
        let [_, c, h, w] = src
            .dims()
            .to_array()
            .ok_or(GraphError::Build("pooling source must have rank 4"))?;
        let [oh, ow] = desc
            .output([h, w])
            .ok_or(GraphError::Build("pooling window does not fit its source"))?;
        let dst = self.alloc_activation(c, oh, ow)?;

        let node = PoolNode::new(self.block, desc, src, dst.clone())?;
        self.push(node);
        Ok(dst)
    }

    pub fn add_upsample(&mut self, src: TensorRef) -> Result<TensorRef, GraphError> {
        let [_, c, h, w] = src
            .dims()
            .to_array()
            .ok_or(GraphError::Build("upsampling source must have rank 4"))?;
        let dst = self.alloc_activation(c, 2 * h, 2 * w)?;

        let node = UpsampleNode::new(self.block, src, dst.clone())?;
        self.push(node);
        Ok(dst)
    }

    /// Writes the first three channels of `src` into the `hwc` image `dst`.
    pub fn add_output_reorder(
        &mut self,
        src: TensorRef,
        dst: TensorRef,
        transfer: Arc<dyn TransferFunction>,
    ) -> Result<(), GraphError> {
        let node = OutputReorderNode::new(self.block, src, dst, transfer)?;
        self.push(node);
        Ok(())
    }

    /// Runs every node in insertion order.
    pub fn execute(&self) {
        #[cfg(feature = "trace")]
        let _span = tracing::trace_span!("graph", nodes = self.nodes.len()).entered();

        let run = || {
            let start = instant::Instant::now();
            for (index, node) in self.nodes.iter().enumerate() {
                let begin = instant::Instant::now();
                node.execute();
                log::trace!("node {index} ({}): {:?}", node.name(), begin.elapsed());
            }
            log::debug!("graph executed in {:?}", start.elapsed());
        };

        #[cfg(feature = "rayon")]
        if let Some(pool) = &self.pool {
            return pool.install(run);
        }
        run();
    }

    /// Bytes held by the distinct tensors the nodes read and write.
    pub fn memory_usage(&self) -> usize {
        let mut seen = HashSet::default();
        self.nodes
            .iter()
            .flat_map(|node| node.inputs().into_iter().chain(node.output()))
            .filter(|tensor| seen.insert(tensor.id()))
            .map(|tensor| tensor.data_size())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, sync::Arc};

    use itertools::iproduct;

    use super::{GraphBuilder, GraphError};
    use crate::{
        hal::{
            ops::{AnyNode, ConvDesc, NodeError, PoolDesc},
            transfer::{Identity, Linear},
        },
        loom::{
            desc::Desc,
            engine::Engine,
            layout::{Block, Format},
        },
    };

    #[test]
    fn test_upsample_to_image() -> Result<(), Box<dyn Error>> {
        let mut graph = GraphBuilder::new(Engine::cpu()).block(Block::K8).build()?;

        let src = graph.alloc_activation(8, 2, 2)?;
        src.fill(|index| (index[1] * 10 + index[2] * 2 + index[3]) as f32);
        let up = graph.add_upsample(src)?;
        let image = graph.alloc(Desc::f32([4, 4, 3], Format::Hwc)?)?;
        graph.add_output_reorder(up, image.clone(), Arc::new(Identity))?;
        graph.execute();

        for (h, w, c) in iproduct!(0..4, 0..4, 0..3) {
            let expected = (c * 10 + (h / 2) * 2 + w / 2) as f32;
            assert_eq!(image.get(&[h, w, c]), expected);
        }
        assert_eq!(graph.len(), 2);
        assert!(matches!(graph.nodes()[0], AnyNode::Upsample(_)));
        Ok(())
    }

    #[test]
    fn test_weights_reorder() -> Result<(), Box<dyn Error>> {
        let mut graph = GraphBuilder::new(Engine::cpu()).block(Block::K16).build()?;

        let weights = graph.alloc(Desc::f32([5, 5, 3, 3], Format::Oihw)?)?;
        weights.fill(|_| 1.0);
        let padded = graph.add_weights_reorder(weights)?;

        assert_eq!(padded.dims().to_array(), Some([16, 16, 3, 3]));
        assert_eq!(padded.format(), Format::Oihw);
        let ones = padded.to_vec().iter().filter(|&&x| x == 1.0).count();
        assert_eq!(ones, 5 * 5 * 9);
        assert!(graph.is_empty());
        Ok(())
    }

    #[test]
    fn test_pipeline() -> Result<(), Box<dyn Error>> {
        fastrand::seed(42);
        for block in Block::ALL {
            let mut graph = GraphBuilder::new(Engine::cpu())
                .block(block)
                .threads(2)
                .alignment(4)
                .build()?;

            let color = graph.alloc(Desc::f32([6, 5, 3], Format::Hwc)?)?;
            color.fill(|_| fastrand::f32());
            let input = graph.add_input_reorder(vec![color.clone()], Arc::new(Linear::new(0.5)))?;
            assert_eq!(input.dims().to_array(), Some([1, 3, 8, 8]));

            // a 1x1 identity convolution on the first three channels
            let weights = graph.alloc(Desc::f32([3, 3, 1, 1], Format::Oihw)?)?;
            weights.fill(|index| if index[0] == index[1] { 2.0 } else { 0.0 });
            let bias = graph.alloc(Desc::f32([3], Format::X)?)?;
            let desc = ConvDesc {
                padding: [0, 0],
                ..ConvDesc::default().with_relu()
            };
            let conv = graph.add_conv(input, weights, bias, desc)?;

            let pool = graph.add_pool(conv, PoolDesc::default())?;
            let up = graph.add_upsample(pool)?;
            let image = graph.alloc(Desc::f32([6, 5, 3], Format::Hwc)?)?;
            graph.add_output_reorder(up, image.clone(), Arc::new(Linear::new(0.5)))?;
            assert_eq!(graph.len(), 5);

            graph.execute();
            let first = image.to_vec();
            graph.execute();
            assert_eq!(first, image.to_vec());

            for (h, w, c) in iproduct!(0..6, 0..5, 0..3) {
                let (y, x) = (h / 2 * 2, w / 2 * 2);
                let window = iproduct!(y..(y + 2).min(6), x..(x + 2).min(5))
                    .map(|(y, x)| color.get(&[y, x, c]))
                    .fold(0.0, f32::max);
                // forward halves, the convolution doubles, inverse doubles
                let expected = window * 2.0;
                let computed = image.get(&[h, w, c]);
                assert!((computed - expected).abs() < 1e-5, "{computed} != {expected}");
            }

            let usage = graph.memory_usage();
            let tensors = [
                6 * 5 * 3,
                block.k() * 8 * 8,
                block.k() * block.k(),
                block.k(),
                block.k() * 8 * 8,
                block.k() * 4 * 4,
                block.k() * 8 * 8,
                6 * 5 * 3,
            ];
            assert_eq!(usage, tensors.iter().sum::<usize>() * 4);
        }
        Ok(())
    }

    #[test]
    fn test_contract_errors() -> Result<(), Box<dyn Error>> {
        let mut graph = GraphBuilder::new(Engine::cpu()).build()?;
        let src = graph.alloc_activation(4, 4, 4)?;

        let weights = graph.alloc(Desc::f32([8, 3, 3, 3], Format::Oihw)?)?;
        let bias = graph.alloc(Desc::f32([8], Format::X)?)?;
        let err = graph.add_conv(src.clone(), weights, bias, ConvDesc::default());
        assert!(matches!(err, Err(GraphError::Node(NodeError::Shape { .. }))));

        let image = graph.alloc(Desc::f32([5, 4, 3], Format::Hwc)?)?;
        let err = graph.add_output_reorder(src.clone(), image, Arc::new(Identity));
        assert!(matches!(err, Err(GraphError::Node(NodeError::Exceeds { .. }))));

        assert!(matches!(
            GraphBuilder::new(Engine::cpu()).alignment(0).build(),
            Err(GraphError::Build(_))
        ));
        assert!(graph.is_empty());
        Ok(())
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_desc_from_json() -> Result<(), Box<dyn Error>> {
        use crate::hal::ops::{Activation, PoolKind};

        let desc: ConvDesc = serde_json::from_str(r#"{ "activation": "relu" }"#)?;
        assert_eq!(desc, ConvDesc::default().with_relu());

        let desc: PoolDesc = serde_json::from_str(r#"{ "kind": "average", "padding": [1, 1] }"#)?;
        assert_eq!(desc.kind, PoolKind::Average);
        assert_eq!(desc.kernel, [2, 2]);
        assert_eq!(desc.padding, [1, 1]);

        let desc: ConvDesc = serde_json::from_str(r#"{ "stride": [2, 2] }"#)?;
        assert_eq!(desc.activation, Activation::None);
        Ok(())
    }
}
