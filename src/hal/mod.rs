//! The `hal` module holds the operators of the denoising network and the graph that runs them.
//!
//! ## Key Components
//! 1. **Nodes** (`ops`):
//!    - Convolution, pooling and upsampling over channel-blocked activations.
//!    - Reorders between plain images or weights and the blocked layouts.
//!    - Every contract between a node and its tensors is checked when the node is built.
//!
//! 2. **Kernels** (`cpu`):
//!    - Row-parallel implementations of [`Node::execute`](crate::loom::node::Node::execute).
//!
//! 3. **Graph** (`graph`):
//!    - Allocates intermediate tensors, pads weights once and runs nodes in order.

mod cpu;
pub mod graph;
pub mod ops;
pub mod transfer;
