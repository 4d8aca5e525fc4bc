//! Channel-blocked tensors and CPU inference nodes for a convolutional image denoiser.
//!
//! [`loom`] holds layouts, descriptors and tensors; [`hal`] holds the nodes and the graph.

pub mod hal;
pub mod loom;
