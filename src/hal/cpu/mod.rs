//! CPU kernels of the nodes in [`crate::hal::ops`].

mod conv;
mod pool;
mod reorder;
mod upsample;
