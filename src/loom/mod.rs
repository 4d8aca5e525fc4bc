//! The `loom` module provides the foundations the operators are built on.
//!
//! ## Key Components
//! 1. **Layouts**:
//!    - Layout tags (`Format`) and blocking factors (`Block`).
//!    - Padded sizes and linear addresses of logical coordinates in blocked storage.
//!
//! 2. **Descriptors**:
//!    - `Desc` describes shape, element type and layout, independent of storage.
//!    - `MemoryDesc` is the fixed-size raw record exchanged with C callers.
//!
//! 3. **Tensors**:
//!    - `Tensor` owns a buffer sized by its descriptor, padding included.
//!    - `TensorRef` shares one tensor between a producer node and its consumers.
//!
//! 4. **Execution**:
//!    - The `Node` trait every operator implements.
//!    - Row-parallel loops over destination buffers.

pub mod desc;
pub mod engine;
pub mod layout;
pub mod node;
pub mod num;
pub mod platform;
pub mod tensor;
