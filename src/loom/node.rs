use std::borrow::Cow;

use super::tensor::TensorRef;

/// A unit of computation in an execution graph.
///
/// A node holds shared handles to the tensors it reads and to the tensor it writes. `execute`
/// recomputes the whole output from the current inputs, so running it twice is harmless.
pub trait Node: Send + Sync {
    /// Name of the node, for logging.
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        Cow::from(std::any::type_name::<Self>())
    }

    /// Tensors read by the node.
    fn inputs(&self) -> Vec<TensorRef>;

    /// Tensor written by the node, if any.
    fn output(&self) -> Option<TensorRef>;

    /// Overwrites the output from the inputs.
    fn execute(&self);
}
