use std::borrow::Cow;

use crate::{
    hal::ops::UpsampleNode,
    loom::{node::Node, platform::for_each_row, tensor::TensorRef},
};

impl Node for UpsampleNode {
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        Cow::from(Self::NAME)
    }

    fn inputs(&self) -> Vec<TensorRef> {
        vec![self.src.clone()]
    }

    fn output(&self) -> Option<TensorRef> {
        Some(self.dst.clone())
    }

    /// Every source cell `(h, w)` lands on the four destination cells `(2h + i, 2w + j)`.
    fn execute(&self) {
        #[cfg(feature = "trace")]
        let _span =
            tracing::trace_span!("upsample", src = %self.src.desc(), dst = %self.dst.desc())
                .entered();

        let input = self.input;
        let k = input.k;

        let src = self.src.read();
        let mut dst = self.dst.write();

        // one task per pair of destination rows sharing a source row
        for_each_row(&mut dst, 2 * self.output.row_len(), |row, out| {
            let (cb, h) = (row / input.height, row % input.height);
            let base = input.cell(cb, h, 0);
            let src = &src[base..base + input.row_len()];

            let (top, bottom) = out.split_at_mut(out.len() / 2);
            for (cell, pair) in src.chunks_exact(k).zip(top.chunks_exact_mut(2 * k)) {
                pair[..k].copy_from_slice(cell);
                pair[k..].copy_from_slice(cell);
            }
            bottom.copy_from_slice(top);
        });
    }
}
