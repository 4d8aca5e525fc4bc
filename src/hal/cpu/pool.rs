use std::borrow::Cow;

use crate::{
    hal::ops::{PoolKind, PoolNode},
    loom::{layout::Block, node::Node, platform::for_each_row, tensor::TensorRef},
};

impl PoolNode {
    fn execute_blocked<const K: usize>(&self) {
        debug_assert_eq!(K, self.block.k());

        let input = self.input;
        let output = self.output;
        let [kh, kw] = self.desc.kernel;
        let [sh, sw] = self.desc.stride;
        let [ph, pw] = self.desc.padding;
        let kind = self.desc.kind;

        let src = self.src.read();
        let mut dst = self.dst.write();

        for_each_row(&mut dst, output.row_len(), |row, out| {
            let (cb, oh) = (row / output.height, row % output.height);
            let rows = (oh * sh).saturating_sub(ph)..(oh * sh + kh).saturating_sub(ph).min(input.height);

            for (ow, cell) in out.chunks_exact_mut(K).enumerate() {
                let cols =
                    (ow * sw).saturating_sub(pw)..(ow * sw + kw).saturating_sub(pw).min(input.width);

                // window cells that fall on the zero padding are skipped
                let mut acc = match kind {
                    PoolKind::Max => [f32::NEG_INFINITY; K],
                    PoolKind::Average => [0.0; K],
                };
                let mut count = 0usize;
                for (ih, iw) in itertools::iproduct!(rows.clone(), cols.clone()) {
                    let base = input.cell(cb, ih, iw);
                    let lanes = &src[base..base + K];
                    match kind {
                        PoolKind::Max => acc.iter_mut().zip(lanes).for_each(|(a, &x)| *a = a.max(x)),
                        PoolKind::Average => acc.iter_mut().zip(lanes).for_each(|(a, &x)| *a += x),
                    }
                    count += 1;
                }

                match (kind, count) {
                    (_, 0) => cell.fill(0.0),
                    (PoolKind::Max, _) => cell.copy_from_slice(&acc),
                    (PoolKind::Average, count) => cell
                        .iter_mut()
                        .zip(acc)
                        .for_each(|(y, a)| *y = a / count as f32),
                }
            }
        });
    }
}

impl Node for PoolNode {
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

    fn execute(&self) {
        #[cfg(feature = "trace")]
        let _span = tracing::trace_span!("pool", src = %self.src.desc(), dst = %self.dst.desc())
            .entered();

        match self.block {
            Block::K8 => self.execute_blocked::<8>(),
            Block::K16 => self.execute_blocked::<16>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::iproduct;

    use crate::{
        hal::ops::{PoolDesc, PoolKind, PoolNode},
        loom::{
            desc::Desc,
            engine::Engine,
            layout::Block,
            node::Node,
            tensor::{Tensor, TensorRef},
        },
    };

    fn activation(block: Block, c: usize, h: usize, w: usize) -> Result<TensorRef, Box<dyn Error>> {
        let tensor = Tensor::zeros(&Engine::cpu(), Desc::activation(block, c, h, w)?)?;
        Ok(tensor.into_ref())
    }

    #[test]
    fn test_max_pool() -> Result<(), Box<dyn Error>> {
        for block in Block::ALL {
            let src = activation(block, 3, 4, 6)?;
            src.fill(|index| {
                let [_, c, h, w] = [index[0], index[1], index[2], index[3]];
                (c * 100 + h * 10 + w) as f32 - 50.0
            });
            let dst = activation(block, 3, 2, 3)?;
            dst.write().fill(f32::NAN);

            let node = PoolNode::new(block, PoolDesc::default(), src, dst.clone())?;
            node.execute();

            for (c, h, w) in iproduct!(0..3, 0..2, 0..3) {
                // the bottom-right cell of each 2x2 window holds the maximum
                let expected = (c * 100 + (2 * h + 1) * 10 + 2 * w + 1) as f32 - 50.0;
                assert_eq!(dst.get(&[0, c, h, w]), expected);
            }
            let padding = dst.to_vec().iter().filter(|&&x| x == 0.0).count();
            assert_eq!(padding, (block.k() - 3) * 2 * 3);
        }
        Ok(())
    }

    #[test]
    fn test_average_pool_with_padding() -> Result<(), Box<dyn Error>> {
        let block = Block::K8;
        let src = activation(block, 1, 3, 3)?;
        src.fill(|index| (index[2] * 3 + index[3] + 1) as f32);
        let dst = activation(block, 1, 2, 2)?;

        let desc = PoolDesc {
            kind: PoolKind::Average,
            kernel: [2, 2],
            stride: [2, 2],
            padding: [1, 1],
        };
        let node = PoolNode::new(block, desc, src, dst.clone())?;
        node.execute();

        // 1 2 3
        // 4 5 6
        // 7 8 9, windows clipped by one row and column of padding
        assert_eq!(dst.get(&[0, 0, 0, 0]), 1.0);
        assert_eq!(dst.get(&[0, 0, 0, 1]), 2.5);
        assert_eq!(dst.get(&[0, 0, 1, 0]), 5.5);
        assert_eq!(dst.get(&[0, 0, 1, 1]), 7.0);
        Ok(())
    }

    #[test]
    fn test_max_pool_negative() -> Result<(), Box<dyn Error>> {
        let block = Block::K16;
        let src = activation(block, 16, 2, 2)?;
        src.fill(|index| -1.0 - (index[1] + index[2] + index[3]) as f32);
        let dst = activation(block, 16, 1, 1)?;

        let node = PoolNode::new(block, PoolDesc::default(), src, dst.clone())?;
        node.execute();
        for c in 0..16 {
            assert_eq!(dst.get(&[0, c, 0, 0]), -1.0 - c as f32);
        }
        Ok(())
    }
}
