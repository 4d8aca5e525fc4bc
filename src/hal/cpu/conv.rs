use std::borrow::Cow;

use wide::f32x8;

use crate::{
    hal::ops::{Activation, ConvNode},
    loom::{
        layout::{Block, Format},
        node::Node,
        platform::for_each_row,
        tensor::TensorRef,
    },
};

/// Lanes of one SIMD vector.
const LANES: usize = 8;

impl ConvNode {
    /// Direct convolution with `G` vectors of accumulators per output cell, i.e. `K = 8G`.
    fn execute_blocked<const G: usize>(&self) {
        let k = G * LANES;
        debug_assert_eq!(k, self.block.k());

        let input = self.input;
        let output = self.output;
        let [kh, kw] = self.kernel;
        let [sh, sw] = self.desc.stride;
        let [ph, pw] = self.desc.padding;
        let relu = matches!(self.desc.activation, Activation::Relu);
        let cells = kh * kw;

        let src = self.src.read();
        let weights = self.weights.read();
        let bias = self.bias.read();
        let mut dst = self.dst.write();

        // address of the weight vector for output block `ocb`, input channel `ic` and kernel
        // cell `cell`, plus the stride between consecutive output lanes
        let blocked = self.weights.format() == self.block.weights();
        let ic_total = input.channels();
        let locate = |ocb: usize, ic: usize, cell: usize| -> (usize, usize) {
            match blocked {
                true => (
                    ((ocb * input.blocks + ic / k) * cells + cell) * k * k + (ic % k) * k,
                    1,
                ),
                false => ((ocb * k * ic_total + ic) * cells + cell, ic_total * cells),
            }
        };
        let load = |base: usize, step: usize| -> f32x8 {
            match step {
                1 => {
                    let mut lanes = [0.0; LANES];
                    lanes.copy_from_slice(&weights[base..base + LANES]);
                    f32x8::new(lanes)
                }
                _ => f32x8::new(std::array::from_fn(|lane| weights[base + lane * step])),
            }
        };

        for_each_row(&mut dst, output.row_len(), |row, out| {
            let (ocb, oh) = (row / output.height, row % output.height);
            let init: [f32x8; G] = std::array::from_fn(|g| {
                let base = ocb * k + g * LANES;
                let mut lanes = [0.0; LANES];
                lanes.copy_from_slice(&bias[base..base + LANES]);
                f32x8::new(lanes)
            });

            for (ow, cell) in out.chunks_exact_mut(k).enumerate() {
                let mut acc = init;

                for (y, x) in itertools::iproduct!(0..kh, 0..kw) {
                    let Some(ih) = (oh * sh + y).checked_sub(ph).filter(|&h| h < input.height)
                    else {
                        continue;
                    };
                    let Some(iw) = (ow * sw + x).checked_sub(pw).filter(|&w| w < input.width)
                    else {
                        continue;
                    };

                    for icb in 0..input.blocks {
                        let base = input.cell(icb, ih, iw);
                        for (lane, &value) in src[base..base + k].iter().enumerate() {
                            let value = f32x8::splat(value);
                            let (address, step) = locate(ocb, icb * k + lane, y * kw + x);
                            for (g, acc) in acc.iter_mut().enumerate() {
                                let w = load(address + g * LANES * step, step);
                                *acc = value.mul_add(w, *acc);
                            }
                        }
                    }
                }

                for (g, acc) in acc.into_iter().enumerate() {
                    let acc = match relu {
                        true => acc.max(f32x8::ZERO),
                        false => acc,
                    };
                    cell[g * LANES..(g + 1) * LANES].copy_from_slice(&acc.to_array());
                }
            }
        });
    }
}

impl Node for ConvNode {
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        Cow::from(Self::NAME)
    }

    fn inputs(&self) -> Vec<TensorRef> {
        vec![self.src.clone(), self.weights.clone(), self.bias.clone()]
    }

    fn output(&self) -> Option<TensorRef> {
        Some(self.dst.clone())
    }

    fn execute(&self) {
        #[cfg(feature = "trace")]
        let _span = tracing::trace_span!("conv", src = %self.src.desc(), dst = %self.dst.desc())
            .entered();

        debug_assert!(matches!(
            self.weights.format(),
            Format::Oihw | Format::OIhw8i8o | Format::OIhw16i16o
        ));
        match self.block {
            Block::K8 => self.execute_blocked::<1>(),
            Block::K16 => self.execute_blocked::<2>(),
        }
    }
}
