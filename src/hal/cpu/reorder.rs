use std::borrow::Cow;

use itertools::iproduct;

use crate::{
    hal::ops::{InputReorderNode, OutputReorderNode, WeightsReorderNode},
    loom::{node::Node, platform::for_each_row, tensor::TensorRef},
};

/// Replaces non-finite and negative samples with zero.
#[inline]
fn sanitize(x: f32) -> f32 {
    match x.is_finite() {
        true => x.max(0.0),
        false => 0.0,
    }
}

impl Node for WeightsReorderNode {
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
        let _span = tracing::trace_span!(
            "weights_reorder",
            src = %self.src.desc(),
            dst = %self.dst.desc()
        )
        .entered();

        let [oc, ic, h, w] = self.src_dims;
        let dst_format = self.dst.format();

        let src = self.src.read();
        let mut dst = self.dst.write();
        dst.fill(0.0);

        // the source is dense `oihw`, so its elements come in iteration order
        for (value, (o, i, y, x)) in src.iter().zip(iproduct!(0..oc, 0..ic, 0..h, 0..w)) {
            dst[dst_format.offset(&self.dst_dims, &[o, i, y, x])] = *value;
        }
    }
}

impl Node for InputReorderNode {
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        Cow::from(Self::NAME)
    }

    fn inputs(&self) -> Vec<TensorRef> {
        self.srcs.clone()
    }

    fn output(&self) -> Option<TensorRef> {
        Some(self.dst.clone())
    }

    fn execute(&self) {
        #[cfg(feature = "trace")]
        let _span = tracing::trace_span!("input_reorder", dst = %self.dst.desc()).entered();

        let output = self.output;
        let k = output.k;
        let [height, width] = self.image;

        let srcs = self.srcs.iter().map(|src| src.read()).collect::<Vec<_>>();
        let strides = self.srcs.iter().map(|src| src.dims()[2]).collect::<Vec<_>>();
        let transfer = self.transfer.as_ref();
        let mut dst = self.dst.write();

        for_each_row(&mut dst, output.row_len(), |row, out| {
            let (cb, h) = (row / output.height, row % output.height);
            out.fill(0.0);
            if h >= height {
                return;
            }

            for (lane, &(image, channel)) in self.channels.iter().skip(cb * k).take(k).enumerate() {
                let stride = strides[image];
                let src = &srcs[image][h * width * stride..(h + 1) * width * stride];
                for (w, pixel) in src.chunks_exact(stride).enumerate() {
                    let x = pixel[channel];
                    out[w * k + lane] = match image {
                        0 => transfer.forward(sanitize(x)),
                        _ if x.is_finite() => x,
                        _ => 0.0,
                    };
                }
            }
        });
    }
}

impl Node for OutputReorderNode {
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

    /// Writes `inverse(sanitize(x))` for the first three channels of every pixel of the image.
    fn execute(&self) {
        #[cfg(feature = "trace")]
        let _span = tracing::trace_span!(
            "output_reorder",
            src = %self.src.desc(),
            dst = %self.dst.desc()
        )
        .entered();

        let input = self.input;
        let [_, width, channels] = self.image;
        let transfer = self.transfer.as_ref();

        let src = self.src.read();
        let mut dst = self.dst.write();

        // the source has a single channel block, so a row of it is a row of pixels
        for_each_row(&mut dst, width * channels, |h, out| {
            for (w, pixel) in out.chunks_exact_mut(channels).enumerate() {
                let base = input.cell(0, h, w);
                for (y, &x) in pixel.iter_mut().zip(&src[base..base + channels]) {
                    *y = transfer.inverse(sanitize(x));
                }
            }
        });
    }
}
