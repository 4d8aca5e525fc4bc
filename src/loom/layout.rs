use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Rounds `value` up to the next multiple of `k`.
#[inline]
pub const fn pad_to(value: usize, k: usize) -> usize {
    value.div_ceil(k) * k
}

/// Channel blocking factor of a blocked layout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Block {
    #[default]
    #[display("8")]
    K8,
    #[display("16")]
    K16,
}

impl Block {
    pub const ALL: [Block; 2] = [Block::K8, Block::K16];

    /// Number of channel lanes stored contiguously per spatial cell.
    #[inline]
    pub const fn k(self) -> usize {
        match self {
            Block::K8 => 8,
            Block::K16 => 16,
        }
    }

    /// The smallest multiple of `K` that is not less than `channels`.
    #[inline]
    pub const fn pad(self, channels: usize) -> usize {
        pad_to(channels, self.k())
    }

    /// Number of channel blocks needed to hold `channels`.
    #[inline]
    pub const fn count(self, channels: usize) -> usize {
        channels.div_ceil(self.k())
    }

    /// The `nChwKc` activation format of this blocking factor.
    pub const fn activations(self) -> Format {
        match self {
            Block::K8 => Format::NChw8c,
            Block::K16 => Format::NChw16c,
        }
    }

    /// The `OIhwKiKo` weight format of this blocking factor.
    pub const fn weights(self) -> Format {
        match self {
            Block::K8 => Format::OIhw8i8o,
            Block::K16 => Format::OIhw16i16o,
        }
    }
}

/// Memory layout tag: axis order plus channel blocking.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Format {
    /// No layout; only valid on the undefined descriptor.
    #[default]
    #[display("undef")]
    Undef,
    /// Layout not chosen yet.
    #[display("any")]
    Any,
    /// Plain row-major of any rank.
    #[display("blocked")]
    Blocked,
    #[display("x")]
    X,
    /// Interleaved image, `[height, width, channels]`.
    #[display("hwc")]
    Hwc,
    #[display("nChw8c")]
    NChw8c,
    #[display("nChw16c")]
    NChw16c,
    #[display("oihw")]
    Oihw,
    #[display("OIhw8i8o")]
    OIhw8i8o,
    #[display("OIhw16i16o")]
    OIhw16i16o,
}

impl Format {
    /// Returns `true` unless the format is a placeholder.
    #[inline]
    pub const fn is_defined(self) -> bool {
        !matches!(self, Format::Undef | Format::Any)
    }

    /// The rank this format requires, if it fixes one.
    pub const fn rank(self) -> Option<usize> {
        match self {
            Format::Undef | Format::Any | Format::Blocked => None,
            Format::X => Some(1),
            Format::Hwc => Some(3),
            Format::NChw8c
            | Format::NChw16c
            | Format::Oihw
            | Format::OIhw8i8o
            | Format::OIhw16i16o => Some(4),
        }
    }

    /// The blocking factor of a channel-blocked format.
    pub const fn block(self) -> Option<Block> {
        match self {
            Format::NChw8c | Format::OIhw8i8o => Some(Block::K8),
            Format::NChw16c | Format::OIhw16i16o => Some(Block::K16),
            _ => None,
        }
    }

    /// Returns `true` for the `nChwKc` activation formats.
    #[inline]
    pub const fn is_activation(self) -> bool {
        matches!(self, Format::NChw8c | Format::NChw16c)
    }

    /// Number of elements a buffer of this format needs for `dims`, including channel padding.
    pub fn size(self, dims: &[usize]) -> usize {
        if !self.is_defined() {
            return 0;
        }
        let spatial = |from: usize| dims.iter().skip(from).product::<usize>();
        match (self.block(), self.is_activation()) {
            (Some(block), true) => dims[0] * block.pad(dims[1]) * spatial(2),
            (Some(block), false) => block.pad(dims[0]) * block.pad(dims[1]) * spatial(2),
            (None, _) => dims.iter().product(),
        }
    }

    /// Like [`Format::size`], but `None` if the element count does not fit in `usize`.
    pub fn checked_size(self, dims: &[usize]) -> Option<usize> {
        if !self.is_defined() {
            return Some(0);
        }
        let product = |dims: &[usize]| dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
        let pad = |block: Block, c: usize| c.div_ceil(block.k()).checked_mul(block.k());
        match (self.block(), self.is_activation()) {
            (Some(block), true) => dims[0]
                .checked_mul(pad(block, dims[1])?)?
                .checked_mul(product(&dims[2..])?),
            (Some(block), false) => pad(block, dims[0])?
                .checked_mul(pad(block, dims[1])?)?
                .checked_mul(product(&dims[2..])?),
            (None, _) => product(dims),
        }
    }

    /// Linear element address of the logical coordinate `index`.
    ///
    /// For `nChwKc` with `N = 1` this is
    /// `(c / K) * H * W * K + h * W * K + w * K + c % K`.
    ///
    /// # Panics
    /// Panics if the format is a placeholder, or if `index` is out of bounds of `dims`.
    pub fn offset(self, dims: &[usize], index: &[usize]) -> usize {
        assert!(self.is_defined(), "cannot address a tensor of format {self}");
        assert_eq!(dims.len(), index.len(), "index rank must match dims rank");
        assert!(
            index.iter().zip(dims).all(|(i, d)| i < d),
            "index {index:?} is out of bounds for dims {dims:?}"
        );

        match (self.block(), self.is_activation()) {
            (Some(block), true) => {
                let k = block.k();
                let (n, c) = (index[0], index[1]);
                let cells = row_major(&dims[2..], &[]);
                let cell = row_major(&dims[2..], &index[2..]);
                ((n * block.count(dims[1]) + c / k) * cells + cell) * k + c % k
            }
            (Some(block), false) => {
                let k = block.k();
                let (o, i) = (index[0], index[1]);
                let cells = row_major(&dims[2..], &[]);
                let cell = row_major(&dims[2..], &index[2..]);
                ((o / k * block.count(dims[1]) + i / k) * cells + cell) * k * k + (i % k) * k + o % k
            }
            (None, _) => row_major(dims, index),
        }
    }
}

/// Row-major offset of `index` within `dims`; with an empty `index`, the element count of `dims`.
fn row_major(dims: &[usize], index: &[usize]) -> usize {
    match index.is_empty() {
        true => dims.iter().product(),
        false => index.iter().zip(dims).fold(0, |acc, (&i, &d)| acc * d + i),
    }
}

/// Geometry of a single-image `nChwKc` tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBlocked {
    pub k: usize,
    pub blocks: usize,
    pub height: usize,
    pub width: usize,
}

impl ChannelBlocked {
    #[inline]
    pub const fn new(block: Block, channels: usize, height: usize, width: usize) -> Self {
        Self {
            k: block.k(),
            blocks: block.count(channels),
            height,
            width,
        }
    }

    /// Padded channel count.
    #[inline]
    pub const fn channels(&self) -> usize {
        self.blocks * self.k
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.blocks * self.height * self.width * self.k
    }

    /// Number of rows, one per `(block, h)` pair.
    #[inline]
    pub const fn rows(&self) -> usize {
        self.blocks * self.height
    }

    /// Elements in one `(block, h)` row.
    #[inline]
    pub const fn row_len(&self) -> usize {
        self.width * self.k
    }

    /// Address of the first lane of the cell `(cb, h, w)`.
    #[inline]
    pub const fn cell(&self, cb: usize, h: usize, w: usize) -> usize {
        ((cb * self.height + h) * self.width + w) * self.k
    }

    #[inline]
    pub const fn offset(&self, c: usize, h: usize, w: usize) -> usize {
        self.cell(c / self.k, h, w) + c % self.k
    }
}

#[cfg(test)]
mod tests {
    use itertools::iproduct;

    use super::{Block, ChannelBlocked, Format, pad_to};

    #[test]
    fn test_padding() {
        for block in Block::ALL {
            let k = block.k();
            for c in 1..=64 {
                let padded = block.pad(c);
                assert!(padded >= c);
                assert_eq!(padded % k, 0);
                assert!(padded - c < k, "{padded} is not the smallest multiple of {k} >= {c}");
                if c % k == 0 {
                    assert_eq!(padded, c);
                }
                assert_eq!(block.count(c) * k, padded);
            }
        }
        assert_eq!(pad_to(3, 8), 8);
        assert_eq!(pad_to(17, 16), 32);
    }

    #[test]
    fn test_activation_offset() {
        let dims = [1, 19, 3, 5];
        for block in Block::ALL {
            let k = block.k();
            let format = block.activations();
            let geometry = ChannelBlocked::new(block, 19, 3, 5);
            assert_eq!(format.size(&dims), geometry.size());
            assert_eq!(format.size(&dims), block.pad(19) * 3 * 5);

            let mut seen = vec![false; format.size(&dims)];
            for (c, h, w) in iproduct!(0..19, 0..3, 0..5) {
                let offset = format.offset(&dims, &[0, c, h, w]);
                assert_eq!(offset, (c / k) * 3 * 5 * k + h * 5 * k + w * k + c % k);
                assert_eq!(offset, geometry.offset(c, h, w));
                assert!(!seen[offset]);
                seen[offset] = true;
            }
            // only the padding lanes remain unaddressed
            let padding = seen.iter().filter(|x| !**x).count();
            assert_eq!(padding, (block.pad(19) - 19) * 3 * 5);
        }
    }

    #[test]
    fn test_weight_offset() {
        let dims = [10, 3, 3, 3];
        let format = Format::OIhw8i8o;
        assert_eq!(format.size(&dims), 16 * 8 * 9);
        assert_eq!(format.offset(&dims, &[0, 0, 0, 0]), 0);
        assert_eq!(format.offset(&dims, &[1, 0, 0, 0]), 1);
        assert_eq!(format.offset(&dims, &[0, 1, 0, 0]), 8);
        assert_eq!(format.offset(&dims, &[0, 0, 0, 1]), 64);
        assert_eq!(format.offset(&dims, &[9, 2, 2, 2]), (9 * 64 + 8 * 64) + 2 * 8 + 1);

        let plain = Format::Oihw;
        assert_eq!(plain.size(&dims), 10 * 3 * 9);
        assert_eq!(plain.offset(&dims, &[1, 2, 0, 1]), 27 + 18 + 1);
    }

    #[test]
    fn test_format_rank() {
        assert_eq!(Format::X.rank(), Some(1));
        assert_eq!(Format::Hwc.rank(), Some(3));
        assert_eq!(Format::NChw16c.rank(), Some(4));
        assert_eq!(Format::Blocked.rank(), None);
        assert_eq!(Format::Any.size(&[1, 8, 2, 2]), 0);
        assert_eq!(Block::K16.activations().block(), Some(Block::K16));
        assert_eq!(Block::K8.weights().block(), Some(Block::K8));
        assert_eq!(Format::NChw8c.to_string(), "nChw8c");
    }

    #[test]
    fn test_checked_size() {
        let dims = [1, 19, 3, 5];
        for format in [Format::NChw8c, Format::NChw16c, Format::OIhw8i8o, Format::Oihw] {
            assert_eq!(format.checked_size(&dims), Some(format.size(&dims)));
        }
        assert_eq!(Format::Any.checked_size(&dims), Some(0));
        assert_eq!(Format::NChw16c.checked_size(&[1, usize::MAX, 1, 1]), None);
        assert_eq!(Format::Blocked.checked_size(&[usize::MAX, 2]), None);
        assert_eq!(Format::OIhw8i8o.checked_size(&[1 << 40, 1 << 40, 1, 1]), None);
    }

    #[test]
    #[should_panic]
    fn test_offset_out_of_bounds() {
        Format::NChw8c.offset(&[1, 3, 2, 2], &[0, 3, 0, 0]);
    }
}
