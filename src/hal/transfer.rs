/// Maps radiance into the range the network was trained on, and back.
pub trait TransferFunction: std::fmt::Debug + Send + Sync {
    fn forward(&self, x: f32) -> f32;
    fn inverse(&self, y: f32) -> f32;
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Identity;

impl TransferFunction for Identity {
    #[inline]
    fn forward(&self, x: f32) -> f32 {
        x
    }

    #[inline]
    fn inverse(&self, y: f32) -> f32 {
        y
    }
}

/// Scales by a constant, e.g. an exposure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Linear {
    scale: f32,
}

impl Linear {
    /// # Panics
    /// Panics if `scale` is not positive and finite.
    pub fn new(scale: f32) -> Self {
        assert!(
            scale.is_finite() && scale > 0.0,
            "transfer scale must be positive and finite, got {scale}"
        );
        Self { scale }
    }

    #[inline]
    pub fn scale(&self) -> f32 {
        self.scale
    }
}

impl Default for Linear {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl TransferFunction for Linear {
    #[inline]
    fn forward(&self, x: f32) -> f32 {
        x * self.scale
    }

    #[inline]
    fn inverse(&self, y: f32) -> f32 {
        y / self.scale
    }
}

#[cfg(test)]
mod tests {
    use super::{Identity, Linear, TransferFunction};

    #[test]
    fn test_linear() {
        let f = Linear::new(4.0);
        assert_eq!(f.forward(0.5), 2.0);
        assert_eq!(f.inverse(2.0), 0.5);
        assert_eq!(Identity.inverse(0.25), 0.25);
    }

    #[test]
    #[should_panic]
    fn test_linear_rejects_zero() {
        Linear::new(0.0);
    }
}
