//! Analysis/synthesis window for the time stretcher

use crate::types::Sample;

/// Precomputed window coefficients, applied multiplicatively in place.
pub struct Window {
    coeffs: Vec<Sample>,
}

impl Window {
    /// Periodic Hann window of the given length.
    pub fn hann(len: usize) -> Self {
        let coeffs = (0..len)
            .map(|i| {
                let phase = 2.0 * std::f64::consts::PI * i as f64 / len as f64;
                (0.5 - 0.5 * phase.cos()) as Sample
            })
            .collect();
        Self { coeffs }
    }

    pub fn len(&self) -> usize {
        self.coeffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coeffs.is_empty()
    }

    /// Multiply `block` by the window. `block` must be at least as long as
    /// the window; excess samples are left untouched.
    pub fn cut(&self, block: &mut [Sample]) {
        for (sample, coeff) in block.iter_mut().zip(self.coeffs.iter()) {
            *sample *= coeff;
        }
    }
}
