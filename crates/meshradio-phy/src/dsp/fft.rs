use std::sync::Arc;

use meshradio_core::dsp_types::{ComplexSample, RealSample};
use num::Zero;

/// An FFT plan with its own input and output buffers.
///
/// `execute` leaves the input buffer intact so overlap-save callers can
/// reuse the tail of the previous input block.
pub struct Fft {
    plan: Arc<dyn rustfft::Fft<RealSample>>,
    scratch: Vec<ComplexSample>,
    pub in_buf: Vec<ComplexSample>,
    pub out_buf: Vec<ComplexSample>,
}

impl Fft {
    pub fn forward(planner: &mut rustfft::FftPlanner<RealSample>, n: usize) -> Self {
        Self::with_plan(planner.plan_fft_forward(n), n)
    }

    pub fn inverse(planner: &mut rustfft::FftPlanner<RealSample>, n: usize) -> Self {
        Self::with_plan(planner.plan_fft_inverse(n), n)
    }

    fn with_plan(plan: Arc<dyn rustfft::Fft<RealSample>>, n: usize) -> Self {
        let scratch_len = plan.get_inplace_scratch_len();

        Self {
            plan,
            scratch: vec![ComplexSample::zero(); scratch_len],
            in_buf: vec![ComplexSample::zero(); n],
            out_buf: vec![ComplexSample::zero(); n],
        }
    }

    pub fn len(&self) -> usize {
        self.in_buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_buf.is_empty()
    }

    /// Transform `in_buf` into `out_buf`
    pub fn execute(&mut self) {
        self.out_buf.copy_from_slice(&self.in_buf);
        self.plan.process_with_scratch(&mut self.out_buf, &mut self.scratch);
    }

    /// Transform an arbitrary buffer in place
    pub fn execute_in_place(&mut self, buf: &mut [ComplexSample]) {
        self.plan.process_with_scratch(buf, &mut self.scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_inverse_roundtrip() {
        let mut planner = rustfft::FftPlanner::new();
        let n = 64;
        let mut fwd = Fft::forward(&mut planner, n);
        let mut inv = Fft::inverse(&mut planner, n);

        for (i, x) in fwd.in_buf.iter_mut().enumerate() {
            *x = ComplexSample::new((i as f32 * 0.3).sin(), (i as f32 * 0.7).cos());
        }

        let original = fwd.in_buf.clone();

        fwd.execute();
        // Input preserved for overlap reuse
        assert_eq!(fwd.in_buf, original);

        inv.in_buf.copy_from_slice(&fwd.out_buf);
        inv.execute();

        // rustfft is unnormalized in both directions
        for (x, y) in original.iter().zip(inv.out_buf.iter()) {
            let y = y / n as f32;

            assert!((x - y).norm() < 1e-5);
        }
    }
}
