use meshradio_core::dsp_types::{ComplexSample, RealSample};
use num::Zero;

use super::fft::Fft;
use super::DspError;

/// Overlap-save block geometry shared by the frequency-domain resamplers.
///
/// The filter length `p` and overlap factor `v` fix the FFT size
/// `N = v*(p-1)`, the overlap `O = p-1`, and the block stride `L = N - O`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResamplerParams {
    /// Filter length
    pub p: usize,
    /// Overlap factor
    pub v: usize,
}

impl ResamplerParams {
    /// FFT size
    pub const fn n(&self) -> usize {
        self.v * (self.p - 1)
    }

    /// FFT overlap
    pub const fn o(&self) -> usize {
        self.p - 1
    }

    /// New samples consumed per block
    pub const fn l(&self) -> usize {
        self.n() - self.o()
    }
}

impl Default for ResamplerParams {
    fn default() -> Self {
        Self { p: 8001, v: 8 }
    }
}

/// An overlap-save frequency-domain upsampler.
///
/// Interpolates by `i`, compensates for a modulator oversample factor `x`,
/// and shifts the signal by `theta` (normalized frequency) by rotating FFT
/// bins. Each processed block yields `N` frequency-domain samples whose
/// inverse transform carries `L` new time-domain samples; the caller
/// accumulates the emitted blocks into its frequency-domain buffer.
pub struct FDUpsampler {
    pub params: ResamplerParams,

    /// Oversample factor
    pub x: usize,

    /// Interpolation factor
    pub i: usize,

    /// Number of bins to rotate
    nrot: usize,

    /// Forward FFT over input blocks, of size `x*N/i`
    fft: Fft,

    /// The assembled output block, of size `N`
    block_buf: Vec<ComplexSample>,

    /// Offset into the FFT input at which to place new data
    pub fftoff: usize,
}

impl FDUpsampler {
    pub fn new(params: ResamplerParams, x: usize, i: usize, theta: f64) -> Result<Self, DspError> {
        let n = params.n();
        let bins = n as f64 * theta;

        if (bins - bins.round()).abs() > 1e-10 {
            return Err(DspError::FractionalBinShift { bins });
        }
        if n % i != 0 {
            return Err(DspError::RateDoesNotDivideFft { rate: i, fft_size: n });
        }

        let mut nrot = bins.round() as isize;
        if nrot < 0 {
            nrot += n as isize;
        }

        let mut planner = rustfft::FftPlanner::new();
        let mut upsampler = Self {
            params,
            x,
            i,
            nrot: nrot as usize,
            fft: Fft::forward(&mut planner, x * n / i),
            block_buf: vec![ComplexSample::zero(); n],
            fftoff: 0,
        };

        upsampler.reset(0);
        Ok(upsampler)
    }

    /// The number of upsampled output samples `count` input samples produce
    pub fn upsampled_size(&self, count: usize) -> usize {
        self.i * count / self.x
    }

    /// Reset the upsampler state.
    ///
    /// The first `offset` input samples' worth of output will be zero.
    pub fn reset(&mut self, offset: usize) {
        let oi = self.x * self.params.o() / self.i;

        self.fftoff = oi + offset;

        let fftoff = self.fftoff.min(self.fft.len());
        self.fft.in_buf[..fftoff].fill(ComplexSample::zero());
    }

    /// Number of output samples pending in the FFT buffer
    pub fn npending(&self) -> usize {
        let n = self.i * self.fftoff / self.x;
        let o = self.params.o();

        if n > o {
            n - o
        } else {
            0
        }
    }

    pub fn save_fft_offset(&self) -> usize {
        self.fftoff
    }

    pub fn restore_fft_offset(&mut self, fftoff: usize) {
        self.fftoff = fftoff;
    }

    /// Copy the scaled input spectrum into the output block, upsampling and
    /// frequency-shifting by rotating bins. Bins that exist only because of
    /// modulator oversampling are not copied.
    fn upsample_block(
        params: ResamplerParams,
        x: usize,
        i: usize,
        nrot: usize,
        fft_out: &[ComplexSample],
        block: &mut [ComplexSample],
    ) {
        let n_fft = params.n();
        let ni = x * n_fft / i;
        // Input block size, not counting oversampling
        let n = n_fft / i;

        block.fill(ComplexSample::zero());

        // N is always even, so the bin at the Nyquist frequency is split
        // between the top of the positive and the bottom of the negative
        // frequencies
        let temp = fft_out[n / 2] / 2.0;

        for j in 0..n / 2 {
            block[(nrot + j) % n_fft] = fft_out[j];
        }
        for (k, j) in (ni - n / 2 + 1..ni).enumerate() {
            block[(nrot + n_fft - n / 2 + 1 + k) % n_fft] = fft_out[j];
        }

        block[(nrot + n / 2) % n_fft] += temp;
        block[(nrot + n_fft - n / 2) % n_fft] = temp;
    }

    /// Incrementally upsample time-domain data into frequency-domain blocks.
    ///
    /// `emit` is called with each completed `N`-bin block and the number of
    /// new time-domain samples it carries; it returns whether upsampling
    /// should continue. When `flush` is set, a trailing partial block is
    /// zero-filled and emitted. Returns the offset of the first unconsumed
    /// input sample.
    pub fn upsample<F>(&mut self, input: &[ComplexSample], g: RealSample, flush: bool, mut emit: F) -> usize
    where
        F: FnMut(&[ComplexSample], usize) -> bool,
    {
        let ni = self.x * self.params.n() / self.i;
        let li = self.x * self.params.l() / self.i;
        let o = self.params.o();
        let l = self.params.l();
        let count = input.len();
        let mut inoff = 0usize;

        // Incorporates the requested gain and scaling compensation for the
        // FFT
        let k = g / ni as RealSample;

        // Allow inoff == count so the upsampler can be flushed without
        // requiring additional samples
        while inoff <= count {
            let avail = count - inoff;
            let partial = self.fftoff + avail < ni;

            if partial {
                self.fft.in_buf[self.fftoff..self.fftoff + avail]
                    .copy_from_slice(&input[inoff..inoff + avail]);

                // Unless we are flushing, wait for a full block
                if !flush {
                    inoff += avail;
                    self.fftoff += avail;
                    return inoff;
                }

                self.fft.in_buf[self.fftoff + avail..].fill(ComplexSample::zero());
            } else {
                self.fft.in_buf[self.fftoff..ni]
                    .copy_from_slice(&input[inoff..inoff + ni - self.fftoff]);
            }

            self.fft.execute();

            for v in &mut self.fft.out_buf {
                *v *= k;
            }

            Self::upsample_block(
                self.params,
                self.x,
                self.i,
                self.nrot,
                &self.fft.out_buf,
                &mut self.block_buf,
            );

            if partial {
                inoff += avail;
                self.fftoff += avail;

                emit(
                    &self.block_buf,
                    (self.i * self.fftoff / self.x).saturating_sub(o),
                );
                break;
            } else if self.fftoff <= li {
                // The FFT buffer held at most Li samples, so the overlap for
                // the next block comes from the input buffer
                inoff += li - self.fftoff;
                self.fftoff = 0;

                if !emit(&self.block_buf, l) {
                    break;
                }
            } else {
                // Reuse part of the current FFT buffer for the overlap
                self.fft.in_buf.copy_within(li..ni, 0);
                self.fftoff -= li;

                if !emit(&self.block_buf, l) {
                    break;
                }
            }
        }

        inoff
    }

    /// Re-emit the most recent FFT output block
    pub fn copy_fft_out(&mut self) -> &[ComplexSample] {
        Self::upsample_block(
            self.params,
            self.x,
            self.i,
            self.nrot,
            &self.fft.out_buf,
            &mut self.block_buf,
        );

        &self.block_buf
    }
}

/// Converts accumulated frequency-domain blocks back to the time domain
pub struct ToTimeDomain {
    params: ResamplerParams,
    ifft: Fft,
}

impl ToTimeDomain {
    pub fn new(params: ResamplerParams) -> Self {
        let mut planner = rustfft::FftPlanner::new();

        Self {
            params,
            ifft: Fft::inverse(&mut planner, params.n()),
        }
    }

    /// Transform whole `N`-bin blocks, appending `L` time-domain samples per
    /// block to `out`. Returns the number of samples produced.
    pub fn to_time_domain(&mut self, fd: &[ComplexSample], out: &mut Vec<ComplexSample>) -> usize {
        let n = self.params.n();
        let o = self.params.o();
        let mut produced = 0;

        for block in fd.chunks_exact(n) {
            self.ifft.in_buf.copy_from_slice(block);
            self.ifft.execute();
            out.extend_from_slice(&self.ifft.out_buf[o..]);
            produced += n - o;
        }

        produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PARAMS: ResamplerParams = ResamplerParams { p: 17, v: 2 };

    fn run_upsampler(
        upsampler: &mut FDUpsampler,
        input: &[ComplexSample],
        flush: bool,
    ) -> (Vec<ComplexSample>, usize) {
        let mut fd = Vec::new();
        let mut nsamples = 0;

        upsampler.upsample(input, 1.0, flush, |block, n| {
            fd.extend_from_slice(block);
            nsamples += n;
            true
        });

        (fd, nsamples)
    }

    #[test]
    fn test_params_geometry() {
        let params = ResamplerParams::default();

        assert_eq!(params.n(), 64000);
        assert_eq!(params.o(), 8000);
        assert_eq!(params.l(), 56000);

        assert_eq!(TEST_PARAMS.n(), 32);
        assert_eq!(TEST_PARAMS.l(), 16);
    }

    #[test]
    fn test_identity_passthrough() {
        let mut upsampler = FDUpsampler::new(TEST_PARAMS, 1, 1, 0.0).unwrap();
        let input = vec![ComplexSample::new(1.0, 0.0); 48];

        let (fd, nsamples) = run_upsampler(&mut upsampler, &input, false);
        assert_eq!(nsamples, 48);

        let mut td = Vec::new();
        ToTimeDomain::new(TEST_PARAMS).to_time_domain(&fd, &mut td);

        for (t, y) in td.iter().take(nsamples).enumerate() {
            assert!(
                (y - ComplexSample::new(1.0, 0.0)).norm() < 1e-4,
                "sample {} = {:?}",
                t,
                y
            );
        }
    }

    #[test]
    fn test_frequency_shift_rotates_bins() {
        // theta = 8/32: shift DC up by 8 bins
        let mut upsampler = FDUpsampler::new(TEST_PARAMS, 1, 1, 8.0 / 32.0).unwrap();
        let input = vec![ComplexSample::new(1.0, 0.0); 48];

        let (fd, nsamples) = run_upsampler(&mut upsampler, &input, false);

        let mut td = Vec::new();
        ToTimeDomain::new(TEST_PARAMS).to_time_domain(&fd, &mut td);

        for (t, y) in td.iter().take(nsamples).enumerate() {
            let phase = 2.0 * std::f32::consts::PI * 8.0 * t as f32 / 32.0;
            let expected = ComplexSample::new(phase.cos(), phase.sin());

            assert!((y - expected).norm() < 1e-4, "sample {} = {:?}", t, y);
        }
    }

    #[test]
    fn test_interpolation_doubles_samples() {
        let mut upsampler = FDUpsampler::new(TEST_PARAMS, 1, 2, 0.0).unwrap();
        let input = vec![ComplexSample::new(0.5, 0.0); 24];

        assert_eq!(upsampler.upsampled_size(24), 48);

        let (fd, nsamples) = run_upsampler(&mut upsampler, &input, false);
        assert_eq!(nsamples, 48);

        let mut td = Vec::new();
        ToTimeDomain::new(TEST_PARAMS).to_time_domain(&fd, &mut td);

        // The first block interpolates across the zero-padded warm-up edge,
        // so only later blocks see a constant window
        for (t, y) in td.iter().take(nsamples).enumerate().skip(16) {
            assert!(
                (y - ComplexSample::new(0.5, 0.0)).norm() < 1e-4,
                "sample {} = {:?}",
                t,
                y
            );
        }
    }

    #[test]
    fn test_fractional_shift_rejected() {
        assert!(matches!(
            FDUpsampler::new(TEST_PARAMS, 1, 1, 0.01),
            Err(DspError::FractionalBinShift { .. })
        ));
    }

    #[test]
    fn test_npending_accounting() {
        let mut upsampler = FDUpsampler::new(TEST_PARAMS, 1, 1, 0.0).unwrap();

        // Freshly reset: the FFT holds only overlap, nothing pending
        assert_eq!(upsampler.npending(), 0);

        // Push fewer samples than a block: they stay pending
        let input = vec![ComplexSample::new(1.0, 0.0); 5];
        let consumed = upsampler.upsample(&input, 1.0, false, |_, _| true);

        assert_eq!(consumed, 5);
        assert_eq!(upsampler.npending(), 5);
    }

    #[test]
    fn test_flush_emits_partial_block() {
        let mut upsampler = FDUpsampler::new(TEST_PARAMS, 1, 1, 0.0).unwrap();
        let input = vec![ComplexSample::new(1.0, 0.0); 5];

        upsampler.upsample(&input, 1.0, false, |_, _| true);

        let (fd, nsamples) = run_upsampler(&mut upsampler, &[], true);
        assert_eq!(fd.len(), TEST_PARAMS.n());
        assert_eq!(nsamples, 5);
    }
}
