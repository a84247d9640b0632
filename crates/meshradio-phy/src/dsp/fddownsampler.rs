use meshradio_core::dsp_types::{ComplexSample, RealSample};
use num::Zero;

use super::fdupsampler::ResamplerParams;
use super::fft::Fft;
use super::DspError;

/// An overlap-save frequency-domain downsampler.
///
/// Filters with a frequency-domain FIR filter, shifts by `theta` (normalized
/// frequency) by rotating FFT bins, and decimates by `d` by folding the
/// spectrum. Each call to [FDDownsampler::resample] processes an independent
/// stretch of signal.
pub struct FDDownsampler {
    pub params: ResamplerParams,

    /// Oversample factor
    x: usize,

    /// Decimation factor
    d: usize,

    /// Number of bins to rotate
    nrot: usize,

    /// Filter delay in input samples
    delay: usize,

    /// Forward FFT over input blocks, of size `N`
    fft: Fft,

    /// Inverse FFT over decimated blocks, of size `x*N/d`
    ifft: Fft,

    /// Rotated and filtered spectrum scratch
    temp: Vec<ComplexSample>,

    /// Frequency-domain filter, scaled by `1/N`
    h: Vec<ComplexSample>,
}

impl FDDownsampler {
    pub fn new(
        params: ResamplerParams,
        x: usize,
        d: usize,
        theta: f64,
        taps: &[ComplexSample],
    ) -> Result<Self, DspError> {
        let n = params.n();

        if taps.len() > params.p {
            return Err(DspError::TooManyTaps {
                ntaps: taps.len(),
                max: params.p,
            });
        }

        let bins = n as f64 * theta;
        if (bins - bins.round()).abs() > 1e-10 {
            return Err(DspError::FractionalBinShift { bins });
        }
        if n % d != 0 {
            return Err(DspError::RateDoesNotDivideFft { rate: d, fft_size: n });
        }

        let mut nrot = bins.round() as isize;
        if nrot < 0 {
            nrot += n as isize;
        }

        let mut planner = rustfft::FftPlanner::new();

        // Compute the frequency-domain filter. The 1/N factor compensates
        // for the unnormalized inverse FFT.
        let mut filter_fft = Fft::forward(&mut planner, n);

        filter_fft.in_buf.fill(ComplexSample::zero());
        filter_fft.in_buf[..taps.len()].copy_from_slice(taps);
        filter_fft.execute();

        let inv_n = 1.0 / n as RealSample;
        let h: Vec<ComplexSample> = filter_fft.out_buf.iter().map(|v| *v * inv_n).collect();

        Ok(Self {
            params,
            x,
            d,
            nrot: nrot as usize,
            delay: ((taps.len() as f64 - 1.0) / 2.0).round() as usize,
            fft: Fft::forward(&mut planner, n),
            ifft: Fft::inverse(&mut planner, x * n / d),
            temp: vec![ComplexSample::zero(); n],
            h,
        })
    }

    /// Filter delay in input samples
    pub fn delay(&self) -> usize {
        self.delay
    }

    pub fn rate(&self) -> f64 {
        1.0 / self.d as f64
    }

    /// Number of output samples `count` input samples produce, at most
    pub fn needed_out(&self, count: usize) -> usize {
        let l = self.params.l();
        let lo = self.x * l / self.d;

        lo * (count.div_ceil(l))
    }

    /// Rotate, filter, and decimate one spectrum block from `fft.out_buf`
    /// into `ifft.in_buf`
    fn downsample_block(&mut self) {
        let n_fft = self.params.n();
        let n = n_fft / self.d;

        // Shift FFT bins as we copy into the scratch buffer
        for (k, v) in self.temp.iter_mut().enumerate() {
            *v = self.fft.out_buf[(k + self.nrot) % n_fft];
        }

        // Apply the filter
        for (v, h) in self.temp.iter_mut().zip(self.h.iter()) {
            *v *= *h;
        }

        // Decimate by summing strides of the scratch buffer
        let out = &mut self.ifft.in_buf;

        out[..n].copy_from_slice(&self.temp[..n]);
        for i in 1..self.d {
            for j in 0..n {
                out[j] += self.temp[i * n + j];
            }
        }

        // Oversample if needed
        if self.x != 1 {
            let xn = self.x * n;

            for j in 0..n / 2 {
                out[xn - n / 2 + j] = out[n / 2 + j];
            }
            out[n / 2..n].fill(ComplexSample::zero());
        }
    }

    /// Downsample a stretch of signal, appending the produced samples to
    /// `out`. Returns the number of samples produced.
    pub fn resample(&mut self, input: &[ComplexSample], out: &mut Vec<ComplexSample>, g: RealSample) -> usize {
        let n = self.params.n();
        let o = self.params.o();
        let l = self.params.l();
        let no = self.x * n / self.d;
        let oo = self.x * o / self.d;
        let count = input.len();

        let mut fftoff = o;
        let mut inoff = 0usize;
        let mut produced = 0usize;

        self.fft.in_buf[..o].fill(ComplexSample::zero());

        while inoff < count {
            let avail = count - inoff;
            let partial = fftoff + avail < n;

            if partial {
                self.fft.in_buf[fftoff..fftoff + avail].copy_from_slice(&input[inoff..inoff + avail]);
                self.fft.in_buf[fftoff + avail..].fill(ComplexSample::zero());
            } else {
                self.fft.in_buf[fftoff..n].copy_from_slice(&input[inoff..inoff + n - fftoff]);
            }

            self.fft.execute();
            self.downsample_block();
            self.ifft.execute();

            if partial {
                let nout = self.x * (fftoff + avail) / self.d;

                if nout > oo {
                    out.extend(self.ifft.out_buf[oo..nout].iter().map(|v| *v * g));
                    produced += nout - oo;
                }
                break;
            }

            out.extend(self.ifft.out_buf[oo..no].iter().map(|v| *v * g));
            produced += no - oo;

            inoff += l - fftoff;
            fftoff = 0;
        }

        produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_PARAMS: ResamplerParams = ResamplerParams { p: 17, v: 2 };

    fn unit_taps() -> Vec<ComplexSample> {
        vec![ComplexSample::new(1.0, 0.0)]
    }

    #[test]
    fn test_identity_passthrough() {
        let mut down = FDDownsampler::new(TEST_PARAMS, 1, 1, 0.0, &unit_taps()).unwrap();

        // With a unit filter, no shift, and no decimation, the overlap-save
        // machinery must reproduce the input exactly
        let input: Vec<ComplexSample> = (0..40)
            .map(|t| ComplexSample::new(t as f32 * 0.1, -(t as f32) * 0.05))
            .collect();

        let mut out = Vec::new();
        let produced = down.resample(&input, &mut out, 1.0);

        assert_eq!(produced, 40);
        for (x, y) in input.iter().zip(out.iter()) {
            assert!((x - y).norm() < 1e-4);
        }
    }

    #[test]
    fn test_decimation_keeps_every_dth_sample() {
        let mut down = FDDownsampler::new(TEST_PARAMS, 1, 2, 0.0, &unit_taps()).unwrap();

        let input: Vec<ComplexSample> = (0..48)
            .map(|t| ComplexSample::new((t % 7) as f32, (t % 5) as f32))
            .collect();

        let mut out = Vec::new();
        let produced = down.resample(&input, &mut out, 1.0);

        assert_eq!(produced, 24);
        for (k, y) in out.iter().enumerate() {
            assert!((y - input[2 * k]).norm() < 1e-4, "sample {} = {:?}", k, y);
        }
    }

    #[test]
    fn test_shift_mixes_tone_to_dc() {
        // A tone at bin 8 mixed down by theta = 8/32 becomes DC
        let mut down = FDDownsampler::new(TEST_PARAMS, 1, 1, 8.0 / 32.0, &unit_taps()).unwrap();

        let input: Vec<ComplexSample> = (0..48)
            .map(|t| {
                let phase = 2.0 * std::f32::consts::PI * 8.0 * t as f32 / 32.0;

                ComplexSample::new(phase.cos(), phase.sin())
            })
            .collect();

        let mut out = Vec::new();
        down.resample(&input, &mut out, 1.0);

        for (k, y) in out.iter().enumerate() {
            assert!(
                (y - ComplexSample::new(1.0, 0.0)).norm() < 1e-4,
                "sample {} = {:?}",
                k,
                y
            );
        }
    }

    #[test]
    fn test_filter_delay() {
        let taps = vec![ComplexSample::new(0.25, 0.0); 9];
        let down = FDDownsampler::new(TEST_PARAMS, 1, 1, 0.0, &taps).unwrap();

        assert_eq!(down.delay(), 4);
    }

    #[test]
    fn test_too_many_taps_rejected() {
        let taps = vec![ComplexSample::new(1.0, 0.0); 18];

        assert!(matches!(
            FDDownsampler::new(TEST_PARAMS, 1, 1, 0.0, &taps),
            Err(DspError::TooManyTaps { .. })
        ));
    }
}
