//! Frequency-domain signal processing primitives

pub mod fddownsampler;
pub mod fdupsampler;
pub mod fft;

pub use fddownsampler::FDDownsampler;
pub use fdupsampler::{FDUpsampler, ResamplerParams, ToTimeDomain};
pub use fft::Fft;

/// Errors raised when constructing a resampler with incompatible parameters
#[derive(Debug, Clone, PartialEq)]
pub enum DspError {
    /// The frequency shift does not land on an integral number of bins
    FractionalBinShift { bins: f64 },
    /// The rate factor must evenly divide the FFT size
    RateDoesNotDivideFft { rate: usize, fft_size: usize },
    /// Too many filter taps for the configured filter length
    TooManyTaps { ntaps: usize, max: usize },
}

impl std::fmt::Display for DspError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FractionalBinShift { bins } => {
                write!(f, "cannot shift a fractional number of frequency bins: {}", bins)
            }
            Self::RateDoesNotDivideFft { rate, fft_size } => {
                write!(f, "rate {} must evenly divide FFT size {}", rate, fft_size)
            }
            Self::TooManyTaps { ntaps, max } => {
                write!(f, "{} taps exceeds the filter length {}", ntaps, max)
            }
        }
    }
}

impl std::error::Error for DspError {}

/// Design a Blackman-windowed sinc lowpass filter.
///
/// `cutoff` is the normalized cutoff frequency (cycles per sample). The taps
/// are normalized to unity DC gain.
pub fn lowpass_taps(ntaps: usize, cutoff: f64) -> Vec<meshradio_core::dsp_types::ComplexSample> {
    use meshradio_core::dsp_types::ComplexSample;
    use std::f64::consts::PI;

    assert!(ntaps % 2 == 1, "filter length must be odd");

    let mid = (ntaps / 2) as f64;
    let mut taps: Vec<f64> = (0..ntaps)
        .map(|i| {
            let t = i as f64 - mid;
            let sinc = if t == 0.0 {
                2.0 * cutoff
            } else {
                (2.0 * PI * cutoff * t).sin() / (PI * t)
            };
            let w = 0.42 - 0.5 * (2.0 * PI * i as f64 / (ntaps - 1) as f64).cos()
                + 0.08 * (4.0 * PI * i as f64 / (ntaps - 1) as f64).cos();

            sinc * w
        })
        .collect();

    let sum: f64 = taps.iter().sum();
    for tap in &mut taps {
        *tap /= sum;
    }

    taps.into_iter()
        .map(|t| ComplexSample::new(t as f32, 0.0))
        .collect()
}
