use meshradio_core::dsp_types::ComplexSample;

/// Compression applied to IQ data before it reaches the on-disk log.
///
/// The stock codec quantizes to 14 bits per component, two interleaved
/// channels (I then Q). A lossless container backend wraps the same
/// quantization externally.
pub trait IqCodec: Send + Sync {
    fn compress(&self, samples: &[ComplexSample]) -> Vec<u8>;
    fn decompress(&self, data: &[u8]) -> Vec<ComplexSample>;
}

/// Full-scale value of a 14-bit sample component
const SCALE: f32 = 8191.0;

/// 14-bit interleaved integer quantization.
///
/// For inputs with `|x| <= 1` the round-trip error per component is bounded
/// by `1/8191`, comfortably below 1e-3.
pub struct Sc14Codec;

impl Sc14Codec {
    fn quantize(v: f32) -> i16 {
        (v * SCALE).round().clamp(-SCALE, SCALE) as i16
    }
}

impl IqCodec for Sc14Codec {
    fn compress(&self, samples: &[ComplexSample]) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples.len() * 4);

        for s in samples {
            out.extend_from_slice(&Self::quantize(s.re).to_le_bytes());
            out.extend_from_slice(&Self::quantize(s.im).to_le_bytes());
        }

        out
    }

    fn decompress(&self, data: &[u8]) -> Vec<ComplexSample> {
        data.chunks_exact(4)
            .map(|chunk| {
                let re = i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / SCALE;
                let im = i16::from_le_bytes([chunk[2], chunk[3]]) as f32 / SCALE;

                ComplexSample::new(re, im)
            })
            .collect()
    }
}
