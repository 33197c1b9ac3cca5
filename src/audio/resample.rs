//! Sample-rate conversion
//!
//! Mono FFT resampling with rubato. A [`StreamResampler`] keeps its filter
//! state and any leftover input between calls, so device blocks of arbitrary
//! size convert without losing samples at block edges.

use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::{Fft, FixedSync, Resampler};

use crate::error::{Result, VoiceError};

const MONO: usize = 1;

/// Number of sub-chunks for the FFT resampler (1 = lowest latency)
const SUB_CHUNKS: usize = 1;

struct Engine {
    resampler: Fft<f32>,
    work_in: Vec<Vec<f32>>,
    work_out: Vec<Vec<f32>>,
    /// Leading output frames that are filter delay, not signal
    skip: usize,
}

/// Stateful mono resampler from `from_rate` to `to_rate`.
///
/// Equal rates pass samples straight through.
pub struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    engine: Option<Engine>,
    pending: Vec<f32>,
    consumed: u64,
    produced: u64,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(VoiceError::Resample(format!(
                "invalid rates {}Hz -> {}Hz",
                from_rate, to_rate
            )));
        }

        let engine = if from_rate == to_rate {
            None
        } else {
            // 10ms of input per processing chunk
            let chunk = (from_rate as usize / 100).max(1);
            let resampler = Fft::<f32>::new(
                from_rate as usize,
                to_rate as usize,
                chunk,
                SUB_CHUNKS,
                MONO,
                FixedSync::Input,
            )
            .map_err(|e| VoiceError::Resample(e.to_string()))?;

            let skip = resampler.output_delay();
            let work_in = vec![vec![0.0; resampler.input_frames_max()]];
            let work_out = vec![vec![0.0; resampler.output_frames_max()]];
            Some(Engine {
                resampler,
                work_in,
                work_out,
                skip,
            })
        };

        Ok(Self {
            from_rate,
            to_rate,
            engine,
            pending: Vec::new(),
            consumed: 0,
            produced: 0,
        })
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Feed input and return whatever output is ready. May return fewer
    /// samples than the rate ratio implies; the rest follows on later calls.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        self.consumed += samples.len() as u64;
        let output = self.pump(samples)?;
        self.produced += output.len() as u64;
        Ok(output)
    }

    /// Flush buffered input with trailing silence so the total output
    /// matches the input duration, then return the remaining samples.
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        let Some(chunk) = self.engine.as_ref().map(|e| e.resampler.input_frames_next()) else {
            return Ok(Vec::new());
        };
        let expected = ((self.consumed as u128 * self.to_rate as u128
            + self.from_rate as u128 / 2)
            / self.from_rate as u128) as u64;

        let silence = vec![0.0; chunk];
        let mut output = Vec::new();
        while self.produced < expected {
            let mut more = self.pump(&silence)?;
            more.truncate((expected - self.produced) as usize);
            self.produced += more.len() as u64;
            output.extend(more);
        }

        self.pending.clear();
        Ok(output)
    }

    fn pump(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let mut output = Vec::new();

        while self.pending.len() >= engine.resampler.input_frames_next() {
            let frames_needed = engine.resampler.input_frames_next();
            engine.work_in[0][..frames_needed].copy_from_slice(&self.pending[..frames_needed]);
            self.pending.drain(..frames_needed);

            let written = run_chunk(engine, frames_needed)?;
            let skipped = engine.skip.min(written);
            engine.skip -= skipped;
            output.extend_from_slice(&engine.work_out[0][skipped..written]);
        }

        Ok(output)
    }

    /// Convert a whole buffer in one go
    pub fn convert(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
        let mut resampler = Self::new(from_rate, to_rate)?;
        let mut output = resampler.process(samples)?;
        output.extend(resampler.finish()?);
        Ok(output)
    }
}

fn run_chunk(engine: &mut Engine, frames_needed: usize) -> Result<usize> {
    let input = SequentialSliceOfVecs::new(&engine.work_in[..], MONO, frames_needed)
        .map_err(|e| VoiceError::Resample(format!("input adapter: {}", e)))?;
    let output_frames = engine.resampler.output_frames_next();
    let mut output = SequentialSliceOfVecs::new_mut(&mut engine.work_out[..], MONO, output_frames)
        .map_err(|e| VoiceError::Resample(format!("output adapter: {}", e)))?;

    let (_, written) = engine
        .resampler
        .process_into_buffer(&input, &mut output, None)
        .map_err(|e| VoiceError::Resample(e.to_string()))?;
    Ok(written)
}
