//! Offline driver: a manual block pump.
//!
//! Instead of a hardware clock, the owner calls `run_block` as often as it
//! likes. Input buffers can be written between blocks and the last
//! outputs stay readable, which makes this the harness for engine tests
//! and offline rendering.

use crate::traits::{Driver, DriverError, ProcessCallback};

pub struct OfflineDriver {
    sample_rate: f64,
    block_size: usize,
    inputs: Vec<Vec<f32>>,
    outputs: Vec<Vec<f32>>,
    callback: Option<ProcessCallback>,
    time: f64,
    running: bool,
}

impl OfflineDriver {
    pub fn new(sample_rate: f64, num_inputs: usize, num_outputs: usize, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size,
            inputs: vec![vec![0.0; block_size]; num_inputs],
            outputs: vec![vec![0.0; block_size]; num_outputs],
            callback: None,
            time: 0.0,
            running: false,
        }
    }

    /// Install the engine callback. Must happen before `run_block`.
    pub fn set_process_callback(&mut self, callback: ProcessCallback) {
        self.callback = Some(callback);
    }

    /// Current driver time in seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Writable view of one input channel, applied on the next block.
    pub fn input_mut(&mut self, channel: usize) -> Option<&mut [f32]> {
        self.inputs.get_mut(channel).map(|buf| buf.as_mut_slice())
    }

    /// Output channels as produced by the most recent block.
    pub fn outputs(&self) -> &[Vec<f32>] {
        &self.outputs
    }

    /// Run one full block through the callback.
    pub fn run_block(&mut self) -> Result<(), DriverError> {
        let callback = self.callback.as_mut().ok_or(DriverError::NoCallback)?;
        let input_refs: Vec<&[f32]> = self.inputs.iter().map(|buf| buf.as_slice()).collect();
        let mut output_refs: Vec<&mut [f32]> =
            self.outputs.iter_mut().map(|buf| buf.as_mut_slice()).collect();
        callback(self.time, self.block_size, &input_refs, &mut output_refs);
        self.time += self.block_size as f64 / self.sample_rate;
        Ok(())
    }

    /// Run `count` consecutive blocks.
    pub fn run_blocks(&mut self, count: usize) -> Result<(), DriverError> {
        for _ in 0..count {
            self.run_block()?;
        }
        Ok(())
    }
}

impl Driver for OfflineDriver {
    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    fn buffer_size(&self) -> usize {
        self.block_size
    }

    fn start(&mut self) -> Result<(), DriverError> {
        if self.callback.is_none() {
            return Err(DriverError::NoCallback);
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.running = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pumps_blocks_and_advances_time() {
        let mut driver = OfflineDriver::new(48_000.0, 1, 2, 64);
        driver.set_process_callback(Box::new(|time, num_frames, inputs, outputs| {
            assert_eq!(num_frames, 64);
            assert_eq!(inputs.len(), 1);
            for output in outputs.iter_mut() {
                output.fill(time as f32 + 1.0);
            }
        }));

        driver.run_block().unwrap();
        assert!(driver.outputs()[0].iter().all(|&s| s == 1.0));
        assert!((driver.time() - 64.0 / 48_000.0).abs() < 1e-12);

        driver.run_blocks(2).unwrap();
        assert!((driver.time() - 3.0 * 64.0 / 48_000.0).abs() < 1e-12);
    }

    #[test]
    fn inputs_reach_the_callback() {
        let mut driver = OfflineDriver::new(48_000.0, 1, 1, 4);
        driver.input_mut(0).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        driver.set_process_callback(Box::new(|_, _, inputs, outputs| {
            outputs[0].copy_from_slice(inputs[0]);
        }));
        driver.run_block().unwrap();
        assert_eq!(driver.outputs()[0], vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn start_without_callback_is_an_error() {
        let mut driver = OfflineDriver::new(48_000.0, 0, 2, 64);
        assert!(matches!(driver.start(), Err(DriverError::NoCallback)));
    }
}
