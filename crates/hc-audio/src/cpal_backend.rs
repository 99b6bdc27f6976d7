//! CPAL-based hardware driver.
//!
//! cpal hands the stream callback one interleaved buffer; the driver cuts
//! it into engine-sized blocks, deinterleaves into per-channel buffers
//! allocated at start, runs the engine, and interleaves the result back.
//! Output only: capture devices are separate streams in cpal and are not
//! wired up here, so the engine sees zero hardware inputs.

use arrayvec::ArrayVec;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};

use crate::traits::{Driver, DriverError, ProcessCallback};

/// Most hardware channels the deinterleaver supports.
const MAX_CHANNELS: usize = 32;

/// CPAL-backed output driver.
pub struct CpalDriver {
    device: Device,
    config: StreamConfig,
    block_size: usize,
    callback: Option<ProcessCallback>,
    stream: Option<Stream>,
}

impl CpalDriver {
    /// Open the default output device. `block_size` bounds the frames per
    /// engine callback.
    pub fn new(block_size: usize) -> Result<Self, DriverError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(DriverError::NoDevice)?;
        let config = device
            .default_output_config()
            .map_err(|e| DriverError::DeviceInit(e.to_string()))?;

        let mut config: StreamConfig = config.into();
        config.channels = config.channels.min(MAX_CHANNELS as u16);

        Ok(Self {
            device,
            config,
            block_size: block_size.max(1),
            callback: None,
            stream: None,
        })
    }

    /// Install the engine callback. Must happen before `start`.
    pub fn set_process_callback(&mut self, callback: ProcessCallback) {
        self.callback = Some(callback);
    }
}

impl Driver for CpalDriver {
    fn sample_rate(&self) -> f64 {
        self.config.sample_rate.0 as f64
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn num_outputs(&self) -> usize {
        self.config.channels as usize
    }

    fn buffer_size(&self) -> usize {
        self.block_size
    }

    fn start(&mut self) -> Result<(), DriverError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut callback = self.callback.take().ok_or(DriverError::NoCallback)?;
        let channels = self.config.channels as usize;
        let block_size = self.block_size;
        let sample_rate = self.sample_rate();

        // Per-channel block buffers, allocated once; the stream callback
        // itself stays allocation-free.
        let mut channel_bufs: Vec<Vec<f32>> = vec![vec![0.0; block_size]; channels];
        let mut time = 0.0f64;

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for chunk in data.chunks_mut(channels * block_size) {
                        let num_frames = chunk.len() / channels;
                        {
                            let mut outputs: ArrayVec<&mut [f32], MAX_CHANNELS> = channel_bufs
                                .iter_mut()
                                .map(|buf| &mut buf[..num_frames])
                                .collect();
                            callback(time, num_frames, &[], &mut outputs);
                        }
                        for (ch, buf) in channel_bufs.iter().enumerate() {
                            for (frame, &sample) in buf[..num_frames].iter().enumerate() {
                                chunk[frame * channels + ch] = sample;
                            }
                        }
                        time += num_frames as f64 / sample_rate;
                    }
                },
                |err| log::error!(target: "audio", "stream error: {}", err),
                None,
            )
            .map_err(|e| DriverError::StreamCreate(e.to_string()))?;

        stream.play().map_err(|e| DriverError::Playback(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        if let Some(stream) = self.stream.take() {
            stream.pause().map_err(|e| DriverError::Playback(e.to_string()))?;
        }
        Ok(())
    }
}
