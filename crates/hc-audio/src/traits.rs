//! Driver trait and error types.

/// Per-block callback into the engine: `(current_time, num_frames,
/// inputs, outputs)`, one slice per channel.
pub type ProcessCallback = Box<dyn FnMut(f64, usize, &[&[f32]], &mut [&mut [f32]]) + Send>;

/// Error type for driver operations.
#[derive(Debug)]
pub enum DriverError {
    /// No audio device available
    NoDevice,
    /// Failed to initialize the audio device
    DeviceInit(String),
    /// Failed to create the audio stream
    StreamCreate(String),
    /// Playback error
    Playback(String),
    /// Driver started without a process callback
    NoCallback,
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::NoDevice => write!(f, "No audio device available"),
            DriverError::DeviceInit(msg) => write!(f, "Device init error: {}", msg),
            DriverError::StreamCreate(msg) => write!(f, "Stream create error: {}", msg),
            DriverError::Playback(msg) => write!(f, "Playback error: {}", msg),
            DriverError::NoCallback => write!(f, "No process callback installed"),
        }
    }
}

impl std::error::Error for DriverError {}

/// An audio driver: negotiated parameters plus start/stop control.
pub trait Driver {
    /// Sample rate in Hz.
    fn sample_rate(&self) -> f64;

    /// Hardware input channel count.
    fn num_inputs(&self) -> usize;

    /// Hardware output channel count.
    fn num_outputs(&self) -> usize;

    /// Upper bound on `num_frames` per callback.
    fn buffer_size(&self) -> usize;

    /// Begin invoking the process callback.
    fn start(&mut self) -> Result<(), DriverError>;

    /// Stop invoking the process callback.
    fn stop(&mut self) -> Result<(), DriverError>;
}
