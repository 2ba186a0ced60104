//! Audio device contract and enumeration
//!
//! The call engine only sees [`AudioBackend`] and [`DuplexStream`]: open a
//! duplex stream that invokes a tick callback at a fixed frame cadence,
//! then start and stop it. Dropping the stream closes it.

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{BufferSize, SupportedBufferSize, SupportedStreamConfigRange};

use crate::config::AudioConfig;
use crate::error::AudioError;

/// Per-tick duplex callback.
///
/// Receives the captured frame when one is available and must fill the
/// output frame. Returning an error ends the audio side of the call.
pub type TickCallback = Box<dyn FnMut(Option<&[i16]>, &mut [i16]) -> Result<(), AudioError> + Send>;

/// Something that can open duplex audio streams
pub trait AudioBackend: Send + Sync {
    fn open_duplex(&self, config: &AudioConfig, callback: TickCallback) -> Result<Box<dyn DuplexStream>, AudioError>;
}

/// An opened duplex stream; closed on drop
pub trait DuplexStream: Send {
    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;

    /// Next asynchronous stream error, if any
    fn check_errors(&self) -> Option<AudioError>;
}

/// Device summary for listings
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

/// Wrapper around cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self { inner: device, name }
    }

    pub fn inner(&self) -> &cpal::Device {
        &self.inner
    }

    /// Get supported input configurations
    pub fn supported_input_configs(&self) -> Result<Vec<SupportedStreamConfigRange>, AudioError> {
        self.inner
            .supported_input_configs()
            .map(|iter| iter.collect())
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))
    }

    /// Get supported output configurations
    pub fn supported_output_configs(&self) -> Result<Vec<SupportedStreamConfigRange>, AudioError> {
        self.inner
            .supported_output_configs()
            .map(|iter| iter.collect())
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))
    }
}

/// Fixed buffer size when every matching config range allows it
pub fn buffer_size_for(ranges: &[SupportedStreamConfigRange], config: &AudioConfig) -> BufferSize {
    let frames = config.frames_per_buffer as u32;
    let rate = cpal::SampleRate(config.sample_rate);

    let fits = ranges
        .iter()
        .filter(|r| r.channels() == config.channels)
        .filter(|r| r.min_sample_rate() <= rate && rate <= r.max_sample_rate())
        .any(|r| match r.buffer_size() {
            SupportedBufferSize::Range { min, max } => *min <= frames && frames <= *max,
            SupportedBufferSize::Unknown => false,
        });

    if fits {
        BufferSize::Fixed(frames)
    } else {
        BufferSize::Default
    }
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                devices.push(AudioDeviceInfo {
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                });
            }
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                } else {
                    devices.push(AudioDeviceInfo {
                        name,
                        is_input: false,
                        is_output: true,
                        is_default,
                    });
                }
            }
        }
    }

    devices
}

/// Input device by name, or the default input device
pub fn find_input_device(name: Option<&str>) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .map(AudioDevice::from_cpal)
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string())),
        Some(name) => {
            let mut devices = host
                .input_devices()
                .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
            devices
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .map(AudioDevice::from_cpal)
                .ok_or_else(|| AudioError::DeviceNotFound(format!("input:{}", name)))
        }
    }
}

/// Output device by name, or the default output device
pub fn find_output_device(name: Option<&str>) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .map(AudioDevice::from_cpal)
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string())),
        Some(name) => {
            let mut devices = host
                .output_devices()
                .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
            devices
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .map(AudioDevice::from_cpal)
                .ok_or_else(|| AudioError::DeviceNotFound(format!("output:{}", name)))
        }
    }
}
