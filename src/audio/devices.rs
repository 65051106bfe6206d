// ABOUTME: Output device enumeration
// ABOUTME: Lists the playback devices of the default cpal host

use cpal::traits::{DeviceTrait, HostTrait};

/// A playback device that can be passed to `--device`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputDevice {
    /// Position in the host's device list
    pub index: usize,
    /// Name used to select the device
    pub id: String,
    /// Human readable description
    pub description: String,
}

/// List the output devices of the default host
///
/// Devices whose name cannot be read are skipped.
pub fn list_output_devices() -> Vec<OutputDevice> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let devices = match host.output_devices() {
        Ok(devices) => devices,
        Err(e) => {
            log::warn!("Failed to enumerate output devices: {}", e);
            return Vec::new();
        }
    };

    devices
        .filter_map(|device| device.name().ok())
        .enumerate()
        .map(|(index, name)| {
            let mut description = format!("{} output", host.id().name());
            if default_name.as_deref() == Some(name.as_str()) {
                description.push_str(" (default)");
            }
            OutputDevice {
                index,
                id: name,
                description,
            }
        })
        .collect()
}
