//! Desktop audio device enumeration
//!
//! Device ids are `input:<name>` or `output:<name>`. A bare name is looked
//! up on whichever side the stream needs.

use serde::{Deserialize, Serialize};

/// A desktop audio device as shown to users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    /// Common rates inside the device's supported ranges
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Which side of a device an id refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Input,
    Output,
}

/// Split a device id into its role prefix (if any) and the device name
pub fn parse_device_id(id: &str) -> (Option<DeviceRole>, &str) {
    if let Some(name) = id.strip_prefix("input:") {
        (Some(DeviceRole::Input), name)
    } else if let Some(name) = id.strip_prefix("output:") {
        (Some(DeviceRole::Output), name)
    } else {
        (None, id)
    }
}

#[cfg(feature = "desktop")]
mod host {
    use super::{parse_device_id, AudioDeviceInfo, DeviceRole};
    use cpal::traits::{DeviceTrait, HostTrait};

    const CANDIDATE_RATES: [u32; 6] = [44_100, 48_000, 88_200, 96_000, 176_400, 192_000];

    /// List all input and output devices of the default host
    pub fn list_devices() -> Vec<AudioDeviceInfo> {
        let host = cpal::default_host();
        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());
        let mut devices: Vec<AudioDeviceInfo> = Vec::new();

        if let Ok(inputs) = host.input_devices() {
            for device in inputs {
                let Ok(name) = device.name() else { continue };
                let (sample_rates, channels) = capabilities(&device, DeviceRole::Input);
                devices.push(AudioDeviceInfo {
                    id: format!("input:{name}"),
                    is_default: default_input.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }

        if let Ok(outputs) = host.output_devices() {
            for device in outputs {
                let Ok(name) = device.name() else { continue };
                let is_default = default_output.as_ref() == Some(&name);
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                    continue;
                }
                let (sample_rates, channels) = capabilities(&device, DeviceRole::Output);
                devices.push(AudioDeviceInfo {
                    id: format!("output:{name}"),
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                    sample_rates,
                    channels,
                });
            }
        }

        devices
    }

    fn capabilities(device: &cpal::Device, role: DeviceRole) -> (Vec<u32>, Vec<u16>) {
        let ranges: Vec<cpal::SupportedStreamConfigRange> = match role {
            DeviceRole::Input => device.supported_input_configs().map(|c| c.collect()).unwrap_or_default(),
            DeviceRole::Output => device.supported_output_configs().map(|c| c.collect()).unwrap_or_default(),
        };

        let mut rates = Vec::new();
        let mut channels = Vec::new();
        for range in &ranges {
            for rate in CANDIDATE_RATES {
                let r = cpal::SampleRate(rate);
                if r >= range.min_sample_rate() && r <= range.max_sample_rate() && !rates.contains(&rate) {
                    rates.push(rate);
                }
            }
            if !channels.contains(&range.channels()) {
                channels.push(range.channels());
            }
        }
        rates.sort_unstable();
        channels.sort_unstable();
        (rates, channels)
    }

    /// Resolve `id` to a device usable for `role`.
    ///
    /// `None`, or an id naming the other role, selects the default device.
    pub fn find_device(id: Option<&str>, role: DeviceRole) -> Option<cpal::Device> {
        let host = cpal::default_host();
        let default = || match role {
            DeviceRole::Input => host.default_input_device(),
            DeviceRole::Output => host.default_output_device(),
        };

        let Some(id) = id else {
            return default();
        };
        let (prefix, name) = parse_device_id(id);
        if prefix.is_some_and(|p| p != role) {
            return default();
        }

        let named = |d: &cpal::Device| d.name().map(|n| n == name).unwrap_or(false);
        match role {
            DeviceRole::Input => host.input_devices().ok()?.find(named),
            DeviceRole::Output => host.output_devices().ok()?.find(named),
        }
    }
}

#[cfg(feature = "desktop")]
pub use host::{find_device, list_devices};

/// Without a desktop backend there is nothing to enumerate
#[cfg(not(feature = "desktop"))]
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_id() {
        assert_eq!(parse_device_id("input:USB Mic"), (Some(DeviceRole::Input), "USB Mic"));
        assert_eq!(parse_device_id("output:Speakers"), (Some(DeviceRole::Output), "Speakers"));
        assert_eq!(parse_device_id("Headset"), (None, "Headset"));
    }

    #[cfg(not(feature = "desktop"))]
    #[test]
    fn test_no_devices_without_desktop() {
        assert!(list_devices().is_empty());
    }
}
