use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host};
use whisperline_foundation::AudioError;

/// Resolves the input device for a recording session.
///
/// A device hint is matched exactly first, then as a case-insensitive
/// substring. A hint that matches nothing is an error rather than a silent
/// fallback; only the no-hint path uses the host default.
pub struct DeviceManager {
    host: Host,
    current_device: Option<Device>,
}

impl DeviceManager {
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        Ok(Self {
            host,
            current_device: None,
        })
    }

    pub fn host_id(&self) -> cpal::HostId {
        self.host.id()
    }

    pub fn enumerate_devices(&self) -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        if let Ok(inputs) = self.host.input_devices() {
            for device in inputs {
                if let Ok(name) = device.name() {
                    devices.push(DeviceInfo {
                        name,
                        is_default: false,
                    });
                }
            }
        }

        if let Some(default) = self.host.default_input_device() {
            if let Ok(default_name) = default.name() {
                for device in &mut devices {
                    if device.name == default_name {
                        device.is_default = true;
                    }
                }
            }
        }

        devices
    }

    pub fn default_input_device_name(&self) -> Option<String> {
        self.host.default_input_device().and_then(|d| d.name().ok())
    }

    pub fn open_device(&mut self, name: Option<&str>) -> Result<Device, AudioError> {
        if let Some(preferred) = name {
            if let Some(device) = self.find_device_by_name(preferred) {
                self.current_device = Some(device.clone());
                return Ok(device);
            }
            if let Some(device) = self
                .find_device_by_predicate(|n| n.to_lowercase().contains(&preferred.to_lowercase()))
            {
                tracing::warn!(
                    target: "audio",
                    "Preferred device '{}' not found exactly; using closest match '{}'",
                    preferred,
                    device.name().unwrap_or_default()
                );
                self.current_device = Some(device.clone());
                return Ok(device);
            }
            // A named device that cannot be found must surface, not fall back
            return Err(AudioError::DeviceNotFound {
                name: Some(preferred.to_string()),
            });
        }

        self.host
            .default_input_device()
            .ok_or(AudioError::DeviceNotFound { name: None })
            .map(|device| {
                self.current_device = Some(device.clone());
                device
            })
    }

    fn find_device_by_name(&self, name: &str) -> Option<Device> {
        if let Ok(devices) = self.host.input_devices() {
            for device in devices {
                if let Ok(device_name) = device.name() {
                    if device_name == name {
                        return Some(device);
                    }
                }
            }
        }
        None
    }

    fn find_device_by_predicate<F>(&self, pred: F) -> Option<Device>
    where
        F: Fn(&str) -> bool,
    {
        if let Ok(devices) = self.host.input_devices() {
            for device in devices {
                if let Ok(name) = device.name() {
                    if pred(&name) {
                        return Some(device);
                    }
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_input_devices() -> bool {
        DeviceManager::new()
            .map(|m| m.default_input_device_name().is_some() || !m.enumerate_devices().is_empty())
            .unwrap_or(false)
    }

    #[test]
    fn missing_named_device_is_an_error() {
        let mut manager = match DeviceManager::new() {
            Ok(m) => m,
            Err(_) => return,
        };
        let result = manager.open_device(Some("no-such-device-zzz"));
        match result {
            Err(AudioError::DeviceNotFound { name }) => {
                assert_eq!(name.as_deref(), Some("no-such-device-zzz"));
            }
            Ok(_) => panic!("nonexistent device should not resolve"),
            Err(other) => panic!("expected DeviceNotFound, got {other}"),
        }
    }

    #[test]
    fn default_device_resolves_when_present() {
        if !has_input_devices() {
            eprintln!("Skipping default_device_resolves_when_present: no audio input devices");
            return;
        }
        let mut manager = DeviceManager::new().unwrap();
        assert!(manager.open_device(None).is_ok());
        assert!(manager.current_device.is_some());
    }
}
