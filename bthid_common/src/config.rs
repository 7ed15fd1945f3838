use std::path::PathBuf;

use app_dirs2::{get_app_root, AppDataType, AppInfo};
use serde::{Deserialize, Serialize};

use crate::{hexkeymap::AddressKeyMap, DeviceType, RemoteAddress, MAX_CHILD_DEVICES};

pub const APP_INFO: AppInfo = AppInfo {
    name: "bthid",
    author: "bthid",
};

pub type ConfigError = Box<dyn std::error::Error + Send + Sync>;

/// Presentation and access policy of a created child device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildOptions {
    /// Child may be opened without a function driver attached.
    pub raw_pdo: bool,
    /// Child is hidden from device listings.
    pub hide_pdo: bool,
    pub admin_only: bool,
    pub exclusive: bool,
    /// Zero disables the idle watchdog.
    pub idle_timeout_ms: u32,
}

impl Default for ChildOptions {
    fn default() -> Self {
        Self {
            raw_pdo: false,
            hide_pdo: false,
            admin_only: false,
            exclusive: true,
            idle_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupportedTypes {
    pub sixaxis: bool,
    pub navigation: bool,
    pub motion: bool,
    pub wireless: bool,
}

impl Default for SupportedTypes {
    fn default() -> Self {
        Self {
            sixaxis: true,
            navigation: true,
            motion: true,
            wireless: true,
        }
    }
}

impl SupportedTypes {
    pub fn is_supported(&self, ty: DeviceType) -> bool {
        match ty {
            DeviceType::Sixaxis => self.sixaxis,
            DeviceType::Navigation => self.navigation,
            DeviceType::Motion => self.motion,
            DeviceType::Wireless => self.wireless,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub capacity: usize,
    pub child: ChildOptions,
    pub supported: SupportedTypes,
    pub device_overrides: AddressKeyMap<ChildOptions>,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            capacity: MAX_CHILD_DEVICES,
            child: ChildOptions::default(),
            supported: SupportedTypes::default(),
            device_overrides: AddressKeyMap::default(),
        }
    }
}

impl BusSettings {
    /// Effective options for a child, per-address overrides win.
    pub fn options_for(&self, address: RemoteAddress) -> ChildOptions {
        self.device_overrides
            .0
            .get(&address)
            .copied()
            .unwrap_or(self.child)
    }

    pub fn set_override(&mut self, address: RemoteAddress, options: ChildOptions) {
        self.device_overrides.0.insert(address, options);
    }

    pub fn sanitized(mut self) -> Self {
        let capacity = self.capacity.clamp(1, MAX_CHILD_DEVICES);
        if capacity != self.capacity {
            tracing::warn!(
                "Bus capacity {} out of range, using {}",
                self.capacity,
                capacity
            );
            self.capacity = capacity;
        }
        self
    }
}

pub fn bus_settings_from_str(contents: &str) -> Result<BusSettings, ConfigError> {
    Ok(json5::from_str::<BusSettings>(contents)?.sanitized())
}

fn bus_settings_path() -> Result<PathBuf, ConfigError> {
    let dir = get_app_root(AppDataType::UserConfig, &APP_INFO)?;
    Ok(dir.join("bus_settings.json"))
}

pub fn bus_settings() -> Result<BusSettings, ConfigError> {
    let path = bus_settings_path()?;
    if path.exists() {
        tracing::info!("Loading bus settings from {}", path.display());
        let contents = std::fs::read_to_string(&path)?;
        bus_settings_from_str(&contents)
    } else {
        tracing::warn!("Bus settings file not found, using default values");
        Ok(Default::default())
    }
}

pub fn bus_settings_save(settings: &BusSettings) -> Result<(), ConfigError> {
    let path = bus_settings_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, json5::to_string(settings)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_fields_missing() {
        let settings = bus_settings_from_str("{}").unwrap();
        assert_eq!(settings, BusSettings::default());
        assert!(settings.child.exclusive);
        assert_eq!(settings.child.idle_timeout_ms, 10_000);
    }

    #[test]
    fn test_parse_overrides_and_support_flags() {
        let settings = bus_settings_from_str(
            r#"{
                capacity: 4,
                child: { hide_pdo: true, idle_timeout_ms: 0 },
                supported: { wireless: false },
                device_overrides: { "0x001bdc0fa231": { admin_only: true } },
            }"#,
        )
        .unwrap();
        assert_eq!(settings.capacity, 4);
        assert!(settings.child.hide_pdo);
        assert!(!settings.supported.is_supported(DeviceType::Wireless));
        assert!(settings.supported.is_supported(DeviceType::Sixaxis));

        let overridden = settings.options_for(RemoteAddress::new(0x001bdc0fa231));
        assert!(overridden.admin_only);
        assert_eq!(overridden.idle_timeout_ms, 10_000);
        let plain = settings.options_for(RemoteAddress::new(0x1));
        assert_eq!(plain.idle_timeout_ms, 0);
    }

    #[test]
    fn test_capacity_is_clamped() {
        let settings = bus_settings_from_str("{ capacity: 0 }").unwrap();
        assert_eq!(settings.capacity, 1);
        let settings = bus_settings_from_str("{ capacity: 4096 }").unwrap();
        assert_eq!(settings.capacity, MAX_CHILD_DEVICES);
    }

    #[test]
    fn test_overrides_survive_serialization() {
        let mut settings = BusSettings::default();
        settings.set_override(
            RemoteAddress::new(0xaabbccddeeff),
            ChildOptions {
                raw_pdo: true,
                ..Default::default()
            },
        );
        let text = json5::to_string(&settings).unwrap();
        let back = bus_settings_from_str(&text).unwrap();
        assert_eq!(back, settings);
    }
}
