pub mod address;
pub mod config;
pub mod device;
pub mod events;
mod hexkeymap;

pub use address::RemoteAddress;
pub use device::{DeviceType, RemoteName};

/// Maximum length of a Bluetooth remote name in bytes.
pub const MAX_REMOTE_NAME_LEN: usize = 248;

/// Upper bound for concurrently enumerated children; serial numbers fit in a byte.
pub const MAX_CHILD_DEVICES: usize = 255;
