use std::fmt;

use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};

use crate::MAX_REMOTE_NAME_LEN;

/// Enumerator name prefixed to every child device id.
pub const BUS_ENUMERATOR_NAME: &str = "BTHPS3BUS";

pub type RemoteName = ArrayString<MAX_REMOTE_NAME_LEN>;

/// Builds a remote name, cutting at the last char boundary that fits.
pub fn remote_name(name: &str) -> RemoteName {
    let mut end = name.len().min(MAX_REMOTE_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = RemoteName::new();
    out.push_str(&name[..end]);
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Sixaxis,
    Navigation,
    Motion,
    Wireless,
}

/// Static, per-type presentation data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceTypeInfo {
    pub ty: DeviceType,
    pub tag: &'static str,
    pub display_name: &'static str,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Prefix of the name the controller reports during the remote name request.
    pub name_prefix: &'static str,
}

pub const DEVICE_TYPES: [DeviceTypeInfo; 4] = [
    DeviceTypeInfo {
        ty: DeviceType::Sixaxis,
        tag: "SIXAXIS",
        display_name: "PlayStation 3 Controller",
        vendor_id: 0x054c,
        product_id: 0x0268,
        name_prefix: "PLAYSTATION(R)3",
    },
    DeviceTypeInfo {
        ty: DeviceType::Navigation,
        tag: "NAVIGATION",
        display_name: "PlayStation Move Navigation Controller",
        vendor_id: 0x054c,
        product_id: 0x042f,
        name_prefix: "Navigation Controller",
    },
    DeviceTypeInfo {
        ty: DeviceType::Motion,
        tag: "MOTION",
        display_name: "PlayStation Move Motion Controller",
        vendor_id: 0x054c,
        product_id: 0x03d5,
        name_prefix: "Motion Controller",
    },
    DeviceTypeInfo {
        ty: DeviceType::Wireless,
        tag: "WIRELESS",
        display_name: "Wireless Controller",
        vendor_id: 0x054c,
        product_id: 0x05c4,
        name_prefix: "Wireless Controller",
    },
];

impl DeviceType {
    pub const ALL: [DeviceType; 4] = [
        DeviceType::Sixaxis,
        DeviceType::Navigation,
        DeviceType::Motion,
        DeviceType::Wireless,
    ];

    pub fn info(self) -> &'static DeviceTypeInfo {
        // Table is ordered like the enum.
        &DEVICE_TYPES[self as usize]
    }

    pub fn device_id(self) -> String {
        format!("{}\\{}", BUS_ENUMERATOR_NAME, self.info().tag)
    }

    pub fn hardware_id(self) -> String {
        self.device_id()
    }

    pub fn from_remote_name(name: &str) -> Option<Self> {
        DEVICE_TYPES
            .iter()
            .find(|info| name.starts_with(info.name_prefix))
            .map(|info| info.ty)
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        DEVICE_TYPES
            .iter()
            .find(|info| info.tag.eq_ignore_ascii_case(tag))
            .map(|info| info.ty)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.info().tag)
    }
}
