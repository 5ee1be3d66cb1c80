//! Device classification from the User-Agent header.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Login slot a token belongs to. One user may hold one token per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Pc,
    Mobile,
    Tablet,
}

const TABLET_MARKERS: &[&str] = &["ipad", "tablet", "kindle", "silk", "playbook"];
const MOBILE_MARKERS: &[&str] = &[
    "mobi",
    "iphone",
    "ipod",
    "android",
    "windows phone",
    "blackberry",
    "opera mini",
];

impl DeviceClass {
    /// Classify a User-Agent. Tablets are recognised before phones, since
    /// Android tablets also advertise "android"; anything else is a PC.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();

        let android_without_mobile = ua.contains("android") && !ua.contains("mobile");
        if android_without_mobile || TABLET_MARKERS.iter().any(|m| ua.contains(m)) {
            return DeviceClass::Tablet;
        }

        if MOBILE_MARKERS.iter().any(|m| ua.contains(m)) {
            return DeviceClass::Mobile;
        }

        DeviceClass::Pc
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Pc => "pc",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pc" => Ok(DeviceClass::Pc),
            "mobile" => Ok(DeviceClass::Mobile),
            "tablet" => Ok(DeviceClass::Tablet),
            other => Err(Error::Config(format!("unknown device class '{}'", other))),
        }
    }
}
