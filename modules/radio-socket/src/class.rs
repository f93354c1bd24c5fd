//! Class-of-device word: minor class in bits 2-7, major class in bits 8-12,
//! service-capability flags in bits 13-23.

use std::fmt;

use gpslink_core::Classification;

const MINOR_SHIFT: u32 = 2;
const MAJOR_SHIFT: u32 = 8;
const SERVICE_SHIFT: u32 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorClass {
    Miscellaneous,
    Computer,
    Phone,
    NetworkAccessPoint,
    AudioVideo,
    Peripheral,
    Imaging,
    Wearable,
    Toy,
    Health,
    Uncategorized,
    Reserved(u8),
}

impl MajorClass {
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => MajorClass::Miscellaneous,
            1 => MajorClass::Computer,
            2 => MajorClass::Phone,
            3 => MajorClass::NetworkAccessPoint,
            4 => MajorClass::AudioVideo,
            5 => MajorClass::Peripheral,
            6 => MajorClass::Imaging,
            7 => MajorClass::Wearable,
            8 => MajorClass::Toy,
            9 => MajorClass::Health,
            31 => MajorClass::Uncategorized,
            other => MajorClass::Reserved(other),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            MajorClass::Miscellaneous => 0,
            MajorClass::Computer => 1,
            MajorClass::Phone => 2,
            MajorClass::NetworkAccessPoint => 3,
            MajorClass::AudioVideo => 4,
            MajorClass::Peripheral => 5,
            MajorClass::Imaging => 6,
            MajorClass::Wearable => 7,
            MajorClass::Toy => 8,
            MajorClass::Health => 9,
            MajorClass::Uncategorized => 31,
            MajorClass::Reserved(b) => b & 0x1F,
        }
    }
}

impl fmt::Display for MajorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MajorClass::Reserved(b) => write!(f, "reserved({b})"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// Service-capability flags, already shifted down to bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceClasses(pub u16);

impl ServiceClasses {
    pub const LIMITED_DISCOVERABLE: u16 = 1 << 0;
    pub const POSITIONING: u16 = 1 << 3;
    pub const NETWORKING: u16 = 1 << 4;
    pub const RENDERING: u16 = 1 << 5;
    pub const CAPTURING: u16 = 1 << 6;
    pub const OBJECT_TRANSFER: u16 = 1 << 7;
    pub const AUDIO: u16 = 1 << 8;
    pub const TELEPHONY: u16 = 1 << 9;
    pub const INFORMATION: u16 = 1 << 10;

    pub fn contains(self, flag: u16) -> bool {
        self.0 & flag == flag
    }

    pub fn has_positioning(self) -> bool {
        self.contains(Self::POSITIONING)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassOfDevice(pub u32);

impl ClassOfDevice {
    pub fn from_parts(major: MajorClass, minor: u8, services: ServiceClasses) -> Self {
        let raw = (u32::from(minor & 0x3F) << MINOR_SHIFT)
            | (u32::from(major.bits()) << MAJOR_SHIFT)
            | (u32::from(services.0 & 0x7FF) << SERVICE_SHIFT);
        ClassOfDevice(raw)
    }

    pub fn major(self) -> MajorClass {
        MajorClass::from_bits(((self.0 >> MAJOR_SHIFT) & 0x1F) as u8)
    }

    pub fn minor(self) -> u8 {
        ((self.0 >> MINOR_SHIFT) & 0x3F) as u8
    }

    pub fn services(self) -> ServiceClasses {
        ServiceClasses(((self.0 >> SERVICE_SHIFT) & 0x7FF) as u16)
    }

    pub fn classification(self) -> Classification {
        Classification {
            major: u32::from(self.major().bits()),
            minor: u32::from(self.minor()),
            service_flags: u32::from(self.services().0),
        }
    }

    /// Inverse of [`ClassOfDevice::classification`]; out-of-range parts are masked.
    pub fn from_classification(c: Classification) -> Self {
        Self::from_parts(
            MajorClass::from_bits((c.major & 0x1F) as u8),
            (c.minor & 0x3F) as u8,
            ServiceClasses((c.service_flags & 0x7FF) as u16),
        )
    }
}
