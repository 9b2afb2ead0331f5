// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! IP address families

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    #[must_use]
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }
}

bitflags! {
    /// Set of address families of a VPN. Empty means NONE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct AddressFamily: u8 {
        const V4 = 0b01;
        const V6 = 0b10;
        const BOTH = Self::V4.bits() | Self::V6.bits();
    }
}

impl From<IpFamily> for AddressFamily {
    fn from(family: IpFamily) -> Self {
        match family {
            IpFamily::V4 => AddressFamily::V4,
            IpFamily::V6 => AddressFamily::V6,
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match (self.contains(Self::V4), self.contains(Self::V6)) {
            (false, false) => "NONE",
            (true, false) => "V4",
            (false, true) => "V6",
            (true, true) => "BOTH",
        };
        f.write_str(name)
    }
}
