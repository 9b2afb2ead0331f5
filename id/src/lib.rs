// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Typed identifiers for the resources of the networking model.
//!
//! Every resource handled by the synchronizer (networks, subnets, ports, routers, VPNs, floating
//! IPs, tenants) is identified by a UUID. Wrapping those UUIDs in [`Id<T>`] ties each identifier
//! to the type it designates, so that a subnet id can never be handed to a function expecting a
//! port id.
//!
//! ```
//! # use vpnsync_id::Id;
//! struct Subnet;
//! struct Port;
//!
//! fn attach(subnet: Id<Subnet>, port: Id<Port>) { /* ... */ }
//!
//! attach(Id::new(), Id::new());
//! ```
//!
//! ```rust,compile_fail
//! # use vpnsync_id::Id;
//! # struct Subnet;
//! # struct Port;
//! fn attach(subnet: Id<Subnet>, port: Id<Port>) {}
//! let port: Id<Port> = Id::new();
//! attach(port, port); // <- subnet and port ids can't be conflated
//! ```

use core::fmt::{Debug, Formatter};
use std::cmp::Ordering;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::str::FromStr;
use uuid::Uuid;

#[allow(unused_imports)] // re-export
#[cfg(any(test, feature = "bolero"))]
pub use contract::*;

/// The reasons why a string can't be turned into an [`Id`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("'{0}' is not a valid uuid")]
    Malformed(String),
}

/// A UUID tagged at compile time with the type `T` it identifies.
///
/// The tag has no runtime footprint. Conversions between tags are only possible by going through
/// the raw [`Uuid`] ([`Id::into_raw`] / [`Id::from_raw`]), which should be reserved for cases where
/// two resources share an identity by construction (e.g. a router and its internal VPN).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent, bound = ""))]
#[repr(transparent)]
pub struct Id<T>(Uuid, #[cfg_attr(feature = "serde", serde(skip))] PhantomData<fn() -> T>);

impl<T> Copy for Id<T> {}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl<T> Display for Id<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        <_ as Display>::fmt(&self.0, f)
    }
}

impl<T> Debug for Id<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        <_ as Display>::fmt(&self.0, f)
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::nil()
    }
}

impl<T> Id<T> {
    /// Namespace used to derive [UUIDv5] identifiers from names
    ///
    /// [UUIDv5]: https://datatracker.ietf.org/doc/html/rfc9562#section-5.5
    pub const NAMESPACE_UUID: Uuid = Uuid::from_u128(0x5c1b_77e2_0d4a_4f7e_9a36_51c2_a8d0_e6f1);

    /// Generate a new, random, [`Id<T>`].
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4(), PhantomData)
    }

    /// The all-zeroes identifier.
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil(), PhantomData)
    }

    /// Tell if this is the all-zeroes identifier.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Strip the type tag and return the wrapped [`Uuid`].
    #[must_use]
    pub const fn into_raw(self) -> Uuid {
        self.0
    }

    /// Return a reference to the wrapped [`Uuid`].
    #[must_use]
    pub const fn as_raw(&self) -> &Uuid {
        &self.0
    }

    /// Tag a [`Uuid`] received from a context where its type is known (e.g. a field of a
    /// resource). Use [`Id::retag`] to convert between tags.
    #[must_use]
    pub const fn from_raw(uuid: Uuid) -> Self {
        Self(uuid, PhantomData)
    }

    /// Reinterpret the identifier under another tag. Only meaningful for entities that share
    /// their identity, like a router and the VPN internal to it.
    #[must_use]
    pub const fn retag<U>(self) -> Id<U> {
        Id(self.0, PhantomData)
    }

    /// Derive a stable identifier from a name. The same name always yields the same id.
    #[must_use]
    pub fn from_name(name: impl AsRef<str>) -> Self {
        Self(
            Uuid::new_v5(&Self::NAMESPACE_UUID, name.as_ref().as_bytes()),
            PhantomData,
        )
    }
}

impl<T> FromStr for Id<T> {
    type Err = IdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self::from_raw)
            .map_err(|_| IdError::Malformed(s.to_owned()))
    }
}

impl<T> TryFrom<&str> for Id<T> {
    type Error = IdError;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl<T> From<Id<T>> for Uuid {
    fn from(value: Id<T>) -> Self {
        value.0
    }
}

#[cfg(any(test, feature = "bolero"))]
mod contract {
    use crate::Id;
    use bolero::{Driver, TypeGenerator};
    use std::marker::PhantomData;

    impl<T: 'static> TypeGenerator for Id<T> {
        fn generate<D: Driver>(driver: &mut D) -> Option<Self> {
            Some(Id(
                uuid::Builder::from_random_bytes(driver.produce::<[u8; 16]>()?).into_uuid(),
                PhantomData,
            ))
        }
    }
}
