//! GATT characteristic identity and capabilities.
//!
//! A characteristic is addressed by its service, its own UUID and an
//! instance index (a service may expose the same characteristic UUID more
//! than once). Capabilities are captured from the radio stack at discovery
//! time and never change afterwards.

use btleplug::api::{CharPropFlags, Characteristic, WriteType};
use std::fmt;
use uuid::Uuid;

/// Immutable identity of a characteristic on a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicId {
    /// UUID of the owning service.
    pub service: Uuid,
    /// UUID of the characteristic.
    pub characteristic: Uuid,
    /// Index distinguishing characteristics sharing a UUID within a service.
    pub instance: u16,
}

impl CharacteristicId {
    /// Create an identity for the first instance of a characteristic.
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
            instance: 0,
        }
    }

    /// Same identity with a different instance index.
    pub fn with_instance(mut self, instance: u16) -> Self {
        self.instance = instance;
        self
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)?;
        if self.instance != 0 {
            write!(f, "#{}", self.instance)?;
        }
        Ok(())
    }
}

/// What a characteristic allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Capabilities {
    /// Value can be read.
    pub readable: bool,
    /// Value can be written with acknowledgment.
    pub writable: bool,
    /// Value can be written without acknowledgment.
    pub writable_no_ack: bool,
    /// Value changes can be notified or indicated.
    pub notifiable: bool,
}

impl Capabilities {
    /// Every capability.
    pub const ALL: Self = Self {
        readable: true,
        writable: true,
        writable_no_ack: true,
        notifiable: true,
    };

    /// Whether a write in the given mode is permitted.
    pub fn allows_write(&self, mode: WriteMode) -> bool {
        match mode {
            WriteMode::WithResponse => self.writable,
            WriteMode::WithoutResponse => self.writable_no_ack,
        }
    }
}

impl From<CharPropFlags> for Capabilities {
    fn from(flags: CharPropFlags) -> Self {
        Self {
            readable: flags.contains(CharPropFlags::READ),
            writable: flags.contains(CharPropFlags::WRITE),
            writable_no_ack: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notifiable: flags.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
        }
    }
}

/// A discovered characteristic: identity plus capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicRef {
    /// Identity of the characteristic.
    pub id: CharacteristicId,
    /// Capabilities reported at discovery time.
    pub capabilities: Capabilities,
}

impl CharacteristicRef {
    /// Create a characteristic reference.
    pub fn new(id: CharacteristicId, capabilities: Capabilities) -> Self {
        Self { id, capabilities }
    }
}

impl From<&Characteristic> for CharacteristicRef {
    fn from(characteristic: &Characteristic) -> Self {
        Self {
            id: CharacteristicId::new(characteristic.service_uuid, characteristic.uuid),
            capabilities: characteristic.properties.into(),
        }
    }
}

/// How a write is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WriteMode {
    /// The peer acknowledges the write; completion waits for the ack.
    #[default]
    WithResponse,
    /// Fire and forget; completion follows the stack accepting the write.
    WithoutResponse,
}

impl WriteMode {
    /// Mode matching an acknowledgment requirement.
    pub fn from_ack_required(ack_required: bool) -> Self {
        if ack_required {
            Self::WithResponse
        } else {
            Self::WithoutResponse
        }
    }

    /// Whether completion waits for the peer's acknowledgment.
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::WithResponse)
    }
}

impl From<WriteMode> for WriteType {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        }
    }
}
