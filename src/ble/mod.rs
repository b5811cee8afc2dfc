//! BLE communication module.
//!
//! The radio-stack seam, the connection state machine, characteristic
//! identities and notification routing for one peripheral.

pub mod btleplug_radio;
pub mod characteristics;
pub mod connection;
pub mod notification;
pub mod radio;
pub mod stack;

pub use btleplug_radio::BtleplugRadio;
pub use characteristics::{Capabilities, CharacteristicId, CharacteristicRef, WriteMode};
pub use connection::{ConnectionEvent, ConnectionEventKind, ConnectionState, DisconnectReason};
pub use notification::{NotificationRegistry, ValueChangedHandler};
pub use radio::{EventSink, RadioStack};
pub use stack::{translate, translate_result, StackFailure};
