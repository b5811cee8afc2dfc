//! The radio-stack capability consumed by a session.
//!
//! A [`RadioStack`] starts operations and returns immediately; outcomes come
//! back later through the [`EventSink`] handed to it once, when the session
//! is created. All sink methods may be called from any thread.

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::ble::characteristics::{CharacteristicId, CharacteristicRef, WriteMode};
use crate::ble::stack::StackFailure;
use crate::session::{Command, PeripheralHandle};

/// Operations the radio stack performs on behalf of a session.
///
/// Reports may be posted from any thread, including from inside these
/// methods; they are queued and handled after the method returns.
#[cfg_attr(test, mockall::automock)]
pub trait RadioStack: Send + Sync {
    /// Register the sink that receives every event for `peripheral`.
    fn attach(&self, peripheral: &PeripheralHandle, events: EventSink);

    /// Start connecting. No timeout. Reports `connected` or `connect_failed`.
    fn connect(&self, peripheral: &PeripheralHandle);

    /// Discover services; an empty list means all of them.
    /// Reports `services_discovered`.
    fn discover_services(&self, peripheral: &PeripheralHandle, services: &[Uuid]);

    /// Discover the characteristics of one service.
    /// Reports `characteristics_discovered`.
    fn discover_characteristics(&self, peripheral: &PeripheralHandle, service: Uuid);

    /// Drop the link, or abandon a pending connection. Reports `disconnected`.
    fn disconnect(&self, peripheral: &PeripheralHandle);

    /// Read the signal strength. Reports `rssi_read`.
    fn read_rssi(&self, peripheral: &PeripheralHandle);

    /// Read a characteristic's value. Reports `value_read`.
    fn read_value(&self, peripheral: &PeripheralHandle, characteristic: &CharacteristicId);

    /// Write a characteristic's value.
    ///
    /// The return value is the stack accepting or rejecting the write. For
    /// [`WriteMode::WithResponse`] the peer's answer is reported later
    /// through `value_written`; unacknowledged writes report nothing more.
    fn write_value(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicId,
        payload: Bytes,
        mode: WriteMode,
    ) -> std::result::Result<(), StackFailure>;

    /// Enable or disable value-change notifications.
    /// Reports `notify_state_updated`, then `value_changed` per change.
    fn set_notify(
        &self,
        peripheral: &PeripheralHandle,
        characteristic: &CharacteristicId,
        enabled: bool,
    );
}

/// Events reported by the radio stack.
#[derive(Debug)]
pub(crate) enum StackEvent {
    Connected,
    ConnectFailed(StackFailure),
    Disconnected(Option<StackFailure>),
    ServicesDiscovered(std::result::Result<Vec<Uuid>, StackFailure>),
    CharacteristicsDiscovered {
        service: Uuid,
        result: std::result::Result<Vec<CharacteristicRef>, StackFailure>,
    },
    RssiRead(std::result::Result<i16, StackFailure>),
    ValueRead {
        characteristic: CharacteristicId,
        result: std::result::Result<Bytes, StackFailure>,
    },
    ValueWritten {
        characteristic: CharacteristicId,
        result: std::result::Result<(), StackFailure>,
    },
    NotifyStateUpdated {
        characteristic: CharacteristicId,
        result: std::result::Result<(), StackFailure>,
    },
    ValueChanged {
        characteristic: CharacteristicId,
        result: std::result::Result<Bytes, StackFailure>,
    },
}

/// Receiver of radio-stack events for one session.
///
/// Cloning is cheap. Events posted after the session has shut down are
/// discarded.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    fn post(&self, event: StackEvent) {
        if self.tx.send(Command::Stack(event)).is_err() {
            trace!("Session gone, dropping stack event");
        }
    }

    /// The link to the peripheral is up.
    pub fn connected(&self) {
        self.post(StackEvent::Connected);
    }

    /// The connection attempt failed.
    pub fn connect_failed(&self, failure: StackFailure) {
        self.post(StackEvent::ConnectFailed(failure));
    }

    /// The link is down, with the failure if the disconnect was not clean.
    pub fn disconnected(&self, failure: Option<StackFailure>) {
        self.post(StackEvent::Disconnected(failure));
    }

    /// Service discovery finished.
    pub fn services_discovered(&self, result: std::result::Result<Vec<Uuid>, StackFailure>) {
        self.post(StackEvent::ServicesDiscovered(result));
    }

    /// Characteristic discovery for one service finished.
    pub fn characteristics_discovered(
        &self,
        service: Uuid,
        result: std::result::Result<Vec<CharacteristicRef>, StackFailure>,
    ) {
        self.post(StackEvent::CharacteristicsDiscovered { service, result });
    }

    /// An RSSI read finished.
    pub fn rssi_read(&self, result: std::result::Result<i16, StackFailure>) {
        self.post(StackEvent::RssiRead(result));
    }

    /// A value read finished.
    pub fn value_read(
        &self,
        characteristic: CharacteristicId,
        result: std::result::Result<Bytes, StackFailure>,
    ) {
        self.post(StackEvent::ValueRead {
            characteristic,
            result,
        });
    }

    /// The peer acknowledged (or rejected) a write.
    pub fn value_written(
        &self,
        characteristic: CharacteristicId,
        result: std::result::Result<(), StackFailure>,
    ) {
        self.post(StackEvent::ValueWritten {
            characteristic,
            result,
        });
    }

    /// A notification state change finished.
    pub fn notify_state_updated(
        &self,
        characteristic: CharacteristicId,
        result: std::result::Result<(), StackFailure>,
    ) {
        self.post(StackEvent::NotifyStateUpdated {
            characteristic,
            result,
        });
    }

    /// A subscribed characteristic's value changed.
    pub fn value_changed(
        &self,
        characteristic: CharacteristicId,
        result: std::result::Result<Bytes, StackFailure>,
    ) {
        self.post(StackEvent::ValueChanged {
            characteristic,
            result,
        });
    }

    /// Whether the session has stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
