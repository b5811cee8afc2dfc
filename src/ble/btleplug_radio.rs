//! Radio stack backed by btleplug.
//!
//! Every operation is started on a spawned task and reported through the
//! session's [`EventSink`]. Link-loss comes from the adapter's event stream
//! and value changes from the peripheral's notification stream.

use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::{CharacteristicId, CharacteristicRef, WriteMode};
use crate::ble::radio::{EventSink, RadioStack};
use crate::ble::stack::StackFailure;
use crate::error::LibraryError;
use crate::session::PeripheralHandle;

/// Error domain reported for btleplug failures with no library equivalent.
pub const BTLEPLUG_DOMAIN: &str = "btleplug";

/// Fold a btleplug error into a stack failure.
pub fn stack_failure(error: &btleplug::Error) -> StackFailure {
    use btleplug::Error as E;

    match error {
        E::NotConnected => LibraryError::Disconnected.into(),
        E::DeviceNotFound | E::NoSuchCharacteristic | E::UnexpectedCharacteristic => {
            LibraryError::InvalidParameters.into()
        }
        E::NotSupported(_) => LibraryError::InvalidCall.into(),
        E::PermissionDenied => foreign(1),
        E::TimedOut(_) => foreign(2),
        E::UnexpectedCallback => foreign(3),
        _ => foreign(0),
    }
}

/// Foreign code reported when the peripheral exposes no RSSI.
const RSSI_UNAVAILABLE: i64 = 4;

fn foreign(code: i64) -> StackFailure {
    StackFailure::Foreign {
        domain: BTLEPLUG_DOMAIN.to_string(),
        code,
    }
}

struct Shared {
    adapter: Adapter,
    peripheral: Peripheral,
    sink: RwLock<Option<EventSink>>,
    /// Set while a disconnect we issued is in flight, so the adapter's own
    /// disconnect event is not reported twice.
    disconnecting: AtomicBool,
    listening: AtomicBool,
}

impl Shared {
    fn sink(&self) -> Option<EventSink> {
        self.sink.read().clone()
    }

    /// Find a cached characteristic. btleplug has no instance ids, so the
    /// instance selects among same-UUID characteristics in discovery order.
    fn characteristic(&self, id: &CharacteristicId) -> Option<Characteristic> {
        self.peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == id.service)
            .flat_map(|s| s.characteristics.into_iter())
            .filter(|c| c.uuid == id.characteristic)
            .nth(usize::from(id.instance))
    }

    /// Service owning a characteristic UUID, for notifications.
    fn service_of(&self, characteristic: Uuid) -> Option<Uuid> {
        self.peripheral
            .services()
            .into_iter()
            .flat_map(|s| s.characteristics.into_iter())
            .find(|c| c.uuid == characteristic)
            .map(|c| c.service_uuid)
    }
}

/// [`RadioStack`] over a btleplug adapter and peripheral.
///
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct BtleplugRadio {
    shared: Arc<Shared>,
}

impl BtleplugRadio {
    /// Create a radio for one peripheral found on `adapter`.
    pub fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        Self {
            shared: Arc::new(Shared {
                adapter,
                peripheral,
                sink: RwLock::new(None),
                disconnecting: AtomicBool::new(false),
                listening: AtomicBool::new(false),
            }),
        }
    }

    /// The underlying peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.shared.peripheral
    }

    /// Run `op` on a task and hand its outcome to `report`.
    fn spawn<T, Fut, R>(&self, op: impl FnOnce(Arc<Shared>) -> Fut, report: R)
    where
        Fut: std::future::Future<Output = std::result::Result<T, StackFailure>> + Send + 'static,
        R: FnOnce(&EventSink, std::result::Result<T, StackFailure>) + Send + 'static,
        T: Send + 'static,
    {
        let shared = self.shared.clone();
        let fut = op(shared.clone());
        tokio::spawn(async move {
            let result = fut.await;
            match shared.sink() {
                Some(sink) => report(&sink, result),
                None => warn!("Radio operation finished before a session attached"),
            }
        });
    }

    fn watch_adapter(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut events = match shared.adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };
            let id = shared.peripheral.id();

            while let Some(event) = events.next().await {
                let Some(sink) = shared.sink() else {
                    continue;
                };
                if sink.is_closed() {
                    break;
                }
                if let CentralEvent::DeviceDisconnected(other) = event {
                    if other == id && !shared.disconnecting.load(Ordering::SeqCst) {
                        debug!("Adapter reports {:?} disconnected", id);
                        sink.disconnected(None);
                    }
                }
            }

            debug!("Adapter event loop ended");
        });
    }

    /// Forward the peripheral's notification stream to the session.
    ///
    /// btleplug notifications carry only the characteristic UUID. Each is
    /// attributed to the first discovered service holding that UUID, as
    /// instance 0, so same-UUID characteristics in different services or
    /// with several instances cannot be told apart.
    fn listen_notifications(&self) {
        if self.shared.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut notifications = match shared.peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    shared.listening.store(false, Ordering::SeqCst);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                let Some(sink) = shared.sink() else {
                    continue;
                };
                if sink.is_closed() {
                    break;
                }
                let Some(service) = shared.service_of(notification.uuid) else {
                    trace!("Notification from unknown characteristic {}", notification.uuid);
                    continue;
                };
                sink.value_changed(
                    CharacteristicId::new(service, notification.uuid),
                    Ok(Bytes::from(notification.value)),
                );
            }

            shared.listening.store(false, Ordering::SeqCst);
            debug!("Notification listener stopped");
        });
    }
}

impl RadioStack for BtleplugRadio {
    fn attach(&self, peripheral: &PeripheralHandle, events: EventSink) {
        debug!("Radio attached to session for {}", peripheral);
        *self.shared.sink.write() = Some(events);
        self.watch_adapter();
    }

    fn connect(&self, _peripheral: &PeripheralHandle) {
        self.shared.disconnecting.store(false, Ordering::SeqCst);
        self.spawn(
            |shared| async move {
                shared
                    .peripheral
                    .connect()
                    .await
                    .map_err(|e| stack_failure(&e))
            },
            |sink, result| match result {
                Ok(()) => sink.connected(),
                Err(failure) => sink.connect_failed(failure),
            },
        );
    }

    fn discover_services(&self, _peripheral: &PeripheralHandle, services: &[Uuid]) {
        let wanted = services.to_vec();
        self.spawn(
            |shared| async move {
                shared
                    .peripheral
                    .discover_services()
                    .await
                    .map_err(|e| stack_failure(&e))?;
                let found: Vec<Uuid> = shared
                    .peripheral
                    .services()
                    .into_iter()
                    .map(|s| s.uuid)
                    .filter(|uuid| wanted.is_empty() || wanted.contains(uuid))
                    .collect();
                Ok::<_, StackFailure>(found)
            },
            |sink, result| sink.services_discovered(result),
        );
    }

    fn discover_characteristics(&self, _peripheral: &PeripheralHandle, service: Uuid) {
        let Some(sink) = self.shared.sink() else {
            return;
        };
        let characteristics = self
            .shared
            .peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.into_iter())
            .map(|c| CharacteristicRef::from(&c))
            .collect::<Vec<_>>();
        sink.characteristics_discovered(service, Ok(characteristics));
    }

    fn disconnect(&self, _peripheral: &PeripheralHandle) {
        self.shared.disconnecting.store(true, Ordering::SeqCst);
        self.spawn(
            |shared| async move {
                shared
                    .peripheral
                    .disconnect()
                    .await
                    .map_err(|e| stack_failure(&e))
            },
            |sink, result| sink.disconnected(result.err()),
        );
    }

    fn read_rssi(&self, _peripheral: &PeripheralHandle) {
        self.spawn(
            |shared| async move {
                let properties = shared
                    .peripheral
                    .properties()
                    .await
                    .map_err(|e| stack_failure(&e))?;
                properties
                    .and_then(|p| p.rssi)
                    .ok_or_else(|| foreign(RSSI_UNAVAILABLE))
            },
            |sink, result| sink.rssi_read(result),
        );
    }

    fn read_value(&self, _peripheral: &PeripheralHandle, characteristic: &CharacteristicId) {
        let id = *characteristic;
        self.spawn(
            move |shared| async move {
                let target = shared
                    .characteristic(&id)
                    .ok_or(StackFailure::Library(LibraryError::InvalidParameters))?;
                shared
                    .peripheral
                    .read(&target)
                    .await
                    .map(Bytes::from)
                    .map_err(|e| stack_failure(&e))
            },
            move |sink, result| sink.value_read(id, result),
        );
    }

    fn write_value(
        &self,
        _peripheral: &PeripheralHandle,
        characteristic: &CharacteristicId,
        payload: Bytes,
        mode: WriteMode,
    ) -> std::result::Result<(), StackFailure> {
        let id = *characteristic;
        let target = self
            .shared
            .characteristic(&id)
            .ok_or(StackFailure::Library(LibraryError::InvalidParameters))?;

        self.spawn(
            move |shared| async move {
                shared
                    .peripheral
                    .write(&target, &payload, mode.into())
                    .await
                    .map_err(|e| stack_failure(&e))
            },
            move |sink, result| {
                if mode.is_acknowledged() {
                    sink.value_written(id, result);
                } else if let Err(failure) = result {
                    warn!("Unacknowledged write to {} failed: {:?}", id, failure);
                }
            },
        );
        Ok(())
    }

    fn set_notify(
        &self,
        _peripheral: &PeripheralHandle,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) {
        if enabled {
            self.listen_notifications();
        }
        let id = *characteristic;
        self.spawn(
            move |shared| async move {
                let target = shared
                    .characteristic(&id)
                    .ok_or(StackFailure::Library(LibraryError::InvalidParameters))?;
                let result = if enabled {
                    shared.peripheral.subscribe(&target).await
                } else {
                    shared.peripheral.unsubscribe(&target).await
                };
                result.map_err(|e| stack_failure(&e))
            },
            move |sink, result| sink.notify_state_updated(id, result),
        );
    }
}
