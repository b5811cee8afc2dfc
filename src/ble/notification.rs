//! Value-changed handlers for subscribed characteristics.
//!
//! The registry is owned by the session worker, so installing, replacing
//! and dispatching are serialized with every other stack event: a
//! notification is delivered either to the old handler or to the new one,
//! never to both and never to neither.

use bytes::Bytes;
use std::collections::HashMap;
use tracing::trace;

use crate::ble::characteristics::CharacteristicId;
use crate::error::Result;

/// Handler invoked for every value change of a subscribed characteristic.
pub type ValueChangedHandler = Box<dyn FnMut(&CharacteristicId, Result<Bytes>) + Send + 'static>;

/// At most one value-changed handler per characteristic.
#[derive(Default)]
pub struct NotificationRegistry {
    bindings: HashMap<CharacteristicId, ValueChangedHandler>,
}

impl NotificationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler, replacing and returning any previous one.
    pub fn register(
        &mut self,
        characteristic: CharacteristicId,
        handler: ValueChangedHandler,
    ) -> Option<ValueChangedHandler> {
        self.bindings.insert(characteristic, handler)
    }

    /// Remove the handler for a characteristic. Returns whether one existed.
    pub fn unregister(&mut self, characteristic: &CharacteristicId) -> bool {
        self.bindings.remove(characteristic).is_some()
    }

    /// Deliver a value change. Returns `false` when nothing is registered,
    /// in which case the event is dropped.
    pub fn dispatch(&mut self, characteristic: &CharacteristicId, value: Result<Bytes>) -> bool {
        match self.bindings.get_mut(characteristic) {
            Some(handler) => {
                handler(characteristic, value);
                true
            }
            None => {
                trace!("No handler for value change on {}", characteristic);
                false
            }
        }
    }

    /// Whether a handler is registered for the characteristic.
    pub fn contains(&self, characteristic: &CharacteristicId) -> bool {
        self.bindings.contains_key(characteristic)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Remove every handler.
    pub fn clear(&mut self) {
        self.bindings.clear();
    }
}

impl std::fmt::Debug for NotificationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRegistry")
            .field("characteristics", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}
