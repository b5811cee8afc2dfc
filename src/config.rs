//! Session configuration.

/// Tunables for a [`PeripheralSession`](crate::PeripheralSession).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Capacity of the connection event channel. Slow subscribers lag
    /// rather than block the session.
    pub event_capacity: usize,

    /// Cancel the queue, and so drop any live link, when the last session
    /// handle goes away.
    pub disconnect_on_drop: bool,
}

impl SessionConfig {
    /// Default connection event channel capacity.
    pub const DEFAULT_EVENT_CAPACITY: usize = 16;

    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection event channel capacity (at least 1).
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Set whether dropping the session disconnects the peripheral.
    pub fn with_disconnect_on_drop(mut self, disconnect: bool) -> Self {
        self.disconnect_on_drop = disconnect;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: Self::DEFAULT_EVENT_CAPACITY,
            disconnect_on_drop: true,
        }
    }
}
