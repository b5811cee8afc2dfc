//! # ble-request-queue
//!
//! Strictly ordered, single-in-flight request execution for one Bluetooth
//! Low Energy peripheral.
//!
//! BLE stacks tolerate only one outstanding GATT operation per peripheral
//! and report outcomes through asynchronous callbacks. A
//! [`PeripheralSession`] turns that into a queue: callers enqueue
//! connect, disconnect, RSSI, read, write and notification requests from
//! any thread, and each request's completion handler fires exactly once,
//! in enqueue order.
//!
//! ## Features
//!
//! - **Ordered execution**: requests start one at a time, first in first out
//! - **Connection state machine**: connect, required-service discovery,
//!   link-loss detection and forced disconnects
//! - **Notifications**: per-characteristic value handlers, replaced on
//!   re-subscription and cleared on disconnect
//! - **Error translation**: stack failures folded into one taxonomy with a
//!   bounded integer form
//! - **Connection events**: broadcast stream of timestamped state changes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_request_queue::{BtleplugRadio, PeripheralHandle, PeripheralSession, Result};
//! use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
//! use btleplug::platform::Manager;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = Manager::new().await.expect("bluetooth");
//!     let adapter = manager.adapters().await.expect("adapters").remove(0);
//!     adapter.start_scan(ScanFilter::default()).await.expect("scan");
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     let peripheral = adapter.peripherals().await.expect("peripherals").remove(0);
//!
//!     let handle = PeripheralHandle::new(peripheral.id().to_string());
//!     let radio = Arc::new(BtleplugRadio::new(adapter, peripheral));
//!     let session = PeripheralSession::new(handle, radio);
//!
//!     session.connect(Vec::new()).await?;
//!     println!("RSSI: {}", session.read_rssi().await?);
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod request;
pub mod session;

mod queue;

// Re-exports for convenience
pub use config::SessionConfig;
pub use error::{error_code, Error, LibraryError, Result};
pub use request::{CompletionHandler, RequestKind, RequestStatus};
pub use session::{PeripheralHandle, PeripheralSession};

// Re-export commonly used types from submodules
pub use ble::btleplug_radio::BtleplugRadio;
pub use ble::characteristics::{Capabilities, CharacteristicId, CharacteristicRef, WriteMode};
pub use ble::connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, DisconnectReason,
};
pub use ble::radio::{EventSink, RadioStack};
pub use ble::stack::StackFailure;
