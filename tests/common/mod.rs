//! Scripted radio stack for session tests.

#![allow(dead_code)]

use ble_request_queue::{
    Capabilities, CharacteristicId, CharacteristicRef, EventSink, PeripheralHandle,
    PeripheralSession, RadioStack, Result, StackFailure, WriteMode,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

pub const SVC_A: Uuid = Uuid::from_u128(0x0000_aaaa_0000_1000_8000_0080_5f9b_34fb);
pub const SVC_B: Uuid = Uuid::from_u128(0x0000_bbbb_0000_1000_8000_0080_5f9b_34fb);
pub const CHR: Uuid = Uuid::from_u128(0x0000_cccc_0000_1000_8000_0080_5f9b_34fb);

const WAIT: Duration = Duration::from_secs(2);

/// A call made by the session into the radio stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect,
    DiscoverServices(Vec<Uuid>),
    DiscoverCharacteristics(Uuid),
    Disconnect,
    ReadRssi,
    ReadValue(CharacteristicId),
    WriteValue(CharacteristicId, Bytes, WriteMode),
    SetNotify(CharacteristicId, bool),
}

/// Radio stack that records calls and lets the test post the outcomes.
pub struct FakeRadio {
    sink: Mutex<Option<EventSink>>,
    calls: mpsc::UnboundedSender<Call>,
    log: Mutex<Vec<Call>>,
    write_result: Mutex<std::result::Result<(), StackFailure>>,
}

impl FakeRadio {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
        let (calls, rx) = mpsc::unbounded_channel();
        let radio = Arc::new(Self {
            sink: Mutex::new(None),
            calls,
            log: Mutex::new(Vec::new()),
            write_result: Mutex::new(Ok(())),
        });
        (radio, rx)
    }

    pub fn sink(&self) -> EventSink {
        self.sink.lock().clone().expect("session attached")
    }

    pub fn log(&self) -> Vec<Call> {
        self.log.lock().clone()
    }

    pub fn reject_writes(&self, failure: StackFailure) {
        *self.write_result.lock() = Err(failure);
    }

    fn record(&self, call: Call) {
        self.log.lock().push(call.clone());
        let _ = self.calls.send(call);
    }
}

impl RadioStack for FakeRadio {
    fn attach(&self, _peripheral: &PeripheralHandle, events: EventSink) {
        *self.sink.lock() = Some(events);
    }

    fn connect(&self, _peripheral: &PeripheralHandle) {
        self.record(Call::Connect);
    }

    fn discover_services(&self, _peripheral: &PeripheralHandle, services: &[Uuid]) {
        self.record(Call::DiscoverServices(services.to_vec()));
    }

    fn discover_characteristics(&self, _peripheral: &PeripheralHandle, service: Uuid) {
        self.record(Call::DiscoverCharacteristics(service));
    }

    fn disconnect(&self, _peripheral: &PeripheralHandle) {
        self.record(Call::Disconnect);
    }

    fn read_rssi(&self, _peripheral: &PeripheralHandle) {
        self.record(Call::ReadRssi);
    }

    fn read_value(&self, _peripheral: &PeripheralHandle, characteristic: &CharacteristicId) {
        self.record(Call::ReadValue(*characteristic));
    }

    fn write_value(
        &self,
        _peripheral: &PeripheralHandle,
        characteristic: &CharacteristicId,
        payload: Bytes,
        mode: WriteMode,
    ) -> std::result::Result<(), StackFailure> {
        self.record(Call::WriteValue(*characteristic, payload, mode));
        self.write_result.lock().clone()
    }

    fn set_notify(
        &self,
        _peripheral: &PeripheralHandle,
        characteristic: &CharacteristicId,
        enabled: bool,
    ) {
        self.record(Call::SetNotify(*characteristic, enabled));
    }
}

/// A session wired to a [`FakeRadio`].
pub struct Harness {
    pub session: PeripheralSession,
    pub radio: Arc<FakeRadio>,
    calls: mpsc::UnboundedReceiver<Call>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let (radio, calls) = FakeRadio::new();
        let session = PeripheralSession::new(PeripheralHandle::new("fake-peripheral"), radio.clone());
        Self {
            session,
            radio,
            calls,
        }
    }

    pub fn sink(&self) -> EventSink {
        self.radio.sink()
    }

    /// Wait for the session's next call into the stack.
    pub async fn next_call(&mut self) -> Call {
        tokio::time::timeout(WAIT, self.calls.recv())
            .await
            .expect("timed out waiting for a radio call")
            .expect("radio dropped")
    }

    /// Connect requiring [`SVC_A`], which exposes `characteristics`.
    pub async fn connect_ready(&mut self, characteristics: Vec<CharacteristicRef>) {
        let (done, rx) = capture();
        self.session.enqueue_connect(vec![SVC_A], done);
        assert_eq!(self.next_call().await, Call::Connect);
        self.sink().connected();
        assert_eq!(self.next_call().await, Call::DiscoverServices(vec![SVC_A]));
        self.sink().services_discovered(Ok(vec![SVC_A]));
        assert_eq!(self.next_call().await, Call::DiscoverCharacteristics(SVC_A));
        self.sink()
            .characteristics_discovered(SVC_A, Ok(characteristics));
        assert_eq!(resolved(rx).await, Ok(()));
    }
}

/// Completion handler forwarding its outcome to a oneshot.
pub fn capture<T: Send + 'static>() -> (
    impl FnOnce(Result<T>) + Send + 'static,
    oneshot::Receiver<Result<T>>,
) {
    let (tx, rx) = oneshot::channel();
    (
        move |result| {
            let _ = tx.send(result);
        },
        rx,
    )
}

/// Wait for a captured completion.
pub async fn resolved<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    tokio::time::timeout(WAIT, rx)
        .await
        .expect("timed out waiting for completion")
        .expect("completion handler dropped")
}

pub fn characteristic(capabilities: Capabilities) -> CharacteristicRef {
    CharacteristicRef::new(CharacteristicId::new(SVC_A, CHR), capabilities)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
