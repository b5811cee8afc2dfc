//! Per-peripheral session.
//!
//! A [`PeripheralSession`] runs requests against one peripheral strictly one
//! at a time, in the order they were queued. Callers queue requests from
//! any thread; a single worker task dispatches them to the [`RadioStack`],
//! processes every stack event and invokes every completion handler.
//!
//! Completion handlers run on the worker. They should return quickly, as
//! they delay every later event for the peripheral.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::{CharacteristicId, CharacteristicRef, WriteMode};
use crate::ble::connection::{
    ConnectionEvent, ConnectionEventKind, ConnectionState, ConnectionStateMachine,
    DisconnectReason, Discovery, LinkDown, LinkStatus,
};
use crate::ble::notification::NotificationRegistry;
use crate::ble::radio::{EventSink, RadioStack, StackEvent};
use crate::ble::stack::{translate, translate_result, StackFailure};
use crate::config::SessionConfig;
use crate::error::{Error, LibraryError, Result};
use crate::queue::{Next, PendingRequests, RequestQueue};
use crate::request::{
    Completion, CompletionHandler, Operation, Request, RequestKind, RequestStatus,
};

/// Stable identity of a peripheral, as assigned by the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    /// Wrap a system identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self(identifier.into())
    }

    /// The system identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Work posted to the session worker.
pub(crate) enum Command {
    /// New requests or a cancellation are pending.
    Wake,
    /// Report from the radio stack.
    Stack(StackEvent),
    /// The last session handle was dropped.
    Teardown,
}

/// State mirrored out of the worker for queries.
#[derive(Debug, Default)]
struct SessionData {
    rssi: Option<i16>,
    services: BTreeMap<Uuid, Vec<CharacteristicRef>>,
}

struct SessionInner {
    peripheral: PeripheralHandle,
    pending: PendingRequests,
    status: Arc<RwLock<LinkStatus>>,
    data: Arc<RwLock<SessionData>>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    next_id: AtomicU64,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Teardown);
    }
}

/// Ordered, single-in-flight request queue for one peripheral.
///
/// Cloning yields another handle to the same session. When the last handle
/// is dropped the session winds down: by default it cancels its queue,
/// disconnects, and stops once every request has resolved.
///
/// Must be created from within a tokio runtime.
#[derive(Clone)]
pub struct PeripheralSession {
    inner: Arc<SessionInner>,
}

impl PeripheralSession {
    /// Create a session with the default configuration.
    pub fn new(peripheral: PeripheralHandle, radio: Arc<dyn RadioStack>) -> Self {
        Self::with_config(peripheral, radio, SessionConfig::default())
    }

    /// Create a session.
    ///
    /// The radio receives its event sink immediately, before this returns.
    pub fn with_config(
        peripheral: PeripheralHandle,
        radio: Arc<dyn RadioStack>,
        config: SessionConfig,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let pending = PendingRequests::new();
        let data = Arc::new(RwLock::new(SessionData::default()));
        let machine = ConnectionStateMachine::new();
        let status = machine.status();

        radio.attach(&peripheral, EventSink::new(commands.clone()));

        let worker = Worker {
            peripheral: peripheral.clone(),
            radio,
            queue: RequestQueue::new(pending.clone()),
            pending: pending.clone(),
            machine,
            registry: NotificationRegistry::new(),
            data: data.clone(),
            events: events.clone(),
            disconnect_on_drop: config.disconnect_on_drop,
            torn_down: false,
        };
        tokio::spawn(worker.run(rx));

        debug!("Created session for {}", peripheral);

        Self {
            inner: Arc::new(SessionInner {
                peripheral,
                pending,
                status,
                data,
                commands,
                events,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The peripheral this session manages.
    pub fn peripheral(&self) -> &PeripheralHandle {
        &self.inner.peripheral
    }

    // === Queries ===

    /// Get the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.status.read().state
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Last RSSI successfully read, if any.
    pub fn last_rssi(&self) -> Option<i16> {
        self.inner.data.read().rssi
    }

    /// Why the peripheral was last disconnected. Cleared when a connect starts.
    pub fn last_disconnect_reason(&self) -> Option<DisconnectReason> {
        self.inner.status.read().last_reason
    }

    /// Services discovered by the last connect.
    pub fn services(&self) -> Vec<Uuid> {
        self.inner.data.read().services.keys().copied().collect()
    }

    /// Characteristics discovered for a service by the last connect.
    pub fn characteristics(&self, service: &Uuid) -> Vec<CharacteristicRef> {
        self.inner
            .data
            .read()
            .services
            .get(service)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up a discovered characteristic.
    pub fn characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Option<CharacteristicRef> {
        self.inner
            .data
            .read()
            .services
            .get(service)?
            .iter()
            .find(|c| c.id.characteristic == *characteristic)
            .copied()
    }

    /// Number of requests waiting to start.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    // === Queueing ===

    /// Queue a connection. Required services may be empty.
    ///
    /// There is no timeout: the request, and every request after it, waits
    /// until the peripheral connects or [`Self::cancel_queue`] is called.
    pub fn enqueue_connect<F>(&self, required_services: Vec<Uuid>, handler: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.enqueue(Operation::Connect {
            required_services,
            done: Completion::new(Box::new(handler)),
        });
    }

    /// Queue a disconnection. It does not preempt earlier requests; call
    /// [`Self::cancel_queue`] for that.
    pub fn enqueue_disconnect<F>(&self, handler: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.enqueue(Operation::Disconnect {
            done: Completion::new(Box::new(handler)),
        });
    }

    /// Queue an RSSI read.
    pub fn enqueue_read_rssi<F>(&self, handler: F)
    where
        F: FnOnce(Result<i16>) + Send + 'static,
    {
        self.enqueue(Operation::ReadRssi {
            done: Completion::new(Box::new(handler)),
        });
    }

    /// Queue a characteristic read.
    pub fn enqueue_read_characteristic<F>(&self, target: CharacteristicRef, handler: F)
    where
        F: FnOnce(Result<Bytes>) + Send + 'static,
    {
        self.enqueue(Operation::ReadCharacteristic {
            target,
            done: Completion::new(Box::new(handler)),
        });
    }

    /// Queue a characteristic write.
    ///
    /// With `ack_required` the handler waits for the peer's acknowledgment;
    /// otherwise it fires once the stack has accepted the write.
    pub fn enqueue_write_characteristic<F>(
        &self,
        target: CharacteristicRef,
        payload: impl Into<Bytes>,
        ack_required: bool,
        handler: F,
    ) where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.enqueue(Operation::WriteCharacteristic {
            target,
            payload: payload.into(),
            mode: WriteMode::from_ack_required(ack_required),
            done: Completion::new(Box::new(handler)),
        });
    }

    /// Queue a notification subscription. On success `value_handler`
    /// replaces any handler previously installed for the characteristic.
    pub fn enqueue_set_notify<H, F>(&self, target: CharacteristicRef, value_handler: H, handler: F)
    where
        H: FnMut(&CharacteristicId, Result<Bytes>) + Send + 'static,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.enqueue(Operation::SetNotify {
            target,
            handler: Some(Box::new(value_handler)),
            done: Completion::new(Box::new(handler)),
        });
    }

    /// Queue a notification unsubscription. On success the characteristic's
    /// value handler is removed.
    pub fn enqueue_clear_notify<F>(&self, target: CharacteristicRef, handler: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.enqueue(Operation::SetNotify {
            target,
            handler: None,
            done: Completion::new(Box::new(handler)),
        });
    }

    /// Cancel every pending request and the running one.
    ///
    /// Pending requests resolve with [`Error::Canceled`]. A live or
    /// in-progress link is disconnected; the running request resolves once
    /// the stack confirms, or at once if no link was established yet.
    ///
    /// Only requests queued before this call are affected; requests queued
    /// afterwards run once the cancellation has been applied.
    pub fn cancel_queue(&self) {
        let count = self.inner.pending.cancel_all();
        debug!(
            "Canceling queue for {} ({} pending)",
            self.inner.peripheral, count
        );
        if self.inner.commands.send(Command::Wake).is_err() {
            warn!("Session worker for {} is gone", self.inner.peripheral);
            for request in self.inner.pending.drain() {
                request.fail(Error::Canceled);
            }
        }
    }

    fn enqueue(&self, operation: Operation) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, operation);
        trace!("Queueing request {} for {}", request, self.inner.peripheral);
        self.inner.pending.push(request);

        if self.inner.commands.send(Command::Wake).is_err() {
            warn!("Session worker for {} is gone", self.inner.peripheral);
            for request in self.inner.pending.drain() {
                request.fail(Error::Canceled);
            }
        }
    }

    // === Async ===

    async fn call<T, Q>(&self, enqueue: Q) -> Result<T>
    where
        T: Send + 'static,
        Q: FnOnce(CompletionHandler<T>),
    {
        let (tx, rx) = oneshot::channel();
        enqueue(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        rx.await.unwrap_or(Err(Error::Canceled))
    }

    /// Connect and wait for the required services to be discovered.
    pub async fn connect(&self, required_services: Vec<Uuid>) -> Result<()> {
        self.call(|done| self.enqueue_connect(required_services, done))
            .await
    }

    /// Disconnect once earlier requests are done.
    pub async fn disconnect(&self) -> Result<()> {
        self.call(|done| self.enqueue_disconnect(done)).await
    }

    /// Read the RSSI.
    pub async fn read_rssi(&self) -> Result<i16> {
        self.call(|done| self.enqueue_read_rssi(done)).await
    }

    /// Read a characteristic.
    pub async fn read_characteristic(&self, target: CharacteristicRef) -> Result<Bytes> {
        self.call(|done| self.enqueue_read_characteristic(target, done))
            .await
    }

    /// Write a characteristic.
    pub async fn write_characteristic(
        &self,
        target: CharacteristicRef,
        payload: impl Into<Bytes>,
        ack_required: bool,
    ) -> Result<()> {
        let payload = payload.into();
        self.call(|done| self.enqueue_write_characteristic(target, payload, ack_required, done))
            .await
    }

    /// Subscribe to a characteristic's value changes.
    pub async fn set_notify<H>(&self, target: CharacteristicRef, value_handler: H) -> Result<()>
    where
        H: FnMut(&CharacteristicId, Result<Bytes>) + Send + 'static,
    {
        self.call(|done| self.enqueue_set_notify(target, value_handler, done))
            .await
    }

    /// Unsubscribe from a characteristic's value changes.
    pub async fn clear_notify(&self, target: CharacteristicRef) -> Result<()> {
        self.call(|done| self.enqueue_clear_notify(target, done))
            .await
    }
}

impl fmt::Debug for PeripheralSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralSession")
            .field("peripheral", &self.inner.peripheral)
            .field("connection_state", &self.connection_state())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

/// What a dispatched request asks of the stack.
enum Action {
    Connect(Vec<Uuid>),
    Disconnect,
    ReadRssi,
    ReadValue(CharacteristicId),
    WriteValue(CharacteristicId, Bytes, WriteMode),
    SetNotify(CharacteristicId, bool),
}

/// The serial execution context of a session.
struct Worker {
    peripheral: PeripheralHandle,
    radio: Arc<dyn RadioStack>,
    queue: RequestQueue,
    pending: PendingRequests,
    machine: ConnectionStateMachine,
    registry: NotificationRegistry,
    data: Arc<RwLock<SessionData>>,
    events: broadcast::Sender<ConnectionEvent>,
    disconnect_on_drop: bool,
    torn_down: bool,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!("Session worker for {} started", self.peripheral);

        while let Some(command) = commands.recv().await {
            self.apply_cancellation();
            match command {
                Command::Wake => {}
                Command::Stack(event) => self.handle_event(event),
                Command::Teardown => self.teardown(),
            }
            self.advance();

            if self.torn_down && self.is_finished() {
                break;
            }
        }

        self.registry.clear();
        debug!("Session worker for {} stopped", self.peripheral);
    }

    fn emit(&self, kind: ConnectionEventKind, reason: Option<DisconnectReason>) {
        let _ = self
            .events
            .send(ConnectionEvent::new(self.peripheral.clone(), kind, reason));
    }

    // === Queue ===

    /// Start pending requests until one is in flight, the queue is empty,
    /// or an internal disconnect pauses the queue.
    fn advance(&mut self) {
        while !self.queue.is_running() {
            self.queue.flush_deferred();
            if self.machine.state() == ConnectionState::Disconnecting {
                return;
            }
            match self.queue.start_next() {
                None => return,
                Some(Next::Cancel(drained)) => self.cancel(drained),
                Some(Next::Start(request)) => self.dispatch(request),
            }
        }
    }

    /// Apply a `cancel_queue` call the worker has not seen yet. Runs before
    /// any other command so nothing queued later is resolved first.
    fn apply_cancellation(&mut self) {
        if let Some(drained) = self.queue.take_cancellation() {
            self.cancel(drained);
        }
    }

    fn validate(&self, request: &Request) -> Result<()> {
        let state = self.machine.state();
        let target = match request.operation() {
            Operation::Connect { .. } | Operation::Disconnect { .. } => return Ok(()),
            Operation::ReadRssi { .. } => None,
            Operation::ReadCharacteristic { target, .. }
            | Operation::WriteCharacteristic { target, .. }
            | Operation::SetNotify { target, .. } => Some(target),
        };

        if !state.is_connected() {
            return Err(Error::invalid_call(format!(
                "{} requires a connected peripheral, state is {}",
                request.kind(),
                state
            )));
        }

        let Some(target) = target else {
            return Ok(());
        };
        let caps = target.capabilities;
        match request.operation() {
            Operation::ReadCharacteristic { .. } if !caps.readable => Err(
                Error::invalid_parameters(format!("{} is not readable", target.id)),
            ),
            Operation::WriteCharacteristic { mode, .. } if !caps.allows_write(*mode) => {
                Err(Error::invalid_parameters(format!(
                    "{} does not support {:?} writes",
                    target.id, mode
                )))
            }
            Operation::SetNotify { .. } if !caps.notifiable => Err(Error::invalid_parameters(
                format!("{} does not support notifications", target.id),
            )),
            _ => Ok(()),
        }
    }

    fn dispatch(&mut self, request: Request) {
        if let Err(e) = self.validate(&request) {
            debug!("Request {} rejected: {}", request, e);
            request.fail(e);
            return;
        }

        let action = match request.operation() {
            Operation::Connect {
                required_services, ..
            } => Action::Connect(required_services.clone()),
            Operation::Disconnect { .. } => Action::Disconnect,
            Operation::ReadRssi { .. } => Action::ReadRssi,
            Operation::ReadCharacteristic { target, .. } => Action::ReadValue(target.id),
            Operation::WriteCharacteristic {
                target,
                payload,
                mode,
                ..
            } => Action::WriteValue(target.id, payload.clone(), *mode),
            Operation::SetNotify {
                target, handler, ..
            } => Action::SetNotify(target.id, handler.is_some()),
        };

        match action {
            Action::Connect(required_services) => {
                if self.machine.state().is_connected() {
                    debug!("Already connected to {}", self.peripheral);
                    request.complete_unit(Ok(()));
                    return;
                }
                info!("Connecting to {}", self.peripheral);
                self.data.write().services.clear();
                self.machine.begin_connect(required_services);
                self.emit(ConnectionEventKind::Connecting, None);
                self.queue.set_running(request);
                self.radio.connect(&self.peripheral);
            }
            Action::Disconnect => {
                if self.machine.state() == ConnectionState::Disconnected {
                    debug!("Already disconnected from {}", self.peripheral);
                    request.complete_unit(Ok(()));
                    return;
                }
                info!("Disconnecting from {}", self.peripheral);
                self.machine.begin_disconnect(DisconnectReason::Requested);
                self.emit(ConnectionEventKind::Disconnecting, None);
                self.queue.set_running(request);
                self.radio.disconnect(&self.peripheral);
            }
            Action::ReadRssi => {
                self.queue.set_running(request);
                self.radio.read_rssi(&self.peripheral);
            }
            Action::ReadValue(characteristic) => {
                self.queue.set_running(request);
                self.radio.read_value(&self.peripheral, &characteristic);
            }
            Action::WriteValue(characteristic, payload, mode) => {
                trace!("Writing {} bytes to {}", payload.len(), characteristic);
                let accepted = translate_result(self.radio.write_value(
                    &self.peripheral,
                    &characteristic,
                    payload,
                    mode,
                ));
                if accepted.is_err() || !mode.is_acknowledged() {
                    request.complete_unit(accepted);
                } else {
                    self.queue.set_running(request);
                }
            }
            Action::SetNotify(characteristic, enabled) => {
                self.queue.set_running(request);
                self.radio
                    .set_notify(&self.peripheral, &characteristic, enabled);
            }
        }
    }

    fn cancel(&mut self, drained: Vec<Request>) {
        match self.machine.state() {
            ConnectionState::Connecting if !self.machine.has_link() => {
                info!("Connection to {} canceled", self.peripheral);
                self.machine.abort_connect(DisconnectReason::Canceled);
                self.emit(
                    ConnectionEventKind::Disconnected,
                    Some(DisconnectReason::Canceled),
                );
                if let Some(request) = self.queue.take_running() {
                    request.fail(Error::Canceled);
                }
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                info!("Queue canceled, disconnecting from {}", self.peripheral);
                self.machine.begin_disconnect(DisconnectReason::Canceled);
                self.emit(ConnectionEventKind::Disconnecting, None);
                self.radio.disconnect(&self.peripheral);
            }
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {}
        }
        self.queue.cancel(drained);
    }

    fn teardown(&mut self) {
        debug!("Last handle to {} dropped", self.peripheral);
        self.torn_down = true;
        if self.disconnect_on_drop {
            self.pending.cancel_all();
            self.apply_cancellation();
        }
    }

    fn is_finished(&self) -> bool {
        self.queue.is_idle()
            && (!self.disconnect_on_drop || self.machine.state() == ConnectionState::Disconnected)
    }

    // === Stack events ===

    fn handle_event(&mut self, event: StackEvent) {
        match event {
            StackEvent::Connected => self.on_link_up(),
            StackEvent::ConnectFailed(failure) => self.on_connect_failed(failure),
            StackEvent::Disconnected(failure) => self.on_link_down(failure),
            StackEvent::ServicesDiscovered(result) => self.on_services_discovered(result),
            StackEvent::CharacteristicsDiscovered { service, result } => {
                self.on_characteristics_discovered(service, result)
            }
            StackEvent::RssiRead(result) => self.on_rssi_read(result),
            StackEvent::ValueRead {
                characteristic,
                result,
            } => self.on_value_read(characteristic, result),
            StackEvent::ValueWritten {
                characteristic,
                result,
            } => self.on_value_written(characteristic, result),
            StackEvent::NotifyStateUpdated {
                characteristic,
                result,
            } => self.on_notify_state_updated(characteristic, result),
            StackEvent::ValueChanged {
                characteristic,
                result,
            } => {
                trace!("Value changed on {}", characteristic);
                self.registry
                    .dispatch(&characteristic, translate_result(result));
            }
        }
    }

    fn take_running(&mut self, kind: RequestKind, target: Option<CharacteristicId>) -> Option<Request> {
        let request = self
            .queue
            .take_running_if(|r| r.kind() == kind && r.target() == target);
        if request.is_none() {
            warn!(
                "Ignoring {} report for {}: no matching request running ({:?})",
                kind,
                self.peripheral,
                self.queue.running()
            );
        }
        request
    }

    fn on_link_up(&mut self) {
        if let Some(services) = self.machine.link_up() {
            info!("Connected to {}, discovering services", self.peripheral);
            self.emit(ConnectionEventKind::Connected, None);
            self.radio.discover_services(&self.peripheral, &services);
        } else if self.machine.state() == ConnectionState::Disconnected {
            warn!("Stray link to {}, disconnecting", self.peripheral);
            self.machine.begin_disconnect(DisconnectReason::Canceled);
            self.radio.disconnect(&self.peripheral);
        } else {
            debug!("Duplicate link-up report for {}", self.peripheral);
        }
    }

    fn on_connect_failed(&mut self, failure: StackFailure) {
        if self.machine.state() != ConnectionState::Connecting {
            debug!("Ignoring connect failure for {}: not connecting", self.peripheral);
            return;
        }
        let error = failure.into_error();
        let reason = match error.library_error() {
            Some(LibraryError::InvalidParameters) => DisconnectReason::PeripheralInvalid,
            _ => DisconnectReason::ConnectFailed,
        };
        warn!("Failed to connect to {}: {}", self.peripheral, error);
        self.machine.abort_connect(reason);
        self.emit(ConnectionEventKind::FailedToConnect, Some(reason));
        if let Some(request) = self.take_running(RequestKind::Connect, None) {
            request.fail(error);
        }
    }

    fn on_services_discovered(&mut self, result: std::result::Result<Vec<Uuid>, StackFailure>) {
        if self.machine.state() != ConnectionState::Connecting {
            debug!("Ignoring service discovery for {}: not connecting", self.peripheral);
            return;
        }
        match result {
            Ok(services) => {
                debug!("Discovered {} service(s) on {}", services.len(), self.peripheral);
                let progress = self.machine.services_discovered(&services);
                for service in &services {
                    self.radio.discover_characteristics(&self.peripheral, *service);
                }
                self.on_discovery(progress);
            }
            Err(failure) => self.fail_discovery(failure.into_error()),
        }
    }

    fn on_characteristics_discovered(
        &mut self,
        service: Uuid,
        result: std::result::Result<Vec<CharacteristicRef>, StackFailure>,
    ) {
        if self.machine.state() != ConnectionState::Connecting {
            debug!("Ignoring characteristic discovery for {}: not connecting", self.peripheral);
            return;
        }
        match result {
            Ok(characteristics) => {
                debug!(
                    "Discovered {} characteristic(s) in service {}",
                    characteristics.len(),
                    service
                );
                self.data.write().services.insert(service, characteristics);
                let progress = self.machine.characteristics_discovered();
                self.on_discovery(progress);
            }
            Err(failure) => self.fail_discovery(failure.into_error()),
        }
    }

    fn on_discovery(&mut self, progress: Discovery) {
        match progress {
            Discovery::Pending => {}
            Discovery::Complete => {
                info!("{} is ready", self.peripheral);
                self.emit(ConnectionEventKind::Ready, None);
                if let Some(request) = self.take_running(RequestKind::Connect, None) {
                    request.complete_unit(Ok(()));
                }
            }
            Discovery::Missing(missing) => {
                warn!(
                    "{} lacks required service(s) {:?}, disconnecting",
                    self.peripheral, missing
                );
                self.emit(ConnectionEventKind::Disconnecting, None);
                self.radio.disconnect(&self.peripheral);
                if let Some(request) = self.take_running(RequestKind::Connect, None) {
                    request.fail(Error::invalid_parameters(format!(
                        "missing required service(s) {:?}",
                        missing
                    )));
                }
            }
        }
    }

    fn fail_discovery(&mut self, error: Error) {
        warn!("Discovery failed on {}: {}, disconnecting", self.peripheral, error);
        self.machine.begin_disconnect(DisconnectReason::DiscoveryFailed);
        self.emit(ConnectionEventKind::Disconnecting, None);
        self.radio.disconnect(&self.peripheral);
        if let Some(request) = self.take_running(RequestKind::Connect, None) {
            request.fail(error);
        }
    }

    fn on_link_down(&mut self, failure: Option<StackFailure>) {
        let Some(outcome) = self.machine.link_down() else {
            debug!("Duplicate link-down report for {}", self.peripheral);
            return;
        };
        self.registry.clear();

        match outcome {
            LinkDown::Expected(DisconnectReason::Requested) => {
                info!("Disconnected from {}", self.peripheral);
                if let Some(request) = self.take_running(RequestKind::Disconnect, None) {
                    request.complete_unit(translate(failure));
                }
            }
            LinkDown::Expected(DisconnectReason::ConnectFailed) => {
                warn!("{} disconnected before connecting", self.peripheral);
                if let Some(request) = self.take_running(RequestKind::Connect, None) {
                    request.fail(failure.map_or(Error::Disconnected, StackFailure::into_error));
                }
            }
            LinkDown::Expected(reason) => {
                info!("Disconnected from {} ({})", self.peripheral, reason);
                if let Some(request) = self.queue.take_running() {
                    match request.kind() {
                        RequestKind::Disconnect => request.complete_unit(Ok(())),
                        _ => request.fail(Error::Canceled),
                    }
                }
            }
            LinkDown::Unexpected => {
                warn!("Lost link to {}", self.peripheral);
                if let Some(request) = self.queue.take_running() {
                    request.fail(Error::Disconnected);
                }
                self.queue.flush_deferred();
                self.flush_after_link_loss();
            }
        }

        self.emit(ConnectionEventKind::Disconnected, self.machine.last_reason());
    }

    /// Resolve the requests queued ahead of the next connect; they cannot
    /// run without a link. Requests from that connect onward stay queued.
    fn flush_after_link_loss(&mut self) {
        let flushed = self
            .queue
            .drain_pending_until(|r| r.kind() == RequestKind::Connect);
        if flushed.is_empty() {
            return;
        }
        debug!(
            "Flushing {} request(s) for {} after link loss",
            flushed.len(),
            self.peripheral
        );
        for request in flushed {
            match request.kind() {
                RequestKind::Disconnect => request.complete_unit(Ok(())),
                _ => request.fail(Error::Disconnected),
            }
        }
    }

    fn on_rssi_read(&mut self, result: std::result::Result<i16, StackFailure>) {
        let Some(request) = self.take_running(RequestKind::ReadRssi, None) else {
            return;
        };
        let result = translate_result(result);
        if let Ok(rssi) = result {
            trace!("RSSI of {} is {}", self.peripheral, rssi);
            self.data.write().rssi = Some(rssi);
        }
        request.complete_rssi(result);
    }

    fn on_value_read(
        &mut self,
        characteristic: CharacteristicId,
        result: std::result::Result<Bytes, StackFailure>,
    ) {
        if let Some(request) =
            self.take_running(RequestKind::ReadCharacteristic, Some(characteristic))
        {
            request.complete_value(translate_result(result));
        }
    }

    fn on_value_written(
        &mut self,
        characteristic: CharacteristicId,
        result: std::result::Result<(), StackFailure>,
    ) {
        if let Some(request) =
            self.take_running(RequestKind::WriteCharacteristic, Some(characteristic))
        {
            request.complete_unit(translate_result(result));
        }
    }

    fn on_notify_state_updated(
        &mut self,
        characteristic: CharacteristicId,
        result: std::result::Result<(), StackFailure>,
    ) {
        let request = self
            .queue
            .take_running_if(|r| {
                matches!(r.kind(), RequestKind::SetNotify | RequestKind::ClearNotify)
                    && r.target() == Some(characteristic)
            });
        let Some(request) = request else {
            warn!(
                "Ignoring notify state report for {}: no matching request running",
                characteristic
            );
            return;
        };

        if let Err(e) = translate_result(result) {
            request.fail(e);
            return;
        }

        match request.into_operation(RequestStatus::Completed) {
            Operation::SetNotify {
                target,
                handler,
                done,
            } => {
                match handler {
                    Some(handler) => {
                        if self.registry.register(target.id, handler).is_some() {
                            debug!("Replaced value handler for {}", target.id);
                        }
                    }
                    None => {
                        self.registry.unregister(&target.id);
                    }
                }
                done.complete(Ok(()));
            }
            other => other.fail(Error::Unexpected {
                message: "notify state resolved a non-notify request".to_string(),
            }),
        }
    }
}
