//! Queued peripheral requests.
//!
//! A request owns its payload and its completion handler. The handler is
//! wrapped in a [`Completion`], which guarantees it runs exactly once: either
//! explicitly with the request's outcome, or with [`Error::Canceled`] if the
//! request is dropped unresolved.

use bytes::Bytes;
use std::fmt;
use tracing::trace;
use uuid::Uuid;

use crate::ble::characteristics::{CharacteristicId, CharacteristicRef, WriteMode};
use crate::ble::notification::ValueChangedHandler;
use crate::error::{Error, Result};

/// Handler receiving the outcome of a request.
pub type CompletionHandler<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// A completion handler that fires exactly once.
pub(crate) struct Completion<T> {
    handler: Option<CompletionHandler<T>>,
}

impl<T> Completion<T> {
    pub(crate) fn new(handler: CompletionHandler<T>) -> Self {
        Self {
            handler: Some(handler),
        }
    }

    pub(crate) fn complete(mut self, result: Result<T>) {
        if let Some(handler) = self.handler.take() {
            handler(result);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler(Err(Error::Canceled));
        }
    }
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    /// Waiting in the queue.
    Pending,
    /// Dispatched, awaiting resolution.
    Running,
    /// Resolved with a stack or validation outcome.
    Completed,
    /// Resolved with [`Error::Canceled`].
    Canceled,
}

/// Kind of request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Connect and discover required services.
    Connect,
    /// Drop the link.
    Disconnect,
    /// Read the signal strength.
    ReadRssi,
    /// Read a characteristic's value.
    ReadCharacteristic,
    /// Write a characteristic's value.
    WriteCharacteristic,
    /// Subscribe to value changes.
    SetNotify,
    /// Unsubscribe from value changes.
    ClearNotify,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::ReadRssi => "read-rssi",
            Self::ReadCharacteristic => "read-characteristic",
            Self::WriteCharacteristic => "write-characteristic",
            Self::SetNotify => "set-notify",
            Self::ClearNotify => "clear-notify",
        };
        f.write_str(s)
    }
}

pub(crate) enum Operation {
    Connect {
        required_services: Vec<Uuid>,
        done: Completion<()>,
    },
    Disconnect {
        done: Completion<()>,
    },
    ReadRssi {
        done: Completion<i16>,
    },
    ReadCharacteristic {
        target: CharacteristicRef,
        done: Completion<Bytes>,
    },
    WriteCharacteristic {
        target: CharacteristicRef,
        payload: Bytes,
        mode: WriteMode,
        done: Completion<()>,
    },
    /// `handler == None` disables notifications.
    SetNotify {
        target: CharacteristicRef,
        handler: Option<ValueChangedHandler>,
        done: Completion<()>,
    },
}

impl Operation {
    pub(crate) fn fail(self, error: Error) {
        match self {
            Self::Connect { done, .. }
            | Self::Disconnect { done }
            | Self::WriteCharacteristic { done, .. }
            | Self::SetNotify { done, .. } => done.complete(Err(error)),
            Self::ReadRssi { done } => done.complete(Err(error)),
            Self::ReadCharacteristic { done, .. } => done.complete(Err(error)),
        }
    }

    fn kind(&self) -> RequestKind {
        match self {
            Self::Connect { .. } => RequestKind::Connect,
            Self::Disconnect { .. } => RequestKind::Disconnect,
            Self::ReadRssi { .. } => RequestKind::ReadRssi,
            Self::ReadCharacteristic { .. } => RequestKind::ReadCharacteristic,
            Self::WriteCharacteristic { .. } => RequestKind::WriteCharacteristic,
            Self::SetNotify {
                handler: Some(_), ..
            } => RequestKind::SetNotify,
            Self::SetNotify { handler: None, .. } => RequestKind::ClearNotify,
        }
    }
}

/// A queued request.
pub(crate) struct Request {
    id: u64,
    status: RequestStatus,
    operation: Operation,
}

impl Request {
    pub(crate) fn new(id: u64, operation: Operation) -> Self {
        Self {
            id,
            status: RequestStatus::Pending,
            operation,
        }
    }

    #[cfg(test)]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn status(&self) -> RequestStatus {
        self.status
    }

    pub(crate) fn kind(&self) -> RequestKind {
        self.operation.kind()
    }

    pub(crate) fn operation(&self) -> &Operation {
        &self.operation
    }

    /// The characteristic the request targets, if any.
    pub(crate) fn target(&self) -> Option<CharacteristicId> {
        match &self.operation {
            Operation::ReadCharacteristic { target, .. }
            | Operation::WriteCharacteristic { target, .. }
            | Operation::SetNotify { target, .. } => Some(target.id),
            _ => None,
        }
    }

    pub(crate) fn mark_running(&mut self) {
        debug_assert_eq!(self.status, RequestStatus::Pending);
        self.status = RequestStatus::Running;
    }

    /// Give up the operation to resolve it.
    pub(crate) fn into_operation(mut self, status: RequestStatus) -> Operation {
        self.status = status;
        trace!("Request {} resolved: {:?}", self, self.status);
        self.operation
    }

    /// Resolve the request with an error, whatever its kind.
    pub(crate) fn fail(self, error: Error) {
        let status = if error == Error::Canceled {
            RequestStatus::Canceled
        } else {
            RequestStatus::Completed
        };
        self.into_operation(status).fail(error);
    }

    /// Resolve a request that carries no success value.
    pub(crate) fn complete_unit(self, result: Result<()>) {
        if let Err(e) = result {
            return self.fail(e);
        }
        match self.into_operation(RequestStatus::Completed) {
            Operation::Connect { done, .. }
            | Operation::Disconnect { done }
            | Operation::WriteCharacteristic { done, .. }
            | Operation::SetNotify { done, .. } => done.complete(Ok(())),
            other => other.fail(mismatch("no value")),
        }
    }

    /// Resolve an RSSI read.
    pub(crate) fn complete_rssi(self, result: Result<i16>) {
        match result {
            Ok(rssi) => match self.into_operation(RequestStatus::Completed) {
                Operation::ReadRssi { done } => done.complete(Ok(rssi)),
                other => other.fail(mismatch("an RSSI")),
            },
            Err(e) => self.fail(e),
        }
    }

    /// Resolve a characteristic read.
    pub(crate) fn complete_value(self, result: Result<Bytes>) {
        match result {
            Ok(value) => match self.into_operation(RequestStatus::Completed) {
                Operation::ReadCharacteristic { done, .. } => done.complete(Ok(value)),
                other => other.fail(mismatch("a characteristic value")),
            },
            Err(e) => self.fail(e),
        }
    }
}

fn mismatch(carrying: &str) -> Error {
    Error::Unexpected {
        message: format!("request resolved with {carrying}"),
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.id, self.kind())?;
        if let Some(target) = self.target() {
            write!(f, " {}", target)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("status", &self.status)
            .field("target", &self.target())
            .finish()
    }
}
