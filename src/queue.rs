//! FIFO request queue with a single running slot.
//!
//! The pending sequence is shared: callers append to it and drain it from
//! any thread. The running slot and the backlog of canceled requests belong
//! to the session worker alone.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::error::Error;
use crate::request::{Request, RequestStatus};

#[derive(Default)]
struct Pending {
    requests: VecDeque<Request>,
    /// Requests removed by a cancellation the worker has not applied yet.
    canceled: Vec<Request>,
    cancel_requested: bool,
}

/// What the worker should do next with the pending sequence.
pub(crate) enum Next {
    /// A cancellation is outstanding; apply it before starting anything.
    Cancel(Vec<Request>),
    /// Dispatch this request, already marked running.
    Start(Request),
}

/// Requests waiting to start, plus any cancellation not yet applied.
///
/// Appending, canceling and popping share one lock, so a request queued
/// after a cancellation can never start before that cancellation is applied.
#[derive(Clone, Default)]
pub(crate) struct PendingRequests {
    inner: Arc<Mutex<Pending>>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append to the tail.
    pub(crate) fn push(&self, request: Request) {
        self.inner.lock().requests.push_back(request);
    }

    /// Pop the head, unless a cancellation must be applied first.
    pub(crate) fn next(&self) -> Option<Next> {
        let mut pending = self.inner.lock();
        if pending.cancel_requested {
            pending.cancel_requested = false;
            return Some(Next::Cancel(std::mem::take(&mut pending.canceled)));
        }
        pending.requests.pop_front().map(Next::Start)
    }

    /// Remove every pending request and record a cancellation covering
    /// them. Returns how many were removed.
    pub(crate) fn cancel_all(&self) -> usize {
        let mut pending = self.inner.lock();
        let drained: Vec<Request> = pending.requests.drain(..).collect();
        let count = drained.len();
        pending.canceled.extend(drained);
        pending.cancel_requested = true;
        count
    }

    /// Take an outstanding cancellation, with the requests it removed.
    pub(crate) fn take_cancellation(&self) -> Option<Vec<Request>> {
        let mut pending = self.inner.lock();
        if !pending.cancel_requested {
            return None;
        }
        pending.cancel_requested = false;
        Some(std::mem::take(&mut pending.canceled))
    }

    /// Remove every pending and canceled request, in order.
    pub(crate) fn drain(&self) -> Vec<Request> {
        let mut pending = self.inner.lock();
        pending.cancel_requested = false;
        let mut drained = std::mem::take(&mut pending.canceled);
        drained.extend(pending.requests.drain(..));
        drained
    }

    /// Remove the leading requests matching `pred`, in order.
    pub(crate) fn drain_while(&self, mut pred: impl FnMut(&Request) -> bool) -> Vec<Request> {
        let mut pending = self.inner.lock();
        let count = pending.requests.iter().take_while(|r| pred(r)).count();
        pending.requests.drain(..count).collect()
    }

    /// Requests waiting to start.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// Whether nothing waits to start or to be canceled.
    pub(crate) fn is_empty(&self) -> bool {
        let pending = self.inner.lock();
        pending.requests.is_empty() && !pending.cancel_requested && pending.canceled.is_empty()
    }
}

/// Pending sequence, running slot and deferred cancellations.
pub(crate) struct RequestQueue {
    pending: PendingRequests,
    running: Option<Request>,
    deferred: VecDeque<Request>,
}

impl RequestQueue {
    pub(crate) fn new(pending: PendingRequests) -> Self {
        Self {
            pending,
            running: None,
            deferred: VecDeque::new(),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub(crate) fn running(&self) -> Option<&Request> {
        self.running.as_ref()
    }

    /// Whether nothing is running, waiting or awaiting cancellation.
    pub(crate) fn is_idle(&self) -> bool {
        self.running.is_none() && self.deferred.is_empty() && self.pending.is_empty()
    }

    /// Pop the head of the pending sequence and mark it running, or hand
    /// back an outstanding cancellation. A started request is either
    /// resolved at once or parked with [`Self::set_running`].
    pub(crate) fn start_next(&mut self) -> Option<Next> {
        debug_assert!(self.running.is_none());
        match self.pending.next()? {
            Next::Start(mut request) => {
                request.mark_running();
                debug!("Starting request {}", request);
                Some(Next::Start(request))
            }
            cancel => Some(cancel),
        }
    }

    /// Take a cancellation recorded by [`PendingRequests::cancel_all`].
    pub(crate) fn take_cancellation(&mut self) -> Option<Vec<Request>> {
        self.pending.take_cancellation()
    }

    /// Park a dispatched request until the stack resolves it.
    pub(crate) fn set_running(&mut self, request: Request) {
        debug_assert!(self.running.is_none(), "at most one running request");
        debug_assert_eq!(request.status(), RequestStatus::Running);
        self.running = Some(request);
    }

    pub(crate) fn take_running(&mut self) -> Option<Request> {
        self.running.take()
    }

    /// Take the running request only if `pred` accepts it.
    pub(crate) fn take_running_if(
        &mut self,
        pred: impl FnOnce(&Request) -> bool,
    ) -> Option<Request> {
        match &self.running {
            Some(request) if pred(request) => self.running.take(),
            _ => None,
        }
    }

    /// Resolve requests removed by a queue cancellation. While a request is
    /// running they wait for it, so completions stay in enqueue order.
    pub(crate) fn cancel(&mut self, drained: Vec<Request>) {
        if drained.is_empty() {
            return;
        }
        debug!("Canceling {} pending request(s)", drained.len());
        if self.running.is_some() {
            self.deferred.extend(drained);
        } else {
            drained.into_iter().for_each(|r| r.fail(Error::Canceled));
        }
    }

    /// Resolve the cancellations that waited for the running request.
    pub(crate) fn flush_deferred(&mut self) {
        debug_assert!(self.running.is_none());
        while let Some(request) = self.deferred.pop_front() {
            request.fail(Error::Canceled);
        }
    }

    /// Remove the pending requests ahead of the first matching one.
    pub(crate) fn drain_pending_until(
        &mut self,
        mut stop: impl FnMut(&Request) -> bool,
    ) -> Vec<Request> {
        self.pending.drain_while(|r| !stop(r))
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
