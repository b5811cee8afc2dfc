//! Peripheral connection state machine.
//!
//! Tracks the connection phase and the progress of required-service
//! discovery. The machine performs no I/O: the session feeds it requests and
//! stack events and acts on what it returns.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::session::PeripheralHandle;

/// Connection state for a peripheral.
///
/// `Connecting` covers both link establishment and required-service
/// discovery; discovery progress stays internal to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the peripheral.
    #[default]
    Disconnected,
    /// Connecting, or connected and discovering required services.
    Connecting,
    /// Connected, required services discovered.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Why the peripheral was last disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DisconnectReason {
    /// A queued disconnect request.
    Requested,
    /// The queue was canceled while a link existed or was being set up.
    Canceled,
    /// The link dropped without being asked to.
    LinkLost,
    /// Required services were missing or could not be discovered.
    DiscoveryFailed,
    /// The stack refused the connection attempt.
    ConnectFailed,
    /// The stack does not know the peripheral.
    PeripheralInvalid,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Canceled => "canceled",
            Self::LinkLost => "link lost",
            Self::DiscoveryFailed => "discovery failed",
            Self::ConnectFailed => "connect failed",
            Self::PeripheralInvalid => "peripheral invalid",
        };
        f.write_str(s)
    }
}

/// Kind of connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionEventKind {
    /// A connect request started.
    Connecting,
    /// The link is up; service discovery follows.
    Connected,
    /// The stack failed to establish the link.
    FailedToConnect,
    /// Required services are discovered; requests may run.
    Ready,
    /// A disconnect was issued.
    Disconnecting,
    /// The link is down.
    Disconnected,
}

/// Event for connection state changes.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// The peripheral the event is about.
    pub peripheral: PeripheralHandle,
    /// What happened.
    pub kind: ConnectionEventKind,
    /// Reason, for `FailedToConnect` and `Disconnected`.
    pub reason: Option<DisconnectReason>,
    /// When the session observed it.
    pub timestamp: DateTime<Utc>,
}

impl ConnectionEvent {
    pub(crate) fn new(
        peripheral: PeripheralHandle,
        kind: ConnectionEventKind,
        reason: Option<DisconnectReason>,
    ) -> Self {
        Self {
            peripheral,
            kind,
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// Progress of service discovery after a stack report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Discovery {
    /// More characteristic discoveries are outstanding.
    Pending,
    /// Every required service was found; the machine is now `Connected`.
    Complete,
    /// These required services are absent; the machine is now disconnecting.
    Missing(Vec<Uuid>),
}

/// What a link-down report meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkDown {
    /// A disconnect we issued completed.
    Expected(DisconnectReason),
    /// The link dropped on its own.
    Unexpected,
}

#[derive(Debug)]
enum Phase {
    Disconnected,
    Connecting {
        required_services: Vec<Uuid>,
        link_up: bool,
        outstanding: usize,
        found: HashSet<Uuid>,
    },
    Connected,
    Disconnecting {
        reason: DisconnectReason,
    },
}

/// Published view of the machine, readable from any thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LinkStatus {
    pub(crate) state: ConnectionState,
    pub(crate) last_reason: Option<DisconnectReason>,
}

/// Connection phase and required-service discovery progress.
#[derive(Debug)]
pub(crate) struct ConnectionStateMachine {
    phase: Phase,
    last_reason: Option<DisconnectReason>,
    status: Arc<RwLock<LinkStatus>>,
}

impl ConnectionStateMachine {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Disconnected,
            last_reason: None,
            status: Arc::new(RwLock::new(LinkStatus::default())),
        }
    }

    /// Shared view updated on every transition.
    pub(crate) fn status(&self) -> Arc<RwLock<LinkStatus>> {
        self.status.clone()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match self.phase {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Connecting { .. } => ConnectionState::Connecting,
            Phase::Connected => ConnectionState::Connected,
            Phase::Disconnecting { .. } => ConnectionState::Disconnecting,
        }
    }

    pub(crate) fn last_reason(&self) -> Option<DisconnectReason> {
        self.last_reason
    }

    /// Whether a physical link exists or is being torn down.
    pub(crate) fn has_link(&self) -> bool {
        match self.phase {
            Phase::Disconnected => false,
            Phase::Connecting { link_up, .. } => link_up,
            Phase::Connected | Phase::Disconnecting { .. } => true,
        }
    }

    /// A connect request starts.
    pub(crate) fn begin_connect(&mut self, required_services: Vec<Uuid>) {
        debug_assert!(matches!(self.phase, Phase::Disconnected));
        self.last_reason = None;
        self.transition(Phase::Connecting {
            required_services,
            link_up: false,
            outstanding: 0,
            found: HashSet::new(),
        });
    }

    /// The stack reports the link is up. Returns the services to discover,
    /// or `None` when no connect is in progress.
    pub(crate) fn link_up(&mut self) -> Option<Vec<Uuid>> {
        match &mut self.phase {
            Phase::Connecting {
                required_services,
                link_up,
                ..
            } if !*link_up => {
                *link_up = true;
                debug!("Link up, discovering {} service(s)", required_services.len());
                Some(required_services.clone())
            }
            _ => None,
        }
    }

    /// The stack reports the discovered services. Characteristic discovery
    /// is expected once per returned service.
    pub(crate) fn services_discovered(&mut self, services: &[Uuid]) -> Discovery {
        if let Phase::Connecting {
            outstanding, found, ..
        } = &mut self.phase
        {
            *outstanding = services.len();
            found.extend(services.iter().copied());
        }
        self.check_discovery()
    }

    /// The stack finished discovering the characteristics of one service.
    pub(crate) fn characteristics_discovered(&mut self) -> Discovery {
        if let Phase::Connecting { outstanding, .. } = &mut self.phase {
            *outstanding = outstanding.saturating_sub(1);
        }
        self.check_discovery()
    }

    fn check_discovery(&mut self) -> Discovery {
        let missing = match &self.phase {
            Phase::Connecting {
                outstanding: 0,
                required_services,
                found,
                link_up: true,
            } => required_services
                .iter()
                .filter(|uuid| !found.contains(uuid))
                .copied()
                .collect::<Vec<_>>(),
            _ => return Discovery::Pending,
        };

        if missing.is_empty() {
            self.transition(Phase::Connected);
            Discovery::Complete
        } else {
            self.begin_disconnect(DisconnectReason::DiscoveryFailed);
            Discovery::Missing(missing)
        }
    }

    /// A disconnect is issued to the stack.
    pub(crate) fn begin_disconnect(&mut self, reason: DisconnectReason) {
        self.transition(Phase::Disconnecting { reason });
    }

    /// Drop a connect attempt that never reached the link.
    pub(crate) fn abort_connect(&mut self, reason: DisconnectReason) {
        self.last_reason = Some(reason);
        self.transition(Phase::Disconnected);
    }

    /// The stack reports the link is down. Returns `None` when already
    /// disconnected (duplicate report).
    pub(crate) fn link_down(&mut self) -> Option<LinkDown> {
        let outcome = match self.phase {
            Phase::Disconnected => return None,
            Phase::Disconnecting { reason } => LinkDown::Expected(reason),
            Phase::Connecting { link_up: false, .. } => {
                LinkDown::Expected(DisconnectReason::ConnectFailed)
            }
            Phase::Connecting { .. } | Phase::Connected => LinkDown::Unexpected,
        };
        self.last_reason = Some(match outcome {
            LinkDown::Expected(reason) => reason,
            LinkDown::Unexpected => DisconnectReason::LinkLost,
        });
        self.transition(Phase::Disconnected);
        Some(outcome)
    }

    fn transition(&mut self, next: Phase) {
        let old = self.state();
        self.phase = next;
        let new = self.state();
        if old != new {
            debug!("Connection state changed: {} -> {}", old, new);
        }
        *self.status.write() = LinkStatus {
            state: new,
            last_reason: self.last_reason,
        };
    }
}
