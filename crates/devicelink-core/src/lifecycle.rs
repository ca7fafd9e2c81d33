//! Connection lifecycle state machine.
//!
//! The daemon's overall health is tracked by a single validated state
//! machine. States:
//!
//! ```text
//! INIT ──► DISCONNECTED ──► DISCOVERING ──► PAIRING ──► CONNECTED ──► SYNCING ──► READY
//!                ▲                │             │            │           │           │
//!                └────────────────┴─────────────┴────────────┴───────────┴───────────┘
//! ```
//!
//! Every state may additionally enter ERROR; ERROR recovers to DISCONNECTED
//! or back to INIT. The transition table is static and directed — an invalid
//! transition (including `from == to`) is a programmer error in the caller
//! and is returned as [`TransitionError`], never silently swallowed.
//!
//! Side effects are applied atomically with a transition:
//! - entering ERROR snapshots the outgoing state into the context,
//! - leaving ERROR clears the error fields,
//! - entering DISCONNECTED clears device/pairing/sync context fields.
//!
//! Every successful transition appends to a bounded history ring and
//! notifies all registered listeners synchronously, in registration order,
//! with a cloned snapshot of the new context.

use std::collections::VecDeque;
use std::time::{Instant, SystemTime};

use thiserror::Error;

/// Number of past transitions retained for diagnostics.
pub const HISTORY_CAPACITY: usize = 64;

/// Lifecycle states of the daemon's primary device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Init,
    Disconnected,
    Discovering,
    Pairing,
    Connected,
    Syncing,
    Ready,
    Error,
}

impl LinkState {
    /// All states, in declaration order. Used by exhaustive table tests.
    pub const ALL: [LinkState; 8] = [
        LinkState::Init,
        LinkState::Disconnected,
        LinkState::Discovering,
        LinkState::Pairing,
        LinkState::Connected,
        LinkState::Syncing,
        LinkState::Ready,
        LinkState::Error,
    ];

    /// The states reachable from `self`.
    pub fn allowed_targets(&self) -> &'static [LinkState] {
        use LinkState::*;
        match self {
            Init => &[Disconnected, Error],
            Disconnected => &[Discovering, Error],
            Discovering => &[Pairing, Connected, Disconnected, Error],
            Pairing => &[Connected, Disconnected, Error],
            Connected => &[Syncing, Disconnected, Error],
            Syncing => &[Ready, Connected, Disconnected, Error],
            Ready => &[Syncing, Disconnected, Error],
            Error => &[Disconnected, Init],
        }
    }
}

/// Returns `true` if `from → to` is a valid transition.
///
/// Same-state "transitions" are always invalid.
pub fn can_transition(from: LinkState, to: LinkState) -> bool {
    from.allowed_targets().contains(&to)
}

/// Error returned for a disallowed transition. State is left unchanged.
#[derive(Debug, Error, PartialEq)]
#[error("invalid transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: LinkState,
    pub to: LinkState,
}

/// Mutable context carried alongside the current state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateContext {
    pub state: LinkState,
    /// Identifier of the device this link concerns, once known.
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    /// Machine-readable error kind; set only while in ERROR.
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    /// The state that was active when ERROR was entered.
    pub previous_state: Option<LinkState>,
    /// Feature-layer sync phase tag (opaque to the core).
    pub sync_phase: Option<String>,
    /// Wall-clock time of the last successful transition.
    pub last_transition: SystemTime,
}

/// Fields to update atomically with a transition.
///
/// `None` means "leave as is"; `Some` overwrites (explicit optionals rather
/// than sentinel values, so "not yet known" stays distinguishable from
/// "known empty").
#[derive(Debug, Clone, Default)]
pub struct ContextPatch {
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub sync_phase: Option<String>,
}

impl ContextPatch {
    /// Patch naming the device the link concerns.
    pub fn device(id: &str, name: &str) -> Self {
        Self {
            device_id: Some(id.to_string()),
            device_name: Some(name.to_string()),
            ..Self::default()
        }
    }

    /// Patch carrying an error kind and message (for ERROR transitions).
    pub fn error(kind: &str, message: &str) -> Self {
        Self {
            error_kind: Some(kind.to_string()),
            error_message: Some(message.to_string()),
            ..Self::default()
        }
    }
}

/// One entry in the transition history ring.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRecord {
    pub from: LinkState,
    pub to: LinkState,
    pub at: SystemTime,
}

type Listener = Box<dyn Fn(&StateContext) + Send>;

/// The lifecycle machine. Exactly one instance exists per daemon process.
pub struct LifecycleMachine {
    context: StateContext,
    started_at: Instant,
    history: VecDeque<TransitionRecord>,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
}

impl LifecycleMachine {
    /// Creates a machine in `INIT` with an empty context.
    pub fn new() -> Self {
        Self {
            context: StateContext {
                state: LinkState::Init,
                device_id: None,
                device_name: None,
                error_kind: None,
                error_message: None,
                previous_state: None,
                sync_phase: None,
                last_transition: SystemTime::now(),
            },
            started_at: Instant::now(),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    /// The current state.
    pub fn state(&self) -> LinkState {
        self.context.state
    }

    /// A snapshot of the current context.
    pub fn context(&self) -> StateContext {
        self.context.clone()
    }

    /// Time elapsed since the machine (and so the process) started.
    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// The most recent transitions, newest last, at most `limit` entries.
    pub fn history(&self, limit: usize) -> Vec<TransitionRecord> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// Registers a listener invoked synchronously after every successful
    /// transition, in registration order. Returns an id for [`Self::remove_listener`].
    pub fn on_transition(&mut self, listener: impl Fn(&StateContext) + Send + 'static) -> u64 {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Removes a previously registered listener. Unknown ids are ignored.
    pub fn remove_listener(&mut self, id: u64) {
        self.listeners.retain(|(lid, _)| *lid != id);
    }

    /// Attempts the transition `current → to`, applying `patch` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] and leaves the context untouched if `to`
    /// is not reachable from the current state.
    pub fn transition(
        &mut self,
        to: LinkState,
        patch: ContextPatch,
    ) -> Result<StateContext, TransitionError> {
        let from = self.context.state;
        if !can_transition(from, to) {
            return Err(TransitionError { from, to });
        }

        if from == LinkState::Error {
            self.context.error_kind = None;
            self.context.error_message = None;
            self.context.previous_state = None;
        }
        if to == LinkState::Error {
            self.context.previous_state = Some(from);
        }
        if to == LinkState::Disconnected {
            self.context.device_id = None;
            self.context.device_name = None;
            self.context.sync_phase = None;
        }

        if let Some(v) = patch.device_id {
            self.context.device_id = Some(v);
        }
        if let Some(v) = patch.device_name {
            self.context.device_name = Some(v);
        }
        if let Some(v) = patch.error_kind {
            self.context.error_kind = Some(v);
        }
        if let Some(v) = patch.error_message {
            self.context.error_message = Some(v);
        }
        if let Some(v) = patch.sync_phase {
            self.context.sync_phase = Some(v);
        }

        self.context.state = to;
        self.context.last_transition = SystemTime::now();

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            from,
            to,
            at: self.context.last_transition,
        });

        let snapshot = self.context.clone();
        for (_, listener) in &self.listeners {
            listener(&snapshot);
        }
        Ok(snapshot)
    }

    /// Detaches all listeners. Idempotent.
    pub fn destroy(&mut self) {
        self.listeners.clear();
    }
}

impl Default for LifecycleMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
