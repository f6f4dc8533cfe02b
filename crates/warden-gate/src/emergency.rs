// emergency.rs: Global system state and the emergency response manager.
//
// Exactly one SystemState exists per process and only the EmergencyManager
// mutates it. The state machine:
//
//   NORMAL ──────────▶ EMERGENCY_MODE ──▶ NORMAL      (manual exit or expiry)
//   NORMAL ◀─────────▶ MAINTENANCE                    (manual or expiry)
//   MAINTENANCE ─────▶ EMERGENCY_MODE
//   EMERGENCY_MODE ──▶ EMERGENCY_MODE                 (replaces reason/expiry)
//   any ─────────────▶ SHUTDOWN                       (terminal)
//
// Every transition produces a signed EmergencyEvent that is durably
// appended to the audit trail *before* the new state becomes observable.
// A transition toward a more restrictive state is applied even when that
// append fails (the failure is reported in the outcome). A transition back
// to NORMAL needs the durable record or it does not happen.
//
// The hot path (`kind()`) is a single atomic load. Full details live behind
// an RwLock that the gate only reads when the system is not NORMAL.
// Transitions are serialised by an async mutex that is also held while
// shutdown callbacks run.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warden_audit::{AuditRecord, AuditTrail, RecordKind, SignatureVerifier, Signer};

use crate::error::GateError;

/// Coarse system state. Serializes as `NORMAL`, `EMERGENCY_MODE`, ...
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum SystemStateKind {
    Normal = 0,
    EmergencyMode = 1,
    Shutdown = 2,
    Maintenance = 3,
}

impl SystemStateKind {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SystemStateKind::Normal,
            1 => SystemStateKind::EmergencyMode,
            3 => SystemStateKind::Maintenance,
            // Anything unexpected is treated as the most restrictive state.
            _ => SystemStateKind::Shutdown,
        }
    }

    /// Whether the transition `self → next` is allowed.
    pub fn can_transition_to(&self, next: SystemStateKind) -> bool {
        use SystemStateKind::*;
        if *self == Shutdown {
            return false;
        }
        matches!(
            (self, next),
            (_, Shutdown)
                | (Normal, EmergencyMode)
                | (Maintenance, EmergencyMode)
                | (EmergencyMode, EmergencyMode)
                | (EmergencyMode, Normal)
                | (Normal, Maintenance)
                | (Maintenance, Normal)
        )
    }

    /// Reason code used by the gate's fast-path deny.
    pub fn deny_reason(&self) -> &'static str {
        match self {
            SystemStateKind::Normal => "",
            SystemStateKind::EmergencyMode => "emergency_mode_active",
            SystemStateKind::Shutdown => "system_shutdown",
            SystemStateKind::Maintenance => "maintenance_mode_active",
        }
    }
}

impl std::fmt::Display for SystemStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SystemStateKind::Normal => "NORMAL",
            SystemStateKind::EmergencyMode => "EMERGENCY_MODE",
            SystemStateKind::Shutdown => "SHUTDOWN",
            SystemStateKind::Maintenance => "MAINTENANCE",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyEventType {
    SecurityBreach,
    SystemCompromise,
    PolicyFailure,
    Manual,
    ManualShutdown,
    Maintenance,
    AutoExpiry,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// The current system state with its context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemState {
    pub state: SystemStateKind,
    pub entered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub initiated_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<EmergencyLevel>,
}

impl SystemState {
    fn initial() -> Self {
        Self {
            state: SystemStateKind::Normal,
            entered_at: Utc::now(),
            expires_at: None,
            reason: "startup".to_string(),
            initiated_by: "system".to_string(),
            level: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A signed record of one state transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmergencyEvent {
    pub event_id: Uuid,
    pub event_type: EmergencyEventType,
    pub level: EmergencyLevel,
    pub reason: String,
    pub initiated_by: String,
    pub from_state: SystemStateKind,
    pub to_state: SystemStateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    /// Base64 Ed25519 signature over the canonical event without this field.
    #[serde(default)]
    pub signature: String,
}

impl EmergencyEvent {
    /// Canonical JSON bytes the signature covers.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("signature");
        }
        Ok(value.to_string().into_bytes())
    }

    fn sign(mut self, signer: &dyn Signer) -> Result<Self, serde_json::Error> {
        self.signature = signer.sign_b64(&self.signing_bytes()?);
        Ok(self)
    }

    pub fn verify<V: SignatureVerifier + ?Sized>(&self, verifier: &V) -> bool {
        match self.signing_bytes() {
            Ok(bytes) => verifier.verify_b64(&bytes, &self.signature),
            Err(_) => false,
        }
    }
}

/// Extract emergency events from audit records, in log order.
pub fn events_from_records(records: &[AuditRecord]) -> Vec<EmergencyEvent> {
    records
        .iter()
        .filter(|r| r.kind == RecordKind::EmergencyEvent)
        .filter_map(|r| match r.payload_as::<EmergencyEvent>() {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(sequence = r.sequence, error = %e, "unreadable emergency event in audit log");
                None
            }
        })
        .collect()
}

/// Result of a transition.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub event: EmergencyEvent,
    /// Whether the event reached the audit log.
    pub persisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_error: Option<String>,
}

/// Hook run when the system shuts down.
#[async_trait]
pub trait ShutdownCallback: Send + Sync {
    fn name(&self) -> &str;

    async fn on_shutdown(&self, event: &EmergencyEvent) -> Result<(), String>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackOutcome {
    pub name: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    #[serde(flatten)]
    pub transition: TransitionOutcome,
    pub callbacks: Vec<CallbackOutcome>,
}

const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Owns the global SystemState.
pub struct EmergencyManager {
    kind: AtomicU8,
    state: RwLock<SystemState>,
    transition: tokio::sync::Mutex<()>,
    audit: AuditTrail,
    history: Mutex<VecDeque<EmergencyEvent>>,
    history_limit: usize,
    callbacks: Mutex<Vec<Arc<dyn ShutdownCallback>>>,
    callback_timeout: Duration,
}

impl EmergencyManager {
    pub fn new(audit: AuditTrail, callback_timeout: Duration) -> Self {
        Self {
            kind: AtomicU8::new(SystemStateKind::Normal as u8),
            state: RwLock::new(SystemState::initial()),
            transition: tokio::sync::Mutex::new(()),
            audit,
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            callbacks: Mutex::new(Vec::new()),
            callback_timeout,
        }
    }

    /// Current state kind. One atomic load.
    pub fn kind(&self) -> SystemStateKind {
        SystemStateKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    /// Full current state.
    pub fn status(&self) -> SystemState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Most recent events first.
    pub fn history(&self, limit: usize) -> Vec<EmergencyEvent> {
        let history = match self.history.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn register_shutdown_callback(&self, callback: Arc<dyn ShutdownCallback>) {
        let mut callbacks = match self.callbacks.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        callbacks.push(callback);
    }

    pub async fn enter_emergency_mode(
        &self,
        reason: &str,
        initiated_by: &str,
        duration: Option<chrono::Duration>,
        event_type: EmergencyEventType,
        level: EmergencyLevel,
    ) -> Result<TransitionOutcome, GateError> {
        let _guard = self.transition.lock().await;
        self.transition_locked(
            SystemStateKind::EmergencyMode,
            event_type,
            level,
            reason,
            initiated_by,
            expiry(duration),
        )
        .await
    }

    pub async fn exit_emergency_mode(
        &self,
        reason: &str,
        initiated_by: &str,
    ) -> Result<TransitionOutcome, GateError> {
        let _guard = self.transition.lock().await;
        self.require_current(SystemStateKind::EmergencyMode, SystemStateKind::Normal)?;
        self.transition_locked(
            SystemStateKind::Normal,
            EmergencyEventType::Manual,
            EmergencyLevel::Low,
            reason,
            initiated_by,
            None,
        )
        .await
    }

    pub async fn enter_maintenance(
        &self,
        reason: &str,
        initiated_by: &str,
        duration: Option<chrono::Duration>,
    ) -> Result<TransitionOutcome, GateError> {
        let _guard = self.transition.lock().await;
        self.transition_locked(
            SystemStateKind::Maintenance,
            EmergencyEventType::Maintenance,
            EmergencyLevel::Low,
            reason,
            initiated_by,
            expiry(duration),
        )
        .await
    }

    pub async fn exit_maintenance(
        &self,
        reason: &str,
        initiated_by: &str,
    ) -> Result<TransitionOutcome, GateError> {
        let _guard = self.transition.lock().await;
        self.require_current(SystemStateKind::Maintenance, SystemStateKind::Normal)?;
        self.transition_locked(
            SystemStateKind::Normal,
            EmergencyEventType::Maintenance,
            EmergencyLevel::Low,
            reason,
            initiated_by,
            None,
        )
        .await
    }

    /// Move to SHUTDOWN and run every registered callback.
    ///
    /// Callbacks run one after another, each in its own task, and share a
    /// single deadline. Callbacks that have not started when the deadline
    /// passes are reported as skipped.
    pub async fn shutdown(
        &self,
        reason: &str,
        initiated_by: &str,
        event_type: EmergencyEventType,
        level: EmergencyLevel,
    ) -> Result<ShutdownReport, GateError> {
        let _guard = self.transition.lock().await;
        let transition = self
            .transition_locked(
                SystemStateKind::Shutdown,
                event_type,
                level,
                reason,
                initiated_by,
                None,
            )
            .await?;

        let callbacks: Vec<Arc<dyn ShutdownCallback>> = match self.callbacks.lock() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let deadline = tokio::time::Instant::now() + self.callback_timeout;
        let mut outcomes = Vec::with_capacity(callbacks.len());

        for callback in callbacks {
            let name = callback.name().to_string();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::error!(callback = %name, "shutdown callback skipped: deadline passed");
                outcomes.push(CallbackOutcome {
                    name,
                    succeeded: false,
                    error: Some("skipped: shutdown deadline passed".into()),
                });
                continue;
            }

            let event = transition.event.clone();
            let cb = Arc::clone(&callback);
            let handle = tokio::spawn(async move { cb.on_shutdown(&event).await });
            let abort = handle.abort_handle();
            let error = match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(e),
                Ok(Err(join)) if join.is_panic() => Some("callback panicked".to_string()),
                Ok(Err(join)) => Some(join.to_string()),
                Err(_) => {
                    abort.abort();
                    Some("timed out".to_string())
                }
            };
            if let Some(ref e) = error {
                tracing::error!(callback = %name, error = %e, "shutdown callback failed");
            }
            outcomes.push(CallbackOutcome {
                name,
                succeeded: error.is_none(),
                error,
            });
        }

        Ok(ShutdownReport {
            transition,
            callbacks: outcomes,
        })
    }

    /// Apply auto-expiry. Returns the transition when one happened.
    pub async fn refresh(&self) -> Result<Option<TransitionOutcome>, GateError> {
        if !matches!(
            self.kind(),
            SystemStateKind::EmergencyMode | SystemStateKind::Maintenance
        ) {
            return Ok(None);
        }
        let _guard = self.transition.lock().await;
        let current = self.status();
        let expirable = matches!(
            current.state,
            SystemStateKind::EmergencyMode | SystemStateKind::Maintenance
        );
        if !expirable || !current.is_expired_at(Utc::now()) {
            return Ok(None);
        }
        let reason = format!("{} expired", current.state);
        self.transition_locked(
            SystemStateKind::Normal,
            EmergencyEventType::AutoExpiry,
            EmergencyLevel::Low,
            &reason,
            "system",
            None,
        )
        .await
        .map(Some)
    }

    /// Rebuild state from persisted events at startup.
    ///
    /// A persisted SHUTDOWN refuses the restart unless `acknowledge_shutdown`
    /// is set, in which case a restart event is recorded. An unexpired
    /// EMERGENCY_MODE or MAINTENANCE is resumed. Events whose signature does
    /// not verify are ignored.
    pub async fn restore(
        &self,
        events: &[EmergencyEvent],
        acknowledge_shutdown: bool,
    ) -> Result<(), GateError> {
        let signer = Arc::clone(self.audit.signer());
        let verified: Vec<&EmergencyEvent> = events
            .iter()
            .filter(|e| {
                let ok = e.verify(&*signer);
                if !ok {
                    tracing::warn!(event_id = %e.event_id, "ignoring emergency event with invalid signature");
                }
                ok
            })
            .collect();

        {
            let mut history = match self.history.lock() {
                Ok(h) => h,
                Err(poisoned) => poisoned.into_inner(),
            };
            for event in verified.iter().rev().take(self.history_limit).rev() {
                history.push_back((*event).clone());
            }
        }

        let last = match verified.last() {
            Some(event) => *event,
            None => return Ok(()),
        };

        match last.to_state {
            SystemStateKind::Shutdown if !acknowledge_shutdown => {
                Err(GateError::ShutdownPersisted {
                    at: last.timestamp.to_rfc3339(),
                    reason: last.reason.clone(),
                })
            }
            SystemStateKind::Shutdown => {
                let _guard = self.transition.lock().await;
                let event = EmergencyEvent {
                    event_id: Uuid::new_v4(),
                    event_type: EmergencyEventType::Manual,
                    level: EmergencyLevel::High,
                    reason: "restart after acknowledged shutdown".to_string(),
                    initiated_by: "operator".to_string(),
                    from_state: SystemStateKind::Shutdown,
                    to_state: SystemStateKind::Normal,
                    expires_at: None,
                    timestamp: Utc::now(),
                    signature: String::new(),
                }
                .sign(&**self.audit.signer())
                .map_err(|e| GateError::Backend(e.to_string()))?;
                let payload =
                    serde_json::to_value(&event).map_err(|e| GateError::Backend(e.to_string()))?;
                self.audit
                    .append_durable(RecordKind::EmergencyEvent, payload)
                    .await?;
                tracing::warn!(shutdown_at = %last.timestamp, "restarting after acknowledged shutdown");
                self.push_history(event);
                Ok(())
            }
            SystemStateKind::EmergencyMode | SystemStateKind::Maintenance => {
                self.apply(SystemState {
                    state: last.to_state,
                    entered_at: last.timestamp,
                    expires_at: last.expires_at,
                    reason: last.reason.clone(),
                    initiated_by: last.initiated_by.clone(),
                    level: Some(last.level),
                });
                tracing::info!(state = %last.to_state, "resumed persisted system state");
                self.refresh().await?;
                Ok(())
            }
            SystemStateKind::Normal => Ok(()),
        }
    }

    // ── Internals ──

    fn require_current(
        &self,
        expected: SystemStateKind,
        to: SystemStateKind,
    ) -> Result<(), GateError> {
        let from = self.kind();
        if from != expected {
            return Err(GateError::InvalidStateTransition {
                from,
                to,
                reason: format!("system is not in {}", expected),
            });
        }
        Ok(())
    }

    /// Caller holds the transition mutex.
    async fn transition_locked(
        &self,
        to: SystemStateKind,
        event_type: EmergencyEventType,
        level: EmergencyLevel,
        reason: &str,
        initiated_by: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<TransitionOutcome, GateError> {
        let from = self.kind();
        if !from.can_transition_to(to) {
            return Err(GateError::InvalidStateTransition {
                from,
                to,
                reason: if from == SystemStateKind::Shutdown {
                    "SHUTDOWN is terminal; restart the daemon to recover".to_string()
                } else {
                    "transition not permitted".to_string()
                },
            });
        }

        let event = EmergencyEvent {
            event_id: Uuid::new_v4(),
            event_type,
            level,
            reason: reason.to_string(),
            initiated_by: initiated_by.to_string(),
            from_state: from,
            to_state: to,
            expires_at,
            timestamp: Utc::now(),
            signature: String::new(),
        }
        .sign(&**self.audit.signer())
        .map_err(|e| GateError::Backend(e.to_string()))?;

        let persisted = match serde_json::to_value(&event) {
            Ok(payload) => self
                .audit
                .append_durable(RecordKind::EmergencyEvent, payload)
                .await
                .map_err(GateError::from),
            Err(e) => Err(GateError::Backend(e.to_string())),
        };

        let audit_error = match persisted {
            Ok(_) => None,
            Err(e) if to == SystemStateKind::Normal => {
                tracing::error!(error = %e, from = %from, "refusing transition to NORMAL without audit record");
                return Err(e);
            }
            Err(e) => {
                tracing::error!(error = %e, from = %from, to = %to, "emergency event not persisted; applying restrictive transition anyway");
                Some(e.to_string())
            }
        };

        self.apply(SystemState {
            state: to,
            entered_at: event.timestamp,
            expires_at,
            reason: reason.to_string(),
            initiated_by: initiated_by.to_string(),
            level: Some(level),
        });
        self.push_history(event.clone());

        tracing::info!(
            from = %from,
            to = %to,
            event_type = ?event_type,
            initiated_by = %initiated_by,
            reason = %reason,
            "system state transition"
        );

        Ok(TransitionOutcome {
            event,
            persisted: audit_error.is_none(),
            audit_error,
        })
    }

    fn apply(&self, state: SystemState) {
        let kind = state.state;
        match self.state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
        self.kind.store(kind as u8, Ordering::Release);
    }

    fn push_history(&self, event: EmergencyEvent) {
        let mut history = match self.history.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push_back(event);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }
}

fn expiry(duration: Option<chrono::Duration>) -> Option<DateTime<Utc>> {
    duration.and_then(|d| Utc::now().checked_add_signed(d))
}
