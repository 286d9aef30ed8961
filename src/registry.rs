use crate::errors::{AppError, AppResult};
use crate::models::InvocationState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{Duration, Instant};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct HandleInner {
    id: String,
    serial: u64,
    pid: Option<u32>,
    cancel: watch::Sender<bool>,
    state: watch::Sender<InvocationState>,
    started_at: Instant,
}

/// Shared view of one invocation: its identity, cancel signal and lifecycle state.
///
/// The serial distinguishes two invocations that reused the same id.
#[derive(Debug, Clone)]
pub struct InvocationHandle {
    inner: Arc<HandleInner>,
}

impl InvocationHandle {
    pub fn new(id: impl Into<String>, pid: Option<u32>) -> Self {
        let (cancel, _) = watch::channel(false);
        let (state, _) = watch::channel(InvocationState::Pending);
        Self {
            inner: Arc::new(HandleInner {
                id: id.into(),
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                pid,
                cancel,
                state,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    /// Returns true only for the call that actually raised the flag.
    pub fn request_cancel(&self) -> bool {
        self.inner.cancel.send_if_modified(|requested| {
            if *requested {
                return false;
            }
            *requested = true;
            true
        })
    }

    pub fn is_cancel_requested(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.inner.cancel.subscribe()
    }

    pub async fn cancelled(&self) {
        let mut signal = self.inner.cancel.subscribe();
        let _ = signal.wait_for(|requested| *requested).await;
    }

    pub fn state(&self) -> InvocationState {
        *self.inner.state.borrow()
    }

    /// Terminal states are final; later transitions are ignored.
    pub fn set_state(&self, next: InvocationState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<InvocationState> {
        self.inner.state.subscribe()
    }

    pub async fn wait_terminal(&self) -> InvocationState {
        let mut states = self.inner.state.subscribe();
        let reached = match states.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        reached
    }
}

#[derive(Debug)]
enum Slot {
    Active(InvocationHandle),
    PendingCancel { requested_at: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Running,
    CancelledOnArrival,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A registered invocation was signalled and reached this state.
    Terminated(InvocationState),
    /// Nothing was registered under the id; a pending-cancel marker was left.
    Deferred,
}

/// In-flight invocations by caller-chosen id.
///
/// The table lock is only held for map edits; signalling and waiting on a
/// child always happen after it is released.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    pending_cancel_ttl: Duration,
}

impl CommandRegistry {
    pub fn new(pending_cancel_ttl: Duration) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            pending_cancel_ttl,
        }
    }

    pub async fn register(&self, handle: &InvocationHandle) -> AppResult<Registration> {
        let mut slots = self.slots.lock().await;
        match slots.get(handle.id()) {
            Some(Slot::Active(existing)) if existing.serial() == handle.serial() => {
                return Ok(Registration::Running);
            }
            Some(Slot::Active(_)) => {
                tracing::warn!(invocation = %handle.id(), "id already registered by a running invocation");
                return Err(AppError::Registry(format!(
                    "invocation id {} is already running",
                    handle.id()
                )));
            }
            Some(Slot::PendingCancel { requested_at }) => {
                let fresh = requested_at.elapsed() <= self.pending_cancel_ttl;
                slots.remove(handle.id());
                if fresh {
                    drop(slots);
                    handle.request_cancel();
                    tracing::info!(invocation = %handle.id(), "pending cancel applied at registration");
                    return Ok(Registration::CancelledOnArrival);
                }
                tracing::debug!(invocation = %handle.id(), "discarding expired pending cancel");
            }
            None => {}
        }
        slots.insert(handle.id().to_string(), Slot::Active(handle.clone()));
        handle.set_state(InvocationState::Running);
        Ok(Registration::Running)
    }

    /// Safe at any time. An unknown id leaves a pending-cancel marker for
    /// the next registration of that id.
    pub async fn cancel(&self, id: &str) -> CancelOutcome {
        let target = {
            let mut slots = self.slots.lock().await;
            self.purge_expired(&mut slots);
            match slots.remove(id) {
                Some(Slot::Active(handle)) => Some(handle),
                Some(Slot::PendingCancel { .. }) | None => {
                    slots.insert(
                        id.to_string(),
                        Slot::PendingCancel {
                            requested_at: Instant::now(),
                        },
                    );
                    None
                }
            }
        };

        match target {
            Some(handle) => {
                handle.request_cancel();
                let state = handle.wait_terminal().await;
                tracing::info!(invocation = %id, state = state.as_str(), "invocation cancelled");
                CancelOutcome::Terminated(state)
            }
            None => {
                tracing::info!(invocation = %id, "cancel requested before registration, deferred");
                CancelOutcome::Deferred
            }
        }
    }

    /// Removes a registered invocation. Unknown ids and pending markers are
    /// left alone.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut slots = self.slots.lock().await;
        if matches!(slots.get(id), Some(Slot::Active(_))) {
            slots.remove(id);
            return true;
        }
        false
    }

    /// Unregisters `handle` only if the id still belongs to it.
    pub async fn release(&self, handle: &InvocationHandle) -> bool {
        let mut slots = self.slots.lock().await;
        match slots.get(handle.id()) {
            Some(Slot::Active(current)) if current.serial() == handle.serial() => {
                slots.remove(handle.id());
                true
            }
            _ => false,
        }
    }

    /// Cancels every registered invocation and forgets all pending markers.
    pub async fn stop_all(&self) -> usize {
        let handles: Vec<InvocationHandle> = {
            let mut slots = self.slots.lock().await;
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Active(handle) => Some(handle),
                    Slot::PendingCancel { .. } => None,
                })
                .collect()
        };
        for handle in &handles {
            handle.request_cancel();
        }
        for handle in &handles {
            handle.wait_terminal().await;
        }
        tracing::info!(count = handles.len(), "stopped all invocations");
        handles.len()
    }

    pub async fn is_active(&self, id: &str) -> bool {
        matches!(self.slots.lock().await.get(id), Some(Slot::Active(_)))
    }

    pub async fn has_pending_cancel(&self, id: &str) -> bool {
        match self.slots.lock().await.get(id) {
            Some(Slot::PendingCancel { requested_at }) => {
                requested_at.elapsed() <= self.pending_cancel_ttl
            }
            _ => false,
        }
    }

    pub async fn active_ids(&self) -> Vec<String> {
        let slots = self.slots.lock().await;
        let mut ids: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Active(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn purge_expired(&self, slots: &mut HashMap<String, Slot>) {
        let ttl = self.pending_cancel_ttl;
        slots.retain(|_, slot| match slot {
            Slot::PendingCancel { requested_at } => requested_at.elapsed() <= ttl,
            Slot::Active(_) => true,
        });
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::{CancelOutcome, CommandRegistry, InvocationHandle, Registration};
    use crate::errors::AppError;
    use crate::models::InvocationState;
    use tokio::time::Duration;

    /// Stands in for the runner's supervisor: settles the handle once cancel is raised.
    fn supervise(handle: &InvocationHandle) {
        let handle = handle.clone();
        tokio::spawn(async move {
            handle.cancelled().await;
            handle.set_state(InvocationState::Cancelled);
        });
    }

    #[tokio::test]
    async fn cancel_terminates_registered_invocation() {
        let registry = CommandRegistry::default();
        let handle = InvocationHandle::new("install:X", None);
        supervise(&handle);
        assert_eq!(registry.register(&handle).await.expect("register"), Registration::Running);
        assert_eq!(handle.state(), InvocationState::Running);

        let outcome = registry.cancel("install:X").await;
        assert_eq!(outcome, CancelOutcome::Terminated(InvocationState::Cancelled));
        assert!(!registry.is_active("install:X").await);
    }

    #[tokio::test]
    async fn cancel_before_register_never_reaches_running() {
        let registry = CommandRegistry::default();
        assert_eq!(registry.cancel("install:X").await, CancelOutcome::Deferred);
        assert!(registry.has_pending_cancel("install:X").await);

        let handle = InvocationHandle::new("install:X", None);
        let states = handle.subscribe_state();
        let registration = registry.register(&handle).await.expect("register");
        assert_eq!(registration, Registration::CancelledOnArrival);
        assert!(handle.is_cancel_requested());
        assert!(!states.has_changed().unwrap_or(true));
        assert_eq!(handle.state(), InvocationState::Pending);
        assert!(!registry.has_pending_cancel("install:X").await);
        assert!(!registry.is_active("install:X").await);
    }

    #[tokio::test]
    async fn expired_marker_does_not_cancel_later_invocation() {
        let registry = CommandRegistry::new(Duration::ZERO);
        registry.cancel("sync").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let handle = InvocationHandle::new("sync", None);
        assert_eq!(registry.register(&handle).await.expect("register"), Registration::Running);
        assert!(!handle.is_cancel_requested());
    }

    #[tokio::test]
    async fn duplicate_running_id_is_rejected() {
        let registry = CommandRegistry::default();
        let first = InvocationHandle::new("list", None);
        let second = InvocationHandle::new("list", None);
        registry.register(&first).await.expect("first");
        let error = registry.register(&second).await.expect_err("duplicate");
        assert!(matches!(error, AppError::Registry(_)));
        assert!(!registry.release(&second).await);
        assert!(registry.release(&first).await);
    }

    #[tokio::test]
    async fn unregister_unknown_id_is_a_no_op() {
        let registry = CommandRegistry::default();
        assert!(!registry.unregister("missing").await);
        registry.cancel("later").await;
        assert!(!registry.unregister("later").await);
        assert!(registry.has_pending_cancel("later").await);
    }

    #[tokio::test]
    async fn stop_all_cancels_everything_and_clears_markers() {
        let registry = CommandRegistry::default();
        let a = InvocationHandle::new("a", None);
        let b = InvocationHandle::new("b", None);
        for handle in [&a, &b] {
            supervise(handle);
            registry.register(handle).await.expect("register");
        }
        registry.cancel("pending").await;

        assert_eq!(registry.stop_all().await, 2);
        assert_eq!(a.state(), InvocationState::Cancelled);
        assert_eq!(b.state(), InvocationState::Cancelled);
        assert!(registry.active_ids().await.is_empty());
        assert!(!registry.has_pending_cancel("pending").await);
    }

    #[test]
    fn terminal_state_is_final() {
        let handle = InvocationHandle::new("x", Some(42));
        assert!(handle.set_state(InvocationState::Running));
        assert!(handle.set_state(InvocationState::Completed));
        assert!(!handle.set_state(InvocationState::Cancelled));
        assert_eq!(handle.state(), InvocationState::Completed);
        assert!(handle.request_cancel());
        assert!(!handle.request_cancel());
    }
}
