//! Subscription state machine.
//!
//! ```text
//! Pending --register--> Active --complete/error/stop--> Stopped
//!    \--duplicate id / connection closed--------------> Stopped
//! ```
//!
//! The id is reserved in the registry while Pending, before the procedure
//! runs, so a later request sees it. A stop or a connection close during
//! Pending ends the subscription before it ever starts.
//!
//! Events that arrive while Pending are buffered and flushed right after the
//! `started` envelope. All sends for one subscription happen under its phase
//! lock, so nothing can follow the terminal envelope. The cancel handle is
//! always invoked after the lock is released.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tracing::{debug, trace};

use procmux_protocol::{JsonRpc, RequestId, ResponseEnvelope};

use crate::outbox::Outbox;
use crate::procedure::ProcedureError;
use crate::registry::{Registration, SubscriptionRegistry};
use crate::stream::{CancelHandle, Observer, StreamEvent};

enum Phase {
    Pending(Vec<StreamEvent>),
    Active,
    Stopped,
}

/// One subscription started by a request on a connection.
pub struct Subscription {
    id: RequestId,
    jsonrpc: Option<JsonRpc>,
    path: String,
    token: u64,
    reservation: OnceLock<Registration>,
    phase: Mutex<Phase>,
    cancel: OnceLock<CancelHandle>,
    outbox: Outbox,
    registry: Weak<SubscriptionRegistry>,
}

impl Subscription {
    /// Creates a pending subscription bound to `registry`.
    pub fn new(
        id: RequestId,
        jsonrpc: Option<JsonRpc>,
        path: impl Into<String>,
        outbox: Outbox,
        registry: &Arc<SubscriptionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            jsonrpc,
            path: path.into(),
            token: registry.next_token(),
            reservation: OnceLock::new(),
            phase: Mutex::new(Phase::Pending(Vec::new())),
            cancel: OnceLock::new(),
            outbox,
            registry: Arc::downgrade(registry),
        })
    }

    /// Request id.
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Procedure path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Generation token allocated by the registry.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Returns true once the subscription reached its terminal state.
    pub fn is_stopped(&self) -> bool {
        matches!(*self.lock_phase(), Phase::Stopped)
    }

    /// Observer that feeds this subscription.
    ///
    /// Holds a weak reference; events for a dropped subscription are ignored.
    pub fn observer(self: &Arc<Self>) -> Observer {
        let weak = Arc::downgrade(self);
        Observer::new(move |event| {
            if let Some(subscription) = weak.upgrade() {
                subscription.on_event(event);
            }
        })
    }

    /// Stores the source's cancel handle. Only the first call has effect.
    pub fn set_cancel(&self, handle: CancelHandle) {
        if self.cancel.set(handle).is_err() {
            trace!(id = %self.id, "Cancel handle already set");
        }
    }

    /// Claims the id in the registry. Later calls return the first outcome.
    ///
    /// A closed registry stops the subscription right away.
    pub fn reserve(self: &Arc<Self>) -> Registration {
        let mut phase = self.lock_phase();
        if let Some(outcome) = self.reservation.get() {
            return *outcome;
        }
        let outcome = match self.registry.upgrade() {
            Some(registry) => registry.register(self.clone()),
            None => Registration::Closed,
        };
        if outcome == Registration::Closed {
            *phase = Phase::Stopped;
        }
        let _ = self.reservation.set(outcome);
        outcome
    }

    /// Leaves Pending once the source is subscribed.
    ///
    /// If the id was reserved, this sends `started` and flushes the buffered
    /// events. A duplicate id is answered with BAD_REQUEST. In every other
    /// case, including a stop that arrived while Pending, the source is
    /// cancelled without sending anything.
    pub fn activate(self: &Arc<Self>) -> Registration {
        let outcome = self.reserve();

        let mut phase = self.lock_phase();
        let terminated = match outcome {
            Registration::Registered => match mem::replace(&mut *phase, Phase::Active) {
                Phase::Pending(buffered) => {
                    self.send(ResponseEnvelope::started(self.id.clone()));
                    let mut terminated = false;
                    for event in buffered {
                        if self.deliver(&mut phase, event) {
                            terminated = true;
                            break;
                        }
                    }
                    if terminated {
                        self.unregister();
                    }
                    terminated
                }
                Phase::Active => false,
                Phase::Stopped => {
                    *phase = Phase::Stopped;
                    true
                }
            },
            Registration::Duplicate => {
                if !matches!(*phase, Phase::Stopped) {
                    *phase = Phase::Stopped;
                    self.send(ResponseEnvelope::error(
                        Some(self.id.clone()),
                        ProcedureError::bad_request("duplicate id").to_shape(&self.path),
                    ));
                }
                true
            }
            Registration::Closed => {
                *phase = Phase::Stopped;
                true
            }
        };
        drop(phase);

        debug!(id = %self.id, path = %self.path, ?outcome, "Subscription activation");
        if terminated {
            self.cancel_source();
        }
        outcome
    }

    /// Ends a subscription that never started, answering with `error`.
    ///
    /// Does nothing once the subscription has started or stopped.
    pub fn fail(&self, error: ProcedureError) {
        let mut phase = self.lock_phase();
        if !matches!(*phase, Phase::Pending(_)) {
            return;
        }
        *phase = Phase::Stopped;
        self.send(ResponseEnvelope::error(
            Some(self.id.clone()),
            error.to_shape(&self.path),
        ));
        self.unregister();
        drop(phase);

        self.cancel_source();
    }

    /// Client-requested stop. Sends `stopped` and cancels the source.
    ///
    /// A Pending subscription is stopped too; its source is cancelled as soon
    /// as it has one. Returns false if the subscription had already stopped.
    pub fn stop(&self) -> bool {
        let mut phase = self.lock_phase();
        if matches!(*phase, Phase::Stopped) {
            return false;
        }
        *phase = Phase::Stopped;
        self.send(ResponseEnvelope::stopped(self.id.clone()));
        drop(phase);

        self.cancel_source();
        true
    }

    /// Stops without sending anything, for connection teardown.
    pub fn cancel_silently(&self) {
        *self.lock_phase() = Phase::Stopped;
        self.cancel_source();
    }

    fn on_event(&self, event: StreamEvent) {
        let mut phase = self.lock_phase();
        let terminated = if let Phase::Pending(buffered) = &mut *phase {
            trace!(id = %self.id, "Buffering event until registration");
            buffered.push(event);
            false
        } else if matches!(*phase, Phase::Active) {
            self.deliver(&mut phase, event)
        } else {
            false
        };
        if terminated {
            self.unregister();
        }
        drop(phase);

        if terminated {
            self.cancel_source();
        }
    }

    /// Sends one event of an Active subscription. Returns true if it was terminal.
    fn deliver(&self, phase: &mut Phase, event: StreamEvent) -> bool {
        let terminal = event.is_terminal();
        if terminal {
            *phase = Phase::Stopped;
        }
        match event {
            StreamEvent::Item(value) => {
                self.send(ResponseEnvelope::data(self.id.clone(), value));
            }
            StreamEvent::Error(error) => {
                debug!(id = %self.id, path = %self.path, error = %error, "Subscription failed");
                self.send(ResponseEnvelope::error(
                    Some(self.id.clone()),
                    error.to_shape(&self.path),
                ));
            }
            StreamEvent::Complete => {
                debug!(id = %self.id, path = %self.path, "Subscription completed");
                self.send(ResponseEnvelope::stopped(self.id.clone()));
            }
        }
        terminal
    }

    fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if(&self.id, self.token);
        }
    }

    fn send(&self, envelope: ResponseEnvelope) {
        self.outbox.send(&envelope.with_jsonrpc(self.jsonrpc));
    }

    fn cancel_source(&self) {
        if let Some(handle) = self.cancel.get() {
            handle.cancel();
        }
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::ProcedureError;
    use crate::stream::Observable;
    use crate::stream::testing::ManualObservable;
    use procmux_protocol::ResponseEncoder;
    use serde_json::{Value, json};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup() -> (Arc<SubscriptionRegistry>, Outbox, UnboundedReceiver<Vec<u8>>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let (outbox, rx) = Outbox::channel(ResponseEncoder::default(), 64 * 1024);
        (registry, outbox, rx)
    }

    fn sent(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(serde_json::from_slice(&bytes).unwrap());
        }
        out
    }

    fn start(
        registry: &Arc<SubscriptionRegistry>,
        outbox: &Outbox,
        id: i64,
        observable: ManualObservable,
    ) -> (Arc<Subscription>, Registration) {
        let sub = Subscription::new(RequestId::from(id), None, "online", outbox.clone(), registry);
        let handle = Box::new(observable).subscribe(sub.observer());
        sub.set_cancel(handle);
        let outcome = sub.activate();
        (sub, outcome)
    }

    #[test]
    fn buffered_events_follow_started() {
        let (registry, outbox, mut rx) = setup();
        let (observable, source) =
            ManualObservable::with_initial(vec![StreamEvent::Item(json!("early"))]);

        let (sub, outcome) = start(&registry, &outbox, 1, observable);
        assert_eq!(outcome, Registration::Registered);
        source.emit(json!("live"));

        assert_eq!(
            sent(&mut rx),
            vec![
                json!({"id": 1, "result": {"type": "started"}}),
                json!({"id": 1, "result": {"type": "data", "data": "early"}}),
                json!({"id": 1, "result": {"type": "data", "data": "live"}}),
            ]
        );
        assert!(!sub.is_stopped());
        assert!(registry.contains(&RequestId::from(1)));
    }

    #[test]
    fn completion_sends_stopped_and_unregisters() {
        let (registry, outbox, mut rx) = setup();
        let (observable, source) = ManualObservable::new();
        let (sub, _) = start(&registry, &outbox, 2, observable);

        source.complete();
        source.emit(json!("late"));

        let wire = sent(&mut rx);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[1], json!({"id": 2, "result": {"type": "stopped"}}));
        assert!(sub.is_stopped());
        assert!(registry.is_empty());
    }

    #[test]
    fn error_sends_error_with_path() {
        let (registry, outbox, mut rx) = setup();
        let (observable, source) = ManualObservable::new();
        start(&registry, &outbox, 3, observable);

        source.fail(ProcedureError::new(
            procmux_protocol::ErrorKind::Forbidden,
            "go away",
        ));

        let wire = sent(&mut rx);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[1]["id"], json!(3));
        assert_eq!(wire[1]["error"]["message"], json!("go away"));
        assert_eq!(wire[1]["error"]["data"]["kind"], json!("FORBIDDEN"));
        assert_eq!(wire[1]["error"]["data"]["path"], json!("online"));
        assert!(registry.is_empty());
    }

    #[test]
    fn terminal_event_during_subscribe_is_flushed() {
        let (registry, outbox, mut rx) = setup();
        let (observable, source) = ManualObservable::with_initial(vec![
            StreamEvent::Item(json!(1)),
            StreamEvent::Complete,
            StreamEvent::Item(json!(2)),
        ]);

        let (sub, outcome) = start(&registry, &outbox, 4, observable);
        assert_eq!(outcome, Registration::Registered);
        assert_eq!(
            sent(&mut rx),
            vec![
                json!({"id": 4, "result": {"type": "started"}}),
                json!({"id": 4, "result": {"type": "data", "data": 1}}),
                json!({"id": 4, "result": {"type": "stopped"}}),
            ]
        );
        assert!(sub.is_stopped());
        assert!(registry.is_empty());
        assert_eq!(source.cancel_count(), 1);
    }

    #[test]
    fn duplicate_is_rejected_and_first_kept() {
        let (registry, outbox, mut rx) = setup();
        let (first, first_source) = ManualObservable::new();
        let (second, second_source) =
            ManualObservable::with_initial(vec![StreamEvent::Item(json!("dup"))]);

        start(&registry, &outbox, 5, first);
        let (dup, outcome) = start(&registry, &outbox, 5, second);

        assert_eq!(outcome, Registration::Duplicate);
        assert!(dup.is_stopped());
        assert_eq!(second_source.cancel_count(), 1);
        assert_eq!(first_source.cancel_count(), 0);

        let wire = sent(&mut rx);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0], json!({"id": 5, "result": {"type": "started"}}));
        assert_eq!(wire[1]["id"], json!(5));
        assert_eq!(wire[1]["error"]["message"], json!("duplicate id"));
        assert_eq!(wire[1]["error"]["data"]["kind"], json!("BAD_REQUEST"));

        first_source.emit(json!("still here"));
        assert_eq!(
            sent(&mut rx),
            vec![json!({"id": 5, "result": {"type": "data", "data": "still here"}})]
        );
    }

    #[test]
    fn closed_registry_rejects_activation() {
        let (registry, outbox, mut rx) = setup();
        registry.drain();
        let (observable, source) = ManualObservable::new();

        let (sub, outcome) = start(&registry, &outbox, 6, observable);
        assert_eq!(outcome, Registration::Closed);
        assert!(sub.is_stopped());
        assert_eq!(source.cancel_count(), 1);
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn stop_is_idempotent() {
        let (registry, outbox, mut rx) = setup();
        let (observable, source) = ManualObservable::new();
        let (sub, _) = start(&registry, &outbox, 8, observable);

        assert!(sub.stop());
        assert!(!sub.stop());
        source.emit(json!("after stop"));

        let wire = sent(&mut rx);
        assert_eq!(
            wire,
            vec![
                json!({"id": 8, "result": {"type": "started"}}),
                json!({"id": 8, "result": {"type": "stopped"}}),
            ]
        );
        assert_eq!(source.cancel_count(), 1);
    }

    #[test]
    fn version_tag_is_echoed() {
        let (registry, outbox, mut rx) = setup();
        let sub = Subscription::new(
            RequestId::from("tagged"),
            Some(JsonRpc::V2),
            "online",
            outbox,
            &registry,
        );
        sub.activate();
        assert_eq!(
            sent(&mut rx),
            vec![json!({"id": "tagged", "jsonrpc": "2.0", "result": {"type": "started"}})]
        );
    }

    #[test]
    fn reserved_id_is_visible_before_activation() {
        let (registry, outbox, mut rx) = setup();
        let sub = Subscription::new(RequestId::from(9), None, "online", outbox, &registry);

        assert_eq!(sub.reserve(), Registration::Registered);
        assert_eq!(sub.reserve(), Registration::Registered);
        assert!(registry.contains(&RequestId::from(9)));
        assert!(!sub.is_stopped());
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn stop_while_pending_cancels_on_activation() {
        let (registry, outbox, mut rx) = setup();
        let sub = Subscription::new(RequestId::from(10), None, "online", outbox, &registry);
        sub.reserve();

        assert!(sub.stop());
        registry.remove(&RequestId::from(10));

        let (observable, source) =
            ManualObservable::with_initial(vec![StreamEvent::Item(json!("too late"))]);
        let handle = Box::new(observable).subscribe(sub.observer());
        sub.set_cancel(handle);
        assert_eq!(sub.activate(), Registration::Registered);

        assert_eq!(
            sent(&mut rx),
            vec![json!({"id": 10, "result": {"type": "stopped"}})]
        );
        assert_eq!(source.cancel_count(), 1);
    }

    #[test]
    fn close_while_pending_is_silent() {
        let (registry, outbox, mut rx) = setup();
        let sub = Subscription::new(RequestId::from(11), None, "online", outbox, &registry);
        sub.reserve();
        for pending in registry.drain() {
            pending.cancel_silently();
        }

        let (observable, source) = ManualObservable::new();
        sub.set_cancel(Box::new(observable).subscribe(sub.observer()));
        sub.activate();

        assert!(sub.is_stopped());
        assert_eq!(source.cancel_count(), 1);
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn fail_answers_pending_once() {
        let (registry, outbox, mut rx) = setup();
        let sub = Subscription::new(RequestId::from(12), None, "online", outbox, &registry);
        sub.reserve();

        sub.fail(ProcedureError::bad_request("bad input"));
        sub.fail(ProcedureError::internal("again"));
        sub.activate();

        let wire = sent(&mut rx);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0]["error"]["message"], json!("bad input"));
        assert_eq!(wire[0]["error"]["data"]["path"], json!("online"));
        assert!(registry.is_empty());
    }

    #[test]
    fn started_precedes_events_racing_activation() {
        for round in 0..200 {
            let (registry, outbox, mut rx) = setup();
            let sub = Subscription::new(RequestId::from(round), None, "online", outbox, &registry);
            let (observable, source) = ManualObservable::new();
            sub.set_cancel(Box::new(observable).subscribe(sub.observer()));
            let barrier = std::sync::Barrier::new(2);

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    for n in 0..20 {
                        source.emit(json!(n));
                    }
                    source.complete();
                });
                barrier.wait();
                sub.activate();
            });

            let wire = sent(&mut rx);
            assert_eq!(wire.len(), 22, "round {round}");
            assert_eq!(wire[0]["result"]["type"], json!("started"));
            for (n, envelope) in wire[1..21].iter().enumerate() {
                assert_eq!(envelope["result"]["data"], json!(n), "round {round}");
            }
            assert_eq!(wire[21]["result"]["type"], json!("stopped"));
            assert!(registry.is_empty());
            assert_eq!(source.cancel_count(), 1);
        }
    }

    #[test]
    fn stop_racing_events_ends_the_stream_once() {
        for round in 0..200 {
            let (registry, outbox, mut rx) = setup();
            let (observable, source) = ManualObservable::new();
            let (sub, _) = start(&registry, &outbox, round, observable);
            let barrier = std::sync::Barrier::new(2);

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    for n in 0..20 {
                        source.emit(json!(n));
                    }
                    source.complete();
                });
                barrier.wait();
                sub.stop();
            });

            let wire = sent(&mut rx);
            let (last, body) = wire.split_last().unwrap();
            assert_eq!(body[0]["result"]["type"], json!("started"));
            for (n, envelope) in body[1..].iter().enumerate() {
                assert_eq!(envelope["result"]["data"], json!(n), "round {round}: {wire:?}");
            }
            assert_eq!(last["result"]["type"], json!("stopped"), "round {round}");
            assert!(sub.is_stopped());
            assert_eq!(source.cancel_count(), 1, "round {round}");
        }
    }
}
