//! Instance runtime.
//!
//! An [`Instance`] executes a compiled model against a stream of dispatched
//! events with run-to-completion semantics. At most one RTC step runs at a
//! time, enforced by an async processing mutex; [`Instance::dispatch`] pushes
//! onto the queue and tries to acquire it, so a dispatch made from within a
//! behavior never re-enters the loop; the already-running drain picks the
//! event up in the same cycle.
//!
//! Activities run as spawned tasks under a cancellation tree rooted at the
//! instance: exiting a state cancels its activities and waits (bounded) for
//! acknowledgement; stopping the instance cancels everything transitively.

use crate::context::{AnyInstance, Ctx, InstanceRef, Registry};
use crate::event::{Done, Event};
use crate::kind::Kind;
use crate::model::{BehaviorFn, Element, Model};
use crate::muid;
use crate::path;
use crate::queue::EventQueue;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Hook invoked around each engine operation when configured. Receives the
/// step name (`dispatch`, `transition`, `enter`, `exit`, `execute`,
/// `evaluate`, `terminate`, `drop`, `process`, `stop`) and the qualified name
/// or event name it applies to; returns a closure invoked when the step
/// completes.
pub type Trace = Arc<dyn Fn(&str, &str) -> Box<dyn FnOnce() + Send> + Send + Sync>;

/// Options accepted by [`start`].
#[derive(Clone, Default)]
pub struct Config {
    /// Unique instance identifier; minted when absent.
    pub id: Option<String>,
    /// Display name; defaults to the model's name.
    pub name: Option<String>,
    /// Bounded wait for activity cancellation acknowledgement. Default 1 ms.
    pub activity_timeout: Option<Duration>,
    /// Payload delivered as `event.data` to the initial transition.
    pub initial_data: Option<Value>,
    /// Tracing hook invoked around engine operations.
    pub trace: Option<Trace>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = Some(timeout);
        self
    }

    pub fn with_initial_data(mut self, data: impl Into<Value>) -> Self {
        self.initial_data = Some(data.into());
        self
    }

    pub fn with_trace(mut self, trace: Trace) -> Self {
        self.trace = Some(trace);
        self
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("activity_timeout", &self.activity_timeout)
            .field("trace", &self.trace.is_some())
            .finish()
    }
}

/// Handle given to running activities: cancellation scope, context access,
/// and dispatch back into the owning instance.
pub struct ActivityContext<T> {
    instance: Instance<T>,
    token: CancellationToken,
}

impl<T> Clone for ActivityContext<T> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            token: self.token.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> ActivityContext<T> {
    /// Resolves when the activity's scope is cancelled. Activities must honor
    /// this for state exit to proceed promptly.
    pub fn cancelled(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Dispatches an event to the owning instance.
    pub fn dispatch(&self, event: Event) -> Done {
        self.instance.dispatch(event)
    }

    /// Runs a closure with exclusive access to the instance context.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut context = self.instance.inner.context.write();
        f(&mut context)
    }

    pub fn instance(&self) -> &Instance<T> {
        &self.instance
    }
}

struct ActiveScope {
    token: CancellationToken,
    done: oneshot::Receiver<()>,
}

struct Inner<T> {
    id: String,
    name: String,
    model: Arc<Model<T>>,
    context: RwLock<T>,
    /// Active leaf; `None` once stopped.
    state: RwLock<Option<String>>,
    queue: EventQueue,
    /// Deferred events held out of the queue until a transition fires.
    deferred: Mutex<Vec<Event>>,
    /// Running activities keyed by behavior qualified name. Mutated only in
    /// the processing loop and on activity termination.
    active: Mutex<HashMap<String, ActiveScope>>,
    processing: Arc<tokio::sync::Mutex<()>>,
    /// Idle generation, bumped after every drain of the queue.
    idle: watch::Sender<u64>,
    cancel: RwLock<CancellationToken>,
    terminated: AtomicBool,
    activity_timeout: Duration,
    trace: Option<Trace>,
    registry: Arc<Registry>,
    parents: Vec<InstanceRef>,
}

/// A running state machine instance. Cheap to clone; all clones share the
/// same runtime state.
pub struct Instance<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Instance<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Instance<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.read())
            .finish()
    }
}

/// Creates an instance, registers it in the context's registry, and executes
/// the model's initial transition before returning.
pub async fn start<T>(ctx: &Ctx, context: T, model: Arc<Model<T>>, config: Config) -> Instance<T>
where
    T: Send + Sync + 'static,
{
    let id = config
        .id
        .unwrap_or_else(|| muid::to_base32(muid::next()));
    let name = config.name.unwrap_or_else(|| model.name().to_string());
    let (idle, _) = watch::channel(0u64);
    let instance = Instance {
        inner: Arc::new(Inner {
            id,
            name,
            model,
            context: RwLock::new(context),
            state: RwLock::new(Some("/".to_string())),
            queue: EventQueue::new(),
            deferred: Mutex::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
            processing: Arc::new(tokio::sync::Mutex::new(())),
            idle,
            cancel: RwLock::new(CancellationToken::new()),
            terminated: AtomicBool::new(false),
            activity_timeout: config
                .activity_timeout
                .unwrap_or(Duration::from_millis(1)),
            trace: config.trace,
            registry: ctx.registry.clone(),
            parents: ctx.chain.clone(),
        }),
    };
    instance.inner.registry.insert(instance.reference());

    let guard = instance.inner.processing.clone().lock_owned().await;
    tracing::debug!(instance = %instance.inner.id, model = %instance.inner.name, "starting instance");
    let event = Event {
        kind: Kind::EVENT,
        name: String::new(),
        id: muid::next(),
        data: config.initial_data.unwrap_or(Value::Null),
    };
    instance.run_initial(&event).await;
    instance.process().await;
    instance.inner.idle.send_modify(|generation| *generation += 1);
    drop(guard);
    instance.maybe_schedule();
    instance
}

impl<T: Send + Sync + 'static> Instance<T> {
    /// Unique instance identifier.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Qualified name of the active leaf, or empty once stopped.
    pub fn state(&self) -> String {
        self.inner.state.read().clone().unwrap_or_default()
    }

    pub fn model(&self) -> &Arc<Model<T>> {
        &self.inner.model
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire) || self.inner.state.read().is_none()
    }

    /// Runs a closure with shared access to the instance context.
    pub fn with_context<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let context = self.inner.context.read();
        f(&context)
    }

    /// A type-erased handle to this instance.
    pub fn reference(&self) -> InstanceRef {
        InstanceRef(Arc::new(self.clone()))
    }

    /// A child context rooted at this instance. Instances started from it
    /// share the registry and keep this instance in their parent chain.
    pub fn context(&self) -> Ctx {
        let mut chain = self.inner.parents.clone();
        chain.push(self.reference());
        Ctx {
            registry: self.inner.registry.clone(),
            chain,
        }
    }

    /// Normalizes and enqueues an event, scheduling the process loop if it is
    /// not already running. The returned signal completes at the next idle
    /// point of the processing mutex; dispatches to a stopped instance
    /// resolve immediately.
    pub fn dispatch(&self, event: Event) -> Done {
        if self.is_stopped() {
            return Done::ready();
        }
        let mut event = event;
        if event.kind == Kind::NONE {
            event.kind = Kind::EVENT;
        }
        if event.id == 0 {
            event.id = muid::next();
        }
        if let Some(end) = self.trace("dispatch", &event.name) {
            end();
        }
        tracing::trace!(instance = %self.inner.id, event = %event.name, "dispatching");
        let target = *self.inner.idle.borrow() + 1;
        self.inner.queue.push(event);
        self.maybe_schedule();
        Done::until(self.inner.idle.subscribe(), target)
    }

    /// Stops the instance: exit protocol from the leaf up through the root,
    /// cancellation of all remaining activities, and removal from the
    /// registry.
    pub async fn stop(&self) {
        let guard = self.inner.processing.clone().lock_owned().await;
        let end = self.trace("stop", &self.state());
        self.stop_locked().await;
        if let Some(end) = end {
            end();
        }
        self.inner.idle.send_modify(|generation| *generation += 1);
        drop(guard);
    }

    /// Stops the instance and runs a fresh initial pass, optionally with new
    /// initial data.
    pub async fn restart(&self, data: Option<Value>) {
        let guard = self.inner.processing.clone().lock_owned().await;
        if self.inner.state.read().is_some() {
            self.stop_locked().await;
        }
        *self.inner.cancel.write() = CancellationToken::new();
        self.inner.terminated.store(false, Ordering::Release);
        self.inner.registry.insert(self.reference());
        *self.inner.state.write() = Some("/".to_string());
        tracing::debug!(instance = %self.inner.id, "restarting instance");
        let event = Event {
            kind: Kind::EVENT,
            name: String::new(),
            id: muid::next(),
            data: data.unwrap_or(Value::Null),
        };
        self.run_initial(&event).await;
        self.process().await;
        self.inner.idle.send_modify(|generation| *generation += 1);
        drop(guard);
        self.maybe_schedule();
    }

    // =========================================================================
    // Process loop
    // =========================================================================

    fn trace(&self, step: &str, detail: &str) -> Option<Box<dyn FnOnce() + Send>> {
        self.inner.trace.as_ref().map(|trace| trace(step, detail))
    }

    fn maybe_schedule(&self) {
        if self.inner.queue.is_empty() {
            return;
        }
        if let Ok(guard) = self.inner.processing.clone().try_lock_owned() {
            let instance = self.clone();
            tokio::spawn(async move {
                instance.run(guard).await;
            });
        }
    }

    async fn run(&self, guard: tokio::sync::OwnedMutexGuard<()>) {
        loop {
            self.process().await;
            self.inner.idle.send_modify(|generation| *generation += 1);
            if self.inner.queue.is_empty() {
                break;
            }
        }
        drop(guard);
        // An event pushed between the emptiness check and the unlock loses
        // the TryLock race in its dispatch; pick it up here.
        self.maybe_schedule();
    }

    /// Drains the queue. Deferred events are held aside in their original
    /// order; whenever a sweep fires a transition they are re-queued at the
    /// tail of the normal bucket and the drain repeats, so events deferred
    /// earlier are re-delivered in the configuration a later step produced.
    /// A sweep without a fired transition leaves them held for the next run.
    async fn process(&self) {
        let end = self.trace("process", "");
        loop {
            let mut fired = false;
            let mut sidelined: Vec<Event> = Vec::new();
            while let Some(event) = self.inner.queue.pop() {
                match AssertUnwindSafe(self.rtc_step(&event, &mut sidelined))
                    .catch_unwind()
                    .await
                {
                    Ok(stepped) => fired |= stepped,
                    Err(payload) => self.recover(payload),
                }
            }
            let mut held = self.inner.deferred.lock();
            held.extend(sidelined);
            if fired && !held.is_empty() {
                let again: Vec<Event> = held.drain(..).collect();
                drop(held);
                self.inner.queue.requeue(again);
                continue;
            }
            break;
        }
        if let Some(end) = end {
            end();
        }
    }

    fn recover(&self, payload: Box<dyn std::any::Any + Send>) {
        let description = panic_message(payload);
        tracing::error!(
            instance = %self.inner.id,
            state = %self.state(),
            "recovered panic in behavior: {description}"
        );
        let instance = self.clone();
        tokio::spawn(async move {
            instance.dispatch(Event::error(description));
        });
    }

    /// One run-to-completion step. Returns true if a transition fired.
    async fn rtc_step(&self, event: &Event, deferred: &mut Vec<Event>) -> bool {
        let Some(current) = self.inner.state.read().clone() else {
            return false;
        };
        let mut visited: Vec<String> = Vec::new();
        let mut cursor = current.clone();
        loop {
            let Some(transitions) = self
                .inner
                .model
                .element(&cursor)
                .and_then(|el| el.transitions())
            else {
                break;
            };
            if let Some(tq) = self.enabled(transitions, event) {
                let end = self.trace("transition", &tq);
                if let Some(next) = self.fire(&tq, &current, event).await {
                    *self.inner.state.write() = Some(next);
                }
                if let Some(end) = end {
                    end();
                }
                return true;
            }
            visited.push(cursor.clone());
            let owner = path::owner(&cursor);
            if owner.is_empty() {
                break;
            }
            cursor = owner.to_string();
        }

        // Nothing enabled anywhere on the ancestor chain: set the event aside
        // if a visited state defers it, otherwise drop it.
        for q in &visited {
            if let Some(Element::State(state)) = self.inner.model.element(q) {
                if path::matches_any(&event.name, &state.deferred) {
                    tracing::trace!(instance = %self.inner.id, event = %event.name, state = %q, "deferring event");
                    deferred.push(event.clone());
                    return false;
                }
            }
        }
        if let Some(end) = self.trace("drop", &event.name) {
            end();
        }
        tracing::trace!(instance = %self.inner.id, event = %event.name, "event not handled, dropping");
        false
    }

    /// Finds the first enabled transition among `transitions`, in declaration
    /// order (wildcard triggers already sorted last).
    fn enabled(&self, transitions: &[String], event: &Event) -> Option<String> {
        for tq in transitions {
            let Some(t) = self.inner.model.transition(tq) else {
                continue;
            };
            if !t
                .events
                .iter()
                .any(|spec| path::matches(&event.name, &spec.name))
            {
                continue;
            }
            if !self.evaluate(t.guard.as_deref(), event) {
                continue;
            }
            return Some(tq.clone());
        }
        None
    }

    fn evaluate(&self, guard: Option<&str>, event: &Event) -> bool {
        let Some(gq) = guard else { return true };
        let Some(constraint) = self.inner.model.constraint(gq) else {
            return true;
        };
        let end = self.trace("evaluate", gq);
        let satisfied = {
            let mut context = self.inner.context.write();
            (constraint.expression)(self, &mut context, event)
        };
        if let Some(end) = end {
            end();
        }
        satisfied
    }

    // =========================================================================
    // Transition engine
    // =========================================================================

    /// Executes a transition from the concrete active vertex `current`:
    /// exit bottom-up, effects in order, then entry top-down. Returns the new
    /// active leaf, or `None` when no path is precomputed for `current`.
    fn fire<'a>(
        &'a self,
        tq: &'a str,
        current: &'a str,
        event: &'a Event,
    ) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let Some(t) = self.inner.model.transition(tq) else {
                return None;
            };
            let Some(paths) = t.paths.get(current) else {
                tracing::debug!(transition = %tq, current = %current, "no precomputed path for active vertex");
                return None;
            };
            for exiting in &paths.exit {
                self.exit_element(exiting, event).await;
            }
            for eq in &t.effects {
                self.run_action(eq, event);
            }
            if t.kind.is(Kind::INTERNAL) {
                return Some(current.to_string());
            }
            for entering in &paths.enter {
                let default_entry = entering == &t.target;
                let landed = self.enter_element(entering, event, default_entry).await;
                if default_entry {
                    return landed;
                }
            }
            Some(t.target.clone())
        })
    }

    /// Entry protocol. For states: entry behaviors, then activities, then on
    /// default entry the recursion through the initial vertex. Choice
    /// vertices resolve immediately to a branch; a top-level final state
    /// terminates the instance.
    fn enter_element<'a>(
        &'a self,
        q: &'a str,
        event: &'a Event,
        default_entry: bool,
    ) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let end = self.trace("enter", q);
            let landed = match self.inner.model.element(q) {
                Some(Element::State(state)) => {
                    for bq in &state.entry {
                        self.run_action(bq, event);
                    }
                    for aq in &state.activities {
                        self.start_activity(aq, event);
                    }
                    match &state.initial {
                        Some(init) if default_entry => self.follow_initial(q, init, event).await,
                        _ => Some(q.to_string()),
                    }
                }
                Some(Element::Vertex(v)) if v.kind.is(Kind::CHOICE) => {
                    self.resolve_choice(q, &v.transitions, event).await
                }
                Some(Element::Vertex(v)) if v.kind.is(Kind::FINAL_STATE) => {
                    if path::owner(q) == "/" {
                        self.terminate().await;
                    }
                    Some(q.to_string())
                }
                _ => Some(q.to_string()),
            };
            if let Some(end) = end {
                end();
            }
            landed
        })
    }

    async fn follow_initial(&self, owner_q: &str, init_q: &str, event: &Event) -> Option<String> {
        let end = self.trace("initial", init_q);
        let landed = match self
            .inner
            .model
            .vertex(init_q)
            .and_then(|v| v.transitions.first())
        {
            Some(tq) => self.fire(tq, owner_q, event).await,
            None => Some(owner_q.to_string()),
        };
        if let Some(end) = end {
            end();
        }
        landed
    }

    /// Evaluates a choice's branches in declaration order and follows the
    /// first whose guard is satisfied; the last branch is unguarded by
    /// construction, so a choice always resolves.
    async fn resolve_choice(
        &self,
        q: &str,
        branches: &[String],
        event: &Event,
    ) -> Option<String> {
        for tq in branches {
            let Some(t) = self.inner.model.transition(tq) else {
                continue;
            };
            if !self.evaluate(t.guard.as_deref(), event) {
                continue;
            }
            return self.fire(tq, q, event).await;
        }
        None
    }

    /// Exit protocol: cancel activities (bounded wait each), then run exit
    /// behaviors in declaration order. Non-state vertices exit silently.
    async fn exit_element(&self, q: &str, event: &Event) {
        let end = self.trace("exit", q);
        if let Some(Element::State(state)) = self.inner.model.element(q) {
            for aq in &state.activities {
                self.terminate_activity(aq).await;
            }
            for bq in &state.exit {
                self.run_action(bq, event);
            }
        }
        if let Some(end) = end {
            end();
        }
    }

    fn run_action(&self, q: &str, event: &Event) {
        let Some(behavior) = self.inner.model.behavior(q) else {
            return;
        };
        if let BehaviorFn::Sync(action) = &behavior.action {
            let end = self.trace("execute", q);
            {
                let mut context = self.inner.context.write();
                action(self, &mut context, event);
            }
            if let Some(end) = end {
                end();
            }
        }
    }

    // =========================================================================
    // Activities
    // =========================================================================

    fn start_activity(&self, q: &str, event: &Event) {
        let Some(behavior) = self.inner.model.behavior(q) else {
            return;
        };
        let BehaviorFn::Activity(action) = &behavior.action else {
            return;
        };
        let token = self.inner.cancel.read().child_token();
        let (ack, done) = oneshot::channel();
        self.inner.active.lock().insert(
            q.to_string(),
            ActiveScope {
                token: token.clone(),
                done,
            },
        );
        let scope = ActivityContext {
            instance: self.clone(),
            token,
        };
        let future = action(scope, event.clone());
        let instance = self.clone();
        let qualified = q.to_string();
        tokio::spawn(async move {
            if let Err(payload) = AssertUnwindSafe(future).catch_unwind().await {
                let description = panic_message(payload);
                tracing::error!(activity = %qualified, "activity panicked: {description}");
                instance.dispatch(Event::error(format!(
                    "activity {qualified} panicked: {description}"
                )));
            }
            let _ = ack.send(());
        });
    }

    /// Cancels one activity and waits up to the configured timeout for its
    /// acknowledgement. A timeout is non-fatal but surfaces an error event.
    async fn terminate_activity(&self, q: &str) {
        let scope = self.inner.active.lock().remove(q);
        let Some(scope) = scope else { return };
        let end = self.trace("terminate", q);
        scope.token.cancel();
        if tokio::time::timeout(self.inner.activity_timeout, scope.done)
            .await
            .is_err()
        {
            tracing::error!(activity = %q, "activity did not acknowledge cancellation in time");
            let instance = self.clone();
            let qualified = q.to_string();
            tokio::spawn(async move {
                instance.dispatch(Event::error(format!(
                    "activity {qualified} cancellation timed out"
                )));
            });
        }
        if let Some(end) = end {
            end();
        }
    }

    /// Instance termination on entering a top-level final state: cancel all
    /// remaining activities, cancel the instance scope, and deregister. The
    /// active leaf stays on the final state.
    async fn terminate(&self) {
        let end = self.trace("terminate", &self.inner.id);
        tracing::debug!(instance = %self.inner.id, "entering top-level final state, terminating");
        self.cancel_remaining().await;
        self.inner.cancel.read().cancel();
        self.inner.terminated.store(true, Ordering::Release);
        self.inner.registry.remove(&self.inner.id);
        if let Some(end) = end {
            end();
        }
    }

    async fn cancel_remaining(&self) {
        let scopes: Vec<(String, ActiveScope)> = self.inner.active.lock().drain().collect();
        for (q, scope) in scopes {
            scope.token.cancel();
            if tokio::time::timeout(self.inner.activity_timeout, scope.done)
                .await
                .is_err()
            {
                tracing::error!(activity = %q, "activity did not acknowledge cancellation in time");
            }
        }
    }

    // =========================================================================
    // Lifecycle internals
    // =========================================================================

    async fn run_initial(&self, event: &Event) {
        match AssertUnwindSafe(self.enter_element("/", event, true))
            .catch_unwind()
            .await
        {
            Ok(Some(next)) => *self.inner.state.write() = Some(next),
            Ok(None) => {}
            Err(payload) => self.recover(payload),
        }
    }

    async fn stop_locked(&self) {
        let event = Event::default();
        loop {
            let Some(current) = self.inner.state.read().clone() else {
                break;
            };
            if let Err(payload) = AssertUnwindSafe(self.exit_element(&current, &event))
                .catch_unwind()
                .await
            {
                self.recover(payload);
            }
            let owner = path::owner(&current);
            let next = if !owner.is_empty() && self.inner.model.element(owner).is_some() {
                Some(owner.to_string())
            } else {
                None
            };
            *self.inner.state.write() = next;
        }
        while self.inner.queue.pop().is_some() {}
        self.inner.deferred.lock().clear();
        self.cancel_remaining().await;
        self.inner.cancel.read().cancel();
        self.inner.terminated.store(true, Ordering::Release);
        self.inner.registry.remove(&self.inner.id);
        tracing::debug!(instance = %self.inner.id, "stopped");
    }
}

impl<T: Send + Sync + 'static> AnyInstance for Instance<T> {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> String {
        Instance::state(self)
    }

    fn dispatch_any(&self, event: Event) -> Done {
        self.dispatch(event)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "behavior panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::*;
    use crate::context::{
        dispatch_all, dispatch_to, from_context, instances_from_context, propagate, propagate_all,
    };
    use crate::event::ERROR_EVENT_NAME;
    use serde_json::json;

    type TraceLog = Arc<Mutex<Vec<String>>>;

    fn track<T: Send + Sync + 'static>(
        log: &TraceLog,
        label: &str,
    ) -> impl Fn(&Instance<T>, &mut T, &Event) + Send + Sync + 'static {
        let log = log.clone();
        let label = label.to_string();
        move |_: &Instance<T>, _: &mut T, _: &Event| log.lock().push(label.clone())
    }

    fn take(log: &TraceLog) -> Vec<String> {
        log.lock().drain(..).collect()
    }

    async fn wait_for_state<T: Send + Sync + 'static>(sm: &Instance<T>, expected: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if sm.state() == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("state never became {expected}"));
    }

    struct TestCtx {
        foo: i32,
    }

    fn hsm_model(log: &TraceLog) -> Model<TestCtx> {
        define(
            "TestHSM",
            [
                state(
                    "s",
                    [
                        entry(track(log, "s.entry")),
                        exit(track(log, "s.exit")),
                        state(
                            "s1",
                            [
                                state(
                                    "s11",
                                    [
                                        entry(track(log, "s11.entry")),
                                        exit(track(log, "s11.exit")),
                                    ],
                                ),
                                initial([
                                    target("s11"),
                                    effect(track(log, "s1.initial.effect")),
                                ]),
                                exit(track(log, "s1.exit")),
                                entry(track(log, "s1.entry")),
                                transition([on("I"), effect(track(log, "s1.I.effect"))]),
                                transition([
                                    on("A"),
                                    target("/s/s1"),
                                    effect(track(log, "s1.A.effect")),
                                ]),
                            ],
                        ),
                        transition([
                            on("D"),
                            source("/s/s1/s11"),
                            target("/s/s1"),
                            effect(track(log, "s11.D.effect")),
                            guard(|_, c: &mut TestCtx, _| {
                                let ok = c.foo == 1;
                                c.foo = 0;
                                ok
                            }),
                        ]),
                        initial([
                            target("s1/s11"),
                            effect(track(log, "s.initial.effect")),
                        ]),
                        state(
                            "s2",
                            [
                                entry(track(log, "s2.entry")),
                                exit(track(log, "s2.exit")),
                                state(
                                    "s21",
                                    [
                                        state(
                                            "s211",
                                            [
                                                entry(track(log, "s211.entry")),
                                                exit(track(log, "s211.exit")),
                                                transition([
                                                    on("G"),
                                                    target("/s/s1/s11"),
                                                    effect(track(log, "s211.G.effect")),
                                                ]),
                                            ],
                                        ),
                                        initial([target("s211")]),
                                        entry(track(log, "s21.entry")),
                                        exit(track(log, "s21.exit")),
                                        transition([on("A"), target("/s/s2/s21")]),
                                    ],
                                ),
                                initial([
                                    target("s21/s211"),
                                    effect(track(log, "s2.initial.effect")),
                                ]),
                                transition([
                                    on("C"),
                                    target("/s/s1"),
                                    effect(track(log, "s2.C.effect")),
                                ]),
                            ],
                        ),
                        state(
                            "s3",
                            [
                                entry(track(log, "s3.entry")),
                                exit(track(log, "s3.exit")),
                            ],
                        ),
                        transition([on("*.P.*"), effect(track(log, "s.P.effect"))]),
                    ],
                ),
                final_state("exit"),
                initial([
                    target(choice_named(
                        "initial_choice",
                        [transition([target("/s/s2")])],
                    )),
                    effect(track(log, "initial.effect")),
                ]),
                transition([
                    on("D"),
                    source("/s/s1"),
                    target("/s"),
                    effect(track(log, "s1.D.effect")),
                    guard(|_, c: &mut TestCtx, _| {
                        let ok = c.foo == 0;
                        c.foo += 1;
                        ok
                    }),
                ]),
                transition_named("wildcard", [on("abcd*"), source("/s"), target("/s")]),
                transition([
                    on("D"),
                    source("/s"),
                    target("/s"),
                    effect(track(log, "s.D.effect")),
                ]),
                transition([
                    on("C"),
                    source("/s/s1"),
                    target("/s/s2"),
                    effect(track(log, "s1.C.effect")),
                ]),
                transition([
                    on("E"),
                    source("/s"),
                    target("/s/s1/s11"),
                    effect(track(log, "s.E.effect")),
                ]),
                transition([
                    on("G"),
                    source("/s/s1/s11"),
                    target("/s/s2/s21/s211"),
                    effect(track(log, "s11.G.effect")),
                ]),
                transition([
                    on("I"),
                    source("/s"),
                    effect(track(log, "s.I.effect")),
                    guard(|_, c: &mut TestCtx, _| {
                        let ok = c.foo == 0;
                        c.foo += 1;
                        ok
                    }),
                ]),
                transition([
                    on("H"),
                    source("/s/s1/s11"),
                    target(choice([
                        transition([
                            target("/s/s1"),
                            guard(|_, c: &mut TestCtx, _| c.foo == 0),
                        ]),
                        transition([
                            target("/s/s2"),
                            effect(track(log, "s11.H.choice.effect")),
                        ]),
                    ])),
                    effect(track(log, "s11.H.effect")),
                ]),
                transition([
                    on("J"),
                    source("/s/s2/s21/s211"),
                    target("/s/s1/s11"),
                    effect({
                        let log = log.clone();
                        move |instance: &Instance<TestCtx>, _: &mut TestCtx, _: &Event| {
                            log.lock().push("s11.J.effect".to_string());
                            instance.dispatch(Event::new("K"));
                        }
                    }),
                ]),
                transition([
                    on("K"),
                    source("/s/s1/s11"),
                    target("/s/s3"),
                    effect(track(log, "s11.K.effect")),
                ]),
                transition([on("Z"), effect(track(log, "Z.effect"))]),
                transition([
                    on("X"),
                    source("/s/s3"),
                    target("/exit"),
                    effect(track(log, "X.effect")),
                ]),
            ],
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hsm_end_to_end() {
        let log: TraceLog = Arc::new(Mutex::new(Vec::new()));
        let model = Arc::new(hsm_model(&log));
        let ctx = Ctx::new();
        let sm = start(
            &ctx,
            TestCtx { foo: 0 },
            model,
            Config::new().with_id("test"),
        )
        .await;

        assert_eq!(sm.state(), "/s/s2/s21/s211");
        assert_eq!(
            take(&log),
            vec![
                "initial.effect",
                "s.entry",
                "s2.entry",
                "s2.initial.effect",
                "s21.entry",
                "s211.entry"
            ]
        );

        sm.dispatch(Event::new("G")).await;
        assert_eq!(sm.state(), "/s/s1/s11");
        assert_eq!(
            take(&log),
            vec![
                "s211.exit",
                "s21.exit",
                "s2.exit",
                "s211.G.effect",
                "s1.entry",
                "s11.entry"
            ]
        );

        // Internal transition on an ancestor: effects only.
        sm.dispatch(Event::new("I")).await;
        assert_eq!(sm.state(), "/s/s1/s11");
        assert_eq!(take(&log), vec!["s1.I.effect"]);

        // Self transition exits and re-enters the source with default entry.
        sm.dispatch(Event::new("A")).await;
        assert_eq!(sm.state(), "/s/s1/s11");
        assert_eq!(
            take(&log),
            vec![
                "s11.exit",
                "s1.exit",
                "s1.A.effect",
                "s1.entry",
                "s1.initial.effect",
                "s11.entry"
            ]
        );

        // The more specific guarded transition loses, the ancestor's fires.
        sm.dispatch(Event::new("D")).await;
        assert_eq!(sm.state(), "/s");
        assert_eq!(take(&log), vec!["s11.exit", "s1.exit", "s1.D.effect"]);

        sm.dispatch(Event::new("D")).await;
        assert_eq!(sm.state(), "/s/s1/s11");
        assert_eq!(
            take(&log),
            vec![
                "s.exit",
                "s.D.effect",
                "s.entry",
                "s.initial.effect",
                "s1.entry",
                "s11.entry"
            ]
        );

        sm.dispatch(Event::new("D")).await;
        assert_eq!(sm.state(), "/s/s1");
        assert_eq!(take(&log), vec!["s11.exit", "s11.D.effect"]);

        sm.dispatch(Event::new("C")).await;
        assert_eq!(sm.state(), "/s/s2/s21/s211");
        assert_eq!(
            take(&log),
            vec![
                "s1.exit",
                "s1.C.effect",
                "s2.entry",
                "s2.initial.effect",
                "s21.entry",
                "s211.entry"
            ]
        );

        // Transition sourced above the active leaf exits the whole branch.
        sm.dispatch(Event::new("E")).await;
        assert_eq!(sm.state(), "/s/s1/s11");
        assert_eq!(
            take(&log),
            vec![
                "s211.exit",
                "s21.exit",
                "s2.exit",
                "s.E.effect",
                "s1.entry",
                "s11.entry"
            ]
        );

        sm.dispatch(Event::new("E")).await;
        assert_eq!(sm.state(), "/s/s1/s11");
        assert_eq!(
            take(&log),
            vec!["s11.exit", "s1.exit", "s.E.effect", "s1.entry", "s11.entry"]
        );

        // Choice resolution: foo is 0, the guarded branch wins.
        sm.dispatch(Event::new("H")).await;
        assert_eq!(sm.state(), "/s/s1");
        assert_eq!(take(&log), vec!["s11.H.effect", "s11.exit"]);

        sm.dispatch(Event::new("C")).await;
        assert_eq!(sm.state(), "/s/s2/s21/s211");
        take(&log);

        // Dispatch from within an effect is drained in the same cycle.
        sm.dispatch(Event::new("J")).await;
        assert_eq!(sm.state(), "/s/s3");
        assert_eq!(
            take(&log),
            vec![
                "s211.exit",
                "s21.exit",
                "s2.exit",
                "s11.J.effect",
                "s1.entry",
                "s11.entry",
                "s11.exit",
                "s1.exit",
                "s11.K.effect",
                "s3.entry"
            ]
        );

        // Wildcard trigger patterns.
        sm.dispatch(Event::new("K.P.A")).await;
        assert_eq!(sm.state(), "/s/s3");
        assert_eq!(take(&log), vec!["s.P.effect"]);

        // Internal transition on the root.
        sm.dispatch(Event::new("Z")).await;
        assert_eq!(sm.state(), "/s/s3");
        assert_eq!(take(&log), vec!["Z.effect"]);

        // Entering the top-level final state terminates the instance.
        sm.dispatch(Event::new("X")).await;
        assert_eq!(sm.state(), "/exit");
        assert_eq!(take(&log), vec!["s3.exit", "s.exit", "X.effect"]);
        assert!(sm.is_stopped());
        assert!(instances_from_context(&sm.context()).is_empty());

        // Dispatch after termination resolves immediately and changes nothing.
        sm.dispatch(Event::new("G")).await;
        assert_eq!(sm.state(), "/exit");

        sm.stop().await;
        assert_eq!(sm.state(), "");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_straight_transition() {
        let log: TraceLog = Arc::new(Mutex::new(Vec::new()));
        let model = Arc::new(
            define(
                "straight",
                [
                    state(
                        "foo",
                        [entry(track(&log, "foo.entry")), exit(track(&log, "foo.exit"))],
                    ),
                    state("bar", [entry(track(&log, "bar.entry"))]),
                    transition([
                        on("go"),
                        source("foo"),
                        target("bar"),
                        effect(track(&log, "go.effect")),
                    ]),
                    initial([target("foo")]),
                ],
            )
            .unwrap(),
        );
        let sm = start(&Ctx::new(), (), model, Config::new()).await;
        assert_eq!(sm.state(), "/foo");
        sm.dispatch(Event::new("go")).await;
        assert_eq!(sm.state(), "/bar");
        assert_eq!(
            take(&log),
            vec!["foo.entry", "foo.exit", "go.effect", "bar.entry"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_choice_branches_on_context() {
        struct Loan {
            score: i64,
        }
        fn loan_model() -> Model<Loan> {
            define(
                "loan",
                [
                    state("approved", []),
                    state("rejected", []),
                    initial([target(choice([
                        transition([
                            target("/approved"),
                            guard(|_, c: &mut Loan, _| c.score > 700),
                        ]),
                        transition([target("/rejected")]),
                    ]))]),
                ],
            )
            .unwrap()
        }

        let sm = start(
            &Ctx::new(),
            Loan { score: 800 },
            Arc::new(loan_model()),
            Config::new(),
        )
        .await;
        assert_eq!(sm.state(), "/approved");

        let sm = start(
            &Ctx::new(),
            Loan { score: 500 },
            Arc::new(loan_model()),
            Config::new(),
        )
        .await;
        assert_eq!(sm.state(), "/rejected");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_completion_events_preempt() {
        let model = Arc::new(
            define(
                "chain",
                [
                    initial([target("a")]),
                    state("a", [transition([on("b"), target("../b")])]),
                    state(
                        "b",
                        [
                            entry(|i: &Instance<()>, _: &mut (), _: &Event| {
                                i.dispatch(Event::new("e"));
                                i.dispatch(Event::completion("c"));
                            }),
                            transition([
                                on("c"),
                                source("."),
                                target(choice([
                                    transition([target("../c"), guard(|_, _, _| true)]),
                                    transition([target("../d")]),
                                ])),
                            ]),
                        ],
                    ),
                    state(
                        "c",
                        [
                            entry(|i: &Instance<()>, _: &mut (), _: &Event| {
                                i.dispatch(Event::new("e"));
                                i.dispatch(Event::completion("d"));
                            }),
                            transition([on("d"), target("../d")]),
                        ],
                    ),
                    state("d", []),
                ],
            )
            .unwrap(),
        );
        let sm = start(&Ctx::new(), (), model, Config::new()).await;
        assert_eq!(sm.state(), "/a");
        // The completion events dispatched from the entry behaviors jump
        // ahead of the queued "e" events, chaining b -> c -> d in one cycle.
        sm.dispatch(Event::new("b")).await;
        assert_eq!(sm.state(), "/d");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deferral_redelivers_after_transition() {
        let drops: TraceLog = Arc::new(Mutex::new(Vec::new()));
        let trace: Trace = {
            let drops = drops.clone();
            Arc::new(move |step: &str, detail: &str| {
                if step == "drop" {
                    drops.lock().push(detail.to_string());
                }
                Box::new(|| {}) as Box<dyn FnOnce() + Send>
            })
        };
        let model = Arc::new(
            define(
                "worker",
                [
                    state(
                        "busy",
                        [
                            defer(["update"]),
                            transition([on("complete"), target("/idle")]),
                        ],
                    ),
                    state("idle", [transition([on("update"), target("/done")])]),
                    state("done", []),
                    initial([target("busy")]),
                ],
            )
            .unwrap(),
        );
        let sm = start(&Ctx::new(), (), model, Config::new().with_trace(trace)).await;
        assert_eq!(sm.state(), "/busy");

        sm.dispatch(Event::new("update")).await;
        assert_eq!(sm.state(), "/busy");

        // The deferred update is re-delivered once complete moves us to idle.
        sm.dispatch(Event::new("complete")).await;
        assert_eq!(sm.state(), "/done");

        // In done nothing handles update; the drop is visible to the hook.
        sm.dispatch(Event::new("update")).await;
        assert_eq!(sm.state(), "/done");
        assert!(drops.lock().contains(&"update".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_timed_transition() {
        let log: TraceLog = Arc::new(Mutex::new(Vec::new()));
        let model = Arc::new(
            define(
                "timed",
                [
                    state("a", [exit(track(&log, "a.exit"))]),
                    state("b", [entry(track(&log, "b.entry"))]),
                    initial([target("a")]),
                    transition([
                        after(|_: &mut (), _: &Event| Some(Duration::from_secs(2))),
                        source("a"),
                        target("b"),
                        effect(track(&log, "after.effect")),
                    ]),
                ],
            )
            .unwrap(),
        );
        let sm = start(&Ctx::new(), (), model, Config::new()).await;
        assert_eq!(sm.state(), "/a");
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(sm.state(), "/b");
        assert_eq!(take(&log), vec!["a.exit", "after.effect", "b.entry"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_disabled_by_none() {
        let model = Arc::new(
            define(
                "disabled",
                [
                    state("a", []),
                    state("b", []),
                    initial([target("a")]),
                    transition([
                        after(|_: &mut (), _: &Event| None),
                        source("a"),
                        target("b"),
                    ]),
                ],
            )
            .unwrap(),
        );
        let sm = start(&Ctx::new(), (), model, Config::new()).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sm.state(), "/a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_rearms() {
        struct Counter {
            fires: u32,
        }
        let model = Arc::new(
            define(
                "tick",
                [
                    state("a", []),
                    initial([target("a")]),
                    transition([
                        every(|_: &mut Counter, _: &Event| Some(Duration::from_millis(500))),
                        effect(|_: &Instance<Counter>, c: &mut Counter, _: &Event| {
                            c.fires += 1
                        }),
                    ]),
                ],
            )
            .unwrap(),
        );
        let sm = start(&Ctx::new(), Counter { fires: 0 }, model, Config::new()).await;
        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert_eq!(sm.with_context(|c| c.fires), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_when_signal() {
        let notify = Arc::new(tokio::sync::Notify::new());
        let armed = Arc::new(AtomicBool::new(false));
        let model = Arc::new(
            define(
                "sig",
                [
                    state("a", []),
                    state("b", []),
                    initial([target("a")]),
                    transition([
                        when({
                            let notify = notify.clone();
                            let armed = armed.clone();
                            move |_: ActivityContext<()>, _: Event| {
                                let notify = notify.clone();
                                let first = !armed.swap(true, Ordering::SeqCst);
                                async move {
                                    if first {
                                        notify.notified().await;
                                        true
                                    } else {
                                        false
                                    }
                                }
                            }
                        }),
                        source("a"),
                        target("b"),
                    ]),
                ],
            )
            .unwrap(),
        );
        let sm = start(
            &Ctx::new(),
            (),
            model,
            Config::new().with_activity_timeout(Duration::from_millis(250)),
        )
        .await;
        assert_eq!(sm.state(), "/a");
        notify.notify_one();
        wait_for_state(&sm, "/b").await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_activity_cancelled_on_exit() {
        let started = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));
        let model = Arc::new(
            define(
                "act",
                [
                    state(
                        "a",
                        [activity({
                            let started = started.clone();
                            let cancelled = cancelled.clone();
                            move |ctx: ActivityContext<()>, _: Event| {
                                let started = started.clone();
                                let cancelled = cancelled.clone();
                                async move {
                                    started.store(true, Ordering::SeqCst);
                                    ctx.cancelled().await;
                                    cancelled.store(true, Ordering::SeqCst);
                                }
                            }
                        })],
                    ),
                    state("b", []),
                    transition([on("go"), source("a"), target("b")]),
                    initial([target("a")]),
                ],
            )
            .unwrap(),
        );
        let sm = start(
            &Ctx::new(),
            (),
            model,
            Config::new().with_activity_timeout(Duration::from_millis(250)),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.load(Ordering::SeqCst));
        assert!(!cancelled.load(Ordering::SeqCst));

        sm.dispatch(Event::new("go")).await;
        assert_eq!(sm.state(), "/b");
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_activity_cancellation_timeout_surfaces_error() {
        let model = Arc::new(
            define(
                "stuck",
                [
                    state(
                        "a",
                        [activity(|_: ActivityContext<()>, _: Event| async {
                            // Ignores its cancellation scope on purpose.
                            std::future::pending::<()>().await
                        })],
                    ),
                    state(
                        "b",
                        [transition([on(ERROR_EVENT_NAME), target("/failed")])],
                    ),
                    state("failed", []),
                    transition([on("go"), source("a"), target("b")]),
                    initial([target("a")]),
                ],
            )
            .unwrap(),
        );
        let sm = start(&Ctx::new(), (), model, Config::new()).await;
        sm.dispatch(Event::new("go")).await;
        // The timeout is non-fatal; the error event arrives asynchronously.
        wait_for_state(&sm, "/failed").await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panic_recovered_as_error_event() {
        let model = Arc::new(
            define(
                "panicky",
                [
                    state(
                        "a",
                        [
                            transition([
                                on("boom"),
                                target("/b"),
                                effect(|_: &Instance<()>, _: &mut (), _: &Event| {
                                    panic!("effect exploded")
                                }),
                            ]),
                            transition([on(ERROR_EVENT_NAME), target("/failed")]),
                        ],
                    ),
                    state("b", []),
                    state("failed", []),
                    initial([target("a")]),
                ],
            )
            .unwrap(),
        );
        let sm = start(&Ctx::new(), (), model, Config::new()).await;
        sm.dispatch(Event::new("boom")).await;
        wait_for_state(&sm, "/failed").await;
        // The instance keeps processing events after recovery.
        assert!(!sm.is_stopped());
    }

    fn flip_model() -> Model<()> {
        define(
            "flip",
            [
                state("foo", []),
                state("bar", []),
                transition([on("foo"), source("foo"), target("bar")]),
                transition([on("bar"), source("bar"), target("foo")]),
                initial([target("foo")]),
            ],
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispatch_all_and_dispatch_to() {
        let model = Arc::new(flip_model());
        let ctx = Ctx::new();
        let sm1 = start(&ctx, (), model.clone(), Config::new().with_id("sm1")).await;
        let sm2 = start(
            &sm1.context(),
            (),
            model.clone(),
            Config::new().with_id("sm2"),
        )
        .await;
        assert_eq!(sm1.state(), "/foo");
        assert_eq!(sm2.state(), "/foo");

        dispatch_all(&sm2.context(), Event::new("foo")).await;
        assert_eq!(sm1.state(), "/bar");
        assert_eq!(sm2.state(), "/bar");

        dispatch_to(&sm2.context(), Event::new("bar"), &["sm*"]).await;
        assert_eq!(sm1.state(), "/foo");
        assert_eq!(sm2.state(), "/foo");

        dispatch_to(&sm2.context(), Event::new("foo"), &["sm2"]).await;
        assert_eq!(sm1.state(), "/foo");
        assert_eq!(sm2.state(), "/bar");

        assert_eq!(from_context(&sm2.context()).unwrap().id(), "sm2");
        assert_eq!(instances_from_context(&sm2.context()).len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_propagation() {
        let model = Arc::new(flip_model());
        let ctx = Ctx::new();
        let sm1 = start(&ctx, (), model.clone(), Config::new().with_id("parent")).await;
        let sm2 = start(
            &sm1.context(),
            (),
            model.clone(),
            Config::new().with_id("child"),
        )
        .await;

        propagate(&sm2.context(), Event::new("foo")).await;
        assert_eq!(sm1.state(), "/bar");
        assert_eq!(sm2.state(), "/foo");

        let sm3 = start(
            &sm2.context(),
            (),
            model.clone(),
            Config::new().with_id("grandchild"),
        )
        .await;
        propagate_all(&sm3.context(), Event::new("foo")).await;
        // Both ancestors receive the event; sm1 is already in bar, where
        // "foo" has no transition, so only sm2 moves.
        assert_eq!(sm1.state(), "/bar");
        assert_eq!(sm2.state(), "/bar");
        assert_eq!(sm3.state(), "/foo");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_runs_exits_in_reverse() {
        let log: TraceLog = Arc::new(Mutex::new(Vec::new()));
        let model = Arc::new(
            define(
                "nested",
                [
                    state(
                        "s",
                        [
                            entry(track(&log, "s.entry")),
                            exit(track(&log, "s.exit")),
                            state(
                                "s1",
                                [
                                    entry(track(&log, "s1.entry")),
                                    exit(track(&log, "s1.exit")),
                                ],
                            ),
                            initial([target("s1")]),
                        ],
                    ),
                    initial([target("s")]),
                ],
            )
            .unwrap(),
        );
        let sm = start(&Ctx::new(), (), model, Config::new()).await;
        assert_eq!(take(&log), vec!["s.entry", "s1.entry"]);

        sm.stop().await;
        assert_eq!(sm.state(), "");
        assert_eq!(take(&log), vec!["s1.exit", "s.exit"]);
        assert!(instances_from_context(&sm.context()).is_empty());

        // Dispatch to a stopped instance resolves immediately.
        sm.dispatch(Event::new("anything")).await;
        assert_eq!(sm.state(), "");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart() {
        let model = Arc::new(flip_model());
        let ctx = Ctx::new();
        let sm = start(&ctx, (), model, Config::new().with_id("r1")).await;
        sm.dispatch(Event::new("foo")).await;
        assert_eq!(sm.state(), "/bar");

        sm.restart(None).await;
        assert_eq!(sm.state(), "/foo");
        assert_eq!(instances_from_context(&sm.context()).len(), 1);

        // Restart also revives a stopped instance.
        sm.stop().await;
        assert_eq!(sm.state(), "");
        sm.restart(None).await;
        assert_eq!(sm.state(), "/foo");
        sm.dispatch(Event::new("foo")).await;
        assert_eq!(sm.state(), "/bar");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_initial_data_reaches_initial_transition() {
        struct Holder {
            seen: Value,
        }
        let model = Arc::new(
            define(
                "seed",
                [
                    state("a", []),
                    initial([
                        target("a"),
                        effect(|_: &Instance<Holder>, c: &mut Holder, e: &Event| {
                            c.seen = e.data.clone();
                        }),
                    ]),
                ],
            )
            .unwrap(),
        );
        let sm = start(
            &Ctx::new(),
            Holder { seen: Value::Null },
            model,
            Config::new().with_initial_data(json!({"user": "ada"})),
        )
        .await;
        assert_eq!(sm.with_context(|c| c.seen.clone()), json!({"user": "ada"}));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_event_decode_in_guard() {
        #[derive(serde::Deserialize)]
        struct Payload {
            amount: i64,
        }
        let model = Arc::new(
            define(
                "pay",
                [
                    state("pending", []),
                    state("paid", []),
                    transition([
                        on("pay"),
                        source("pending"),
                        target("paid"),
                        guard(|_, _: &mut (), e: &Event| {
                            e.decode::<Payload>().is_some_and(|p| p.amount > 0)
                        }),
                    ]),
                    initial([target("pending")]),
                ],
            )
            .unwrap(),
        );
        let sm = start(&Ctx::new(), (), model, Config::new()).await;

        sm.dispatch(Event::new("pay").with_data(json!({"amount": 0})))
            .await;
        assert_eq!(sm.state(), "/pending");

        sm.dispatch(Event::new("pay").with_data(json!({"amount": 5})))
            .await;
        assert_eq!(sm.state(), "/paid");
    }
}
