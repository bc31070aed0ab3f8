//! The workflow-authoring surface.
//!
//! A [`WorkflowContext`] is handed to every workflow function. All external
//! effects go through it: activities, timers, sub-workflows, signals, side
//! effects. Everything it returns is a durable future resolved from history,
//! which is what lets the same code replay deterministically.

use crate::sync::channel::{Channel, ReceiveFuture};
use crate::sync::future::{SharedFuture, WorkflowFuture};
use crate::sync::scheduler::{yield_now, SchedulerShared, YieldNow};
use crate::sync::select::Selector;
use crate::workflow::options::{ActivityOptions, SubWorkflowOptions};
use crate::workflow::state::WorkflowState;
use chrono::{DateTime, Utc};
use heddle_core::command::{Command, CommandAttributes};
use heddle_core::converter::{Converter, IntoPayloads, JsonConverter};
use heddle_core::error::WorkflowError;
use heddle_core::history::{Event, EventAttributes, WorkflowEvent};
use heddle_core::instance::WorkflowInstance;
use heddle_core::payload::Payload;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Tracks the cancelable operations created under one `with_cancel` scope.
pub(crate) struct CancelScope {
    canceled: Cell<bool>,
    canceled_future: SharedFuture<Payload>,
    timers: RefCell<Vec<(u64, SharedFuture<Payload>)>>,
    activities: RefCell<Vec<SharedFuture<Payload>>>,
    sub_workflows: RefCell<Vec<(u64, String, SharedFuture<Payload>)>>,
    children: RefCell<Vec<Rc<CancelScope>>>,
}

impl CancelScope {
    pub(crate) fn new(shared: Rc<SchedulerShared>) -> Rc<Self> {
        Rc::new(Self {
            canceled: Cell::new(false),
            canceled_future: SharedFuture::new(shared),
            timers: RefCell::new(Vec::new()),
            activities: RefCell::new(Vec::new()),
            sub_workflows: RefCell::new(Vec::new()),
            children: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.get()
    }

    /// Cancels every pending operation in the scope and its children:
    /// pending timers are canceled durably, activity futures are rejected
    /// (their late results are ignored on arrival), and each pending
    /// sub-workflow is sent a cancellation request.
    pub(crate) fn cancel(scope: &Rc<Self>, state: &Rc<RefCell<WorkflowState>>) {
        if scope.canceled.replace(true) {
            return;
        }

        for (timer_id, future) in scope.timers.borrow_mut().drain(..) {
            if future.is_settled() {
                continue;
            }
            {
                let mut st = state.borrow_mut();
                st.cancel_command(timer_id);
                let cancel_id = st.allocate_command_id();
                st.push_command(Command::new(
                    cancel_id,
                    CommandAttributes::CancelTimer { timer_event_id: timer_id },
                ));
            }
            future.settle(Err(WorkflowError::Canceled));
        }

        for future in scope.activities.borrow_mut().drain(..) {
            future.settle(Err(WorkflowError::Canceled));
        }

        for (command_id, child_instance_id, future) in scope.sub_workflows.borrow_mut().drain(..) {
            if future.is_settled() {
                continue;
            }
            let mut st = state.borrow_mut();
            // Cancellation requests are fire-and-forget messages; during
            // replay they were already delivered when the slice first ran.
            if !st.is_replaying() {
                let event = Event::new(
                    st.now(),
                    command_id,
                    EventAttributes::SubWorkflowCancellationRequested,
                );
                st.push_message(WorkflowEvent {
                    instance: WorkflowInstance::new(child_instance_id, String::new()),
                    event,
                });
            }
        }

        let children: Vec<Rc<CancelScope>> = scope.children.borrow_mut().drain(..).collect();
        for child in &children {
            Self::cancel(child, state);
        }

        scope.canceled_future.settle(Ok(Payload::default()));
    }
}

/// Cancels the scope returned by [`WorkflowContext::with_cancel`].
pub struct CancelHandle {
    scope: Rc<CancelScope>,
    state: Rc<RefCell<WorkflowState>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        CancelScope::cancel(&self.scope, &self.state);
    }
}

/// Context passed to workflow functions. Cheap to clone; clones share the
/// same execution state and cancellation scope.
pub struct WorkflowContext<C: Converter = JsonConverter> {
    state: Rc<RefCell<WorkflowState>>,
    shared: Rc<SchedulerShared>,
    converter: C,
    scope: Rc<CancelScope>,
}

impl<C: Converter> Clone for WorkflowContext<C> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            shared: Rc::clone(&self.shared),
            converter: self.converter.clone(),
            scope: Rc::clone(&self.scope),
        }
    }
}

impl<C: Converter> WorkflowContext<C> {
    pub(crate) fn new(
        state: Rc<RefCell<WorkflowState>>,
        shared: Rc<SchedulerShared>,
        converter: C,
        scope: Rc<CancelScope>,
    ) -> Self {
        Self { state, shared, converter, scope }
    }

    /// The instance this execution belongs to.
    pub fn instance(&self) -> WorkflowInstance {
        self.state.borrow().instance().clone()
    }

    /// The instance's logical clock: the timestamp of the last applied
    /// history event, never the host clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.state.borrow().now()
    }

    /// True while the execution is replaying previously committed history.
    pub fn is_replaying(&self) -> bool {
        self.state.borrow().is_replaying()
    }

    /// Schedules an activity and returns a future for its result.
    ///
    /// With `options.retry.max_attempts > 1` the activity is wrapped in a
    /// retry decorator: each failed attempt schedules a backoff timer and
    /// re-issues the activity, all recorded in history.
    pub fn schedule_activity<R>(
        &self,
        options: ActivityOptions,
        name: &str,
        args: impl IntoPayloads,
    ) -> WorkflowFuture<R>
    where
        R: DeserializeOwned + 'static,
    {
        let inputs = match args.into_payloads(&self.converter) {
            Ok(inputs) => inputs,
            Err(e) => {
                return WorkflowFuture::rejected(
                    Rc::clone(&self.shared),
                    WorkflowError::failure(format!("failed to encode activity inputs: {e}")),
                )
            }
        };
        let raw = if options.retry.max_attempts > 1 {
            self.schedule_activity_with_retry(options, name, inputs)
        } else {
            self.schedule_activity_raw(name, &options.version, inputs)
        };
        WorkflowFuture::new(raw, self.decoder::<R>())
    }

    fn schedule_activity_raw(
        &self,
        name: &str,
        version: &str,
        inputs: Vec<Payload>,
    ) -> SharedFuture<Payload> {
        if self.scope.is_canceled() {
            return SharedFuture::settled(Rc::clone(&self.shared), Err(WorkflowError::Canceled));
        }
        let future = {
            let mut st = self.state.borrow_mut();
            let id = st.allocate_command_id();
            st.push_command(Command::new(
                id,
                CommandAttributes::ScheduleActivity {
                    name: name.to_string(),
                    version: version.to_string(),
                    inputs,
                },
            ));
            st.register_future(id, Rc::clone(&self.shared))
        };
        self.scope.activities.borrow_mut().push(future.clone());
        future
    }

    fn schedule_activity_with_retry(
        &self,
        options: ActivityOptions,
        name: &str,
        inputs: Vec<Payload>,
    ) -> SharedFuture<Payload> {
        let outcome = SharedFuture::new(Rc::clone(&self.shared));
        let ctx = self.clone();
        let name = name.to_string();
        let result = outcome.clone();
        self.spawn(async move {
            let retry = options.retry;
            let mut backoff = retry.initial_backoff;
            let mut attempt = 1u32;
            loop {
                let raw = ctx.schedule_activity_raw(&name, &options.version, inputs.clone());
                let attempt_result =
                    WorkflowFuture::<Payload>::new(raw, Rc::new(|p: &Payload| Ok(p.clone()))).await;
                match attempt_result {
                    Ok(payload) => {
                        result.settle(Ok(payload));
                        return;
                    }
                    Err(error) => {
                        if attempt >= retry.max_attempts || error.is_canceled() {
                            result.settle(Err(error));
                            return;
                        }
                        if ctx.schedule_timer(backoff).await.is_err() {
                            result.settle(Err(WorkflowError::Canceled));
                            return;
                        }
                        let next = backoff.as_secs_f64() * retry.backoff_factor;
                        backoff = Duration::from_secs_f64(next.min(retry.max_backoff.as_secs_f64()));
                        attempt += 1;
                    }
                }
            }
        });
        outcome
    }

    /// Schedules a timer that fires after `delay` of workflow time.
    pub fn schedule_timer(&self, delay: Duration) -> WorkflowFuture<()> {
        let delta = match chrono::Duration::from_std(delay) {
            Ok(delta) => delta,
            Err(_) => {
                return WorkflowFuture::rejected(
                    Rc::clone(&self.shared),
                    WorkflowError::failure("timer delay out of range"),
                )
            }
        };
        let at = self.state.borrow().now() + delta;
        self.schedule_timer_at(at)
    }

    /// Schedules a timer that fires at an absolute time.
    pub fn schedule_timer_at(&self, at: DateTime<Utc>) -> WorkflowFuture<()> {
        if self.scope.is_canceled() {
            return WorkflowFuture::rejected(Rc::clone(&self.shared), WorkflowError::Canceled);
        }
        let (id, future) = {
            let mut st = self.state.borrow_mut();
            let id = st.allocate_command_id();
            st.push_command(Command::new(id, CommandAttributes::ScheduleTimer { at }));
            (id, st.register_future(id, Rc::clone(&self.shared)))
        };
        self.scope.timers.borrow_mut().push((id, future.clone()));
        WorkflowFuture::new(future, Rc::new(|_| Ok(())))
    }

    /// Schedules a sub-workflow and returns a future for its result. The
    /// parent does not have to await it.
    pub fn schedule_sub_workflow<R>(
        &self,
        options: SubWorkflowOptions,
        name: &str,
        args: impl IntoPayloads,
    ) -> WorkflowFuture<R>
    where
        R: DeserializeOwned + 'static,
    {
        let inputs = match args.into_payloads(&self.converter) {
            Ok(inputs) => inputs,
            Err(e) => {
                return WorkflowFuture::rejected(
                    Rc::clone(&self.shared),
                    WorkflowError::failure(format!("failed to encode sub-workflow inputs: {e}")),
                )
            }
        };
        if self.scope.is_canceled() {
            return WorkflowFuture::rejected(Rc::clone(&self.shared), WorkflowError::Canceled);
        }

        let future = {
            let mut st = self.state.borrow_mut();
            let id = st.allocate_command_id();
            let instance_id = options
                .instance_id
                .unwrap_or_else(|| format!("{}:{}", st.instance().instance_id, id));
            st.push_command(Command::new(
                id,
                CommandAttributes::ScheduleSubWorkflow {
                    instance_id: instance_id.clone(),
                    name: name.to_string(),
                    version: options.version.clone(),
                    inputs,
                },
            ));
            let future = st.register_future(id, Rc::clone(&self.shared));
            self.scope
                .sub_workflows
                .borrow_mut()
                .push((id, instance_id, future.clone()));
            future
        };
        WorkflowFuture::new(future, self.decoder::<R>())
    }

    /// Returns the channel for a named signal. Repeated calls with the same
    /// name return the same channel; values arriving before the first
    /// receiver are buffered.
    pub fn signal_channel<T>(&self, name: &str) -> SignalChannel<T, C>
    where
        T: DeserializeOwned + 'static,
    {
        let channel = self.state.borrow_mut().signal_channel(name, &self.shared);
        SignalChannel {
            name: name.to_string(),
            channel,
            converter: self.converter.clone(),
            _marker: PhantomData,
        }
    }

    /// Sends a signal to another workflow instance. Delivery is
    /// at-least-once: a slice that fails to commit re-sends on re-execution.
    pub fn signal_workflow(
        &self,
        instance_id: &str,
        name: &str,
        value: &impl Serialize,
    ) -> Result<(), WorkflowError> {
        let payload = self
            .converter
            .to_payload(value)
            .map_err(|e| WorkflowError::failure(format!("failed to encode signal value: {e}")))?;
        let mut st = self.state.borrow_mut();
        if st.is_replaying() {
            return Ok(());
        }
        let event = Event::new(
            st.now(),
            0,
            EventAttributes::SignalReceived { name: name.to_string(), arg: Some(payload) },
        );
        st.push_message(WorkflowEvent {
            instance: WorkflowInstance::new(instance_id.to_string(), String::new()),
            event,
        });
        Ok(())
    }

    /// Runs `f` exactly once and persists its value; replays return the
    /// stored value without invoking `f` again.
    pub fn side_effect<T, F>(&self, f: F) -> WorkflowFuture<T>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> T,
    {
        let (id, future, replaying) = {
            let mut st = self.state.borrow_mut();
            let id = st.allocate_command_id();
            let future = st.register_future(id, Rc::clone(&self.shared));
            (id, future, st.is_replaying())
        };

        if replaying {
            // Placeholder attributes; the command reconciles against the
            // recorded SideEffectResult and is never translated again.
            self.state.borrow_mut().push_command(Command::new(
                id,
                CommandAttributes::SideEffect { result: Payload::default() },
            ));
        } else {
            let value = f();
            let payload = self.converter.to_payload(&value).unwrap_or_default();
            self.state
                .borrow_mut()
                .push_command(Command::new(id, CommandAttributes::SideEffect { result: payload.clone() }));
            future.settle(Ok(payload));
        }

        WorkflowFuture::new(future, self.decoder::<T>())
    }

    /// Starts a child coroutine within the same instance. It never runs
    /// immediately; the scheduler resumes it at the next suspension point.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        self.shared.spawn(future);
    }

    /// Creates a typed channel for coordination between coroutines of this
    /// instance.
    pub fn channel<T>(&self) -> Channel<T> {
        Channel::new(Rc::clone(&self.shared))
    }

    /// Builder for waiting on the first-satisfied of several cases.
    pub fn select<'a>(&self) -> Selector<'a> {
        Selector::new()
    }

    /// Suspends the current coroutine for one scheduler round.
    pub fn yield_now(&self) -> YieldNow {
        yield_now(Rc::clone(&self.shared))
    }

    /// Derives a child cancellation scope. Operations scheduled through the
    /// returned context are canceled together when the handle fires.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let child = CancelScope::new(Rc::clone(&self.shared));
        self.scope.children.borrow_mut().push(Rc::clone(&child));
        if self.scope.is_canceled() {
            CancelScope::cancel(&child, &self.state);
        }
        let ctx = Self {
            state: Rc::clone(&self.state),
            shared: Rc::clone(&self.shared),
            converter: self.converter.clone(),
            scope: Rc::clone(&child),
        };
        let handle = CancelHandle { scope: child, state: Rc::clone(&self.state) };
        (ctx, handle)
    }

    /// Resolves once this context's cancellation scope is canceled.
    pub fn canceled(&self) -> WorkflowFuture<()> {
        WorkflowFuture::new(self.scope.canceled_future.clone(), Rc::new(|_| Ok(())))
    }

    pub(crate) fn scheduler_shared(&self) -> &Rc<SchedulerShared> {
        &self.shared
    }

    fn decoder<R: DeserializeOwned + 'static>(
        &self,
    ) -> Rc<dyn Fn(&Payload) -> Result<R, WorkflowError>> {
        let converter = self.converter.clone();
        Rc::new(move |payload| {
            converter
                .from_payload::<R>(payload)
                .map_err(|e| WorkflowError::failure(format!("failed to decode result payload: {e}")))
        })
    }
}

/// Typed view of a named per-instance signal channel.
pub struct SignalChannel<T, C: Converter = JsonConverter> {
    name: String,
    channel: Channel<Payload>,
    converter: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C: Converter> Clone for SignalChannel<T, C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            channel: self.channel.clone(),
            converter: self.converter.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, C: Converter> SignalChannel<T, C>
where
    T: DeserializeOwned + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receives the next signal value, suspending until one arrives.
    /// Resolves to `None` if the channel is closed.
    pub fn receive(&self) -> SignalReceiveFuture<T, C> {
        SignalReceiveFuture {
            inner: self.channel.receive(),
            name: self.name.clone(),
            converter: self.converter.clone(),
            _marker: PhantomData,
        }
    }

    /// The untyped payload channel, usable in a [`Selector`] receive case.
    pub fn raw(&self) -> Channel<Payload> {
        self.channel.clone()
    }
}

pub struct SignalReceiveFuture<T, C: Converter> {
    inner: ReceiveFuture<Payload>,
    name: String,
    converter: C,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C> Future for SignalReceiveFuture<T, C>
where
    T: DeserializeOwned + 'static,
    C: Converter + Unpin,
{
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Ready(Some(payload)) => match this.converter.from_payload::<T>(&payload) {
                Ok(value) => Poll::Ready(Some(value)),
                Err(e) => panic!("failed to decode signal '{}': {e}", this.name),
            },
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
