//! Wait on the first-satisfied of a set of cases.
//!
//! Cases are evaluated in source order on every poll, and among
//! simultaneously ready cases the lowest-indexed one fires. That rule is
//! load-bearing: replay determinism depends on it.

use crate::sync::channel::Channel;
use crate::sync::future::WorkflowFuture;
use heddle_core::error::WorkflowError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

trait SelectCase {
    /// Fires the case if it is ready, running its handler inline.
    fn try_fire(&mut self) -> bool;
    /// Registers the selecting coroutine for wakeup.
    fn register(&self);
}

struct FutureCase<'a, T> {
    future: WorkflowFuture<T>,
    handler: Option<Box<dyn FnOnce(Result<T, WorkflowError>) + 'a>>,
}

impl<T> SelectCase for FutureCase<'_, T> {
    fn try_fire(&mut self) -> bool {
        if !self.future.is_ready() {
            return false;
        }
        // Settled, so polling decodes without registering a waiter.
        let pinned = Pin::new(&mut self.future);
        let outcome = match crate::sync::scheduler::poll_once(pinned) {
            Poll::Ready(value) => value,
            Poll::Pending => return false,
        };
        if let Some(handler) = self.handler.take() {
            handler(outcome);
        }
        true
    }

    fn register(&self) {
        self.future.inner().register_current_waiter();
    }
}

struct ReceiveCase<'a, T> {
    channel: Channel<T>,
    handler: Option<Box<dyn FnOnce(Option<T>) + 'a>>,
}

impl<T> SelectCase for ReceiveCase<'_, T> {
    fn try_fire(&mut self) -> bool {
        match self.channel.try_receive() {
            Some(value) => {
                if let Some(handler) = self.handler.take() {
                    handler(value);
                }
                true
            }
            None => false,
        }
    }

    fn register(&self) {
        self.channel.register_current_waiter();
    }
}

struct SendCase<'a, T> {
    channel: Channel<T>,
    value: Option<T>,
    handler: Option<Box<dyn FnOnce() + 'a>>,
}

impl<T> SelectCase for SendCase<'_, T> {
    fn try_fire(&mut self) -> bool {
        // Channels are unbounded; a send is always ready.
        if let Some(value) = self.value.take() {
            self.channel.send(value);
        }
        if let Some(handler) = self.handler.take() {
            handler();
        }
        true
    }

    fn register(&self) {}
}

/// Builder for a select operation. Await it to block until one case fires.
#[must_use = "a selector does nothing until awaited"]
pub struct Selector<'a> {
    cases: Vec<Box<dyn SelectCase + 'a>>,
    default_case: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Selector<'a> {
    pub fn new() -> Self {
        Self { cases: Vec::new(), default_case: None }
    }

    /// Fires when the future settles, passing its result to `handler`.
    pub fn future<T: 'static>(
        mut self,
        future: WorkflowFuture<T>,
        handler: impl FnOnce(Result<T, WorkflowError>) + 'a,
    ) -> Self {
        self.cases.push(Box::new(FutureCase { future, handler: Some(Box::new(handler)) }));
        self
    }

    /// Fires when a value (or close) can be received from the channel.
    pub fn receive<T: 'static>(
        mut self,
        channel: Channel<T>,
        handler: impl FnOnce(Option<T>) + 'a,
    ) -> Self {
        self.cases.push(Box::new(ReceiveCase { channel, handler: Some(Box::new(handler)) }));
        self
    }

    /// Fires when the value can be sent; always ready on unbounded channels.
    pub fn send<T: 'static>(
        mut self,
        channel: Channel<T>,
        value: T,
        handler: impl FnOnce() + 'a,
    ) -> Self {
        self.cases.push(Box::new(SendCase {
            channel,
            value: Some(value),
            handler: Some(Box::new(handler)),
        }));
        self
    }

    /// Fires when no other case is ready, instead of suspending.
    pub fn default(mut self, handler: impl FnOnce() + 'a) -> Self {
        self.default_case = Some(Box::new(handler));
        self
    }
}

impl Default for Selector<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl Future for Selector<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        for case in this.cases.iter_mut() {
            if case.try_fire() {
                return Poll::Ready(());
            }
        }
        if let Some(handler) = this.default_case.take() {
            handler();
            return Poll::Ready(());
        }
        for case in this.cases.iter() {
            case.register();
        }
        Poll::Pending
    }
}
