//! Unbounded typed channels usable only from workflow code.
//!
//! `send` never blocks; `receive` blocks while the channel is empty and not
//! closed. Channels underlie signal delivery and coordination between
//! coroutines of the same instance.

use crate::sync::scheduler::{CoroutineId, SchedulerShared};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

struct ChannelState<T> {
    queue: VecDeque<T>,
    closed: bool,
    waiters: Vec<CoroutineId>,
}

pub struct Channel<T> {
    state: Rc<RefCell<ChannelState<T>>>,
    shared: Rc<SchedulerShared>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self { state: Rc::clone(&self.state), shared: Rc::clone(&self.shared) }
    }
}

impl<T> Channel<T> {
    pub(crate) fn new(shared: Rc<SchedulerShared>) -> Self {
        Self {
            state: Rc::new(RefCell::new(ChannelState {
                queue: VecDeque::new(),
                closed: false,
                waiters: Vec::new(),
            })),
            shared,
        }
    }

    pub fn send(&self, value: T) {
        let mut state = self.state.borrow_mut();
        state.queue.push_back(value);
        for waiter in state.waiters.drain(..) {
            self.shared.make_ready(waiter);
        }
    }

    /// Closes the channel. Pending receivers observe `None` once the queue
    /// drains; further sends are discarded.
    pub fn close(&self) {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        for waiter in state.waiters.drain(..) {
            self.shared.make_ready(waiter);
        }
    }

    /// Receives the next value, suspending while the channel is empty.
    /// Resolves to `None` once the channel is closed and drained.
    pub fn receive(&self) -> ReceiveFuture<T> {
        ReceiveFuture { channel: self.clone() }
    }

    /// Non-blocking receive: `Some(Some(v))` for a value, `Some(None)` for
    /// closed-and-empty, `None` when a receive would suspend.
    pub(crate) fn try_receive(&self) -> Option<Option<T>> {
        let mut state = self.state.borrow_mut();
        match state.queue.pop_front() {
            Some(value) => Some(Some(value)),
            None if state.closed => Some(None),
            None => None,
        }
    }

    pub(crate) fn register_current_waiter(&self) {
        let id = self.shared.current();
        let mut state = self.state.borrow_mut();
        if !state.waiters.contains(&id) {
            state.waiters.push(id);
        }
    }
}

pub struct ReceiveFuture<T> {
    channel: Channel<T>,
}

impl<T> Future for ReceiveFuture<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.channel.try_receive() {
            Some(value) => Poll::Ready(value),
            None => {
                this.channel.register_current_waiter();
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::scheduler::Scheduler;

    #[test]
    fn send_before_receive_is_buffered() {
        let mut scheduler = Scheduler::new();
        let channel = Channel::new(scheduler.shared());
        channel.send(1);
        channel.send(2);

        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        let rx = channel.clone();
        scheduler.spawn(async move {
            sink.borrow_mut().push(rx.receive().await.unwrap());
            sink.borrow_mut().push(rx.receive().await.unwrap());
        });
        scheduler.run_until_blocked();

        assert_eq!(*received.borrow(), vec![1, 2]);
    }

    #[test]
    fn receive_blocks_until_send() {
        let mut scheduler = Scheduler::new();
        let channel: Channel<i32> = Channel::new(scheduler.shared());

        let received = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&received);
        let rx = channel.clone();
        scheduler.spawn(async move {
            *sink.borrow_mut() = rx.receive().await;
        });
        scheduler.run_until_blocked();
        assert!(received.borrow().is_none());

        channel.send(9);
        scheduler.run_until_blocked();
        assert_eq!(*received.borrow(), Some(9));
    }

    #[test]
    fn close_resolves_pending_receivers_with_none() {
        let mut scheduler = Scheduler::new();
        let channel: Channel<i32> = Channel::new(scheduler.shared());

        let observed = Rc::new(RefCell::new(Some(0)));
        let sink = Rc::clone(&observed);
        let rx = channel.clone();
        scheduler.spawn(async move {
            *sink.borrow_mut() = rx.receive().await;
        });
        scheduler.run_until_blocked();

        channel.close();
        scheduler.run_until_blocked();
        assert_eq!(*observed.borrow(), None);
    }
}
