//! Single-assignment workflow futures.
//!
//! A workflow future transitions `Pending → Resolved(value) | Rejected(error)`
//! exactly once. Awaiting a pending future records the current coroutine as a
//! waiter; settling moves every waiter back onto the ready queue. The settled
//! value is kept so any number of coroutines can observe it.

use crate::sync::scheduler::{CoroutineId, SchedulerShared};
use heddle_core::error::WorkflowError;
use heddle_core::payload::Payload;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

struct FutureState<T> {
    value: Option<Result<T, WorkflowError>>,
    waiters: Vec<CoroutineId>,
}

/// Untyped handle onto a single-assignment cell. Cloning shares the cell.
pub(crate) struct SharedFuture<T> {
    state: Rc<RefCell<FutureState<T>>>,
    shared: Rc<SchedulerShared>,
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self { state: Rc::clone(&self.state), shared: Rc::clone(&self.shared) }
    }
}

impl<T> SharedFuture<T> {
    pub(crate) fn new(shared: Rc<SchedulerShared>) -> Self {
        Self {
            state: Rc::new(RefCell::new(FutureState { value: None, waiters: Vec::new() })),
            shared,
        }
    }

    pub(crate) fn settled(shared: Rc<SchedulerShared>, result: Result<T, WorkflowError>) -> Self {
        let future = Self::new(shared);
        future.settle(result);
        future
    }

    /// Sets the cell and readies all waiters. Later settles are ignored;
    /// the first result wins (a canceled future keeps its rejection even if
    /// a late result arrives).
    pub(crate) fn settle(&self, result: Result<T, WorkflowError>) {
        let mut state = self.state.borrow_mut();
        if state.value.is_some() {
            return;
        }
        state.value = Some(result);
        for waiter in state.waiters.drain(..) {
            self.shared.make_ready(waiter);
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.state.borrow().value.is_some()
    }

    pub(crate) fn register_current_waiter(&self) {
        let id = self.shared.current();
        let mut state = self.state.borrow_mut();
        if !state.waiters.contains(&id) {
            state.waiters.push(id);
        }
    }
}

impl<T: Clone> SharedFuture<T> {
    pub(crate) fn value(&self) -> Option<Result<T, WorkflowError>> {
        self.state.borrow().value.clone()
    }
}

/// A durable promise, the only awaitable surface exposed to workflow code.
///
/// The raw cell always holds a [`Payload`]; the typed wrapper decodes at the
/// await point with the converter captured when the future was created.
pub struct WorkflowFuture<T> {
    inner: SharedFuture<Payload>,
    decode: Rc<dyn Fn(&Payload) -> Result<T, WorkflowError>>,
}

impl<T> WorkflowFuture<T> {
    pub(crate) fn new(
        inner: SharedFuture<Payload>,
        decode: Rc<dyn Fn(&Payload) -> Result<T, WorkflowError>>,
    ) -> Self {
        Self { inner, decode }
    }

    pub(crate) fn rejected(shared: Rc<SchedulerShared>, error: WorkflowError) -> Self {
        Self {
            inner: SharedFuture::settled(shared, Err(error)),
            decode: Rc::new(|_| {
                Err(WorkflowError::failure("rejected future carries no value"))
            }),
        }
    }

    pub(crate) fn inner(&self) -> &SharedFuture<Payload> {
        &self.inner
    }

    /// Whether awaiting would complete without suspending.
    pub fn is_ready(&self) -> bool {
        self.inner.is_settled()
    }
}

impl<T> Future for WorkflowFuture<T> {
    type Output = Result<T, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.inner.value() {
            Some(Ok(payload)) => Poll::Ready((this.decode)(&payload)),
            Some(Err(error)) => Poll::Ready(Err(error)),
            None => {
                this.inner.register_current_waiter();
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::scheduler::Scheduler;
    use std::cell::Cell;

    #[test]
    fn settling_wakes_waiters_in_fifo_order() {
        let mut scheduler = Scheduler::new();
        let shared = scheduler.shared();
        let future = SharedFuture::<Payload>::new(Rc::clone(&shared));
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..2 {
            let order = Rc::clone(&order);
            let typed = WorkflowFuture::<i32>::new(future.clone(), Rc::new(|_| Ok(7)));
            scheduler.spawn(async move {
                let value = typed.await.unwrap();
                order.borrow_mut().push((i, value));
            });
        }
        scheduler.run_until_blocked();
        assert!(order.borrow().is_empty());

        future.settle(Ok(Payload::default()));
        scheduler.run_until_blocked();
        assert_eq!(*order.borrow(), vec![(0, 7), (1, 7)]);
    }

    #[test]
    fn first_settle_wins() {
        let scheduler = Scheduler::new();
        let future = SharedFuture::<Payload>::new(scheduler.shared());

        future.settle(Err(WorkflowError::Canceled));
        future.settle(Ok(Payload::default()));

        assert!(matches!(future.value(), Some(Err(WorkflowError::Canceled))));
    }

    #[test]
    fn rejected_future_resolves_with_error() {
        let mut scheduler = Scheduler::new();
        let shared = scheduler.shared();
        let seen = Rc::new(Cell::new(false));

        let flag = Rc::clone(&seen);
        let future = WorkflowFuture::<i32>::rejected(shared, WorkflowError::failure("boom"));
        scheduler.spawn(async move {
            let result = future.await;
            assert_eq!(result, Err(WorkflowError::failure("boom")));
            flag.set(true);
        });
        scheduler.run_until_blocked();

        assert!(seen.get());
    }
}
