//! Single-threaded cooperative coroutine scheduler.
//!
//! Runs inside one workflow task execution. At most one coroutine runs at a
//! time; suspension happens only where workflow futures and channels return
//! `Pending`. Coroutines are plain futures polled with a no-op waker; wakeups
//! flow exclusively through [`SchedulerShared::make_ready`], driven by future
//! resolution and channel sends. Combined with the FIFO ready queue this
//! makes the resumption order, and therefore the emitted command sequence,
//! identical on every run over the same history.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub(crate) type CoroutineId = usize;
pub(crate) type CoroutineFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Wakeup surface shared between the scheduler and every workflow future and
/// channel created during the execution.
pub(crate) struct SchedulerShared {
    ready: RefCell<VecDeque<CoroutineId>>,
    spawned: RefCell<Vec<CoroutineFuture>>,
    current: Cell<Option<CoroutineId>>,
}

impl SchedulerShared {
    fn new() -> Self {
        Self {
            ready: RefCell::new(VecDeque::new()),
            spawned: RefCell::new(Vec::new()),
            current: Cell::new(None),
        }
    }

    /// Moves a blocked coroutine back onto the ready queue.
    pub(crate) fn make_ready(&self, id: CoroutineId) {
        let mut ready = self.ready.borrow_mut();
        if !ready.contains(&id) {
            ready.push_back(id);
        }
    }

    /// ID of the coroutine currently being polled.
    ///
    /// # Panics
    ///
    /// Panics when called outside a coroutine poll; workflow futures may only
    /// be awaited from workflow code.
    pub(crate) fn current(&self) -> CoroutineId {
        self.current
            .get()
            .expect("workflow futures may only be awaited from within workflow code")
    }

    /// Queues a new coroutine. It never starts immediately; the scheduler
    /// adopts it at the next opportunity.
    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        self.spawned.borrow_mut().push(Box::pin(future));
    }
}

pub(crate) struct Scheduler {
    shared: Rc<SchedulerShared>,
    coroutines: Vec<Option<CoroutineFuture>>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            shared: Rc::new(SchedulerShared::new()),
            coroutines: Vec::new(),
        }
    }

    pub(crate) fn shared(&self) -> Rc<SchedulerShared> {
        Rc::clone(&self.shared)
    }

    pub(crate) fn spawn(&mut self, future: impl Future<Output = ()> + 'static) {
        self.shared.spawn(future);
        self.adopt_spawned();
    }

    /// Resumes ready coroutines in FIFO order until every coroutine is
    /// blocked or finished.
    pub(crate) fn run_until_blocked(&mut self) {
        self.adopt_spawned();
        loop {
            let next = self.shared.ready.borrow_mut().pop_front();
            let Some(id) = next else { break };
            let Some(mut future) = self.coroutines.get_mut(id).and_then(Option::take) else {
                continue;
            };

            self.shared.current.set(Some(id));
            let poll = poll_once(future.as_mut());
            self.shared.current.set(None);

            if poll.is_pending() {
                self.coroutines[id] = Some(future);
            }
            self.adopt_spawned();
        }
    }

    fn adopt_spawned(&mut self) {
        let spawned: Vec<CoroutineFuture> = self.shared.spawned.borrow_mut().drain(..).collect();
        for future in spawned {
            let id = self.coroutines.len();
            self.coroutines.push(Some(future));
            self.shared.make_ready(id);
        }
    }
}

/// Suspends the current coroutine for one scheduler round by re-queueing it
/// behind everything already ready.
pub(crate) fn yield_now(shared: Rc<SchedulerShared>) -> YieldNow {
    YieldNow { yielded: false, shared }
}

pub struct YieldNow {
    yielded: bool,
    shared: Rc<SchedulerShared>,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            let id = self.shared.current();
            self.shared.make_ready(id);
            Poll::Pending
        }
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

pub(crate) fn poll_once<F: Future + ?Sized>(future: Pin<&mut F>) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    future.poll(&mut cx)
}
