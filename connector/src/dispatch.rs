//! Asynchronous dispatch of server-originated messages to registered
//! per-class callbacks (spec §4.6).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use connector_wire::Message;

/// What a callback's handler asks the dispatcher to do next.
pub enum DispatchOutcome {
    Done,
    Reschedule,
}

pub type MessageCallback = dyn Fn(&Message) -> DispatchOutcome + Send + Sync;
pub type DisconnectCallback = dyn Fn() + Send + Sync;

/// One registered (class-name, callback) pair. Kept alive by an in-flight
/// [`Operation`] even after [`Dispatcher::unregister`] removes it from the
/// registry, so a dispatch already queued for it still runs.
pub struct CallbackEntry {
    class_name: String,
    on_message: Box<MessageCallback>,
    on_thread_disconnect: Box<DisconnectCallback>,
    used: AtomicBool,
}

impl CallbackEntry {
    pub fn class_name(&self) -> &str {
        &self.class_name
    }
}

enum OperationKind {
    Dispatch { entry: Arc<CallbackEntry>, message: Message },
    ThreadDisconnect { entry: Arc<CallbackEntry> },
}

pub struct Operation {
    kind: OperationKind,
    requeue_count: u32,
}

impl Operation {
    /// VITAL operations (thread-disconnect notifications) still run while
    /// the dispatcher is poisoned.
    fn is_vital(&self) -> bool {
        matches!(self.kind, OperationKind::ThreadDisconnect { .. })
    }
}

#[derive(Default)]
struct Registry {
    entries: Vec<Arc<CallbackEntry>>,
}

struct Inner {
    queue: VecDeque<Operation>,
    worker_running: bool,
}

pub struct Dispatcher {
    inner: Mutex<Inner>,
    cond: Condvar,
    registry: Mutex<Registry>,
    poisoned: AtomicBool,
    idle_timeout: Duration,
    reschedule_delay: Duration,
    reschedule_info_count: u32,
    reschedule_abort_count: u32,
}

impl Dispatcher {
    pub fn new(
        idle_timeout: Duration,
        reschedule_delay: Duration,
        reschedule_info_period: Duration,
        reschedule_abort_period: Duration,
    ) -> Arc<Self> {
        let count = |period: Duration| -> u32 {
            (period.as_millis() / reschedule_delay.as_millis().max(1)).max(1) as u32
        };
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                worker_running: false,
            }),
            cond: Condvar::new(),
            registry: Mutex::new(Registry::default()),
            poisoned: AtomicBool::new(false),
            idle_timeout,
            reschedule_delay,
            reschedule_info_count: count(reschedule_info_period),
            reschedule_abort_count: count(reschedule_abort_period),
        })
    }

    pub fn register(
        &self,
        class_name: impl Into<String>,
        on_message: Box<MessageCallback>,
        on_thread_disconnect: Box<DisconnectCallback>,
    ) -> Arc<CallbackEntry> {
        let entry = Arc::new(CallbackEntry {
            class_name: class_name.into(),
            on_message,
            on_thread_disconnect,
            used: AtomicBool::new(false),
        });
        self.registry.lock().unwrap().entries.push(Arc::clone(&entry));
        entry
    }

    /// Removes `entry` from the registry immediately. If it was never
    /// dispatched to, it is released synchronously (the `Arc` this
    /// function holds was the registry's only other reference besides the
    /// caller's). If it was used, a VITAL thread-disconnect operation is
    /// queued to hold it alive until that notification has run.
    pub fn unregister(self: &Arc<Self>, entry: &Arc<CallbackEntry>) {
        self.registry
            .lock()
            .unwrap()
            .entries
            .retain(|e| !Arc::ptr_eq(e, entry));
        if entry.used.load(Ordering::Acquire) {
            self.submit(Operation {
                kind: OperationKind::ThreadDisconnect {
                    entry: Arc::clone(entry),
                },
                requeue_count: 0,
            });
        }
    }

    /// Routes a server-originated user message with no `handle` to the
    /// first registered callback whose class matches.
    pub fn dispatch(self: &Arc<Self>, class_name: &str, payload: Message) {
        let entry = self
            .registry
            .lock()
            .unwrap()
            .entries
            .iter()
            .find(|e| e.class_name == class_name)
            .cloned();
        match entry {
            Some(entry) => self.submit(Operation {
                kind: OperationKind::Dispatch { entry, message: payload },
                requeue_count: 0,
            }),
            None => tracing::debug!(class_name, "no callback registered for this class"),
        }
    }

    fn submit(self: &Arc<Self>, op: Operation) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(op);
        let needs_spawn = !inner.worker_running;
        if needs_spawn {
            inner.worker_running = true;
        }
        self.cond.notify_one();
        drop(inner);
        if needs_spawn {
            let this = Arc::clone(self);
            std::thread::spawn(move || this.run());
        }
    }

    fn next_operation(&self) -> Option<Operation> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(op) = inner.queue.pop_front() {
                return Some(op);
            }
            if self.poisoned.load(Ordering::Acquire) {
                inner.worker_running = false;
                return None;
            }
            let (guard, result) = self.cond.wait_timeout(inner, self.idle_timeout).unwrap();
            inner = guard;
            if result.timed_out() && inner.queue.is_empty() {
                inner.worker_running = false;
                return None;
            }
        }
    }

    fn run(self: Arc<Self>) {
        while let Some(op) = self.next_operation() {
            if self.poisoned.load(Ordering::Acquire) && !op.is_vital() {
                continue;
            }
            match self.run_operation(&op) {
                DispatchOutcome::Done => {}
                DispatchOutcome::Reschedule => self.reschedule(op),
            }
        }
    }

    fn run_operation(&self, op: &Operation) -> DispatchOutcome {
        match &op.kind {
            OperationKind::Dispatch { entry, message } => {
                entry.used.store(true, Ordering::Release);
                (entry.on_message)(message)
            }
            OperationKind::ThreadDisconnect { entry } => {
                (entry.on_thread_disconnect)();
                DispatchOutcome::Done
            }
        }
    }

    fn reschedule(self: &Arc<Self>, mut op: Operation) {
        op.requeue_count += 1;
        if op.requeue_count == self.reschedule_info_count {
            tracing::warn!(
                class = op_class(&op),
                count = op.requeue_count,
                "dispatch operation has been requeued repeatedly"
            );
        }
        if op.requeue_count >= self.reschedule_abort_count {
            tracing::error!(
                class = op_class(&op),
                "abandoning dispatch operation and the rest of the queue after exceeding reschedule-abort-period"
            );
            self.inner.lock().unwrap().queue.retain(Operation::is_vital);
            return;
        }
        std::thread::sleep(self.reschedule_delay);
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_front(op);
        self.cond.notify_one();
    }

    /// Poisons the dispatcher: the worker finishes its current operation,
    /// discards every queued non-VITAL operation, then runs only the
    /// VITAL ones before exiting. A later [`Dispatcher::dispatch`] or
    /// [`Dispatcher::unregister`] still queues work but it is silently
    /// dropped unless VITAL.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        let mut inner = self.inner.lock().unwrap();
        inner.queue.retain(Operation::is_vital);
        self.cond.notify_all();
    }
}

fn op_class(op: &Operation) -> &str {
    match &op.kind {
        OperationKind::Dispatch { entry, .. } => entry.class_name(),
        OperationKind::ThreadDisconnect { entry } => entry.class_name(),
    }
}
