//! The `_on_queue` adapter (§4.J), grounded on
//! `original_source/src/on_queue.h`'s "enqueue work, get back an event
//! ordered after the previous one on this queue" contract. There is no GPU
//! command queue to submit to here, so a [`Queue`] is a single background
//! worker thread draining a FIFO of jobs — ordering falls out for free from
//! there being exactly one draining thread per queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send>;
type Signal = Arc<(Mutex<bool>, Condvar)>;

/// A handle to one submitted job. `wait()` blocks until the worker thread
/// has run it.
#[derive(Clone)]
pub struct QueueEvent {
    signal: Signal,
}

impl QueueEvent {
    pub fn wait(&self) {
        let (lock, cv) = &*self.signal;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = cv.wait(done).unwrap();
        }
    }

    pub fn is_done(&self) -> bool {
        *self.signal.0.lock().unwrap()
    }
}

/// One ordered work queue: jobs submitted to it run in submission order on
/// a single background thread.
pub struct Queue {
    sender: Option<mpsc::Sender<(Job, Signal)>>,
    worker: Option<JoinHandle<()>>,
}

impl Queue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<(Job, Signal)>();
        let worker = std::thread::Builder::new()
            .name("ishmem-on-queue".into())
            .spawn(move || {
                for (job, signal) in receiver {
                    job();
                    let (lock, cv) = &*signal;
                    *lock.lock().unwrap() = true;
                    cv.notify_all();
                }
            })
            .expect("failed to spawn on_queue worker thread");
        Queue {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Enqueue `job`, returning an event ordered after whatever was
    /// previously submitted to this queue.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> QueueEvent {
        let signal: Signal = Arc::new((Mutex::new(false), Condvar::new()));
        let sender = self.sender.as_ref().expect("queue used after shutdown");
        sender.send((Box::new(job), signal.clone())).expect("on_queue worker thread died");
        QueueEvent { signal }
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // Dropping the sender first closes the channel so the worker's
        // `for` loop ends and the thread can be joined.
        self.sender.take();
        if let Some(h) = self.worker.take() {
            let _ = h.join();
        }
    }
}

pub type QueueId = u64;

/// `Mutex<HashMap<QueueId, ..>>`-guarded event map (§4.J): queues are
/// addressed by an opaque id rather than a Rust reference, matching a
/// device-side queue handle.
pub struct QueueRegistry {
    queues: Mutex<HashMap<QueueId, Queue>>,
    next_id: AtomicU64,
}

impl QueueRegistry {
    pub fn new() -> Self {
        QueueRegistry {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn create(&self) -> QueueId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.queues.lock().unwrap().insert(id, Queue::new());
        id
    }

    /// Submit `job` to queue `id`. `None` if `id` has already been destroyed.
    pub fn submit(&self, id: QueueId, job: impl FnOnce() + Send + 'static) -> Option<QueueEvent> {
        self.queues.lock().unwrap().get(&id).map(|q| q.submit(job))
    }

    pub fn destroy(&self, id: QueueId) {
        self.queues.lock().unwrap().remove(&id);
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn jobs_run_in_submission_order() {
        let queue = Queue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut events = Vec::new();
        for i in 0..5 {
            let order = order.clone();
            events.push(queue.submit(move || order.lock().unwrap().push(i)));
        }
        events.last().unwrap().wait();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn registry_addresses_queues_by_opaque_id() {
        let registry = QueueRegistry::new();
        let id = registry.create();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let event = registry.submit(id, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        event.unwrap().wait();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        registry.destroy(id);
        assert!(registry.submit(id, || {}).is_none());
    }
}
