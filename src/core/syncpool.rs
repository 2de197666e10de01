//! Bounded pools for workers, requests and responses.
//!
//! Each pool has its own mutex. Request and response pools fail fast when exhausted; the worker
//! pool sleeps once, retries once, and then rejects.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::core::config::ServerConfig;
use crate::core::error::PoolError;
use crate::core::http::{Request, Response};
use crate::parking_lot::Mutex;
use crate::support::debug::{self, InfoLevel};

/// Pooled objects go back to their construction-time state on release.
pub(crate) trait Poolable: Default {
    fn reset_for_reuse(&mut self);
}

impl Poolable for Request {
    fn reset_for_reuse(&mut self) {
        self.reset();
    }
}

impl Poolable for Response {
    fn reset_for_reuse(&mut self) {
        self.reset_for_pool();
    }
}

struct Slots<T> {
    unused: Vec<T>,
    used: usize,
}

pub(crate) struct SyncPool<T: Poolable> {
    name: &'static str,
    max: usize,
    slots: Mutex<Slots<Box<T>>>,
}

impl<T: Poolable> SyncPool<T> {
    pub(crate) fn new(name: &'static str, start: usize, max: usize) -> Self {
        let max = max.max(1);
        let unused = (0..start.min(max)).map(|_| Box::new(T::default())).collect();

        SyncPool {
            name,
            max,
            slots: Mutex::new(Slots { unused, used: 0 }),
        }
    }

    pub(crate) fn acquire(&self) -> Result<Box<T>, PoolError> {
        let mut slots = self.slots.lock();

        if let Some(item) = slots.unused.pop() {
            slots.used += 1;
            return Ok(item);
        }

        if slots.used < self.max {
            slots.used += 1;
            return Ok(Box::new(T::default()));
        }

        Err(PoolError::CapacityExceeded {
            pool: self.name,
            max: self.max,
        })
    }

    pub(crate) fn release(&self, mut item: Box<T>) {
        item.reset_for_reuse();

        let mut slots = self.slots.lock();
        slots.used = slots.used.saturating_sub(1);
        slots.unused.push(item);
    }

    #[cfg(test)]
    pub(crate) fn used(&self) -> usize {
        self.slots.lock().used
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.slots.lock().unused.len()
    }
}

/// A worker that can be told to stop for good.
pub(crate) trait Retire {
    fn retire(self);
}

type Spawner<W> = Box<dyn Fn(usize) -> io::Result<W> + Send + Sync>;

pub(crate) struct WorkerPool<W: Retire> {
    slots: Mutex<Slots<W>>,
    next_id: AtomicUsize,
    max: usize,
    max_idle: usize,
    retry: Duration,
    spawner: Spawner<W>,
    retries: AtomicUsize,
    rejections: AtomicUsize,
}

impl<W: Retire> WorkerPool<W> {
    pub(crate) fn new<F>(
        startup: usize,
        max_idle: usize,
        max: usize,
        retry: Duration,
        spawner: F,
    ) -> Self
    where
        F: Fn(usize) -> io::Result<W> + Send + Sync + 'static,
    {
        WorkerPool {
            slots: Mutex::new(Slots {
                unused: Vec::with_capacity(startup),
                used: 0,
            }),
            next_id: AtomicUsize::new(0),
            max: max.max(1),
            max_idle,
            retry,
            spawner: Box::new(spawner),
            retries: AtomicUsize::new(0),
            rejections: AtomicUsize::new(0),
        }
    }

    /// Start `count` idle workers ahead of the first connection.
    pub(crate) fn prestart(&self, count: usize) -> io::Result<()> {
        for _ in 0..count.min(self.max) {
            let worker = self.spawn()?;
            self.slots.lock().unused.push(worker);
        }

        Ok(())
    }

    fn spawn(&self) -> io::Result<W> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        (self.spawner)(id)
    }

    fn try_acquire(&self) -> Option<W> {
        let mut slots = self.slots.lock();

        if let Some(worker) = slots.unused.pop() {
            slots.used += 1;
            return Some(worker);
        }

        if slots.used < self.max {
            match self.spawn() {
                Ok(worker) => {
                    slots.used += 1;
                    return Some(worker);
                }
                Err(err) => debug::print(
                    &format!("Unable to start a new request handler: {}", err),
                    InfoLevel::Error,
                ),
            }
        }

        None
    }

    /// A free worker, or `Rejected` after one sleep-and-retry cycle.
    pub(crate) fn acquire(&self) -> Result<W, PoolError> {
        if let Some(worker) = self.try_acquire() {
            return Ok(worker);
        }

        self.retries.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(retry_ms = self.retry.as_millis() as u64, "worker pool exhausted, retrying");
        thread::sleep(self.retry);

        match self.try_acquire() {
            Some(worker) => Ok(worker),
            None => {
                self.rejections.fetch_add(1, Ordering::AcqRel);
                debug::print(
                    "No request handlers available after retrying, rejecting the connection",
                    InfoLevel::Warning,
                );
                Err(PoolError::Rejected)
            }
        }
    }

    pub(crate) fn release(&self, worker: W) {
        let mut slots = self.slots.lock();
        slots.used = slots.used.saturating_sub(1);
        slots.unused.push(worker);
    }

    /// Count a worker as gone without returning it, e.g. after it died.
    pub(crate) fn forget(&self) {
        let mut slots = self.slots.lock();
        slots.used = slots.used.saturating_sub(1);
    }

    /// Retire idle workers above the idle ceiling; returns how many went away.
    pub(crate) fn trim_idle(&self) -> usize {
        let surplus: Vec<W> = {
            let mut slots = self.slots.lock();
            if slots.unused.len() <= self.max_idle {
                return 0;
            }

            let keep = self.max_idle;
            slots.unused.drain(keep..).collect()
        };

        let count = surplus.len();
        surplus.into_iter().for_each(Retire::retire);
        count
    }

    pub(crate) fn retire_all(&self) {
        let idle: Vec<W> = self.slots.lock().unused.drain(..).collect();
        idle.into_iter().for_each(Retire::retire);
    }

    pub(crate) fn used(&self) -> usize {
        self.slots.lock().used
    }

    pub(crate) fn idle(&self) -> usize {
        self.slots.lock().unused.len()
    }

    pub(crate) fn retries(&self) -> usize {
        self.retries.load(Ordering::Acquire)
    }

    pub(crate) fn rejections(&self) -> usize {
        self.rejections.load(Ordering::Acquire)
    }
}

/// The three pools one server owns.
pub(crate) struct ResourcePool<W: Retire> {
    workers: WorkerPool<W>,
    requests: SyncPool<Request>,
    responses: SyncPool<Response>,
}

impl<W: Retire> ResourcePool<W> {
    pub(crate) fn new<F>(config: &ServerConfig, spawner: F) -> Self
    where
        F: Fn(usize) -> io::Result<W> + Send + Sync + 'static,
    {
        ResourcePool {
            workers: WorkerPool::new(
                config.get_startup_workers(),
                config.get_max_idle_workers(),
                config.get_max_workers(),
                config.get_worker_retry(),
                spawner,
            ),
            requests: SyncPool::new("request", config.get_start_requests(), config.get_max_requests()),
            responses: SyncPool::new("response", config.get_start_requests(), config.get_max_requests()),
        }
    }

    #[inline]
    pub(crate) fn workers(&self) -> &WorkerPool<W> {
        &self.workers
    }

    #[inline]
    pub(crate) fn acquire_worker(&self) -> Result<W, PoolError> {
        self.workers.acquire()
    }

    #[inline]
    pub(crate) fn release_worker(&self, worker: W) {
        self.workers.release(worker)
    }

    #[inline]
    pub(crate) fn acquire_request(&self) -> Result<Box<Request>, PoolError> {
        self.requests.acquire()
    }

    #[inline]
    pub(crate) fn acquire_response(&self) -> Result<Box<Response>, PoolError> {
        self.responses.acquire()
    }

    #[inline]
    pub(crate) fn release_request(&self, req: Box<Request>) {
        self.requests.release(req)
    }

    #[inline]
    pub(crate) fn release_response(&self, resp: Box<Response>) {
        self.responses.release(resp)
    }
}
