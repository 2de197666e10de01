//! Periodic background tasks. Every task has its own thread; all of them share one stop channel,
//! so dropping the sender wakes every task at once.

use std::io;
use std::thread;
use std::time::Duration;

use crate::channel::{self, Receiver, RecvTimeoutError, Sender};
use crate::support::debug::{self, InfoLevel};

pub(crate) struct Scheduler {
    stop: Option<Sender<()>>,
    signal: Receiver<()>,
    tasks: Vec<Task>,
}

struct Task {
    name: String,
    thread: Option<thread::JoinHandle<()>>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        let (stop, signal) = channel::bounded(0);
        Scheduler {
            stop: Some(stop),
            signal,
            tasks: Vec::new(),
        }
    }

    /// Run `job` every `period` until the scheduler stops. A zero period disables the task.
    pub(crate) fn every<F>(&mut self, name: &str, period: Duration, job: F) -> io::Result<()>
    where
        F: Fn() + Send + 'static,
    {
        if period.is_zero() {
            debug::print(&format!("Periodic task {} is disabled", name), InfoLevel::Info);
            return Ok(());
        }

        let signal = self.signal.clone();
        let thread = thread::Builder::new()
            .name(format!("task-{}", name))
            .spawn(move || loop {
                match signal.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => job(),
                    _ => return,
                }
            })?;

        self.tasks.push(Task {
            name: name.to_owned(),
            thread: Some(thread),
        });

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every task and wait for the ones mid-run to finish.
    pub(crate) fn stop(&mut self) {
        if self.stop.take().is_none() {
            return;
        }

        self.tasks.drain(..).for_each(drop);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                debug::print(
                    &format!("Periodic task {} ended with a panic", self.name),
                    InfoLevel::Error,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn tasks_run_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let mut scheduler = Scheduler::new();
        scheduler
            .every("count", Duration::from_millis(10), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        scheduler.stop();

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {} times", seen);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn stop_does_not_wait_out_the_period() {
        let mut scheduler = Scheduler::new();
        scheduler.every("slow", Duration::from_secs(3600), || {}).unwrap();

        let started = Instant::now();
        scheduler.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn zero_period_tasks_are_skipped() {
        let mut scheduler = Scheduler::new();
        scheduler.every("off", Duration::ZERO, || {}).unwrap();
        assert_eq!(scheduler.len(), 0);
    }
}
