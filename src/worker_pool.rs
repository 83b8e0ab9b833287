//! A fixed set of background threads running boxed jobs in submission order.
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
pub(crate) struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` threads.  Does nothing if the pool is already running.
    pub(crate) fn start(&self, workers: usize) -> std::io::Result<()> {
        let mut sender = self.sender.lock().unwrap();
        if sender.is_some() {
            return Ok(());
        }

        let (tx, rx) = channel::unbounded::<Job>();
        let mut threads = self.threads.lock().unwrap();
        for i in 0..workers.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("resource-loader-{}", i))
                .spawn(move || {
                    // Ends once every sender is gone and the queue is drained.
                    for job in rx.iter() {
                        job();
                    }
                })?;
            threads.push(handle);
        }
        *sender = Some(tx);
        Ok(())
    }

    /// Queue a job.  Once the pool has shut down, the job runs on the calling thread instead.
    pub(crate) fn submit(&self, job: Job) {
        let job = {
            let sender = self.sender.lock().unwrap();
            match sender.as_ref() {
                Some(tx) => match tx.send(job) {
                    Ok(()) => return,
                    Err(e) => e.into_inner(),
                },
                None => job,
            }
        };
        job();
    }

    /// Stop accepting jobs, let the queue drain, and join every worker.
    pub(crate) fn shutdown(&self) {
        drop(self.sender.lock().unwrap().take());

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        let me = thread::current().id();
        for t in threads {
            // A job that tears down the pool cannot wait for itself.
            if t.thread().id() == me {
                continue;
            }
            if t.join().is_err() {
                tracing::error!("Resource loader thread panicked");
            }
        }
    }
}
