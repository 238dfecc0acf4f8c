//! Worker pool servicing asynchronous requests

use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

use crate::error::{Result, TileError};

/// Unit of work run on a pool thread
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads fed from one unbounded channel
pub struct AioPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl AioPool {
    /// Spawn `size` workers (at least one)
    pub fn new(size: usize) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(size.max(1));

        for id in 0..size.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("tilestore-aio-{}", id))
                .spawn(move || {
                    tracing::debug!("AIO worker {} started", id);
                    // Ends once every sender is gone
                    for job in receiver.iter() {
                        job();
                    }
                    tracing::debug!("AIO worker {} stopped", id);
                })?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queue a job for the next free worker
    pub(crate) fn execute(&self, job: Job) -> Result<()> {
        match &self.sender {
            Some(sender) => sender
                .send(job)
                .map_err(|_| TileError::InvalidHandle("AIO pool has shut down".to_string())),
            None => Err(TileError::InvalidHandle("AIO pool has shut down".to_string())),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for AioPool {
    fn drop(&mut self) {
        // Closing the channel lets each worker finish its queue and exit
        self.sender.take();

        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last owner may be a job running on one of the workers
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::warn!("AIO worker panicked");
            }
        }
    }
}
