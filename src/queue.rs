//! Named worker queue for cryptographic work. Every job a target posts
//! runs on these threads, never in a submission or completion context.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::io::{self, CryptIo};

struct QueueShared {
    busy: Mutex<usize>,
    cv: Condvar,
}

/// A worker-thread queue, shareable between targets. Work items are
/// lifecycle objects; [`CryptQueue::flush`] waits for every queued and
/// running item, which is what quiesces a target before suspend or
/// teardown.
pub struct CryptQueue {
    name: String,
    shared: Arc<QueueShared>,
    tx: Mutex<Option<Sender<Arc<CryptIo>>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl CryptQueue {
    pub fn new(name: &str, nr_workers: usize) -> Arc<CryptQueue> {
        let nr_workers = nr_workers.max(1);
        let (tx, rx) = mpsc::channel::<Arc<CryptIo>>();
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(QueueShared {
            busy: Mutex::new(0),
            cv: Condvar::new(),
        });

        let workers = (0..nr_workers)
            .map(|i| {
                let shared = shared.clone();
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("{}/{}", name, i))
                    .spawn(move || worker_main(shared, rx))
                    .unwrap()
            })
            .collect();

        log::info!("work queue '{}' started with {} workers", name, nr_workers);

        Arc::new(CryptQueue {
            name: name.to_string(),
            shared,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn queue_io(&self, io: Arc<CryptIo>) {
        *self.shared.busy.lock().unwrap() += 1;
        self.tx
            .lock()
            .unwrap()
            .as_ref()
            .expect("queue is shut down")
            .send(io)
            .expect("queue workers are gone");
    }

    /// Wait until the queue is drained, including currently running work.
    pub fn flush(&self) {
        let mut busy = self.shared.busy.lock().unwrap();
        while *busy > 0 {
            busy = self.shared.cv.wait(busy).unwrap();
        }
    }
}

impl Drop for CryptQueue {
    fn drop(&mut self) {
        // Closing the channel ends the workers once the backlog drains.
        drop(self.tx.lock().unwrap().take());
        for worker in std::mem::take(&mut *self.workers.lock().unwrap()) {
            // The last reference can be dropped from a worker itself; that
            // thread just runs out on its own.
            if worker.thread().id() == thread::current().id() {
                continue;
            }
            let _ = worker.join();
        }
        log::info!("work queue '{}' stopped", self.name);
    }
}

fn worker_main(shared: Arc<QueueShared>, rx: Arc<Mutex<Receiver<Arc<CryptIo>>>>) {
    loop {
        let msg = {
            let rx = rx.lock().unwrap();
            rx.recv()
        };
        let Ok(io) = msg else { break };

        io::process_io(io);

        {
            let mut busy = shared.busy.lock().unwrap();
            *busy -= 1;
        }
        shared.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_on_idle_queue_returns() {
        let queue = CryptQueue::new("cryptd-test", 2);
        queue.flush();
        assert_eq!(queue.name(), "cryptd-test");
    }
}
