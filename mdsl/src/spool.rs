//! Spool: a small fixed worker pool draining a flush queue, grounded in
//! `mdsl/spool.c`'s `reqin` list + `rin_sem` + `spool_main` loop. Generalized
//! here into a generic job queue so both abuf retirement and fd idle-sweeps
//! can share the same pool shape.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::JoinHandle;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct Spool {
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl Spool {
    pub fn new(threads: usize) -> Self {
        let (tx, rx): (Sender<Job>, Receiver<Job>) = bounded(1024);
        let mut workers = Vec::with_capacity(threads);
        for tid in 0..threads.max(1) {
            let rx = rx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("mdsl-spool-{tid}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("spawn spool worker"),
            );
        }
        Self { tx, workers }
    }

    pub fn submit(&self, job: Job) {
        if self.tx.send(job).is_err() {
            log::error!("spool queue closed, running job inline");
        }
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        // Dropping `tx` (implicitly, once all clones are gone) lets workers
        // drain and exit; we don't join here to avoid blocking shutdown on
        // a wedged job, matching the teacher's "errors during shutdown
        // flush are logged, not fatal" policy (spec.md §6).
        let _ = &self.workers;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn jobs_run_on_worker_threads() {
        let spool = Spool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            spool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
