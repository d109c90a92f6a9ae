//! Transport abstraction and FIFO-queue dispatch (spec.md §5): "a fixed pool
//! of service threads consuming from a single FIFO request queue protected
//! by a lock and counted semaphore." `LoopbackTransport` is the in-process
//! implementation used by tests and single-binary deployments; a real
//! network transport would implement the same `Transport` trait.

use crate::wire::Message;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Sends a framed message to a destination site, addressed by the caller's
/// own site-id bookkeeping (the transport doesn't know about `SiteId`
/// directly so it stays decoupled from the ring/registry modules).
pub trait Transport: Send + Sync {
    fn send(&self, dsite: u64, msg: Message) -> std::io::Result<()>;
}

/// In-process transport: routes messages between registered handlers by
/// site-id, used when MDS/MDSL/R2 roles run colocated (tests, single-node
/// deployments).
pub struct LoopbackTransport {
    routes: parking_lot::RwLock<HashMap<u64, Sender<Message>>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: parking_lot::RwLock::new(HashMap::new()),
        })
    }

    /// Registers `site`'s inbox, returning the receiver a dispatcher pool
    /// should drain.
    pub fn register(&self, site: u64) -> Receiver<Message> {
        let (tx, rx) = bounded(1024);
        self.routes.write().insert(site, tx);
        rx
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self {
            routes: parking_lot::RwLock::new(HashMap::new()),
        }
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, dsite: u64, msg: Message) -> std::io::Result<()> {
        let routes = self.routes.read();
        match routes.get(&dsite) {
            Some(tx) => tx.send(msg).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "destination gone")
            }),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "unknown destination site",
            )),
        }
    }
}

/// A fixed pool of worker threads draining one inbox and invoking `handler`
/// per message (spec.md §5's single FIFO queue + counted semaphore, here
/// `crossbeam_channel`'s bounded channel plays both roles at once).
pub struct Dispatcher {
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn(
        threads: usize,
        inbox: Receiver<Message>,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) -> Self {
        let handler = Arc::new(handler);
        let mut workers = Vec::with_capacity(threads);
        for tid in 0..threads.max(1) {
            let inbox = inbox.clone();
            let handler = handler.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("dispatch-{tid}"))
                    .spawn(move || {
                        while let Ok(msg) = inbox.recv() {
                            handler(msg);
                        }
                    })
                    .expect("spawn dispatch worker"),
            );
        }
        Self { workers }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = &self.workers;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Command, TxHeader};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn loopback_delivers_to_registered_site() {
        let transport = LoopbackTransport::new();
        let inbox = transport.register(2);
        let msg = Message::new(TxHeader::new(Command::R2Hb, 1, 2, 0), &[]);
        transport.send(2, msg).unwrap();
        let received = inbox.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(received.header.command(), Some(Command::R2Hb));
    }

    #[test]
    fn send_to_unknown_site_errors() {
        let transport = LoopbackTransport::new();
        let msg = Message::new(TxHeader::new(Command::R2Hb, 1, 9, 0), &[]);
        assert!(transport.send(9, msg).is_err());
    }

    #[test]
    fn dispatcher_pool_drains_concurrently() {
        let transport = LoopbackTransport::new();
        let inbox = transport.register(5);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let _dispatcher = Dispatcher::spawn(2, inbox, move |_msg| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..20 {
            let msg = Message::new(TxHeader::new(Command::R2Hb, 1, 5, 0), &[]);
            transport.send(5, msg).unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(150));
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}
