//! The connection registry and the worker thread pool.
//!
//! Connections live in a slab arena; the arena slot plus a monotonic
//! generation form the 56-bit tag carried by poll events, so a stale tag
//! from a deleted connection is rejected in O(1) without touching freed
//! state. A second, handle-sorted vector serves O(log n) lookups by the
//! public [`Handle`].

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;
use slab::Slab;

use crate::conn::Connection;
use crate::engine::Engine;
use crate::error::ServerError;
use crate::handle::{Handle, MAX_HANDLE};

/// Arena slots fit in the low 24 bits of a tag; the generation takes the
/// other 32 of the 56 available.
const SLOT_BITS: u32 = 24;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;

/// Cleared slots kept around for keep-alive reuse.
const RECYCLE_POOL_MAX: usize = 64;

struct Entry {
    generation: u32,
    conn: Arc<Connection>,
}

struct Inner {
    arena: Slab<Entry>,
    /// Sorted by handle; handles are monotonic so pushes keep the order.
    by_handle: Vec<Arc<Connection>>,
    last_handle: u32,
    next_generation: u32,
    recycle: Vec<Arc<Connection>>,
}

/// All live connections of one server, behind a single coarse lock.
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            inner: Mutex::new(Inner {
                arena: Slab::new(),
                by_handle: Vec::new(),
                last_handle: 0,
                next_generation: 1,
                recycle: Vec::new(),
            }),
        }
    }

    /// Register a fresh connection: assign the next handle and an arena
    /// tag. Handle exhaustion is fatal, never wrapped.
    pub fn add(&self, conn: Connection) -> Result<Arc<Connection>, ServerError> {
        let mut inner = self.inner.lock().unwrap();
        Registry::register(&mut inner, Arc::new(conn))
    }

    /// Build or recycle a slot for an accepted socket and register it.
    pub fn checkout(
        &self,
        fd: RawFd,
        remote_ip: String,
    ) -> Result<Arc<Connection>, ServerError> {
        let mut inner = self.inner.lock().unwrap();

        // Reuse a retired slot only when the registry is its sole owner;
        // a straggler Arc elsewhere means the slot may still be observed.
        let mut reused = None;
        while let Some(candidate) = inner.recycle.pop() {
            if Arc::strong_count(&candidate) == 1 {
                reused = Some(candidate);
                break;
            }
        }

        let conn = match reused {
            Some(conn) => {
                conn.recycle(fd, remote_ip);
                conn
            }
            None => Arc::new(Connection::new(fd, remote_ip)),
        };

        Registry::register(&mut inner, conn)
    }

    fn register(
        inner: &mut Inner,
        conn: Arc<Connection>,
    ) -> Result<Arc<Connection>, ServerError> {
        if inner.last_handle >= MAX_HANDLE {
            return Err(ServerError::HandleOverflow);
        }
        inner.last_handle += 1;
        conn.set_handle(Handle(inner.last_handle));

        let generation = inner.next_generation;
        inner.next_generation = inner.next_generation.wrapping_add(1).max(1);

        let slot = inner.arena.insert(Entry {
            generation,
            conn: conn.clone(),
        });
        if slot as u64 > SLOT_MASK {
            inner.arena.remove(slot);
            return Err(ServerError::ArenaFull);
        }

        conn.set_tag(slot as u64 | (generation as u64) << SLOT_BITS);
        inner.by_handle.push(conn.clone());

        Ok(conn)
    }

    /// Resolve a poll-event tag. O(1); a mismatched generation means the
    /// connection behind this tag is gone.
    pub fn resolve_tag(&self, tag: u64) -> Option<Arc<Connection>> {
        let slot = (tag & SLOT_MASK) as usize;
        let generation = (tag >> SLOT_BITS) as u32;

        let inner = self.inner.lock().unwrap();
        inner
            .arena
            .get(slot)
            .filter(|entry| entry.generation == generation)
            .map(|entry| entry.conn.clone())
    }

    /// O(log n) lookup by public handle.
    pub fn find(&self, handle: Handle) -> Option<Arc<Connection>> {
        if !handle.is_valid() {
            return None;
        }
        let inner = self.inner.lock().unwrap();
        inner
            .by_handle
            .binary_search_by_key(&handle, |c| c.handle())
            .ok()
            .map(|idx| inner.by_handle[idx].clone())
    }

    /// Drop a connection from the arena and the sorted vector. The cleared
    /// slot goes to the recycle pool.
    pub fn remove(&self, conn: &Arc<Connection>) {
        let tag = conn.tag();
        let slot = (tag & SLOT_MASK) as usize;
        let generation = (tag >> SLOT_BITS) as u32;

        let mut inner = self.inner.lock().unwrap();

        match inner.arena.get(slot) {
            Some(entry) if entry.generation == generation => {
                inner.arena.remove(slot);
            }
            _ => {
                debug!("remove: tag {} already gone", tag);
                return;
            }
        }

        if let Ok(idx) = inner
            .by_handle
            .binary_search_by_key(&conn.handle(), |c| c.handle())
        {
            inner.by_handle.remove(idx);
        }

        if inner.recycle.len() < RECYCLE_POOL_MAX {
            inner.recycle.push(conn.clone());
        }
    }

    /// Clone out every live connection, for iteration without holding the
    /// registry lock during per-connection work.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().unwrap().by_handle.clone()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().by_handle.len()
    }

    pub fn last_handle(&self) -> Handle {
        Handle(self.inner.lock().unwrap().last_handle)
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

/// The reader/writer thread pool driving an [`Engine`].
///
/// N reader threads block in `process_read`; one writer thread (unless
/// folded into the readers) drains `process_write`, runs the once-a-second
/// idle scan, and invokes the `writer_idle` hook each loop so the owner can
/// flush its outgoing queues.
pub struct WorkerPool {
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        engine: Arc<Engine>,
        readers: usize,
        no_write_thread: bool,
        poll_timeout_ms: u64,
        writer_idle: Arc<dyn Fn() + Send + Sync>,
    ) -> WorkerPool {
        let readers = readers.max(1);
        let mut threads = Vec::with_capacity(readers + 1);

        for i in 0..readers {
            let engine = engine.clone();
            let idle = writer_idle.clone();
            let fold_writer = no_write_thread;
            // Folded mode keeps reads responsive to the idle cadence.
            let timeout = if fold_writer {
                poll_timeout_ms.min(1_000)
            } else {
                poll_timeout_ms
            };
            threads.push(
                thread::Builder::new()
                    .name(format!("swarm-read-{}", i))
                    .spawn(move || {
                        let mut last_scan = Instant::now();
                        while !engine.terminated() {
                            engine.process_read(timeout);
                            if fold_writer {
                                while engine.process_write(0) {}
                                idle();
                                if i == 0 && last_scan.elapsed() >= Duration::from_secs(1) {
                                    engine.idle_every_second();
                                    last_scan = Instant::now();
                                }
                            }
                        }
                    })
                    .expect("spawn reader thread"),
            );
        }

        if !no_write_thread {
            let engine = engine.clone();
            threads.push(
                thread::Builder::new()
                    .name("swarm-write".to_string())
                    .spawn(move || {
                        let mut last_scan = Instant::now();
                        while !engine.terminated() {
                            engine.process_write(1_000);
                            writer_idle();
                            if last_scan.elapsed() >= Duration::from_secs(1) {
                                engine.idle_every_second();
                                last_scan = Instant::now();
                            }
                        }
                    })
                    .expect("spawn writer thread"),
            );
        }

        WorkerPool { threads }
    }

    /// Wait for every worker to observe termination and exit.
    pub fn join(self) {
        for th in self.threads {
            let _ = th.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic(fd: RawFd) -> Connection {
        Connection::new(fd, "test".into())
    }

    #[test]
    fn handles_are_monotonic() {
        let registry = Registry::new();
        let mut last = 0;
        for fd in 0..10 {
            let conn = registry.add(synthetic(1000 + fd)).unwrap();
            assert!(conn.handle().0 > last);
            last = conn.handle().0;
            conn.take_socket();
        }
        assert_eq!(registry.count(), 10);
    }

    #[test]
    fn find_by_handle_uses_binary_search() {
        let registry = Registry::new();
        let mut handles = Vec::new();
        for fd in 0..32 {
            let conn = registry.add(synthetic(2000 + fd)).unwrap();
            handles.push(conn.handle());
            conn.take_socket();
        }

        for handle in &handles {
            let conn = registry.find(*handle).unwrap();
            assert_eq!(conn.handle(), *handle);
        }
        assert!(registry.find(Handle(999_999)).is_none());
        assert!(registry.find(Handle(0)).is_none());
    }

    #[test]
    fn stale_tag_does_not_resolve() {
        let registry = Registry::new();
        let conn = registry.add(synthetic(3000)).unwrap();
        let tag = conn.tag();

        assert!(registry.resolve_tag(tag).is_some());
        conn.take_socket();
        registry.remove(&conn);
        assert!(registry.resolve_tag(tag).is_none());
    }

    #[test]
    fn recycled_slot_gets_fresh_identity() {
        let registry = Registry::new();
        let conn = registry.add(synthetic(4000)).unwrap();
        let old_handle = conn.handle();
        let old_tag = conn.tag();

        conn.take_socket();
        registry.remove(&conn);
        drop(conn);

        let reborn = registry.checkout(4001, "10.0.0.1".into()).unwrap();
        assert!(reborn.handle() > old_handle);
        assert_ne!(reborn.tag(), old_tag);
        assert_eq!(reborn.remote_ip(), "10.0.0.1");
        // The old tag must not resolve to the reborn connection.
        assert!(registry.resolve_tag(old_tag).is_none());
        reborn.take_socket();
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        let conn = registry.add(synthetic(5000)).unwrap();
        conn.take_socket();
        registry.remove(&conn);
        registry.remove(&conn);
        assert_eq!(registry.count(), 0);
    }
}
