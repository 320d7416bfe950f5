use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use indexmap::IndexMap;
use log::{debug, warn};

use crate::sys::socket as sys;

use super::{EpollPoller, Interest, PollEvent, Poller, SelectPoller};

enum SubCommand {
    Subscribe {
        fd: RawFd,
        tag: u64,
        interest: Interest,
    },
    Unsubscribe {
        fd: RawFd,
        tag: u64,
    },
}

struct Inner {
    pollers: Vec<Arc<dyn Poller>>,
    /// Which poller tracks which descriptor. Only maintained on the
    /// snapshot facility; epoll has a single instance.
    owner: IndexMap<RawFd, usize>,
}

struct Pending {
    events: Vec<PollEvent>,
    index: usize,
}

impl Pending {
    fn remaining(&self) -> usize {
        self.events.len() - self.index
    }
}

/// Thread-safe front of one or more pollers.
///
/// Presents a single queue of pending readiness events. On the epoll
/// facility this is one poller and subscription calls go straight through;
/// on the `poll(2)` facility the tracked sets may only change between waits,
/// so subscribe/unsubscribe enqueue commands which
/// [`poll_for_pending_events`](PollMux::poll_for_pending_events) applies at
/// the head of each cycle, growing extra pollers when the existing ones are
/// full.
pub struct PollMux {
    inner: Mutex<Inner>,
    pending: Mutex<Pending>,
    commands: ConcurrentQueue<SubCommand>,
    /// Serializes apply-and-wait cycles on the snapshot facility.
    poll_lock: Mutex<()>,
    next_poller: AtomicUsize,
    terminated: AtomicBool,
    follow_epoll: bool,
    unsubscribe_closes_socket: bool,
}

impl PollMux {
    /// A multiplexer on the platform's best facility.
    pub fn new(unsubscribe_closes_socket: bool) -> std::io::Result<PollMux> {
        match EpollPoller::new() {
            Ok(poller) => Ok(PollMux::build(
                Arc::new(poller),
                true,
                unsubscribe_closes_socket,
            )),
            Err(e) => {
                debug!("epoll unavailable ({}), falling back to poll", e);
                PollMux::with_select_facility(unsubscribe_closes_socket)
            }
        }
    }

    /// A multiplexer forced onto the snapshot (`poll(2)`) facility.
    pub fn with_select_facility(unsubscribe_closes_socket: bool) -> std::io::Result<PollMux> {
        Ok(PollMux::build(
            Arc::new(SelectPoller::new()?),
            false,
            unsubscribe_closes_socket,
        ))
    }

    fn build(
        poller: Arc<dyn Poller>,
        follow_epoll: bool,
        unsubscribe_closes_socket: bool,
    ) -> PollMux {
        PollMux {
            inner: Mutex::new(Inner {
                pollers: vec![poller],
                owner: IndexMap::new(),
            }),
            pending: Mutex::new(Pending {
                events: Vec::new(),
                index: 0,
            }),
            commands: ConcurrentQueue::unbounded(),
            poll_lock: Mutex::new(()),
            next_poller: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
            follow_epoll,
            unsubscribe_closes_socket,
        }
    }

    pub fn follow_epoll(&self) -> bool {
        self.follow_epoll
    }

    /// Start delivering events for `fd` under `tag`.
    ///
    /// On the snapshot facility the subscription only takes effect at the
    /// next poll cycle.
    pub fn subscribe(&self, fd: RawFd, tag: u64, interest: Interest) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }

        if self.follow_epoll {
            let inner = self.inner.lock().unwrap();
            return inner.pollers[0].subscribe(fd, tag, interest);
        }

        self.commands
            .push(SubCommand::Subscribe { fd, tag, interest })
            .is_ok()
    }

    /// Stop delivering events for `fd`. Queued on the snapshot facility.
    pub fn unsubscribe(&self, fd: RawFd, tag: u64) -> bool {
        if self.follow_epoll {
            let done = {
                let inner = self.inner.lock().unwrap();
                inner.pollers[0].unsubscribe(fd)
            };
            if done && self.unsubscribe_closes_socket {
                sys::close(fd);
            }
            return done;
        }

        self.commands
            .push(SubCommand::Unsubscribe { fd, tag })
            .is_ok()
    }

    /// One poll cycle: apply queued subscription changes, wait on one
    /// poller, merge what it reports into the pending queue. Returns how
    /// many events were newly queued.
    pub fn poll_for_pending_events(&self, timeout_ms: u64) -> usize {
        if self.terminated.load(Ordering::Acquire) {
            return 0;
        }

        let mut fresh = Vec::new();

        if self.follow_epoll {
            let poller = {
                let inner = self.inner.lock().unwrap();
                inner.pollers[0].clone()
            };
            poller.wait_for_modified(&mut fresh, timeout_ms);
        } else {
            // The snapshot facility: nobody else may touch the poller set
            // while a cycle is in flight.
            let _poll = self.poll_lock.lock().unwrap();

            self.apply_subscription_changes();

            let poller = {
                let inner = self.inner.lock().unwrap();
                if inner.pollers.is_empty() {
                    return 0;
                }
                let idx =
                    self.next_poller.fetch_add(1, Ordering::Relaxed) % inner.pollers.len();
                inner.pollers[idx].clone()
            };
            poller.wait_for_modified(&mut fresh, timeout_ms);
        }

        if fresh.is_empty() {
            return 0;
        }

        self.merge_pending(fresh)
    }

    fn apply_subscription_changes(&self) {
        let mut subs: Vec<(RawFd, u64, Interest)> = Vec::new();
        let mut unsubs: Vec<(RawFd, u64)> = Vec::new();

        while let Ok(cmd) = self.commands.pop() {
            match cmd {
                SubCommand::Subscribe { fd, tag, interest } => subs.push((fd, tag, interest)),
                SubCommand::Unsubscribe { fd, tag } => unsubs.push((fd, tag)),
            }
        }

        if subs.is_empty() && unsubs.is_empty() {
            return;
        }

        let mut inner = self.inner.lock().unwrap();

        // Unsubscribes first. A subscribe and its matching unsubscribe in
        // the same batch cancel each other, unless the unsubscribe also has
        // to shut the socket down.
        for (fd, tag) in unsubs {
            if let Some(pos) = subs.iter().position(|(sfd, _, _)| *sfd == fd) {
                subs.swap_remove(pos);
                if !self.unsubscribe_closes_socket {
                    continue;
                }
            }

            if let Some(idx) = inner.owner.swap_remove(&fd) {
                inner.pollers[idx].unsubscribe(fd);
            }
            if self.unsubscribe_closes_socket {
                sys::close(fd);
            }
            self.delete_one_pending(tag);
        }

        for (fd, tag, interest) in subs {
            let idx = match inner
                .pollers
                .iter()
                .position(|p| p.count() < p.max_sockets())
            {
                Some(idx) => idx,
                None => match SelectPoller::new() {
                    Ok(poller) => {
                        inner.pollers.push(Arc::new(poller));
                        inner.pollers.len() - 1
                    }
                    Err(e) => {
                        warn!("cannot grow poller set: {}", e);
                        continue;
                    }
                },
            };

            if inner.pollers[idx].subscribe(fd, tag, interest) {
                inner.owner.insert(fd, idx);
            }
        }
    }

    fn merge_pending(&self, fresh: Vec<PollEvent>) -> usize {
        let mut pending = self.pending.lock().unwrap();

        if pending.remaining() == 0 {
            let count = fresh.len();
            pending.events = fresh;
            pending.index = 0;
            return count;
        }

        // Vacuum consumed entries, then append only tags not already queued.
        // Pending stays small in steady state, so the scan is cheap.
        let index = pending.index;
        pending.events.drain(..index);
        pending.index = 0;

        let mut added = 0;
        for ev in fresh {
            let seen = pending
                .events
                .iter()
                .any(|p| p.tag() == ev.tag() && !p.is_cleared());
            if !seen {
                pending.events.push(ev);
                added += 1;
            }
        }
        added
    }

    /// Take one already-queued event. Skips cancelled entries.
    pub fn get_one_pending(&self, out: &mut PollEvent) -> bool {
        let mut pending = self.pending.lock().unwrap();

        while pending.index < pending.events.len() {
            let ev = pending.events[pending.index];
            pending.index += 1;
            if !ev.is_cleared() {
                *out = ev;
                return true;
            }
        }

        false
    }

    /// Take one event, polling if none is queued, for up to `timeout_ms`.
    pub fn get_one(&self, timeout_ms: u64, out: &mut PollEvent) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            if self.get_one_pending(out) {
                return true;
            }
            if self.terminated.load(Ordering::Acquire) {
                return false;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let remaining = (deadline - now).as_millis() as u64;

            // Subscription churn must be applied promptly on the snapshot
            // facility, so its wait slices are capped at 10 ms.
            let step = if self.follow_epoll {
                remaining
            } else {
                remaining.min(10)
            };
            self.poll_for_pending_events(step.max(1));
        }
    }

    /// Queue a manufactured event, optionally merging into one already
    /// pending for the same tag.
    pub fn add_one_pending(&self, tag: u64, events: Interest, search_existing: bool) {
        let mut pending = self.pending.lock().unwrap();

        if search_existing {
            let index = pending.index;
            for ev in &mut pending.events[index..] {
                if ev.tag() == tag && !ev.is_cleared() {
                    ev.merge(events);
                    return;
                }
            }
        }

        pending.events.push(PollEvent::new(tag, events));
    }

    /// Cancel any queued notification for `tag`.
    pub fn delete_one_pending(&self, tag: u64) {
        let mut pending = self.pending.lock().unwrap();
        let index = pending.index;
        for ev in &mut pending.events[index..] {
            if ev.tag() == tag {
                ev.clear_events();
            }
        }
    }

    /// Cancel queued notifications for every tag in `tags`.
    pub fn delete_several_pending(&self, tags: &[u64]) {
        if tags.is_empty() {
            return;
        }
        let mut pending = self.pending.lock().unwrap();
        let index = pending.index;
        for ev in &mut pending.events[index..] {
            if tags.contains(&ev.tag()) {
                ev.clear_events();
            }
        }
    }

    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Stop every wait loop. Safe to call more than once.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        let inner = self.inner.lock().unwrap();
        for poller in &inner.pollers {
            poller.terminate();
        }
    }

    #[cfg(test)]
    fn poller_count(&self) -> usize {
        self.inner.lock().unwrap().pollers.len()
    }
}
