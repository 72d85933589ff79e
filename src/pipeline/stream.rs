//! Consumer side of a stream: the latest completed frame, blocking reads and
//! frame listeners.
//!
//! There is no queue. A consumer slower than the device sees only the most
//! recent frame; older frames stay alive only while someone holds a handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use flume::TrySendError;
use tracing::{debug, trace};

use crate::capture::pool::FrameHandle;
use crate::error::{Result, SdkError};
use crate::pipeline::wait::{wait_for_any, WaiterList};

/// Identifies a listener registered with [`VideoStream::add_frame_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Latest {
    frame: Option<FrameHandle>,
    unread: bool,
}

struct Listener {
    id: ListenerId,
    sender: flume::Sender<FrameHandle>,
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    corrupted: AtomicU64,
    read: AtomicU64,
    listener_drops: AtomicU64,
}

/// Snapshot of stream counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub published: u64,
    pub corrupted: u64,
    pub read: u64,
    pub listener_drops: u64,
}

struct StreamShared {
    name: String,
    latest: Mutex<Latest>,
    waiters: WaiterList,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
    stats: CachePadded<Stats>,
}

/// Shared handle to one stream's frame slot. Cloning is cheap.
#[derive(Clone)]
pub struct VideoStream {
    shared: Arc<StreamShared>,
}

impl VideoStream {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                name: name.into(),
                latest: Mutex::new(Latest::default()),
                waiters: WaiterList::default(),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                stats: CachePadded::new(Stats::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn latest(&self) -> MutexGuard<'_, Latest> {
        self.shared.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn waiters(&self) -> &WaiterList {
        &self.shared.waiters
    }

    /// Whether a frame arrived that has not been read yet.
    pub fn has_new_frame(&self) -> bool {
        self.latest().unread
    }

    /// Producer side: makes `frame` the latest frame and wakes consumers.
    /// The previous latest frame loses the stream's reference.
    pub fn publish(&self, frame: FrameHandle) {
        frame.publish();
        let corrupted = frame.read().meta.corrupted;
        let stats = &self.shared.stats;
        stats.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("perigee_frames_published", "stream" => self.shared.name.clone())
            .increment(1);
        if corrupted {
            stats.corrupted.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("perigee_frames_corrupted", "stream" => self.shared.name.clone())
                .increment(1);
        }

        let previous = {
            let mut latest = self.latest();
            latest.unread = true;
            latest.frame.replace(frame.clone())
        };
        // Released outside the slot lock; this may run a return hook.
        drop(previous);

        self.shared.waiters.notify_all();

        let mut listeners = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|listener| match listener.sender.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                stats.listener_drops.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("perigee_listener_drops", "stream" => self.shared.name.clone())
                    .increment(1);
                trace!(stream = %self.shared.name, listener = listener.id.0, "listener busy, frame dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(stream = %self.shared.name, listener = listener.id.0, "listener gone");
                false
            }
        });
    }

    /// Takes the unread frame, if any, without blocking.
    pub fn try_read_frame(&self) -> Option<FrameHandle> {
        let mut latest = self.latest();
        if !latest.unread {
            return None;
        }
        latest.unread = false;
        let frame = latest.frame.clone();
        drop(latest);
        if frame.is_some() {
            self.shared.stats.read.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Blocks until a new frame is available. `None` waits forever.
    pub fn read_frame(&self, timeout: Option<Duration>) -> Result<FrameHandle> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if let Some(frame) = self.try_read_frame() {
                return Ok(frame);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SdkError::Timeout(timeout.unwrap_or_default()));
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            match wait_for_any(&[self], remaining) {
                Ok(_) => continue,
                Err(SdkError::Timeout(_)) => {
                    return Err(SdkError::Timeout(timeout.unwrap_or_default()))
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// The most recent frame, read or not.
    pub fn peek_latest(&self) -> Option<FrameHandle> {
        self.latest().frame.clone()
    }

    /// Registers an asynchronous listener. The channel holds at most one
    /// frame; frames published while it is full are dropped for that
    /// listener so the producer never blocks. Async consumers can use
    /// `recv_async`.
    pub fn add_frame_listener(&self) -> (ListenerId, flume::Receiver<FrameHandle>) {
        let (sender, receiver) = flume::bounded(1);
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Listener { id, sender });
        (id, receiver)
    }

    /// Returns whether the listener was registered.
    pub fn remove_frame_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        before != listeners.len()
    }

    /// Drops the held frame and listeners. Blocked readers time out normally.
    pub fn clear(&self) {
        let previous = {
            let mut latest = self.latest();
            latest.unread = false;
            latest.frame.take()
        };
        drop(previous);
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn stats(&self) -> StreamStats {
        let stats = &self.shared.stats;
        StreamStats {
            published: stats.published.load(Ordering::Relaxed),
            corrupted: stats.corrupted.load(Ordering::Relaxed),
            read: stats.read.load(Ordering::Relaxed),
            listener_drops: stats.listener_drops.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for VideoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoStream")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::pool::FramePool;

    fn frame_with_index(pool: &FramePool, index: u64) -> FrameHandle {
        let frame = pool.acquire(4);
        frame.write().unwrap().meta.frame_index = index;
        frame
    }

    #[test]
    fn latest_frame_wins() {
        let pool = FramePool::new(0, 4);
        let stream = VideoStream::new("Depth");
        stream.publish(frame_with_index(&pool, 1));
        stream.publish(frame_with_index(&pool, 2));

        let frame = stream.try_read_frame().unwrap();
        assert_eq!(frame.read().meta.frame_index, 2);
        assert!(stream.try_read_frame().is_none());
        // The first frame went back to the pool.
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn consumer_keeps_old_frame_alive() {
        let pool = FramePool::new(0, 4);
        let stream = VideoStream::new("Depth");
        stream.publish(frame_with_index(&pool, 1));
        let held = stream.read_frame(Some(Duration::ZERO)).unwrap();
        stream.publish(frame_with_index(&pool, 2));
        assert_eq!(held.read().meta.frame_index, 1);
        assert_eq!(held.ref_count(), 1);
        assert_eq!(pool.free_count(), 0);
        drop(held);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn read_blocks_until_publish() {
        let pool = FramePool::new(0, 4);
        let stream = VideoStream::new("Image");
        let producer = stream.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            producer.publish(frame_with_index(&pool, 9));
        });
        let frame = stream.read_frame(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(frame.read().meta.frame_index, 9);
        handle.join().unwrap();
    }

    #[test]
    fn read_times_out() {
        let stream = VideoStream::new("Image");
        let started = Instant::now();
        let err = stream.read_frame(Some(Duration::from_millis(40))).unwrap_err();
        assert!(matches!(err, SdkError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn busy_listener_drops_frames() {
        let pool = FramePool::new(0, 4);
        let stream = VideoStream::new("Depth");
        let (id, receiver) = stream.add_frame_listener();
        stream.publish(frame_with_index(&pool, 1));
        stream.publish(frame_with_index(&pool, 2));
        assert_eq!(receiver.try_recv().unwrap().read().meta.frame_index, 1);
        assert!(receiver.try_recv().is_err());
        assert_eq!(stream.stats().listener_drops, 1);

        assert!(stream.remove_frame_listener(id));
        assert!(!stream.remove_frame_listener(id));
    }

    #[test]
    fn disconnected_listener_is_pruned() {
        let pool = FramePool::new(0, 4);
        let stream = VideoStream::new("Depth");
        let (id, receiver) = stream.add_frame_listener();
        drop(receiver);
        stream.publish(frame_with_index(&pool, 1));
        assert!(!stream.remove_frame_listener(id));
    }
}
