use crate::cache::CacheBuffer;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify};

/// The response stream went away (client disconnect or processor teardown).
/// Workers treat this as a stop signal, not as an error to report.
#[derive(Debug)]
pub struct DrainClosed;

impl fmt::Display for DrainClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "response stream closed")
    }
}

impl std::error::Error for DrainClosed {}

/// Serializer of worker output into the client stream.
///
/// Two variants: `unordered` gates writers behind an async mutex so each
/// worker's chunks stay contiguous while the overall order is first-come;
/// `ordered` tags chunks with a sort key (the route index), buffers
/// out-of-order chunks up to a memory bound, and emits in key order.
///
/// The drain also owns the two cross-cutting response concerns: the lazy
/// first-byte signal (nothing is sent to the client until some worker
/// produces output) and the cache tee (every emitted byte is mirrored into
/// the uncommitted cache buffer).
#[derive(Clone)]
pub struct Drain {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::Sender<Bytes>,
    mode: Mode,
    /// Set once by whichever writer emits the request-global prefix
    /// (JSON `[`, StationXML header, text header line).
    once_written: AtomicBool,
    bytes_written: AtomicU64,
    first_byte_tx: watch::Sender<bool>,
    first_byte_rx: watch::Receiver<bool>,
    cache: std::sync::Mutex<Option<CacheBuffer>>,
}

enum Mode {
    Unordered {
        lock: Mutex<()>,
    },
    Ordered {
        state: Mutex<OrderedState>,
        space: Notify,
        max_buffered: usize,
    },
}

struct OrderedState {
    next: usize,
    pending: BTreeMap<usize, VecDeque<Bytes>>,
    finished: BTreeSet<usize>,
    buffered: usize,
}

impl Drain {
    pub fn unordered(tx: mpsc::Sender<Bytes>, cache: Option<CacheBuffer>) -> Self {
        Self::build(
            tx,
            Mode::Unordered {
                lock: Mutex::new(()),
            },
            cache,
        )
    }

    pub fn ordered(tx: mpsc::Sender<Bytes>, max_buffered: usize, cache: Option<CacheBuffer>) -> Self {
        Self::build(
            tx,
            Mode::Ordered {
                state: Mutex::new(OrderedState {
                    next: 0,
                    pending: BTreeMap::new(),
                    finished: BTreeSet::new(),
                    buffered: 0,
                }),
                space: Notify::new(),
                max_buffered,
            },
            cache,
        )
    }

    fn build(tx: mpsc::Sender<Bytes>, mode: Mode, cache: Option<CacheBuffer>) -> Self {
        let (first_byte_tx, first_byte_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                tx,
                mode,
                once_written: AtomicBool::new(false),
                bytes_written: AtomicU64::new(0),
                first_byte_tx,
                first_byte_rx,
                cache: std::sync::Mutex::new(cache),
            }),
        }
    }

    /// Acquire the write lock (unordered mode). The guard keeps one worker's
    /// chunks contiguous in the output.
    pub async fn lock(&self) -> DrainGuard<'_> {
        match &self.inner.mode {
            Mode::Unordered { lock } => DrainGuard {
                _guard: lock.lock().await,
                inner: &self.inner,
            },
            Mode::Ordered { .. } => unreachable!("lock() is only valid on an unordered drain"),
        }
    }

    /// Submit a chunk under `key` (ordered mode). Chunks for the lowest
    /// unfinished key stream straight through; later keys are buffered up to
    /// the memory bound, blocking the producer beyond it.
    pub async fn write_keyed(&self, key: usize, bytes: Bytes) -> Result<(), DrainClosed> {
        let Mode::Ordered {
            state,
            space,
            max_buffered,
        } = &self.inner.mode
        else {
            unreachable!("write_keyed() is only valid on an ordered drain");
        };

        loop {
            let mut st = state.lock().await;
            if key <= st.next {
                return self.inner.emit(bytes).await;
            }
            if st.buffered + bytes.len() <= *max_buffered || st.buffered == 0 {
                st.buffered += bytes.len();
                st.pending.entry(key).or_default().push_back(bytes);
                return Ok(());
            }
            // Over the bound — wait for the window to advance. Interest is
            // registered before the lock drops so a flush between the check
            // and the await cannot be missed.
            let notified = space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(st);
            notified.await;
        }
    }

    /// Mark `key` complete (ordered mode), advancing the emission window and
    /// flushing any buffered successors.
    pub async fn finish_key(&self, key: usize) -> Result<(), DrainClosed> {
        let Mode::Ordered { state, space, .. } = &self.inner.mode else {
            unreachable!("finish_key() is only valid on an ordered drain");
        };

        let mut st = state.lock().await;
        st.finished.insert(key);
        loop {
            // Flush whatever the current window head has buffered.
            let next = st.next;
            if let Some(chunks) = st.pending.remove(&next) {
                for chunk in chunks {
                    st.buffered -= chunk.len();
                    self.inner.emit(chunk).await?;
                }
                space.notify_waiters();
            }
            if st.finished.contains(&st.next) {
                st.next += 1;
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Write bytes outside any worker ordering — used by the processor for
    /// format footers after the queue has drained.
    pub async fn write_tail(&self, bytes: Bytes) -> Result<(), DrainClosed> {
        self.inner.emit(bytes).await
    }

    /// Resolves once the first byte has been emitted. Never resolves when no
    /// worker produces output — pair with completion in a `select!`.
    pub async fn first_byte(&self) {
        let mut rx = self.inner.first_byte_rx.clone();
        // Only fails when the sender is dropped, which cannot outlive `self`.
        let _ = rx.wait_for(|prepared| *prepared).await;
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Acquire)
    }

    /// Detach the uncommitted cache buffer (for commit or discard).
    pub fn take_cache_buffer(&self) -> Option<CacheBuffer> {
        self.inner.cache.lock().unwrap().take()
    }
}

/// Exclusive writer handle onto an unordered drain.
pub struct DrainGuard<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
    inner: &'a Inner,
}

impl DrainGuard<'_> {
    /// Write the request-global prefix if nobody has yet. Returns whether
    /// this call was the one that wrote it.
    pub async fn write_once(&self, bytes: Bytes) -> Result<bool, DrainClosed> {
        if self
            .inner
            .once_written
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }
        self.inner.emit(bytes).await?;
        Ok(true)
    }

    pub async fn write(&self, bytes: Bytes) -> Result<(), DrainClosed> {
        self.inner.emit(bytes).await
    }
}

impl Inner {
    async fn emit(&self, bytes: Bytes) -> Result<(), DrainClosed> {
        if bytes.is_empty() {
            return Ok(());
        }
        if let Some(buf) = self.cache.lock().unwrap().as_mut() {
            buf.push(&bytes);
        }
        self.bytes_written
            .fetch_add(bytes.len() as u64, Ordering::AcqRel);
        self.first_byte_tx.send_replace(true);
        self.tx.send(bytes).await.map_err(|_| DrainClosed)
    }
}
