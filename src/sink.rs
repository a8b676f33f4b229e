//! Frame fan-out.
//!
//! `FrameSink::dispatch` PNG-encodes a frame once and hands the same bytes to
//! the display and storage consumers without ever waiting on them:
//! - display: a per-slot mailbox that only keeps the newest frame; a display
//!   thread drains it
//! - storage: an unbounded queue drained by a storage thread, so every frame
//!   delivered while persistence is on gets a save attempt
//!
//! A failing consumer never blocks or starves the other one. Encode and save
//! failures surface as non-fatal `CaptureError` events.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::event::{ErrorKind, Event, EventBus};
use crate::frame::{EncodedFrame, Frame};
use crate::slot::SlotIndex;

/// Live view consumer. Only ever sees the newest frame per slot.
pub trait DisplayConsumer: Send + Sync {
    fn present(&self, slot: SlotIndex, frame: &EncodedFrame) -> Result<()>;
}

/// Storage consumer. Called once per frame while persistence is enabled,
/// with the same encoding the display got.
pub trait PersistenceConsumer: Send + Sync {
    fn save(&self, slot: SlotIndex, target: &Path, frame: &EncodedFrame) -> Result<()>;
}

/// Writes each frame as `frame_<epoch-micros>_<sequence>.png` in the target
/// directory, creating the directory on first use.
#[derive(Clone, Debug, Default)]
pub struct FrameStore;

impl FrameStore {
    pub fn new() -> Self {
        Self
    }

    pub fn file_name(frame: &EncodedFrame) -> String {
        format!("frame_{}_{:06}.png", frame.capture_micros(), frame.sequence)
    }
}

impl PersistenceConsumer for FrameStore {
    fn save(&self, _slot: SlotIndex, target: &Path, frame: &EncodedFrame) -> Result<()> {
        std::fs::create_dir_all(target)
            .with_context(|| format!("create frame directory {}", target.display()))?;
        let path = target.join(Self::file_name(frame));
        std::fs::write(&path, frame.png_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct SinkConsumers {
    pub display: Option<Arc<dyn DisplayConsumer>>,
    pub persistence: Option<Arc<dyn PersistenceConsumer>>,
}

/// Counters since the sink was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub dispatched: u64,
    pub encoded: u64,
    /// Display frames overwritten before the display thread picked them up.
    pub display_replaced: u64,
    pub saved: u64,
    pub save_failed: u64,
}

#[derive(Default)]
struct SinkCounters {
    dispatched: AtomicU64,
    encoded: AtomicU64,
    display_replaced: AtomicU64,
    saved: AtomicU64,
    save_failed: AtomicU64,
}

struct StorageJob {
    slot: SlotIndex,
    target: PathBuf,
    frame: EncodedFrame,
}

struct MailboxState {
    latest: Vec<Option<EncodedFrame>>,
    closed: bool,
}

/// Latest-frame-wins slots shared with the display thread.
struct DisplayMailbox {
    state: Mutex<MailboxState>,
    ready: Condvar,
}

impl DisplayMailbox {
    fn new(slots: usize) -> Self {
        Self {
            state: Mutex::new(MailboxState {
                latest: vec![None; slots],
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Store `frame` as the newest for `slot`. Returns true if an undisplayed
    /// frame was overwritten.
    fn put(&self, slot: SlotIndex, frame: EncodedFrame) -> bool {
        let mut state = self.state.lock();
        if slot.index() >= state.latest.len() {
            state.latest.resize(slot.index() + 1, None);
        }
        let replaced = state.latest[slot.index()].replace(frame).is_some();
        drop(state);
        self.ready.notify_one();
        replaced
    }

    /// Wait for at least one frame. `None` once closed and empty.
    fn take_batch(&self) -> Option<Vec<(SlotIndex, EncodedFrame)>> {
        let mut state = self.state.lock();
        loop {
            let batch: Vec<_> = state
                .latest
                .iter_mut()
                .enumerate()
                .filter_map(|(idx, slot)| slot.take().map(|frame| (SlotIndex(idx), frame)))
                .collect();
            if !batch.is_empty() {
                return Some(batch);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }
}

pub struct FrameSink {
    bus: Arc<EventBus>,
    mailbox: Option<Arc<DisplayMailbox>>,
    storage_tx: Mutex<Option<Sender<StorageJob>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<SinkCounters>,
}

impl FrameSink {
    pub fn new(bus: Arc<EventBus>, slots: usize, consumers: SinkConsumers) -> Result<Self> {
        let counters = Arc::new(SinkCounters::default());
        let mut threads = Vec::new();

        let mailbox = match consumers.display {
            Some(display) => {
                let mailbox = Arc::new(DisplayMailbox::new(slots));
                let thread_mailbox = mailbox.clone();
                let join = std::thread::Builder::new()
                    .name("camslot-display".to_string())
                    .spawn(move || run_display(thread_mailbox, display))
                    .context("spawn display thread")?;
                threads.push(join);
                Some(mailbox)
            }
            None => None,
        };

        let storage_tx = match consumers.persistence {
            Some(store) => {
                let (tx, rx) = unbounded::<StorageJob>();
                let thread_bus = bus.clone();
                let thread_counters = counters.clone();
                let join = std::thread::Builder::new()
                    .name("camslot-storage".to_string())
                    .spawn(move || {
                        for job in rx.iter() {
                            save_job(&*store, &thread_bus, &thread_counters, job);
                        }
                    })
                    .context("spawn storage thread")?;
                threads.push(join);
                Some(tx)
            }
            None => None,
        };

        Ok(Self {
            bus,
            mailbox,
            storage_tx: Mutex::new(storage_tx),
            threads: Mutex::new(threads),
            counters,
        })
    }

    /// Deliver one frame. Never waits on a consumer.
    pub fn dispatch(&self, slot: SlotIndex, frame: Frame, persist: Option<PathBuf>) {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        let storage = match persist {
            Some(target) => {
                let tx = self.storage_tx.lock().clone();
                if tx.is_none() {
                    log::debug!("{}: persistence enabled but no frame store", slot);
                }
                tx.map(|tx| (tx, target))
            }
            None => None,
        };
        if self.mailbox.is_none() && storage.is_none() {
            return;
        }

        let encoded = match frame.encode_png() {
            Ok(encoded) => encoded,
            Err(err) => {
                log::warn!("{}: encode error: {:#}", slot, err);
                self.bus.publish(Event::CaptureError {
                    slot,
                    kind: ErrorKind::EncodeFailed,
                    message: format!("encode error: {:#}", err),
                });
                return;
            }
        };
        self.counters.encoded.fetch_add(1, Ordering::Relaxed);

        if let Some((tx, target)) = storage {
            let job = StorageJob {
                slot,
                target,
                frame: encoded.clone(),
            };
            if tx.send(job).is_err() {
                log::warn!("{}: storage thread gone, frame not saved", slot);
            }
        }
        if let Some(mailbox) = &self.mailbox {
            if mailbox.put(slot, encoded) {
                self.counters
                    .display_replaced
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            encoded: self.counters.encoded.load(Ordering::Relaxed),
            display_replaced: self.counters.display_replaced.load(Ordering::Relaxed),
            saved: self.counters.saved.load(Ordering::Relaxed),
            save_failed: self.counters.save_failed.load(Ordering::Relaxed),
        }
    }

    /// Finish pending saves, show the last frames and join both threads.
    pub fn shutdown(&self) {
        if let Some(mailbox) = &self.mailbox {
            mailbox.close();
        }
        self.storage_tx.lock().take();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for join in threads {
            if join.join().is_err() {
                log::error!("frame sink thread panicked");
            }
        }
    }
}

impl Drop for FrameSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_display(mailbox: Arc<DisplayMailbox>, display: Arc<dyn DisplayConsumer>) {
    while let Some(batch) = mailbox.take_batch() {
        for (slot, frame) in batch {
            if let Err(err) = display.present(slot, &frame) {
                log::warn!("{}: display error: {:#}", slot, err);
            }
        }
    }
}

fn save_job(
    store: &dyn PersistenceConsumer,
    bus: &EventBus,
    counters: &SinkCounters,
    job: StorageJob,
) {
    match store.save(job.slot, &job.target, &job.frame) {
        Ok(()) => {
            counters.saved.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            counters.save_failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("{}: save error: {:#}", job.slot, err);
            bus.publish(Event::CaptureError {
                slot: job.slot,
                kind: ErrorKind::SaveFailed,
                message: format!("save error: {:#}", err),
            });
        }
    }
}
