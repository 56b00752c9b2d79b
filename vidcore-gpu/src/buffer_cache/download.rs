// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Background GPU to host write-back.
//!
//! Downloads are queued in submission order. A single worker thread pops the
//! oldest entry, waits for the GPU tick its copy depends on, runs the host
//! copy, then raises the download tick to the entry's signal tick. Guest
//! memory is only ever written with GPU results from this thread.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::backend::Device;
use crate::tick::TickCounter;

/// A queued host copy.
pub struct PendingDownload {
    /// Copies GPU results from the readback ring into guest memory.
    pub callback: Box<dyn FnOnce() + Send>,
    /// Device tick after which the readback ring holds the results.
    pub gpu_tick: u64,
    /// Download tick published once `callback` has run.
    pub signal_tick: u64,
}

struct QueueState {
    entries: VecDeque<PendingDownload>,
    stop: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    queue_cv: Condvar,
    download_tick: TickCounter,
}

/// Owner of the download thread and its queue.
pub struct DownloadWorker {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl DownloadWorker {
    pub fn spawn(device: Arc<dyn Device>) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                entries: VecDeque::new(),
                stop: false,
            }),
            queue_cv: Condvar::new(),
            download_tick: TickCounter::new(0),
        });
        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("vidcore:download".into())
                .spawn(move || download_thread(&shared, device.as_ref()))?
        };
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Queue a download behind every previously queued one.
    pub fn push(&self, download: PendingDownload) {
        let mut queue = self.shared.queue.lock();
        debug_assert!(
            queue
                .entries
                .back()
                .map_or(true, |last| last.signal_tick < download.signal_tick),
            "download signal ticks must increase"
        );
        queue.entries.push_back(download);
        self.shared.queue_cv.notify_one();
    }

    /// Highest signal tick whose host copy has completed.
    #[inline]
    pub fn download_tick(&self) -> u64 {
        self.shared.download_tick.get()
    }

    /// Block until every download up to `target` has landed in guest memory.
    #[inline]
    pub fn wait_for_tick(&self, target: u64) {
        self.shared.download_tick.wait_for(target);
    }

    /// Number of queued downloads not yet started.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().entries.len()
    }

    /// Ask the worker to exit and join it. Queued entries are abandoned; one
    /// already running finishes first.
    pub fn stop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.stop = true;
            self.shared.queue_cv.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("download worker panicked");
            }
        }
    }
}

impl Drop for DownloadWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn download_thread(shared: &Shared, device: &dyn Device) {
    log::debug!("download worker started");
    loop {
        let download = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.stop {
                    log::debug!(
                        "download worker stopping, {} entries abandoned",
                        queue.entries.len()
                    );
                    return;
                }
                if let Some(download) = queue.entries.pop_front() {
                    break download;
                }
                shared.queue_cv.wait(&mut queue);
            }
        };

        device.wait_tick(download.gpu_tick);
        (download.callback)();
        shared.download_tick.advance_to(download.signal_tick);
        log::trace!("download tick {} signalled", download.signal_tick);
    }
}
