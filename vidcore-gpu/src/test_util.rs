// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Shared fixtures for unit tests.

use std::sync::Arc;

use parking_lot::Mutex;

use vidcore_common::settings::BufferCacheSettings;
use vidcore_common::{VAddr, KIB, MIB};

use crate::backend::host::{CompletionMode, HostDevice};
use crate::buffer_cache::{BufferCache, ImageSource, PageWatcher};
use crate::guest_memory::MappedGuestMemory;

/// Size of the guest window backing test caches.
const GUEST_WINDOW: usize = 16 * MIB as usize;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Page watcher that records every request.
#[derive(Default)]
pub struct RecordingWatcher {
    events: Mutex<Vec<(VAddr, u64, bool)>>,
}

impl RecordingWatcher {
    pub fn events(&self) -> Vec<(VAddr, u64, bool)> {
        self.events.lock().clone()
    }
}

impl PageWatcher for RecordingWatcher {
    fn update_watch(&self, addr: VAddr, size: u64, watch: bool) {
        self.events.lock().push((addr, size, watch));
    }
}

/// Small pools so tests do not allocate hundreds of megabytes.
pub fn test_settings() -> BufferCacheSettings {
    BufferCacheSettings {
        staging_buffer_size: MIB,
        stream_buffer_size: 256 * KIB,
        download_buffer_size: MIB,
        device_buffer_size: 256 * KIB,
        gds_buffer_size: 64 * KIB,
        ..BufferCacheSettings::default()
    }
}

/// A cache over the host device and a zeroed guest window at address 0.
pub struct TestCache {
    pub cache: BufferCache,
    pub device: Arc<HostDevice>,
    pub guest: Arc<MappedGuestMemory>,
    pub watcher: Arc<RecordingWatcher>,
}

pub fn test_cache(mode: CompletionMode) -> TestCache {
    test_cache_with(&test_settings(), mode, None)
}

pub fn test_cache_with(
    settings: &BufferCacheSettings,
    mode: CompletionMode,
    image_source: Option<Arc<dyn ImageSource>>,
) -> TestCache {
    let device = Arc::new(HostDevice::with_config(mode, u64::MAX));
    test_cache_on(settings, device, image_source)
}

pub fn test_cache_on(
    settings: &BufferCacheSettings,
    device: Arc<HostDevice>,
    image_source: Option<Arc<dyn ImageSource>>,
) -> TestCache {
    init_logging();
    let guest = Arc::new(MappedGuestMemory::new(0, GUEST_WINDOW).unwrap());
    let watcher = Arc::new(RecordingWatcher::default());
    let page_watcher: Arc<dyn PageWatcher> = watcher.clone();
    let cache = BufferCache::new(
        settings,
        device.clone(),
        guest.clone(),
        Some(page_watcher),
        image_source,
    )
    .unwrap();
    TestCache {
        cache,
        device,
        guest,
        watcher,
    }
}
