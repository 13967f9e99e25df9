//! Per-channel history streams.
//!
//! Each channel keeps a bounded, ordered log of recent publications. Offsets
//! are assigned here and are gap-free within one stream epoch. Entries leave
//! the log when the size cap is exceeded or their TTL elapses; a stream with
//! no publishes for `meta_ttl` is dropped and the next append starts a new
//! epoch at offset 1.

use crate::channel::ChannelId;
use crate::message::{now_millis, ClientInfo, Publication, StreamPosition};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

static EPOCH_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_epoch() -> String {
    let counter = EPOCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}{:04x}", now_millis(), counter & 0xffff)
}

/// Retention requested for a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryOptions {
    /// Maximum number of entries kept per channel.
    pub size: usize,
    /// Time each entry is retained.
    pub ttl: Duration,
}

impl HistoryOptions {
    /// No history retention.
    pub const NONE: HistoryOptions = HistoryOptions {
        size: 0,
        ttl: Duration::ZERO,
    };

    #[must_use]
    pub fn new(size: usize, ttl: Duration) -> Self {
        Self { size, ttl }
    }

    /// Whether these options keep anything at all.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.size > 0 && !self.ttl.is_zero()
    }
}

impl Default for HistoryOptions {
    fn default() -> Self {
        Self {
            size: 100,
            ttl: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct HistoryEntry {
    publication: Publication,
    expires_at: Instant,
}

#[derive(Debug)]
struct Stream {
    epoch: String,
    top: u64,
    entries: VecDeque<HistoryEntry>,
    meta_expires_at: Instant,
}

impl Stream {
    fn new(now: Instant, meta_ttl: Duration) -> Self {
        Self {
            epoch: generate_epoch(),
            top: 0,
            entries: VecDeque::new(),
            meta_expires_at: now + meta_ttl,
        }
    }

    fn position(&self) -> StreamPosition {
        StreamPosition {
            offset: self.top,
            epoch: self.epoch.clone(),
        }
    }

    fn meta_expired(&self, now: Instant) -> bool {
        now >= self.meta_expires_at
    }

    /// Drop expired entries from the front. Returns how many were removed.
    fn evict_expired(&mut self, now: Instant) -> usize {
        let mut evicted = 0;
        // Entries are appended in time order, so expiry is ordered too.
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.expires_at <= now)
        {
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    fn since(&self, offset: u64) -> Vec<Publication> {
        let Some(first) = self.entries.front() else {
            return Vec::new();
        };
        if first.publication.offset > offset.saturating_add(1) {
            // Part of the requested range is already gone.
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|entry| entry.publication.offset > offset)
            .map(|entry| entry.publication.clone())
            .collect()
    }
}

/// Bounded per-channel publication log with TTL expiry.
#[derive(Debug)]
pub struct HistoryBuffer {
    streams: DashMap<ChannelId, Stream>,
    meta_ttl: Duration,
}

impl HistoryBuffer {
    /// Create a buffer whose streams are dropped after `meta_ttl` without publishes.
    #[must_use]
    pub fn new(meta_ttl: Duration) -> Self {
        Self {
            streams: DashMap::new(),
            meta_ttl,
        }
    }

    /// Number of tracked streams.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Append a publication to the channel stream.
    ///
    /// Returns the recorded publication and the stream position after it.
    pub fn append(
        &self,
        channel: &str,
        payload: Bytes,
        info: Option<ClientInfo>,
        options: &HistoryOptions,
    ) -> (Publication, StreamPosition) {
        let now = Instant::now();
        let mut stream = self
            .streams
            .entry(channel.to_string())
            .or_insert_with(|| Stream::new(now, self.meta_ttl));

        if stream.meta_expired(now) {
            debug!(channel = %channel, epoch = %stream.epoch, "History stream expired, starting new epoch");
            *stream = Stream::new(now, self.meta_ttl);
        }
        stream.evict_expired(now);

        stream.top += 1;
        let publication = Publication {
            channel: channel.to_string(),
            offset: stream.top,
            payload,
            timestamp: now_millis(),
            info,
        };
        stream.entries.push_back(HistoryEntry {
            publication: publication.clone(),
            expires_at: now + options.ttl,
        });
        while stream.entries.len() > options.size {
            stream.entries.pop_front();
        }
        stream.meta_expires_at = now + self.meta_ttl;

        trace!(channel = %channel, offset = publication.offset, "Appended to history");
        (publication, stream.position())
    }

    /// Retained publications with `offset > since`, in offset order.
    ///
    /// Empty when `since` predates the oldest retained entry.
    #[must_use]
    pub fn recover(&self, channel: &str, since: u64) -> Vec<Publication> {
        self.read(channel, since).0
    }

    /// Publications after `since` together with the current stream position.
    pub fn read(&self, channel: &str, since: u64) -> (Vec<Publication>, StreamPosition) {
        let now = Instant::now();
        let mut stream = self
            .streams
            .entry(channel.to_string())
            .or_insert_with(|| Stream::new(now, self.meta_ttl));

        if stream.meta_expired(now) {
            *stream = Stream::new(now, self.meta_ttl);
        }
        stream.evict_expired(now);

        (stream.since(since), stream.position())
    }

    /// Current position of the channel stream, creating it if absent.
    pub fn position(&self, channel: &str) -> StreamPosition {
        self.read(channel, u64::MAX).1
    }

    /// Drop expired entries and expired streams.
    ///
    /// Returns the number of entries evicted.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        self.streams.retain(|_, stream| {
            evicted += stream.evict_expired(now);
            if stream.meta_expired(now) {
                evicted += stream.entries.len();
                return false;
            }
            true
        });
        if evicted > 0 {
            debug!(evicted, "Removed expired history entries");
        }
        evicted
    }
}
