//! Change-feed types and window diffing.
//!
//! A feed delivers one full snapshot of the top-N window, then change lists.
//! `diff_windows` turns two successive windows into the change list a
//! window-limited query listener reports: removals first, then additions
//! and modifications in new-window order.
//!
//! The queue between producer and subscriber is bounded. A subscriber that
//! falls `capacity` deliveries behind has its feed cut and sees
//! `FeedClosed`, the same gap signal as a lost connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::StoreError;
use crate::models::CaseRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change-list entry. `record` is `None` only for removals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub id: String,
    pub record: Option<CaseRecord>,
}

impl DocumentChange {
    pub fn added(record: CaseRecord) -> Self {
        Self {
            kind: ChangeKind::Added,
            id: record.id.clone(),
            record: Some(record),
        }
    }

    pub fn modified(record: CaseRecord) -> Self {
        Self {
            kind: ChangeKind::Modified,
            id: record.id.clone(),
            record: Some(record),
        }
    }

    pub fn removed(id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Removed,
            id: id.into(),
            record: None,
        }
    }
}

/// One delivery from the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Full contents of the window.
    Snapshot(Vec<CaseRecord>),
    /// Ordered changes since the previous delivery.
    Changes(Vec<DocumentChange>),
}

pub type FeedItem = Result<FeedEvent, StoreError>;

/// Deliveries a subscriber may fall behind by before its feed is cut.
pub const DEFAULT_FEED_CAPACITY: usize = 64;

/// Producing end of an open change feed.
pub struct FeedSender {
    tx: mpsc::Sender<FeedItem>,
    lagged: Arc<AtomicBool>,
}

impl FeedSender {
    /// Queue a delivery without waiting. A full queue cuts the feed.
    pub fn send(&self, item: FeedItem) -> Result<(), StoreError> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.lagged.store(true, Ordering::Release);
                tracing::warn!(capacity = self.tx.max_capacity(), "Feed subscriber fell behind, feed cut");
                Err(StoreError::FeedClosed)
            }
            Err(TrySendError::Closed(_)) => Err(StoreError::FeedClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the subscriber has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Receiving end of an open change feed.
///
/// Dropping or closing it unsubscribes: the producing side observes the
/// closed channel and releases its listener.
pub struct FeedSubscription {
    rx: mpsc::Receiver<FeedItem>,
    lagged: Arc<AtomicBool>,
}

impl FeedSubscription {
    /// Create a connected producer/subscription pair.
    pub fn channel() -> (FeedSender, Self) {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (FeedSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let lagged = Arc::new(AtomicBool::new(false));
        (
            FeedSender {
                tx,
                lagged: Arc::clone(&lagged),
            },
            Self { rx, lagged },
        )
    }

    /// Next delivery in order. `None` once the producer has gone away.
    ///
    /// After an overflow the queued deliveries are stale: `FeedClosed` is
    /// returned instead of them.
    pub async fn next(&mut self) -> Option<FeedItem> {
        if self.lagged.load(Ordering::Acquire) {
            self.rx.close();
            return Some(Err(StoreError::FeedClosed));
        }
        self.rx.recv().await
    }

    pub fn close(mut self) {
        self.rx.close();
    }
}

/// Compute the change list between two windows of the same query.
pub fn diff_windows(previous: &[CaseRecord], next: &[CaseRecord]) -> Vec<DocumentChange> {
    let before: HashMap<&str, &CaseRecord> = previous.iter().map(|r| (r.id.as_str(), r)).collect();
    let after: HashMap<&str, &CaseRecord> = next.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut changes: Vec<DocumentChange> = previous
        .iter()
        .filter(|r| !after.contains_key(r.id.as_str()))
        .map(|r| DocumentChange::removed(r.id.clone()))
        .collect();

    for record in next {
        match before.get(record.id.as_str()) {
            None => changes.push(DocumentChange::added(record.clone())),
            Some(old) if *old != record => changes.push(DocumentChange::modified(record.clone())),
            Some(_) => {}
        }
    }

    changes
}
