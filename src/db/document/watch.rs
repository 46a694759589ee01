//! Typed change feed handed out by [`DocumentRepository::watch`](super::DocumentRepository::watch).

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::db::StorageResult;
use crate::db::models::ChangeEvent;

/// Receiving end of a change feed.
///
/// Yields decoded events until the watch is cancelled or the driver stream ends. A driver
/// failure arrives as a final `Err`. Dropping the feed stops the background task.
pub struct ChangeFeed<T> {
    rx: mpsc::Receiver<StorageResult<ChangeEvent<T>>>,
}

impl<T> ChangeFeed<T> {
    pub(crate) fn new(rx: mpsc::Receiver<StorageResult<ChangeEvent<T>>>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the feed has ended.
    pub async fn recv(&mut self) -> Option<StorageResult<ChangeEvent<T>>> {
        self.rx.recv().await
    }

    /// Stop receiving; buffered events can still be drained with [`recv`](Self::recv).
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl<T> Stream for ChangeFeed<T> {
    type Item = StorageResult<ChangeEvent<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
