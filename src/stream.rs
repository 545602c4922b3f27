//! Inbound stream iterator for streaming request handlers.
//!
//! A [`StreamReader`] is the handler-facing half of a request's inbound
//! queue: a single-consumer FIFO fed by the dispatcher and closed by the
//! client's END_OF_STREAM. Payloads cross the queue as dynamic values and
//! are decoded to the handler's declared type on the way out.
//!
//! # Example
//!
//! ```ignore
//! async fn sum(mut numbers: StreamReader<i64>, ctx: Context) -> Result<i64> {
//!     let mut total = 0;
//!     while let Some(n) = numbers.next().await? {
//!         total += n;
//!     }
//!     Ok(total)
//! }
//! ```

use std::marker::PhantomData;

use rmpv::Value;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::MsgPackCodec;
use crate::error::{Result, SwillError};

/// Lazy, cancellable, in-order reader over a request's inbound messages.
///
/// `next()` suspends until a value arrives, the stream ends, or the request
/// is cancelled. Cancellation takes priority over buffered values: once the
/// request's cancellation signal fires, every waiter is unblocked with
/// [`SwillError::Cancelled`] and buffered items are no longer delivered.
pub struct StreamReader<T> {
    rx: mpsc::Receiver<Value>,
    cancel: CancellationToken,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> StreamReader<T> {
    pub(crate) fn new(rx: mpsc::Receiver<Value>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            cancel,
            _marker: PhantomData,
        }
    }

    /// Wait for the next message.
    ///
    /// Returns `Ok(Some(value))` for a message, `Ok(None)` once the stream
    /// has ended and the buffer is drained, and an error on cancellation or
    /// when a payload does not decode to `T`.
    pub async fn next(&mut self) -> Result<Option<T>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SwillError::Cancelled),
            item = self.rx.recv() => match item {
                Some(value) => MsgPackCodec::from_value(value).map(Some),
                None => Ok(None),
            },
        }
    }

    /// Number of buffered, unread messages.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the buffer is currently empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Stop accepting new messages.
    ///
    /// Idempotent. Buffered messages remain readable; once drained, `next()`
    /// reports end.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Whether the request's cancellation signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> (mpsc::Sender<Value>, StreamReader<i64>, CancellationToken) {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, StreamReader::new(rx, cancel.clone()), cancel)
    }

    #[tokio::test]
    async fn test_in_order_delivery() {
        let (tx, mut reader, _cancel) = queue(8);

        for i in 1..=3i64 {
            tx.send(Value::from(i)).await.unwrap();
        }

        assert_eq!(reader.next().await.unwrap(), Some(1));
        assert_eq!(reader.next().await.unwrap(), Some(2));
        assert_eq!(reader.next().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_end_after_producer_drop() {
        let (tx, mut reader, _cancel) = queue(8);

        tx.send(Value::from(7i64)).await.unwrap();
        drop(tx);

        assert_eq!(reader.next().await.unwrap(), Some(7));
        assert_eq!(reader.next().await.unwrap(), None);
        // End is sticky.
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_next_suspends_until_value() {
        let (tx, mut reader, _cancel) = queue(8);

        let producer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tx.send(Value::from(42i64)).await.unwrap();
        });

        assert_eq!(reader.next().await.unwrap(), Some(42));
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_waiter() {
        let (_tx, mut reader, cancel) = queue(8);

        let waiter = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SwillError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancellation_beats_buffered_values() {
        let (tx, mut reader, cancel) = queue(8);

        tx.send(Value::from(1i64)).await.unwrap();
        cancel.cancel();

        assert!(matches!(reader.next().await, Err(SwillError::Cancelled)));
    }

    #[tokio::test]
    async fn test_close_then_drain() {
        let (tx, mut reader, _cancel) = queue(8);

        tx.send(Value::from(1i64)).await.unwrap();
        tx.send(Value::from(2i64)).await.unwrap();

        reader.close();
        reader.close(); // idempotent

        assert_eq!(reader.len(), 2);
        assert_eq!(reader.next().await.unwrap(), Some(1));
        assert_eq!(reader.next().await.unwrap(), Some(2));
        assert_eq!(reader.next().await.unwrap(), None);
        assert_eq!(reader.len(), 0);

        // Sends after close fail.
        assert!(tx.send(Value::from(3i64)).await.is_err());
    }

    #[tokio::test]
    async fn test_length_tracks_buffer() {
        let (tx, mut reader, _cancel) = queue(8);
        assert!(reader.is_empty());

        tx.send(Value::from(1i64)).await.unwrap();
        tx.send(Value::from(2i64)).await.unwrap();
        assert_eq!(reader.len(), 2);

        reader.next().await.unwrap();
        assert_eq!(reader.len(), 1);
    }

    #[tokio::test]
    async fn test_decode_error_surfaces() {
        let (tx, mut reader, _cancel) = queue(8);
        tx.send(Value::from("not a number")).await.unwrap();

        assert!(matches!(reader.next().await, Err(SwillError::Decode(_))));
    }

    #[tokio::test]
    async fn test_capacity_floor_of_one() {
        let (tx, mut reader, _cancel) = queue(0);
        tx.send(Value::from(1i64)).await.unwrap();
        assert_eq!(reader.next().await.unwrap(), Some(1));
    }
}
