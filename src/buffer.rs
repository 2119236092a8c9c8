//! Inbound Byte Stream Buffer
//!
//! Accumulates bytes received on a serial link and supports draining
//! reads as well as delimiter-bounded reads with a timeout.
//!
//! The buffer is written by the session's inbound pump and drained by one
//! caller at a time (reads are serialized at the session layer). Capacity
//! is capped: when a stalled consumer lets the buffer fill up, the oldest
//! bytes are dropped to bound memory.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{BtError, Result};

/// Default capacity if none is configured (1 MiB).
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

struct Inner {
    data: VecDeque<u8>,
    /// Total bytes ever removed from the head (consumed or overflowed).
    /// Lets a pending delimiter search keep its place across appends.
    head_offset: u64,
    capacity: usize,
    closed: bool,
}

/// Thread-safe inbound buffer for one connection.
pub struct ByteStreamBuffer {
    inner: Mutex<Inner>,
    data_ready: Notify,
}

impl ByteStreamBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                data: VecDeque::new(),
                head_offset: 0,
                capacity: capacity.max(1),
                closed: false,
            }),
            data_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a panic elsewhere; the byte queue
        // itself is always in a consistent state.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append received bytes at the tail. Never fails; when the cap is
    /// exceeded the oldest bytes are discarded.
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        {
            let mut inner = self.lock();
            inner.data.extend(bytes.iter().copied());
            let len = inner.data.len();
            if len > inner.capacity {
                let overflow = len - inner.capacity;
                inner.data.drain(..overflow);
                inner.head_offset += overflow as u64;
                warn!(dropped = overflow, "inbound buffer overflow, oldest bytes discarded");
            }
        }
        self.data_ready.notify_one();
    }

    /// Mark the stream as closed and wake any pending read.
    ///
    /// Already-buffered bytes stay readable; only delimiter waits that can
    /// no longer be satisfied fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.data_ready.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().data.is_empty()
    }

    /// Drain and return everything currently buffered. Never blocks.
    pub fn read_all(&self) -> Vec<u8> {
        let mut inner = self.lock();
        let out: Vec<u8> = inner.data.drain(..).collect();
        inner.head_offset += out.len() as u64;
        out
    }

    /// Wait until at least one byte is buffered, then drain everything.
    ///
    /// Fails with `ReadTimeout` if nothing arrives in time and with
    /// `ConnectionClosed` if the stream is closed while empty.
    pub async fn read_some(&self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.lock();
                if !inner.data.is_empty() {
                    let out: Vec<u8> = inner.data.drain(..).collect();
                    inner.head_offset += out.len() as u64;
                    return Ok(out);
                }
                if inner.closed {
                    return Err(BtError::ConnectionClosed);
                }
            }
            self.wait_for_data(deadline, timeout).await?;
        }
    }

    /// Wait until `delimiter` appears as a contiguous subsequence, then
    /// drain and return everything up to and including it.
    ///
    /// On timeout the buffered bytes are left intact so a later read can
    /// still consume them. The search keeps its position across appends
    /// instead of rescanning from the head every time data arrives.
    pub async fn read_until(&self, delimiter: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        if delimiter.is_empty() {
            return Err(BtError::InvalidArgument("empty delimiter".into()));
        }
        let deadline = Instant::now() + timeout;
        let mut scanner = DelimiterScanner::new(delimiter);
        // Absolute position of the next unexamined byte.
        let mut scan_pos = self.lock().head_offset;

        loop {
            {
                let mut inner = self.lock();
                // Overflow may have dropped bytes we already examined.
                if scan_pos < inner.head_offset {
                    debug!("delimiter scan restarted after buffer overflow");
                    scan_pos = inner.head_offset;
                    scanner.reset();
                }
                let mut idx = (scan_pos - inner.head_offset) as usize;
                while idx < inner.data.len() {
                    let byte = inner.data[idx];
                    if scanner.push(byte) {
                        let out: Vec<u8> = inner.data.drain(..=idx).collect();
                        inner.head_offset += out.len() as u64;
                        return Ok(out);
                    }
                    idx += 1;
                }
                scan_pos = inner.head_offset + inner.data.len() as u64;
                if inner.closed {
                    return Err(BtError::ConnectionClosed);
                }
            }
            self.wait_for_data(deadline, timeout).await?;
        }
    }

    async fn wait_for_data(&self, deadline: Instant, timeout: Duration) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(BtError::ReadTimeout(timeout));
        }
        match tokio::time::timeout(remaining, self.data_ready.notified()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(BtError::ReadTimeout(timeout)),
        }
    }
}

impl Default for ByteStreamBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Incremental substring matcher with a prefix-function fallback, so the
/// first occurrence of the delimiter is found even when it overlaps
/// itself (e.g. delimiter `AAB` in stream `AAAB`).
struct DelimiterScanner {
    delimiter: Vec<u8>,
    fallback: Vec<usize>,
    matched: usize,
}

impl DelimiterScanner {
    fn new(delimiter: &[u8]) -> Self {
        let mut fallback = vec![0usize; delimiter.len()];
        let mut k = 0;
        for i in 1..delimiter.len() {
            while k > 0 && delimiter[i] != delimiter[k] {
                k = fallback[k - 1];
            }
            if delimiter[i] == delimiter[k] {
                k += 1;
            }
            fallback[i] = k;
        }
        Self {
            delimiter: delimiter.to_vec(),
            fallback,
            matched: 0,
        }
    }

    fn reset(&mut self) {
        self.matched = 0;
    }

    /// Feed one byte; returns true when the full delimiter has matched.
    fn push(&mut self, byte: u8) -> bool {
        while self.matched > 0 && byte != self.delimiter[self.matched] {
            self.matched = self.fallback[self.matched - 1];
        }
        if byte == self.delimiter[self.matched] {
            self.matched += 1;
        }
        if self.matched == self.delimiter.len() {
            self.matched = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_until_returns_prefix_including_delimiter() {
        let buffer = ByteStreamBuffer::default();
        buffer.append(&[0x41, 0x42, 0x43, 0x0D]);
        let out = buffer
            .read_until(&[0x0D], Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(out, vec![0x41, 0x42, 0x43, 0x0D]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_read_until_no_double_delivery() {
        let buffer = ByteStreamBuffer::default();
        buffer.append(b"first\nsecond\n");
        let first = buffer.read_until(b"\n", Duration::from_millis(100)).await.unwrap();
        assert_eq!(first, b"first\n");
        let second = buffer.read_until(b"\n", Duration::from_millis(100)).await.unwrap();
        assert_eq!(second, b"second\n");
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_read_until_waits_for_split_delimiter() {
        let buffer = std::sync::Arc::new(ByteStreamBuffer::default());
        buffer.append(b"half\r");
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                buffer.read_until(b"\r\n", Duration::from_secs(1)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.append(b"\nrest");
        let out = reader.await.unwrap().unwrap();
        assert_eq!(out, b"half\r\n");
        assert_eq!(buffer.read_all(), b"rest");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_until_timeout_leaves_buffer_intact() {
        let buffer = ByteStreamBuffer::default();
        buffer.append(b"no delimiter here");
        let err = buffer
            .read_until(b"\n", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BtError::ReadTimeout(_)));
        assert_eq!(buffer.read_all(), b"no delimiter here");
    }

    #[tokio::test]
    async fn test_read_until_overlapping_delimiter() {
        // First occurrence of AAB inside AAAB must be found.
        let buffer = ByteStreamBuffer::default();
        buffer.append(&[0xAA, 0xAA, 0xAA, 0xBB, 0x01]);
        let out = buffer
            .read_until(&[0xAA, 0xAA, 0xBB], Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(out, vec![0xAA, 0xAA, 0xAA, 0xBB]);
        assert_eq!(buffer.read_all(), vec![0x01]);
    }

    #[tokio::test]
    async fn test_empty_delimiter_rejected() {
        let buffer = ByteStreamBuffer::default();
        let err = buffer.read_until(&[], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, BtError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let buffer = std::sync::Arc::new(ByteStreamBuffer::default());
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.read_until(b"\n", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();
        let err = reader.await.unwrap().unwrap_err();
        assert!(matches!(err, BtError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_drain_allowed_after_close() {
        let buffer = ByteStreamBuffer::default();
        buffer.append(b"leftover");
        buffer.close();
        assert_eq!(buffer.read_all(), b"leftover");
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let buffer = ByteStreamBuffer::new(4);
        buffer.append(&[1, 2, 3, 4]);
        buffer.append(&[5, 6]);
        assert_eq!(buffer.read_all(), vec![3, 4, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_some_timeout_when_empty() {
        let buffer = ByteStreamBuffer::default();
        let err = buffer.read_some(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, BtError::ReadTimeout(_)));
    }

    #[tokio::test]
    async fn test_read_some_returns_buffered() {
        let buffer = ByteStreamBuffer::default();
        buffer.append(&[9, 8, 7]);
        let out = buffer.read_some(Duration::from_secs(1)).await.unwrap();
        assert_eq!(out, vec![9, 8, 7]);
    }
}
