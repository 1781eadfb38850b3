//! Fixed-count, MTU-sized buffers and the queues they cycle through.
//!
//! Buffers are allocated once when a connection starts listening and are never freed during
//! steady state. At any point in time a buffer is owned by exactly one place: the free pool,
//! the protocol task (reorder deque / write deque), or the application. Ownership moves by
//! value through [`BufferQueue`]s; there is no reference counting on the data path.

use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Mutex;
use std::time::Duration;

use bytes::buf::UninitSlice;
use tokio::sync::Notify;
use tokio::time::timeout;

/// A fixed-capacity, pre-allocated buffer implementing `BufMut` for the `bytes` ecosystem.
#[derive(Eq)]
pub struct FixedBuf {
    buf: Vec<u8>,
    len: usize,
}

impl FixedBuf {
    pub fn new(capacity: usize) -> FixedBuf {
        // buffers are reused aggressively, so eager zero-initialization is paid only once
        FixedBuf {
            buf: vec![0; capacity],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Makes the entire underlying buffer addressable through `as_mut`, e.g. as a receive
    /// target for a socket read.
    pub fn maximize_len(&mut self) {
        self.len = self.capacity();
    }

    /// Shortens the addressable region, e.g. to the number of bytes a socket read produced.
    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.capacity());
        self.len = len;
    }

    /// Convenience constructor for test code; capacity is taken from the slice.
    #[cfg(test)]
    pub fn from_slice(data: &[u8]) -> FixedBuf {
        let mut result = FixedBuf::new(data.len());
        bytes::BufMut::put_slice(&mut result, data);
        result
    }
}

impl PartialEq for FixedBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for FixedBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<[u8]> for FixedBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for FixedBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for FixedBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}

/// Allocates the fixed buffer complement of one connection.
pub fn allocate_buffers(count: u16, capacity: usize) -> Vec<FixedBuf> {
    (0..count).map(|_| FixedBuf::new(capacity)).collect()
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PopError {
    /// The queue was closed; pending items were drained first unless the close was an abort.
    Closed,
    /// No item arrived within the requested time.
    Timeout,
}

/// A buffer hand-over queue between the protocol task and the application.
///
/// Pushing never blocks. `try_pop` is the non-blocking side used by the protocol task; `pop`
/// awaits the next item and is used by the application. Closing wakes all waiters: a regular
/// `close` lets poppers drain remaining items before they observe [`PopError::Closed`], an
/// `abort` makes them observe it immediately.
pub struct BufferQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

struct QueueState {
    items: VecDeque<FixedBuf>,
    closed: bool,
    aborted: bool,
}

impl BufferQueue {
    pub fn new() -> BufferQueue {
        BufferQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
                aborted: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn with_buffers(buffers: Vec<FixedBuf>) -> BufferQueue {
        let queue = BufferQueue::new();
        {
            let mut state = queue.state.lock().unwrap();
            state.items.extend(buffers);
        }
        queue
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Appends a buffer. Buffers pushed after `close` are unreachable and silently dropped.
    pub fn push(&self, buf: FixedBuf) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.items.push_back(buf);
        }
        self.notify.notify_waiters();
    }

    pub fn try_pop(&self) -> Option<FixedBuf> {
        self.state.lock().unwrap().items.pop_front()
    }

    /// Pops the front buffer if `predicate` approves it. Used for writer-side coalescing,
    /// where the decision needs a look at the pending datagram before taking it.
    pub fn try_pop_if(&self, predicate: impl FnOnce(&FixedBuf) -> bool) -> Option<FixedBuf> {
        let mut state = self.state.lock().unwrap();
        match state.items.front() {
            Some(front) if predicate(front) => state.items.pop_front(),
            _ => None,
        }
    }

    /// Awaits the next buffer, honoring an optional deadline.
    pub async fn pop(&self, deadline: Option<Duration>) -> Result<FixedBuf, PopError> {
        match deadline {
            None => self.pop_inner().await,
            Some(limit) => match timeout(limit, self.pop_inner()).await {
                Ok(result) => result,
                Err(_) => Err(PopError::Timeout),
            },
        }
    }

    async fn pop_inner(&self) -> Result<FixedBuf, PopError> {
        loop {
            // register with the notifier before inspecting state, so a notification between
            // the check and the await is not lost
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().unwrap();
                if state.aborted {
                    return Err(PopError::Closed);
                }
                if let Some(buf) = state.items.pop_front() {
                    return Ok(buf);
                }
                if state.closed {
                    return Err(PopError::Closed);
                }
            }
            notified.await;
        }
    }

    /// Awaits the queue holding at least `count` items - used by `finish` to wait until all
    /// write buffers have returned to the free pool.
    pub async fn wait_len(&self, count: usize) -> Result<(), PopError> {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let state = self.state.lock().unwrap();
                if state.items.len() >= count {
                    return Ok(());
                }
                if state.closed || state.aborted {
                    return Err(PopError::Closed);
                }
            }
            notified.await;
        }
    }

    /// Closes the queue; poppers drain remaining items and then observe `Closed`.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    /// Closes the queue and makes poppers observe `Closed` immediately, remaining items
    /// notwithstanding.
    pub fn abort(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.aborted = true;
        }
        self.notify.notify_waiters();
    }
}

impl Default for BufferQueue {
    fn default() -> Self {
        BufferQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::sync::Arc;

    #[test]
    fn test_fixed_buf_cycle() {
        let mut buf = FixedBuf::new(8);
        assert_eq!(buf.capacity(), 8);
        assert!(buf.is_empty());

        buf.put_slice(&[1, 2, 3]);
        assert_eq!(buf.as_ref(), &[1, 2, 3]);
        assert_eq!(buf.len(), 3);

        buf.maximize_len();
        assert_eq!(buf.len(), 8);
        buf.truncate(2);
        assert_eq!(buf.as_ref(), &[1, 2]);

        buf.clear();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_pop_returns_pushed_buffers_in_order() {
        let queue = BufferQueue::new();
        queue.push(FixedBuf::from_slice(&[1]));
        queue.push(FixedBuf::from_slice(&[2]));

        assert_eq!(queue.pop(None).await.unwrap().as_ref(), &[1]);
        assert_eq!(queue.pop(None).await.unwrap().as_ref(), &[2]);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(BufferQueue::new());

        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(None).await })
        };
        tokio::task::yield_now().await;
        queue.push(FixedBuf::from_slice(&[7]));

        assert_eq!(popper.await.unwrap().unwrap().as_ref(), &[7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_timeout() {
        let queue = BufferQueue::new();
        let result = queue.pop(Some(Duration::from_millis(10))).await;
        assert_eq!(result.unwrap_err(), PopError::Timeout);
    }

    #[tokio::test]
    async fn test_close_drains_before_sentinel() {
        let queue = BufferQueue::new();
        queue.push(FixedBuf::from_slice(&[1]));
        queue.close();

        assert_eq!(queue.pop(None).await.unwrap().as_ref(), &[1]);
        assert_eq!(queue.pop(None).await.unwrap_err(), PopError::Closed);
        // all subsequent poppers observe the sentinel as well
        assert_eq!(queue.pop(None).await.unwrap_err(), PopError::Closed);
    }

    #[tokio::test]
    async fn test_abort_preempts_pending_items() {
        let queue = BufferQueue::new();
        queue.push(FixedBuf::from_slice(&[1]));
        queue.abort();
        assert_eq!(queue.pop(None).await.unwrap_err(), PopError::Closed);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_poppers() {
        let queue = Arc::new(BufferQueue::new());
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(None).await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(popper.await.unwrap().unwrap_err(), PopError::Closed);
    }

    #[test]
    fn test_try_pop_if() {
        let queue = BufferQueue::new();
        queue.push(FixedBuf::from_slice(&[1, 2, 3]));

        assert!(queue.try_pop_if(|buf| buf.len() > 5).is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.try_pop_if(|buf| buf.len() == 3).is_some());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_wait_len() {
        let queue = Arc::new(BufferQueue::new());
        queue.push(FixedBuf::new(4));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_len(2).await })
        };
        tokio::task::yield_now().await;
        queue.push(FixedBuf::new(4));

        waiter.await.unwrap().unwrap();
    }
}
