//! A bounded circular buffer of metrics with a borrow/commit/rollback
//! protocol: [`Buffer::batch`] lends out a window of metrics, which the
//! caller must later resolve with [`Buffer::accept`] (delivered) or
//! [`Buffer::reject`] (retry later).
//!
//! This is the part of the pipeline with the subtlest invariants: see the
//! module tests for the literal scenarios this implementation is checked
//! against.

use std::sync::Mutex;

use crate::metric::Metric;

struct Inner {
    buf: Vec<Option<Metric>>,
    /// Index of the first/oldest metric.
    first: usize,
    /// One past the index of the last/newest metric.
    last: usize,
    /// Number of metrics currently held (excluding any lent-out batch).
    size: usize,
    cap: usize,

    /// Index of the first metric in the currently lent-out batch, if any.
    batch_first: usize,
    /// Number of metrics currently lent out in a batch.
    batch_size: usize,
}

impl Inner {
    fn length(&self) -> usize {
        (self.size + self.batch_size).min(self.cap)
    }

    fn next(&self, index: usize) -> usize {
        let i = index + 1;
        if i == self.cap {
            0
        } else {
            i
        }
    }

    fn prev(&self, index: usize) -> usize {
        if index == 0 {
            self.cap - 1
        } else {
            index - 1
        }
    }

    fn nextby(&self, index: usize, count: usize) -> usize {
        (index + count) % self.cap
    }

    /// Distance from `begin` to `end` going forward, with wrap-around.
    fn dist(&self, begin: usize, end: usize) -> usize {
        if begin <= end {
            end - begin
        } else {
            self.cap - begin + end
        }
    }

    fn add_one(&mut self, m: Metric) -> usize {
        let mut dropped = 0;
        if self.size == self.cap {
            if let Some(old) = self.buf[self.last].take() {
                old.reject();
            }
            dropped += 1;

            if self.last == self.batch_first && self.batch_size > 0 {
                self.batch_size -= 1;
                self.batch_first = self.next(self.batch_first);
            }
        }

        self.buf[self.last] = Some(m);
        self.last = self.next(self.last);

        if self.size == self.cap {
            self.first = self.next(self.first);
        }

        self.size = (self.size + 1).min(self.cap);
        dropped
    }

    fn reset_batch(&mut self) {
        self.batch_first = 0;
        self.batch_size = 0;
    }
}

/// A mutex-protected circular buffer of bounded capacity.
///
/// Safe to share between a producer (adding metrics) and a consumer
/// (batching/accepting/rejecting them), though ordering guarantees only
/// hold relative to the serialization the mutex provides.
pub struct Buffer {
    inner: Mutex<Inner>,
}

impl Buffer {
    /// Creates an empty buffer. Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be positive");
        Buffer {
            inner: Mutex::new(Inner {
                buf: (0..capacity).map(|_| None).collect(),
                first: 0,
                last: 0,
                size: 0,
                cap: capacity,
                batch_first: 0,
                batch_size: 0,
            }),
        }
    }

    /// Number of metrics currently held, including any lent-out batch.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().cap
    }

    /// Appends metrics in order. Returns the number of metrics dropped due
    /// to overflow (the oldest metrics are dropped first).
    pub fn add<I: IntoIterator<Item = Metric>>(&self, metrics: I) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut dropped = 0;
        for m in metrics {
            dropped += inner.add_one(m);
        }
        dropped
    }

    /// Lends out up to `batch_size` of the most recently added metrics,
    /// ordered newest-first. The caller must resolve the loan with
    /// [`accept`](Self::accept) or [`reject`](Self::reject).
    pub fn batch(&self, batch_size: usize) -> Vec<Metric> {
        let mut inner = self.inner.lock().unwrap();
        let out_len = inner.size.min(batch_size);
        if out_len == 0 {
            return Vec::new();
        }

        inner.batch_first = (inner.cap + inner.last - out_len) % inner.cap;
        inner.batch_size = out_len;

        let mut out: Vec<Option<Metric>> = (0..out_len).map(|_| None).collect();
        let mut idx = inner.batch_first;
        for i in 0..out_len {
            out[out_len - 1 - i] = inner.buf[idx].take();
            idx = inner.next(idx);
        }

        inner.last = inner.batch_first;
        inner.size -= out_len;

        out.into_iter()
            .map(|m| m.expect("lent batch slot must be occupied"))
            .collect()
    }

    /// Marks a batch obtained from [`batch`](Self::batch) as durably
    /// delivered.
    pub fn accept(&self, batch: Vec<Metric>) {
        let mut inner = self.inner.lock().unwrap();
        for m in &batch {
            m.accept();
        }
        inner.reset_batch();
    }

    /// Returns an unsent batch obtained from [`batch`](Self::batch) back
    /// into the buffer, preferring to evict the oldest metrics still
    /// present over the ones being restored.
    pub fn reject(&self, batch: Vec<Metric>) {
        let mut inner = self.inner.lock().unwrap();
        if batch.is_empty() {
            return;
        }

        let older = inner.dist(inner.first, inner.batch_first);
        let free = inner.cap - inner.size;
        let restore = batch.len().min(free + older);

        let rb = inner.batch_first;
        let mut rp = inner.last;
        let mut re = inner.nextby(rp, restore);
        inner.last = re;

        while rb != rp && rp != re {
            rp = inner.prev(rp);
            re = inner.prev(re);

            if let Some(old) = inner.buf[re].take() {
                old.reject();
                inner.first = inner.next(inner.first);
            }
            inner.buf[re] = inner.buf[rp].take();
        }

        for (i, m) in batch.into_iter().enumerate() {
            if i < restore {
                re = inner.prev(re);
                inner.buf[re] = Some(m);
                inner.size = (inner.size + 1).min(inner.cap);
            } else {
                m.reject();
            }
        }

        inner.reset_batch();
    }
}
