use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::chunk::{Chunk, Origin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Tx,
    Rx,
    Combined,
}

impl ViewKind {
    pub const ALL: [ViewKind; 3] = [ViewKind::Tx, ViewKind::Rx, ViewKind::Combined];
}

impl From<Origin> for ViewKind {
    fn from(origin: Origin) -> Self {
        match origin {
            Origin::Tx => ViewKind::Tx,
            Origin::Rx => ViewKind::Rx,
        }
    }
}

/// Which views a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub tx: bool,
    pub rx: bool,
    pub combined: bool,
}

/// Pure demultiplexing by origin. Every chunk lands in the combined view.
pub fn classify(chunk: &Chunk) -> Classification {
    Classification {
        tx: chunk.origin() == Origin::Tx,
        rx: chunk.origin() == Origin::Rx,
        combined: true,
    }
}

/// Absolute position in a view, counted from the first chunk ever appended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(u64);

impl Cursor {
    pub const START: Cursor = Cursor(0);

    pub fn position(self) -> u64 {
        self.0
    }
}

/// Chunks returned from one cursor read.
#[derive(Debug, Clone)]
pub struct ViewBatch {
    pub chunks: Vec<Chunk>,
    /// Where the next read should resume.
    pub next: Cursor,
    /// Chunks between the requested cursor and the oldest retained one.
    pub skipped: u64,
}

struct ViewBuffer {
    base: u64,
    chunks: VecDeque<Chunk>,
}

/// Append-only record of one direction (or both, for the combined view).
pub struct StreamView {
    retention: usize,
    buffer: RwLock<ViewBuffer>,
}

impl StreamView {
    fn new(retention: usize) -> Self {
        Self {
            retention,
            buffer: RwLock::new(ViewBuffer {
                base: 0,
                chunks: VecDeque::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ViewBuffer> {
        self.buffer.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ViewBuffer> {
        self.buffer.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, chunk: Chunk) {
        let mut buffer = self.write();
        buffer.chunks.push_back(chunk);
        if self.retention > 0 {
            while buffer.chunks.len() > self.retention {
                buffer.chunks.pop_front();
                buffer.base += 1;
            }
        }
    }

    fn clear(&self) {
        let mut buffer = self.write();
        buffer.base += buffer.chunks.len() as u64;
        buffer.chunks.clear();
    }

    /// Chunks currently retained.
    pub fn len(&self) -> usize {
        self.read().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cursor just past the newest chunk.
    pub fn end(&self) -> Cursor {
        let buffer = self.read();
        Cursor(buffer.base + buffer.chunks.len() as u64)
    }

    /// Up to `limit` chunks starting at `cursor`.
    pub fn read_since(&self, cursor: Cursor, limit: usize) -> ViewBatch {
        let buffer = self.read();
        let start = cursor.0.max(buffer.base);
        let skipped = start - cursor.0;
        let offset = (start - buffer.base) as usize;
        let chunks: Vec<Chunk> = buffer
            .chunks
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        let next = Cursor(start + chunks.len() as u64);
        ViewBatch {
            chunks,
            next,
            skipped,
        }
    }

    pub fn snapshot(&self) -> Vec<Chunk> {
        self.read().chunks.iter().cloned().collect()
    }

    /// Lazily walks the view from `cursor`, picking up chunks appended while iterating.
    pub fn iter_since(&self, cursor: Cursor) -> ViewIter<'_> {
        ViewIter { view: self, cursor }
    }
}

pub struct ViewIter<'a> {
    view: &'a StreamView,
    cursor: Cursor,
}

impl ViewIter<'_> {
    /// Position to hand back to `iter_since` to resume later.
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }
}

impl Iterator for ViewIter<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let mut batch = self.view.read_since(self.cursor, 1);
        self.cursor = batch.next;
        batch.chunks.pop()
    }
}

/// The Tx, Rx and Combined views fed by the single bus consumer.
pub struct StreamViews {
    tx: StreamView,
    rx: StreamView,
    combined: StreamView,
}

impl StreamViews {
    pub fn new(retention: usize) -> Self {
        Self {
            tx: StreamView::new(retention),
            rx: StreamView::new(retention),
            combined: StreamView::new(retention),
        }
    }

    /// Appends the chunk to every view it classifies into, boundaries untouched.
    pub fn append(&self, chunk: &Chunk) -> Classification {
        let class = classify(chunk);
        if class.tx {
            self.tx.append(chunk.clone());
        }
        if class.rx {
            self.rx.append(chunk.clone());
        }
        self.combined.append(chunk.clone());
        class
    }

    pub fn view(&self, kind: ViewKind) -> &StreamView {
        match kind {
            ViewKind::Tx => &self.tx,
            ViewKind::Rx => &self.rx,
            ViewKind::Combined => &self.combined,
        }
    }

    pub fn clear(&self) {
        for kind in ViewKind::ALL {
            self.view(kind).clear();
        }
    }
}
