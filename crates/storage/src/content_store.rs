use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::format::PayloadFormat;

const INITIAL_CAPACITY: usize = 4 * 1024;

/// Location of one payload inside the store buffer.
///
/// `start`/`len` cover the payload bytes only; the format delimiters written
/// around them are not part of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentEntry {
    pub start: usize,
    pub len: usize,
    pub format: PayloadFormat,
}

struct Inner {
    buffer: Vec<u8>,
    entries: Vec<ContentEntry>,
}

impl Inner {
    /// Grow by doubling, or to an exact fit when doubling is not enough.
    fn ensure_room(&mut self, needed: usize) {
        let used = self.buffer.len();
        let capacity = self.buffer.capacity();
        if capacity - used >= needed {
            return;
        }

        let doubled = capacity.max(1) * 2;
        let target = if doubled - used >= needed {
            doubled
        } else {
            used + needed
        };
        self.buffer.reserve_exact(target - used);
        debug!(
            "Content store grew from {} to {} bytes",
            capacity,
            self.buffer.capacity()
        );
    }
}

/// Append-only store for received payloads, backed by one growable buffer.
///
/// Every payload is written framed by its format's delimiters so the buffer
/// can also be scanned by delimiter (see [`ContentStore::search`]).
pub struct ContentStore {
    inner: Arc<Mutex<Inner>>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffer: Vec::with_capacity(capacity),
                entries: Vec::new(),
            })),
        }
    }

    /// Append a payload and return its entry index.
    pub fn append(&self, format: PayloadFormat, payload: &[u8]) -> usize {
        let mut inner = self.inner.lock();
        let framed = format.open().len() + payload.len() + format.close().len();
        inner.ensure_room(framed);

        inner.buffer.extend_from_slice(format.open().as_bytes());
        let start = inner.buffer.len();
        inner.buffer.extend_from_slice(payload);
        inner.buffer.extend_from_slice(format.close().as_bytes());

        inner.entries.push(ContentEntry {
            start,
            len: payload.len(),
            format,
        });
        inner.entries.len() - 1
    }

    /// Copy of the payload recorded at `index`.
    pub fn read_by_index(&self, index: usize) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let entry = inner.entries.get(index).ok_or(StoreError::OutOfRange {
            index,
            len: inner.entries.len(),
        })?;
        Ok(inner.buffer[entry.start..entry.start + entry.len].to_vec())
    }

    /// Copy of the first payload recorded with `format`.
    pub fn read_by_format(&self, format: PayloadFormat) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let entry = inner
            .entries
            .iter()
            .find(|e| e.format == format)
            .ok_or_else(|| StoreError::NotFound(format!("no {} entry", format)))?;
        Ok(inner.buffer[entry.start..entry.start + entry.len].to_vec())
    }

    /// Scan the raw buffer for the first `format` delimiter pair and return
    /// the enclosed bytes.
    pub fn search(&self, format: PayloadFormat) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let open = format.open().as_bytes();
        let close = format.close().as_bytes();

        let begin = find_subslice(&inner.buffer, open)
            .ok_or_else(|| StoreError::NotFound(format!("opening {} delimiter", format)))?
            + open.len();
        let end = find_subslice(&inner.buffer[begin..], close)
            .ok_or_else(|| StoreError::NotFound(format!("closing {} delimiter", format)))?
            + begin;

        Ok(inner.buffer[begin..end].to_vec())
    }

    pub fn entries(&self) -> Vec<ContentEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently written, delimiters included.
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().buffer.capacity()
    }

    /// Drop every entry and release the buffer.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.buffer = Vec::with_capacity(INITIAL_CAPACITY);
        inner.entries.clear();
    }
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ContentStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_back_in_append_order() {
        let store = ContentStore::new();
        let payloads: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; (i as usize + 1) * 3]).collect();

        for (i, p) in payloads.iter().enumerate() {
            assert_eq!(store.append(PayloadFormat::File, p), i);
        }

        for (i, p) in payloads.iter().enumerate() {
            assert_eq!(&store.read_by_index(i).unwrap(), p);
        }
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_read_past_end_fails() {
        let store = ContentStore::new();
        store.append(PayloadFormat::File, b"one");
        store.append(PayloadFormat::Task, b"two");

        assert_eq!(
            store.read_by_index(2),
            Err(StoreError::OutOfRange { index: 2, len: 2 })
        );
    }

    #[test]
    fn test_entries_never_overlap() {
        let store = ContentStore::with_capacity(8);
        for i in 0..20u8 {
            store.append(PayloadFormat::File, &[i; 7]);
        }

        let entries = store.entries();
        for pair in entries.windows(2) {
            assert!(pair[0].start + pair[0].len <= pair[1].start);
        }
    }

    #[test]
    fn test_growth_keeps_payloads_readable() {
        let store = ContentStore::with_capacity(16);
        // 17 framed bytes
        store.append(PayloadFormat::File, b"abcd");
        assert!(store.capacity() >= 17);

        store.append(PayloadFormat::File, b"");
        assert_eq!(store.used_bytes(), 30);

        // far larger than double the capacity
        let big = vec![7u8; 1000];
        store.append(PayloadFormat::File, &big);
        assert!(store.capacity() >= store.used_bytes());
        assert_eq!(store.read_by_index(0).unwrap(), b"abcd");
        assert_eq!(store.read_by_index(1).unwrap(), b"");
        assert_eq!(store.read_by_index(2).unwrap(), big);
    }

    #[test]
    fn test_read_by_format_returns_first_match() {
        let store = ContentStore::new();
        store.append(PayloadFormat::File, b"first file");
        store.append(PayloadFormat::Task, b"task body");
        store.append(PayloadFormat::File, b"second file");

        assert_eq!(store.read_by_format(PayloadFormat::Task).unwrap(), b"task body");
        assert_eq!(store.read_by_format(PayloadFormat::File).unwrap(), b"first file");
    }

    #[test]
    fn test_read_by_format_missing() {
        let store = ContentStore::new();
        store.append(PayloadFormat::File, b"x");
        assert!(matches!(
            store.read_by_format(PayloadFormat::Task),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_search_scans_delimiters() {
        let store = ContentStore::new();
        store.append(PayloadFormat::File, b"report");
        store.append(PayloadFormat::Task, b"ping");

        assert_eq!(store.search(PayloadFormat::Task).unwrap(), b"ping");
        assert_eq!(store.search(PayloadFormat::File).unwrap(), b"report");
    }

    #[test]
    fn test_search_on_empty_store_fails() {
        let store = ContentStore::new();
        assert!(matches!(
            store.search(PayloadFormat::File),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_reset_clears_entries() {
        let store = ContentStore::new();
        store.append(PayloadFormat::File, b"data");
        store.reset();

        assert!(store.is_empty());
        assert_eq!(store.used_bytes(), 0);
        assert!(store.read_by_index(0).is_err());
    }
}
