use std::sync::{Arc, Mutex};

use bytes::Bytes;

/// A byte region shared between stage workers and, through the shared-memory
/// allocator, between local ranks. Accessors take the region lock; callers
/// must not nest accessors on two regions (snapshot the source instead).
#[derive(Clone)]
pub struct SharedRegion {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedRegion {
    pub fn new(len: usize) -> Self {
        SharedRegion {
            inner: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_at(&self, offset: usize, src: &[u8]) {
        let mut data = self.inner.lock().unwrap();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        let data = self.inner.lock().unwrap();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    /// Owned copy of a sub-range, for hand-off to the transport.
    pub fn snapshot(&self, offset: usize, len: usize) -> Bytes {
        let data = self.inner.lock().unwrap();
        Bytes::copy_from_slice(&data[offset..offset + len])
    }

    pub fn with_mut<R>(&self, offset: usize, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.inner.lock().unwrap();
        f(&mut data[offset..offset + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let region = SharedRegion::new(16);
        region.write_at(4, &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        region.read_at(4, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(region.snapshot(5, 2).as_ref(), &[2, 3]);
    }

    #[test]
    fn clones_alias_the_same_storage() {
        let region = SharedRegion::new(8);
        let alias = region.clone();
        alias.write_at(0, &[9; 8]);
        let mut out = [0u8; 8];
        region.read_at(0, &mut out);
        assert_eq!(out, [9; 8]);
    }
}
