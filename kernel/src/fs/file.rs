//! Files as the memory manager sees them: positional byte access, a length and a deny-write
//! flag set while the file is being executed.

use crate::sync::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub trait File: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the number of bytes read,
    /// which is short at end of file.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize;

    /// Writes up to `buf.len()` bytes starting at `offset`. Returns the number of bytes
    /// written; writes never extend the file.
    fn write_at(&self, offset: usize, buf: &[u8]) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_deny_write(&self) -> bool;
}

pub type FileHandle = Arc<dyn File>;

/// A fixed-size file held in kernel memory.
#[derive(Debug, Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    deny_write: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            ..Self::default()
        }
    }

    pub fn deny_write(&self) {
        self.deny_write.store(true, Ordering::Release);
    }

    pub fn allow_write(&self) {
        self.deny_write.store(false, Ordering::Release);
    }

    /// Number of `read_at` calls served.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `write_at` calls served.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl File for MemFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.lock();
        let Some(available) = data.len().checked_sub(offset) else {
            return 0;
        };
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        if self.is_deny_write() {
            return 0;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.lock();
        let Some(available) = data.len().checked_sub(offset) else {
            return 0;
        };
        let n = buf.len().min(available);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn is_deny_write(&self) -> bool {
        self.deny_write.load(Ordering::Acquire)
    }
}
