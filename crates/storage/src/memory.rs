//! Sparse in-memory block device
//!
//! Backs "block device" layers in a session. Data is kept in fixed-size
//! pages inside an `FxHashMap`, so a 100 MiB image that only ever sees a few
//! kilobytes of writes costs a few kilobytes of memory.
//!
//! Fault injection (`fail_writes_in` / `fail_reads_in`) lets tests make a
//! specific byte range return `io::Error`, which is how merge-job failure
//! paths are exercised.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use livemerge_core::{BlockDevice, BlockRange, LayerLocation};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

const PAGE_SIZE: u64 = 4096;

/// In-memory device with sparse page storage
#[derive(Debug)]
pub struct MemoryDevice {
    location: LayerLocation,
    pages: RwLock<FxHashMap<u64, Box<[u8]>>>,
    len: AtomicU64,
    fail_writes: Mutex<Option<BlockRange>>,
    fail_reads: Mutex<Option<BlockRange>>,
}

impl MemoryDevice {
    /// Create a zero-filled device of `len` bytes
    pub fn new(location: LayerLocation, len: u64) -> Self {
        Self {
            location,
            pages: RwLock::new(FxHashMap::default()),
            len: AtomicU64::new(len),
            fail_writes: Mutex::new(None),
            fail_reads: Mutex::new(None),
        }
    }

    /// Make writes overlapping `range` fail until cleared
    pub fn fail_writes_in(&self, range: Option<BlockRange>) {
        *self.fail_writes.lock() = range;
    }

    /// Make reads overlapping `range` fail until cleared
    pub fn fail_reads_in(&self, range: Option<BlockRange>) {
        *self.fail_reads.lock() = range;
    }

    /// Number of pages holding data
    pub fn resident_pages(&self) -> usize {
        self.pages.read().len()
    }

    fn check_fault(slot: &Mutex<Option<BlockRange>>, offset: u64, len: usize) -> io::Result<()> {
        if let Some(range) = *slot.lock() {
            let request = BlockRange::at(offset, len as u64);
            if !request.intersect(&range).is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("injected fault in {}", range),
                ));
            }
        }
        Ok(())
    }
}

impl BlockDevice for MemoryDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        Self::check_fault(&self.fail_reads, offset, buf.len())?;
        let len = self.len.load(Ordering::Acquire);
        let pages = self.pages.read();
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page = pos / PAGE_SIZE;
            let in_page = (pos % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - in_page).min(buf.len() - done);
            let out = &mut buf[done..done + n];
            match pages.get(&page) {
                Some(data) if pos < len => {
                    out.copy_from_slice(&data[in_page..in_page + n]);
                    // Bytes past the device end read as zero even if a page
                    // still holds stale data from before a shrink.
                    let valid = len.saturating_sub(pos).min(n as u64) as usize;
                    out[valid..].fill(0);
                }
                _ => out.fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        Self::check_fault(&self.fail_writes, offset, data.len())?;
        let mut pages = self.pages.write();
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let page = pos / PAGE_SIZE;
            let in_page = (pos % PAGE_SIZE) as usize;
            let n = (PAGE_SIZE as usize - in_page).min(data.len() - done);
            let slot = pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            slot[in_page..in_page + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        let end = offset + data.len() as u64;
        self.len.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    fn resize(&self, new_len: u64) -> io::Result<()> {
        let mut pages = self.pages.write();
        let keep = new_len.div_ceil(PAGE_SIZE);
        pages.retain(|page, _| *page < keep);
        if let Some(last) = pages.get_mut(&(new_len / PAGE_SIZE)) {
            last[(new_len % PAGE_SIZE) as usize..].fill(0);
        }
        self.len.store(new_len, Ordering::Release);
        Ok(())
    }

    fn location(&self) -> &LayerLocation {
        &self.location
    }
}
