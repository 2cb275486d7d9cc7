use std::io;

use memmap2::MmapMut;

/// Anonymous address range reserved for the heap. Pages are backed lazily by the
/// OS; `commit` and `decommit` advise the kernel about ranges becoming hot or
/// dead.
pub struct Mmap {
    _map: MmapMut,
    start: *mut u8,
    size: usize,
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

impl Mmap {
    pub fn new(size: usize) -> io::Result<Self> {
        let mut map = MmapMut::map_anon(size)?;
        let start = map.as_mut_ptr();
        Ok(Self {
            _map: map,
            start,
            size,
        })
    }

    pub fn start(&self) -> *mut u8 {
        self.start
    }

    pub fn end(&self) -> *mut u8 {
        unsafe { self.start.add(self.size) }
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    fn range(&self, offset: usize, size: usize) -> *mut u8 {
        assert!(offset + size <= self.size, "range outside of the reservation");
        unsafe { self.start.add(offset) }
    }

    /// Writes one byte per `stride` so the range is backed by physical memory.
    pub fn pretouch(&self, offset: usize, size: usize, stride: usize) {
        let page = self.range(offset, size);
        let mut at = 0;
        while at < size {
            unsafe {
                page.add(at).write_volatile(0);
            }
            at += stride;
        }
    }
}

#[cfg(unix)]
impl Mmap {
    pub fn commit(&self, offset: usize, size: usize) -> io::Result<()> {
        let page = self.range(offset, size);
        let res = unsafe { libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn decommit(&self, offset: usize, size: usize) -> io::Result<()> {
        let page = self.range(offset, size);
        let res = unsafe { libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(unix))]
impl Mmap {
    pub fn commit(&self, offset: usize, size: usize) -> io::Result<()> {
        self.range(offset, size);
        Ok(())
    }

    // Memory stays resident, the region is only accounted as uncommitted.
    pub fn decommit(&self, offset: usize, size: usize) -> io::Result<()> {
        self.range(offset, size);
        Ok(())
    }
}
