use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

/// Size of one pooled slab.
pub const SLAB_SIZE: usize = 128 * 1024;

// Free slabs retained per pool before excess slabs are dropped outright.
const MAX_FREE_SLABS: usize = 256;

/// A pool of fixed-size slabs backing [`Sgl`] buffers. Slabs released
/// by dropped SGLs are retained for reuse up to a bound; `free_spare`
/// drops the retained set under memory pressure.
pub struct MemPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl MemPool {
    pub fn new() -> Arc<MemPool> {
        Arc::new(MemPool {
            free: Mutex::new(Vec::new()),
        })
    }

    fn alloc_slab(&self) -> Vec<u8> {
        let mut free = self.free.lock().unwrap();
        free.pop().unwrap_or_else(|| Vec::with_capacity(SLAB_SIZE))
    }

    fn release(&self, mut slabs: Vec<Vec<u8>>) {
        let mut free = self.free.lock().unwrap();
        while free.len() < MAX_FREE_SLABS {
            let Some(mut slab) = slabs.pop() else {
                return;
            };
            slab.clear();
            free.push(slab);
        }
        // Remaining slabs fall out of scope and return to the allocator.
    }

    /// Drop all retained free slabs.
    pub fn free_spare(&self) {
        let mut free = self.free.lock().unwrap();
        let n = free.len();
        free.clear();
        free.shrink_to_fit();
        if n > 0 {
            tracing::debug!(slabs = n, "released spare slabs");
        }
    }

    pub fn free_slabs(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Allocate an SGL sized for an expected `len` bytes of content.
    pub fn alloc_sgl(self: &Arc<Self>, len: usize) -> Sgl {
        let mut slabs = Vec::with_capacity(len.div_ceil(SLAB_SIZE).max(1));
        slabs.push(self.alloc_slab());
        Sgl {
            pool: self.clone(),
            slabs,
            len: 0,
        }
    }
}

/// Scatter-gather list: an append-only byte stream over pooled slabs.
pub struct Sgl {
    pool: Arc<MemPool>,
    slabs: Vec<Vec<u8>>,
    len: usize,
}

impl Sgl {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of bytes of slab capacity held by this SGL.
    pub fn cap(&self) -> usize {
        self.slabs.len() * SLAB_SIZE
    }

    pub fn reader(self: &Arc<Self>) -> SglReader {
        SglReader {
            sgl: self.clone(),
            pos: 0,
        }
    }

    fn slab_at(&self, pos: usize) -> (&[u8], usize) {
        let (idx, off) = (pos / SLAB_SIZE, pos % SLAB_SIZE);
        (&self.slabs[idx], off)
    }
}

impl Write for Sgl {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            let last = self.slabs.last_mut().unwrap();
            if last.len() == SLAB_SIZE {
                let slab = self.pool.alloc_slab();
                self.slabs.push(slab);
                continue;
            }
            let room = SLAB_SIZE - last.len();
            let n = room.min(buf.len() - written);
            last.extend_from_slice(&buf[written..written + n]);
            written += n;
        }
        self.len += written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Sgl {
    fn drop(&mut self) {
        let slabs = std::mem::take(&mut self.slabs);
        self.pool.release(slabs);
    }
}

/// Cheap positioned reader over a shared SGL.
pub struct SglReader {
    sgl: Arc<Sgl>,
    pos: usize,
}

impl Read for SglReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.sgl.len {
            return Ok(0);
        }
        let (slab, off) = self.sgl.slab_at(self.pos);
        let avail = (slab.len() - off).min(self.sgl.len - self.pos);
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&slab[off..off + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Seek for SglReader {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        let next = match from {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.sgl.len as i64 + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of SGL",
            ));
        }
        self.pos = next as usize;
        Ok(self.pos as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_read_across_slabs() {
        let pool = MemPool::new();
        let mut sgl = pool.alloc_sgl(SLAB_SIZE * 2);

        let chunk: Vec<u8> = (0..=255u8).cycle().take(SLAB_SIZE + 777).collect();
        sgl.write_all(&chunk).unwrap();
        assert_eq!(sgl.len(), chunk.len());
        assert_eq!(sgl.slabs.len(), 2);

        let sgl = Arc::new(sgl);
        let mut out = Vec::new();
        sgl.reader().read_to_end(&mut out).unwrap();
        assert_eq!(out, chunk);
    }

    #[test]
    fn reader_seek() {
        let pool = MemPool::new();
        let mut sgl = pool.alloc_sgl(64);
        sgl.write_all(b"hello, world").unwrap();
        let sgl = Arc::new(sgl);

        let mut r = sgl.reader();
        r.seek(SeekFrom::Start(7)).unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "world");
    }

    #[test]
    fn slabs_return_to_pool() {
        let pool = MemPool::new();
        {
            let mut sgl = pool.alloc_sgl(SLAB_SIZE * 3);
            sgl.write_all(&vec![0u8; SLAB_SIZE * 3]).unwrap();
        }
        assert_eq!(pool.free_slabs(), 3);
        pool.free_spare();
        assert_eq!(pool.free_slabs(), 0);
    }
}
