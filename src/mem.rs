// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Narrow interface to the GPU buffer-object layer.
//!
//! The real allocator (drm_tegra_bo and friends, including its mmap and
//! dma-buf plumbing) lives outside this crate. Everything here consumes
//! buffers through `BufferObject`/`BufferAllocator`, which is also what lets
//! the tests run against plain in-memory buffers.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::error::Result;
use crate::error::VdpError;
use crate::sync::Mutex;

/// A GPU-visible memory allocation.
pub trait BufferObject: Send + Sync {
    /// Allocation size in bytes.
    fn size(&self) -> u32;

    /// Copies `data` into the buffer at `offset`.
    fn write(&self, offset: u32, data: &[u8]) -> Result<()>;

    /// Copies buffer contents at `offset` into `data`.
    fn read(&self, offset: u32, data: &mut [u8]) -> Result<()>;

    /// The dma-buf file descriptor handed to the decode engine. The
    /// descriptor stays owned by the buffer object.
    fn export_fd(&self) -> Result<RawFd>;
}

pub type BoRef = Arc<dyn BufferObject>;

/// Allocates `BufferObject`s.
pub trait BufferAllocator: Send + Sync {
    fn alloc(&self, size: u32) -> Result<BoRef>;

    /// Minimum allocation granularity negotiated with the kernel driver.
    fn granularity(&self) -> u32 {
        0x1000
    }
}

pub fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Size of the shared bitstream allocation. Bitstreams that fit are decoded
/// out of one long-lived buffer instead of a per-picture allocation.
pub const BITSTREAM_POOL_SIZE: u32 = 512 * 1024;

/// A lazily-created shared buffer for small bitstreams, with fallback to
/// fresh allocations for oversized ones.
pub struct BitstreamPool {
    allocator: Arc<dyn BufferAllocator>,
    shared: Mutex<Option<BoRef>>,
}

impl BitstreamPool {
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        BitstreamPool {
            allocator,
            shared: Mutex::new(None),
        }
    }

    /// Returns a buffer of at least `size` bytes: the shared pool allocation
    /// when the padded size fits, a fresh granularity-aligned buffer
    /// otherwise.
    pub fn acquire(&self, size: u32) -> Result<BoRef> {
        if size <= BITSTREAM_POOL_SIZE {
            let mut shared = self.shared.lock();
            if shared.is_none() {
                *shared = Some(self.allocator.alloc(BITSTREAM_POOL_SIZE)?);
            }
            // Unwrap checked just above.
            return shared.clone().ok_or(VdpError::Resources);
        }
        self.allocator
            .alloc(align_up(size, self.allocator.granularity()))
    }
}

/// In-memory fakes standing in for the DRM buffer-object layer.
///
/// Public so integration tests can build a full device with no hardware.
pub mod fake {
    use super::*;

    pub struct FakeBo {
        data: Mutex<Vec<u8>>,
        fd: RawFd,
    }

    impl BufferObject for FakeBo {
        fn size(&self) -> u32 {
            self.data.lock().len() as u32
        }

        fn write(&self, offset: u32, data: &[u8]) -> Result<()> {
            let mut backing = self.data.lock();
            let start = offset as usize;
            let end = start
                .checked_add(data.len())
                .ok_or(VdpError::InvalidSize)?;
            if end > backing.len() {
                return Err(VdpError::InvalidSize);
            }
            backing[start..end].copy_from_slice(data);
            Ok(())
        }

        fn read(&self, offset: u32, data: &mut [u8]) -> Result<()> {
            let backing = self.data.lock();
            let start = offset as usize;
            let end = start
                .checked_add(data.len())
                .ok_or(VdpError::InvalidSize)?;
            if end > backing.len() {
                return Err(VdpError::InvalidSize);
            }
            data.copy_from_slice(&backing[start..end]);
            Ok(())
        }

        fn export_fd(&self) -> Result<RawFd> {
            Ok(self.fd)
        }
    }

    /// Allocates zero-filled `FakeBo`s with synthetic dma-buf descriptors.
    /// `fail_after` makes the Nth and later allocations fail, for
    /// resource-exhaustion tests.
    pub struct FakeAllocator {
        next_fd: Mutex<RawFd>,
        fail_after: Option<u32>,
        allocated: Mutex<u32>,
    }

    impl FakeAllocator {
        pub fn new() -> Self {
            FakeAllocator {
                next_fd: Mutex::new(100),
                fail_after: None,
                allocated: Mutex::new(0),
            }
        }

        pub fn failing_after(count: u32) -> Self {
            FakeAllocator {
                fail_after: Some(count),
                ..FakeAllocator::new()
            }
        }
    }

    impl Default for FakeAllocator {
        fn default() -> Self {
            FakeAllocator::new()
        }
    }

    impl BufferAllocator for FakeAllocator {
        fn alloc(&self, size: u32) -> Result<BoRef> {
            let mut allocated = self.allocated.lock();
            if let Some(limit) = self.fail_after {
                if *allocated >= limit {
                    return Err(VdpError::Resources);
                }
            }
            *allocated += 1;
            let mut next_fd = self.next_fd.lock();
            let fd = *next_fd;
            *next_fd += 1;
            Ok(Arc::new(FakeBo {
                data: Mutex::new(vec![0; size as usize]),
                fd,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeAllocator;
    use super::*;

    #[test]
    fn pool_reuses_shared_buffer() {
        let pool = BitstreamPool::new(Arc::new(FakeAllocator::new()));
        let a = pool.acquire(1024).unwrap();
        let b = pool.acquire(4096).unwrap();
        assert_eq!(a.export_fd().unwrap(), b.export_fd().unwrap());
        assert_eq!(a.size(), BITSTREAM_POOL_SIZE);
    }

    #[test]
    fn pool_falls_back_for_oversized_bitstreams() {
        let pool = BitstreamPool::new(Arc::new(FakeAllocator::new()));
        let big = pool.acquire(BITSTREAM_POOL_SIZE + 1).unwrap();
        assert!(big.size() > BITSTREAM_POOL_SIZE);
        let small = pool.acquire(16).unwrap();
        assert_ne!(big.export_fd().unwrap(), small.export_fd().unwrap());
    }

    #[test]
    fn alloc_failure_is_resources() {
        let pool = BitstreamPool::new(Arc::new(FakeAllocator::failing_after(0)));
        assert!(matches!(pool.acquire(16), Err(VdpError::Resources)));
    }

    #[test]
    fn fake_bo_bounds_checked() {
        let allocator = FakeAllocator::new();
        let bo = allocator.alloc(16).unwrap();
        assert!(bo.write(12, &[0; 8]).is_err());
        let mut buf = [0u8; 8];
        assert!(bo.read(12, &mut buf).is_err());
        bo.write(8, &[1; 8]).unwrap();
        bo.read(8, &mut buf).unwrap();
        assert_eq!(buf, [1; 8]);
    }
}
