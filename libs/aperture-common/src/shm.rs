use std::ffi::CString;

use crate::error::ShmError;
use crate::slot::FrameHeader;

/// Size of the segment header: `{manager_id, num_buffers, buffer_size}`,
/// packed little-endian u64s at offset 0.
const HEADER_SIZE: usize = 24;

/// Bounded pool of fixed-size frame slots in a named POSIX shared-memory
/// segment.
///
/// The receiver creates the segment and unlinks it on clean exit;
/// processors open it read-write and lease slots through the ready/release
/// handshake. Slot `id` lives at `HEADER_SIZE + id * buffer_size`.
pub struct SharedBufferManager {
    name: String,
    shm_name: CString,
    base: *mut u8,
    map_len: usize,
    manager_id: u64,
    num_buffers: u64,
    buffer_size: u64,
    owner: bool,
}

// Safety: the mapping is fixed for the lifetime of the manager and raw
// slot access is serialized by the ready/release handshake between the
// two processes; the manager itself holds no interior mutability.
unsafe impl Send for SharedBufferManager {}
unsafe impl Sync for SharedBufferManager {}

impl SharedBufferManager {
    /// Create (or re-create) the named segment with `num_buffers` slots of
    /// `buffer_size` bytes. The slot size is rounded up to the frame
    /// header alignment so every slot base stays aligned.
    pub fn create(name: &str, num_buffers: u64, buffer_size: u64) -> Result<Self, ShmError> {
        if num_buffers == 0 {
            return Err(ShmError::InvalidHeader {
                name: name.to_string(),
                reason: "pool must hold at least one buffer".into(),
            });
        }
        if buffer_size < FrameHeader::SIZE as u64 {
            return Err(ShmError::InvalidHeader {
                name: name.to_string(),
                reason: format!(
                    "buffer size {buffer_size} below frame header size {}",
                    FrameHeader::SIZE
                ),
            });
        }
        let buffer_size = buffer_size.next_multiple_of(8);
        let map_len = HEADER_SIZE + (num_buffers * buffer_size) as usize;

        let shm_name = shm_cname(name);
        let create_err = |source| ShmError::Create {
            name: name.to_string(),
            source,
        };

        // Safety: shm_name is a valid NUL-terminated string; fd lifetime is
        // local to this function (the mapping keeps the segment alive).
        let base = unsafe {
            let fd = libc::shm_open(
                shm_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o600 as libc::mode_t,
            );
            if fd < 0 {
                return Err(create_err(std::io::Error::last_os_error()));
            }
            if libc::ftruncate(fd, map_len as libc::off_t) != 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                libc::shm_unlink(shm_name.as_ptr());
                return Err(create_err(err));
            }
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if ptr == libc::MAP_FAILED {
                let err = std::io::Error::last_os_error();
                libc::shm_unlink(shm_name.as_ptr());
                return Err(create_err(err));
            }
            ptr as *mut u8
        };

        let manager_id = u64::from(std::process::id());

        // Safety: base..base+map_len is a fresh private view of the
        // segment sized above.
        unsafe {
            write_u64_le(base, 0, manager_id);
            write_u64_le(base, 8, num_buffers);
            write_u64_le(base, 16, buffer_size);
            // The segment may be a re-used name with stale contents.
            std::ptr::write_bytes(base.add(HEADER_SIZE), 0, (num_buffers * buffer_size) as usize);
        }

        tracing::info!(
            name,
            num_buffers,
            buffer_size,
            total = map_len,
            "created shared buffer segment"
        );

        Ok(Self {
            name: name.to_string(),
            shm_name,
            base,
            map_len,
            manager_id,
            num_buffers,
            buffer_size,
            owner: true,
        })
    }

    /// Map an existing segment read-write and validate its header.
    pub fn open(name: &str) -> Result<Self, ShmError> {
        let shm_name = shm_cname(name);
        let open_err = |source| ShmError::Open {
            name: name.to_string(),
            source,
        };

        // Safety: as in create(); fstat sizes the mapping.
        let (base, map_len) = unsafe {
            let fd = libc::shm_open(shm_name.as_ptr(), libc::O_RDWR, 0);
            if fd < 0 {
                return Err(open_err(std::io::Error::last_os_error()));
            }
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                return Err(open_err(err));
            }
            let map_len = stat.st_size as usize;
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if ptr == libc::MAP_FAILED {
                return Err(open_err(std::io::Error::last_os_error()));
            }
            (ptr as *mut u8, map_len)
        };

        if map_len < HEADER_SIZE {
            // Safety: base/map_len are the mapping created above.
            unsafe {
                libc::munmap(base as *mut libc::c_void, map_len);
            }
            return Err(ShmError::InvalidHeader {
                name: name.to_string(),
                reason: format!("segment of {map_len} bytes has no header"),
            });
        }

        // Safety: header range checked above.
        let (manager_id, num_buffers, buffer_size) = unsafe {
            (
                read_u64_le(base, 0),
                read_u64_le(base, 8),
                read_u64_le(base, 16),
            )
        };

        let needed = HEADER_SIZE as u64 + num_buffers * buffer_size;
        if num_buffers == 0 || needed > map_len as u64 {
            // Safety: base/map_len are the mapping created above.
            unsafe {
                libc::munmap(base as *mut libc::c_void, map_len);
            }
            return Err(ShmError::InvalidHeader {
                name: name.to_string(),
                reason: format!(
                    "header declares {num_buffers} x {buffer_size} bytes but segment is {map_len}"
                ),
            });
        }

        tracing::debug!(name, num_buffers, buffer_size, "opened shared buffer segment");

        Ok(Self {
            name: name.to_string(),
            shm_name,
            base,
            map_len,
            manager_id,
            num_buffers,
            buffer_size,
            owner: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager_id(&self) -> u64 {
        self.manager_id
    }

    pub fn num_buffers(&self) -> u64 {
        self.num_buffers
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    /// Raw base address of a slot.
    pub fn slot_ptr(&self, id: u32) -> Result<*mut u8, ShmError> {
        if u64::from(id) >= self.num_buffers {
            return Err(ShmError::SlotOutOfRange {
                id,
                num_buffers: self.num_buffers,
            });
        }
        // Safety: offset bounded by the validated header geometry.
        Ok(unsafe {
            self.base
                .add(HEADER_SIZE + (u64::from(id) * self.buffer_size) as usize)
        })
    }

    /// Read-only view of a slot's bytes.
    pub fn slot_bytes(&self, id: u32) -> Result<&[u8], ShmError> {
        let ptr = self.slot_ptr(id)?;
        // Safety: ptr/len bounded by the validated header geometry.
        Ok(unsafe { std::slice::from_raw_parts(ptr, self.buffer_size as usize) })
    }
}

impl Drop for SharedBufferManager {
    fn drop(&mut self) {
        // Safety: base/map_len are the live mapping owned by self.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_len);
            if self.owner {
                libc::shm_unlink(self.shm_name.as_ptr());
            }
        }
    }
}

fn shm_cname(name: &str) -> CString {
    let mut path = String::with_capacity(name.len() + 1);
    if !name.starts_with('/') {
        path.push('/');
    }
    path.push_str(name);
    CString::new(path).unwrap_or_default()
}

/// # Safety
/// `base + offset .. base + offset + 8` must be inside the mapping.
unsafe fn write_u64_le(base: *mut u8, offset: usize, value: u64) {
    unsafe {
        std::ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), base.add(offset), 8);
    }
}

/// # Safety
/// `base + offset .. base + offset + 8` must be inside the mapping.
unsafe fn read_u64_le(base: *const u8, offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    unsafe {
        std::ptr::copy_nonoverlapping(base.add(offset), bytes.as_mut_ptr(), 8);
    }
    u64::from_le_bytes(bytes)
}
