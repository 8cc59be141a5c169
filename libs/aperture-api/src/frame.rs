use std::sync::Arc;

use tokio::sync::mpsc;

use aperture_common::error::ShmError;
use aperture_common::shm::SharedBufferManager;

use crate::meta::{Compression, DataType, FrameMetadata};

/// Dataset name of the end-of-acquisition sentinel frame.
pub const END_OF_ACQUISITION: &str = "end_of_acquisition";

/// Release notification emitted when the last reference to a leased slot
/// drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRelease {
    pub frame_number: u32,
    pub buffer_id: u32,
}

pub type ReleaseSender = mpsc::UnboundedSender<FrameRelease>;

/// A lease on one shared-memory slot's payload region.
///
/// The lease pins the mapped segment and, on drop, enqueues exactly one
/// `frame_release` notification for its buffer. While leased, the slot is
/// read-only on the processor side.
pub struct SlotLease {
    _pool: Arc<SharedBufferManager>,
    buffer_id: u32,
    frame_number: u32,
    ptr: *const u8,
    len: usize,
    release: ReleaseSender,
}

// Safety: `ptr` points into the mapping owned (and kept alive) by `_pool`;
// the region is read-only for the lease's lifetime per the ready/release
// handshake.
unsafe impl Send for SlotLease {}
unsafe impl Sync for SlotLease {}

impl SlotLease {
    /// Lease `len` payload bytes starting `offset` into the slot.
    pub fn new(
        pool: Arc<SharedBufferManager>,
        buffer_id: u32,
        frame_number: u32,
        offset: usize,
        len: usize,
        release: ReleaseSender,
    ) -> Result<Self, ShmError> {
        let base = pool.slot_ptr(buffer_id)?;
        if (offset + len) as u64 > pool.buffer_size() {
            return Err(ShmError::SlotOutOfRange {
                id: buffer_id,
                num_buffers: pool.num_buffers(),
            });
        }
        // Safety: offset+len validated against the slot extent above.
        let ptr = unsafe { base.add(offset) as *const u8 };
        Ok(Self {
            _pool: pool,
            buffer_id,
            frame_number,
            ptr,
            len,
            release,
        })
    }

    pub fn buffer_id(&self) -> u32 {
        self.buffer_id
    }

    pub fn bytes(&self) -> &[u8] {
        // Safety: range validated at construction, mapping pinned by _pool.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let release = FrameRelease {
            frame_number: self.frame_number,
            buffer_id: self.buffer_id,
        };
        if self.release.send(release).is_err() {
            tracing::warn!(
                buffer_id = self.buffer_id,
                "release channel closed, slot will not return to the pool"
            );
        }
    }
}

/// Frame payload: either heap-owned bytes or a borrowed slot region.
pub enum FrameData {
    Owned(Vec<u8>),
    Shared(SlotLease),
}

/// The logical image unit flowing through the plugin chain: typed
/// metadata plus payload bytes.
pub struct Frame {
    meta: FrameMetadata,
    data: FrameData,
}

impl Frame {
    pub fn new(meta: FrameMetadata, data: FrameData) -> Self {
        Self { meta, data }
    }

    /// Build the end-of-acquisition sentinel pushed through the chain so
    /// stateful plugins can flush.
    pub fn end_of_acquisition() -> Self {
        let meta = FrameMetadata {
            dataset_name: END_OF_ACQUISITION.to_string(),
            dtype: DataType::U8,
            dimensions: vec![1],
            compression: Compression::None,
            ..FrameMetadata::default()
        };
        Self {
            meta,
            data: FrameData::Owned(Vec::new()),
        }
    }

    pub fn meta_data(&self) -> &FrameMetadata {
        &self.meta
    }

    pub fn meta_data_mut(&mut self) -> &mut FrameMetadata {
        &mut self.meta
    }

    pub fn is_end_of_acquisition(&self) -> bool {
        self.meta.dataset_name == END_OF_ACQUISITION
    }

    pub fn image_bytes(&self) -> &[u8] {
        match &self.data {
            FrameData::Owned(bytes) => bytes,
            FrameData::Shared(lease) => lease.bytes(),
        }
    }

    /// Mutable payload access. A shared payload is first promoted to an
    /// owned copy: slot memory stays read-only on the processor side, so
    /// in-place mutation requires exclusive ownership of the bytes.
    pub fn image_bytes_mut(&mut self) -> &mut [u8] {
        if let FrameData::Shared(lease) = &self.data {
            let copied = lease.bytes().to_vec();
            self.data = FrameData::Owned(copied);
        }
        match &mut self.data {
            FrameData::Owned(bytes) => bytes,
            FrameData::Shared(_) => unreachable!("shared payload promoted above"),
        }
    }

    /// Replace the payload outright, e.g. after a reorder or compression
    /// pass.
    pub fn set_image(&mut self, bytes: Vec<u8>) {
        self.data = FrameData::Owned(bytes);
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.data, FrameData::Shared(_))
    }
}

/// Reference-counted frame handle shared across plugin queues. The slot
/// release fires when the last clone drops.
pub type FrameRef = Arc<tokio::sync::Mutex<Frame>>;

pub fn frame_ref(frame: Frame) -> FrameRef {
    Arc::new(tokio::sync::Mutex::new(frame))
}
