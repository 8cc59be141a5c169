/// Upper bound on packets per frame: a 4096x4096x2-byte frame split into
/// 8000-byte packets.
pub const MAX_PACKETS: usize = 4195;

/// Receive state of the frame held in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Incomplete = 0,
    Complete = 1,
    TimedOut = 2,
}

impl FrameState {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(FrameState::Incomplete),
            1 => Some(FrameState::Complete),
            2 => Some(FrameState::TimedOut),
            _ => None,
        }
    }
}

/// Frame bookkeeping header embedded at offset 0 of every shared-memory
/// slot. Written by the receiver while it owns the slot, read by the
/// processor after the ready notification; the ready/release handshake is
/// the only synchronization.
///
/// Payload bytes begin at `FrameHeader::SIZE`.
#[repr(C)]
pub struct FrameHeader {
    pub frame_number: u32,
    pub frame_state: u32,
    pub start_secs: u64,
    pub start_nanos: u32,
    pub packets_expected: u32,
    pub packets_received: u32,
    _pad: u32,
    pub packet_size: u64,
    /// One byte per packet: 0 absent, 1 received.
    pub packet_state: [u8; MAX_PACKETS],
}

impl FrameHeader {
    pub const SIZE: usize = std::mem::size_of::<FrameHeader>();

    /// Reset the header for a new frame and stamp its start time.
    pub fn init(&mut self, frame_number: u32, packets_expected: u32, packet_size: u64) {
        let (secs, nanos) = monotonic_now();
        self.frame_number = frame_number;
        self.frame_state = FrameState::Incomplete as u32;
        self.start_secs = secs;
        self.start_nanos = nanos;
        self.packets_expected = packets_expected;
        self.packets_received = 0;
        self._pad = 0;
        self.packet_size = packet_size;
        self.packet_state.fill(0);
    }

    /// Mark a packet received. Returns false when the packet was already
    /// present, so duplicates stay idempotent.
    pub fn mark_packet(&mut self, packet_number: usize) -> bool {
        if packet_number >= MAX_PACKETS || self.packet_state[packet_number] != 0 {
            return false;
        }
        self.packet_state[packet_number] = 1;
        true
    }

    pub fn state(&self) -> FrameState {
        FrameState::from_u32(self.frame_state).unwrap_or(FrameState::Incomplete)
    }

    /// Milliseconds elapsed since the first packet of this frame arrived.
    pub fn elapsed_ms(&self, now: (u64, u32)) -> u64 {
        let start = self.start_secs * 1_000 + u64::from(self.start_nanos) / 1_000_000;
        let current = now.0 * 1_000 + u64::from(now.1) / 1_000_000;
        current.saturating_sub(start)
    }
}

/// Current monotonic clock as (seconds, nanoseconds). The monotonic clock
/// is used so host clock adjustments cannot disrupt frame timeouts.
pub fn monotonic_now() -> (u64, u32) {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: ts is a valid timespec out-pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// View the frame header embedded in a slot.
///
/// # Safety
///
/// `ptr` must point at the start of a slot of at least `FrameHeader::SIZE`
/// bytes, aligned for `FrameHeader`, and the caller must hold the slot per
/// the ready/release handshake for the chosen mutability.
pub unsafe fn header_mut<'a>(ptr: *mut u8) -> &'a mut FrameHeader {
    unsafe { &mut *(ptr as *mut FrameHeader) }
}

/// Read-only counterpart of [`header_mut`].
///
/// # Safety
///
/// Same contract as [`header_mut`], for shared access.
pub unsafe fn header_ref<'a>(ptr: *const u8) -> &'a FrameHeader {
    unsafe { &*(ptr as *const FrameHeader) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_stable() {
        // Interop layout: fixed header fields then the packet state array,
        // eight-byte aligned.
        assert_eq!(std::mem::align_of::<FrameHeader>(), 8);
        assert_eq!(FrameHeader::SIZE, 40 + MAX_PACKETS + 5);
        assert_eq!(FrameHeader::SIZE % 8, 0);
    }

    #[test]
    fn mark_packet_is_idempotent() {
        let mut header: FrameHeader = unsafe { std::mem::zeroed() };
        header.init(7, 2, 1024);
        assert!(header.mark_packet(1));
        assert!(!header.mark_packet(1));
        assert!(!header.mark_packet(MAX_PACKETS));
        let set: u32 = header.packet_state.iter().map(|&b| u32::from(b)).sum();
        assert_eq!(set, 1);
    }

    #[test]
    fn elapsed_counts_forward() {
        let mut header: FrameHeader = unsafe { std::mem::zeroed() };
        header.init(0, 1, 64);
        let (secs, nanos) = (header.start_secs + 2, header.start_nanos);
        assert_eq!(header.elapsed_ms((secs, nanos)), 2_000);
    }
}
