use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use aperture_api::plugin::PluginVersion;
use aperture_common::message::IpcMessage;
use aperture_common::shm::SharedBufferManager;
use aperture_common::slot::FrameHeader;

use crate::error::ReceiverError;

/// Receive state of the frame a packet belongs to, as reported after each
/// processed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameReceiveState {
    Incomplete,
    Complete,
}

/// Completion notification for a filled (or timed-out) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyFrame {
    pub buffer_id: u32,
    pub frame_number: u32,
}

/// Decoders signal completed frames by sending on this channel; the RX
/// service drains it after every packet and monitor pass.
pub type ReadyNotifier = mpsc::UnboundedSender<ReadyFrame>;

/// A detector-variant frame decoder.
///
/// The decoder owns the per-frame slot state machine: the empty-slot
/// queue, the frame-number to slot map, and the drop buffer used when the
/// pool is exhausted. All calls arrive on the RX service's reactor, so a
/// decoder needs no internal locking.
///
/// Per-packet flow driven by the service: `process_packet_header` routes
/// the packet to a slot, `payload_destination` yields the write location
/// for its payload bytes, and `process_packet` updates the frame state
/// and reports completion.
pub trait FrameDecoder: Send {
    /// Apply a configuration message. Also called for reconfiguration;
    /// rejected values leave the previous configuration in place.
    fn init(&mut self, config: &IpcMessage) -> Result<(), ReceiverError>;

    /// Attach the shared buffer pool and the completion notifier. Called
    /// once by the RX service before any packet is processed.
    fn attach(&mut self, pool: Arc<SharedBufferManager>, ready: ReadyNotifier);

    /// Slot bytes required by the current configuration.
    fn frame_buffer_size(&self) -> usize;

    fn frame_header_size(&self) -> usize {
        FrameHeader::SIZE
    }

    /// Fixed size of this variant's packet header.
    fn packet_header_size(&self) -> usize;

    /// Incomplete frames older than this are flushed by the monitor.
    fn frame_timeout_ms(&self) -> u64;

    fn process_packet_header(&mut self, header: &[u8], port: u16, from: SocketAddr);

    /// Write location for the current packet's payload.
    fn payload_destination(&mut self) -> &mut [u8];

    fn process_packet(&mut self, payload_len: usize) -> FrameReceiveState;

    /// Timeout scan over mapped frames, called periodically by the RX
    /// service reactor at the frame timeout interval.
    fn monitor_buffers(&mut self);

    fn push_empty_buffer(&mut self, buffer_id: u32);

    fn num_empty_buffers(&self) -> usize;

    fn num_mapped_buffers(&self) -> usize;

    fn frames_timedout(&self) -> u64;

    /// Populate decoder-specific status counters under `prefix`.
    fn status(&self, prefix: &str, msg: &mut IpcMessage);

    /// Populate the current configuration under `prefix`.
    fn request_configuration(&self, prefix: &str, msg: &mut IpcMessage);

    fn reset_statistics(&mut self);

    fn version(&self) -> PluginVersion;
}
