use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;

use aperture_api::plugin::PluginVersion;
use aperture_common::message::IpcMessage;
use aperture_common::params::{ParamContainer, as_bool, as_u64};
use aperture_common::shm::SharedBufferManager;
use aperture_common::slot::{FrameHeader, FrameState, MAX_PACKETS, header_mut, monotonic_now};

use crate::decoder::{FrameDecoder, FrameReceiveState, ReadyFrame, ReadyNotifier};
use crate::error::ReceiverError;

/// Max packet payload for a 9000-byte jumbo frame: 9000 - (20 IPv4 + 8 UDP
/// + 8 application header).
pub const MAX_PACKET_SIZE: usize = 8964;

pub const PACKET_HEADER_SIZE: usize = 8;

pub const START_OF_FRAME_MASK: u32 = 1 << 31;
pub const END_OF_FRAME_MASK: u32 = 1 << 30;
pub const PACKET_NUMBER_MASK: u32 = 0x3FFF_FFFF;

/// Wire header of every packet in the generic UDP variant: two
/// little-endian u32s, frame number then packet number plus SOF/EOF flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_number: u32,
    pub packet_number: u32,
    pub start_of_frame: bool,
    pub end_of_frame: bool,
}

impl PacketHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return None;
        }
        let frame_number = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let flags = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Some(Self {
            frame_number,
            packet_number: flags & PACKET_NUMBER_MASK,
            start_of_frame: flags & START_OF_FRAME_MASK != 0,
            end_of_frame: flags & END_OF_FRAME_MASK != 0,
        })
    }

    pub fn encode(frame_number: u32, packet_number: u32, sof: bool, eof: bool) -> [u8; 8] {
        let mut flags = packet_number & PACKET_NUMBER_MASK;
        if sof {
            flags |= START_OF_FRAME_MASK;
        }
        if eof {
            flags |= END_OF_FRAME_MASK;
        }
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&frame_number.to_le_bytes());
        bytes[4..].copy_from_slice(&flags.to_le_bytes());
        bytes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DummyUdpConfig {
    pub udp_packets_per_frame: u64,
    pub udp_packet_size: u64,
    pub frame_timeout_ms: u64,
    pub enable_packet_logging: bool,
}

impl Default for DummyUdpConfig {
    fn default() -> Self {
        Self {
            udp_packets_per_frame: 1,
            udp_packet_size: 8000,
            frame_timeout_ms: 1000,
            enable_packet_logging: false,
        }
    }
}

impl DummyUdpConfig {
    fn validate(&self) -> Result<(), ReceiverError> {
        if self.udp_packets_per_frame == 0 || self.udp_packets_per_frame > MAX_PACKETS as u64 {
            return Err(ReceiverError::Config(format!(
                "udp_packets_per_frame {} outside 1..={MAX_PACKETS}",
                self.udp_packets_per_frame
            )));
        }
        if self.udp_packet_size == 0 || self.udp_packet_size > MAX_PACKET_SIZE as u64 {
            return Err(ReceiverError::Config(format!(
                "udp_packet_size {} outside 1..={MAX_PACKET_SIZE}",
                self.udp_packet_size
            )));
        }
        if self.frame_timeout_ms == 0 {
            return Err(ReceiverError::Config("frame_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    fn frame_buffer_size(&self) -> usize {
        FrameHeader::SIZE + (self.udp_packets_per_frame * self.udp_packet_size) as usize
    }
}

fn param_container() -> ParamContainer<DummyUdpConfig> {
    let mut c = ParamContainer::new();
    c.bind(
        "udp_packets_per_frame",
        |cfg: &DummyUdpConfig| json!(cfg.udp_packets_per_frame),
        |cfg, v| {
            cfg.udp_packets_per_frame = as_u64(v)?;
            Ok(())
        },
    );
    c.bind(
        "udp_packet_size",
        |cfg: &DummyUdpConfig| json!(cfg.udp_packet_size),
        |cfg, v| {
            cfg.udp_packet_size = as_u64(v)?;
            Ok(())
        },
    );
    c.bind(
        "frame_timeout_ms",
        |cfg: &DummyUdpConfig| json!(cfg.frame_timeout_ms),
        |cfg, v| {
            cfg.frame_timeout_ms = as_u64(v)?;
            Ok(())
        },
    );
    c.bind(
        "enable_packet_logging",
        |cfg: &DummyUdpConfig| json!(cfg.enable_packet_logging),
        |cfg, v| {
            cfg.enable_packet_logging = as_bool(v)?;
            Ok(())
        },
    );
    c
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CurrentTarget {
    None,
    Slot(u32),
    Dropping,
}

/// Frame decoder for the generic UDP variant.
///
/// Packets carry a fixed 8-byte header; frames are a fixed number of
/// fixed-size packets written to `slot + header + packet_number * size`,
/// tolerating arrival in any order. The first packet of an unseen frame
/// claims a slot from the empty queue, or switches the decoder into drop
/// mode for that frame when the queue is empty.
pub struct DummyUdpFrameDecoder {
    config: DummyUdpConfig,
    params: ParamContainer<DummyUdpConfig>,
    pool: Option<Arc<SharedBufferManager>>,
    ready: Option<ReadyNotifier>,
    empty_queue: VecDeque<u32>,
    frame_map: HashMap<u32, u32>,
    /// Scratch frame for drop mode, u64-backed to keep the embedded
    /// header aligned.
    drop_buffer: Vec<u64>,
    current_packet: Option<PacketHeader>,
    current_frame_seen: Option<u32>,
    target: CurrentTarget,
    packet_is_new: bool,
    dropping: bool,
    packets_received: u64,
    packets_lost: u64,
    packets_dropped: u64,
    frames_dropped: u64,
    frames_timedout: u64,
}

impl Default for DummyUdpFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyUdpFrameDecoder {
    pub fn new() -> Self {
        let config = DummyUdpConfig::default();
        let mut decoder = Self {
            drop_buffer: Vec::new(),
            config,
            params: param_container(),
            pool: None,
            ready: None,
            empty_queue: VecDeque::new(),
            frame_map: HashMap::new(),
            current_packet: None,
            current_frame_seen: None,
            target: CurrentTarget::None,
            packet_is_new: false,
            dropping: false,
            packets_received: 0,
            packets_lost: 0,
            packets_dropped: 0,
            frames_dropped: 0,
            frames_timedout: 0,
        };
        decoder.resize_drop_buffer();
        decoder
    }

    fn resize_drop_buffer(&mut self) {
        let words = self.config.frame_buffer_size().div_ceil(8);
        self.drop_buffer = vec![0u64; words];
    }

    /// Raw pointer to the frame header currently written to, if any.
    fn target_header_ptr(&mut self) -> Option<*mut FrameHeader> {
        match self.target {
            CurrentTarget::Slot(buffer_id) => {
                let pool = self.pool.as_ref()?;
                pool.slot_ptr(buffer_id)
                    .ok()
                    .map(|ptr| ptr as *mut FrameHeader)
            }
            CurrentTarget::Dropping => {
                Some(self.drop_buffer.as_mut_ptr() as *mut FrameHeader)
            }
            CurrentTarget::None => None,
        }
    }

    fn init_target_header(&mut self, frame_number: u32) {
        let expected = self.config.udp_packets_per_frame as u32;
        let packet_size = self.config.udp_packet_size;
        if let Some(ptr) = self.target_header_ptr() {
            // Safety: ptr comes from the owned slot or drop buffer; the
            // decoder is the only writer while the slot is unreleased.
            unsafe { (*ptr).init(frame_number, expected, packet_size) };
        }
    }

    fn notify_ready(&mut self, buffer_id: u32, frame_number: u32) {
        let Some(ready) = &self.ready else { return };
        let notification = ReadyFrame {
            buffer_id,
            frame_number,
        };
        if ready.send(notification).is_err() {
            tracing::warn!(buffer_id, frame_number, "ready channel closed");
        }
    }
}

impl FrameDecoder for DummyUdpFrameDecoder {
    fn init(&mut self, config: &IpcMessage) -> Result<(), ReceiverError> {
        let mut updated = self.config.clone();
        self.params.update(&mut updated, config.params())?;
        updated.validate()?;

        tracing::debug!(
            packets_per_frame = updated.udp_packets_per_frame,
            packet_size = updated.udp_packet_size,
            timeout_ms = updated.frame_timeout_ms,
            "dummy udp decoder configured"
        );

        self.config = updated;
        self.resize_drop_buffer();
        self.reset_statistics();
        Ok(())
    }

    fn attach(&mut self, pool: Arc<SharedBufferManager>, ready: ReadyNotifier) {
        self.pool = Some(pool);
        self.ready = Some(ready);
    }

    fn frame_buffer_size(&self) -> usize {
        self.config.frame_buffer_size()
    }

    fn packet_header_size(&self) -> usize {
        PACKET_HEADER_SIZE
    }

    fn frame_timeout_ms(&self) -> u64 {
        self.config.frame_timeout_ms
    }

    fn process_packet_header(&mut self, header: &[u8], port: u16, from: SocketAddr) {
        let Some(packet) = PacketHeader::parse(header) else {
            tracing::warn!(port, %from, "runt packet header, ignoring");
            self.current_packet = None;
            return;
        };

        if packet.packet_number as u64 >= self.config.udp_packets_per_frame {
            tracing::warn!(
                frame = packet.frame_number,
                packet = packet.packet_number,
                "packet number outside configured frame geometry, ignoring"
            );
            self.current_packet = None;
            return;
        }

        if self.config.enable_packet_logging {
            tracing::trace!(
                port,
                %from,
                frame = packet.frame_number,
                packet = packet.packet_number,
                sof = packet.start_of_frame,
                eof = packet.end_of_frame,
                "packet header"
            );
        }

        self.current_packet = Some(packet);

        if self.current_frame_seen != Some(packet.frame_number) {
            self.current_frame_seen = Some(packet.frame_number);

            if let Some(&buffer_id) = self.frame_map.get(&packet.frame_number) {
                self.target = CurrentTarget::Slot(buffer_id);
            } else if let Some(buffer_id) = self.empty_queue.pop_front() {
                self.frame_map.insert(packet.frame_number, buffer_id);
                self.target = CurrentTarget::Slot(buffer_id);
                if self.dropping {
                    self.dropping = false;
                    tracing::debug!(
                        frame = packet.frame_number,
                        buffer_id,
                        "free buffer available again, allocating"
                    );
                } else {
                    tracing::debug!(
                        frame = packet.frame_number,
                        buffer_id,
                        "first packet of frame, allocating buffer"
                    );
                }
                self.init_target_header(packet.frame_number);
            } else {
                self.target = CurrentTarget::Dropping;
                if !self.dropping {
                    tracing::error!(
                        frame = packet.frame_number,
                        "first packet of frame but no free buffers, dropping frame data"
                    );
                    self.frames_dropped += 1;
                    self.dropping = true;
                }
                self.init_target_header(packet.frame_number);
            }
        }

        let packet_number = packet.packet_number as usize;
        self.packet_is_new = match self.target_header_ptr() {
            // Safety: exclusive header access per the slot ownership rules.
            Some(ptr) => unsafe { (*ptr).mark_packet(packet_number) },
            None => false,
        };
    }

    fn payload_destination(&mut self) -> &mut [u8] {
        let packet_size = self.config.udp_packet_size as usize;
        let packet_number = self
            .current_packet
            .map(|p| p.packet_number as usize)
            .unwrap_or(0);
        let offset = FrameHeader::SIZE + packet_number * packet_size;

        let slot_ptr = match self.target {
            CurrentTarget::Slot(buffer_id) if self.current_packet.is_some() => self
                .pool
                .as_ref()
                .and_then(|pool| pool.slot_ptr(buffer_id).ok()),
            _ => None,
        };

        match slot_ptr {
            // Safety: offset+packet_size lies inside the slot: packet
            // numbers are bounded by the configured geometry and the pool
            // was sized from frame_buffer_size().
            Some(ptr) => unsafe {
                std::slice::from_raw_parts_mut(ptr.add(offset), packet_size)
            },
            None => {
                let bytes: &mut [u8] = bytemuck_bytes(&mut self.drop_buffer);
                &mut bytes[offset..offset + packet_size]
            }
        }
    }

    fn process_packet(&mut self, payload_len: usize) -> FrameReceiveState {
        let Some(packet) = self.current_packet else {
            return FrameReceiveState::Incomplete;
        };

        if self.config.enable_packet_logging {
            tracing::trace!(
                frame = packet.frame_number,
                packet = packet.packet_number,
                payload_len,
                "packet payload received"
            );
        }

        if self.target == CurrentTarget::Dropping {
            self.packets_dropped += 1;
        } else if self.packet_is_new {
            self.packets_received += 1;
        }

        let Some(ptr) = self.target_header_ptr() else {
            return FrameReceiveState::Incomplete;
        };

        // Safety: exclusive header access per the slot ownership rules.
        let complete = unsafe {
            let header = &mut *ptr;
            if self.packet_is_new {
                header.packets_received += 1;
            }
            if header.packets_received == header.packets_expected {
                header.frame_state = FrameState::Complete as u32;
                true
            } else {
                false
            }
        };

        if !complete {
            return FrameReceiveState::Incomplete;
        }

        if let CurrentTarget::Slot(buffer_id) = self.target {
            self.frame_map.remove(&packet.frame_number);
            self.notify_ready(buffer_id, packet.frame_number);
            // Reset the last-seen latch so an immediate repeat of the same
            // frame number starts a new frame.
            self.current_frame_seen = None;
            self.target = CurrentTarget::None;
        }
        FrameReceiveState::Complete
    }

    fn monitor_buffers(&mut self) {
        let now = monotonic_now();
        let timeout_ms = self.config.frame_timeout_ms;

        let expired: Vec<(u32, u32)> = self
            .frame_map
            .iter()
            .filter_map(|(&frame, &buffer_id)| {
                let pool = self.pool.as_ref()?;
                let ptr = pool.slot_ptr(buffer_id).ok()?;
                // Safety: receiver-owned slot, read-only peek at the header.
                let header = unsafe { header_mut(ptr) };
                (header.elapsed_ms(now) > timeout_ms).then_some((frame, buffer_id))
            })
            .collect();

        let timed_out = expired.len();
        for (frame, buffer_id) in expired {
            if let Some(pool) = self.pool.as_ref()
                && let Ok(ptr) = pool.slot_ptr(buffer_id)
            {
                // Safety: exclusive header access, slot still receiver-owned.
                let lost = unsafe {
                    let header = header_mut(ptr);
                    header.frame_state = FrameState::TimedOut as u32;
                    u64::from(header.packets_expected - header.packets_received)
                };
                self.packets_lost += lost;
                tracing::debug!(frame, buffer_id, packets_lost = lost, "frame timed out");
            }
            self.frame_map.remove(&frame);
            self.notify_ready(buffer_id, frame);
            self.frames_timedout += 1;
            if self.current_frame_seen == Some(frame) {
                self.current_frame_seen = None;
                self.target = CurrentTarget::None;
            }
        }

        if timed_out > 0 {
            tracing::warn!(count = timed_out, "released timed out incomplete frames");
        }
    }

    fn push_empty_buffer(&mut self, buffer_id: u32) {
        self.empty_queue.push_back(buffer_id);
    }

    fn num_empty_buffers(&self) -> usize {
        self.empty_queue.len()
    }

    fn num_mapped_buffers(&self) -> usize {
        self.frame_map.len()
    }

    fn frames_timedout(&self) -> u64 {
        self.frames_timedout
    }

    fn status(&self, prefix: &str, msg: &mut IpcMessage) {
        msg.set_param(&format!("{prefix}name"), "DummyUdpFrameDecoder");
        msg.set_param(&format!("{prefix}packets_received"), self.packets_received);
        msg.set_param(&format!("{prefix}packets_lost"), self.packets_lost);
        msg.set_param(&format!("{prefix}packets_dropped"), self.packets_dropped);
        msg.set_param(&format!("{prefix}frames_dropped"), self.frames_dropped);
    }

    fn request_configuration(&self, prefix: &str, msg: &mut IpcMessage) {
        let encoded = self.params.encode(&self.config);
        if let Some(map) = encoded.as_object() {
            for (key, value) in map {
                msg.set_param(&format!("{prefix}{key}"), value.clone());
            }
        }
    }

    fn reset_statistics(&mut self) {
        self.packets_received = 0;
        self.packets_lost = 0;
        self.packets_dropped = 0;
        self.frames_dropped = 0;
        self.frames_timedout = 0;
    }

    fn version(&self) -> PluginVersion {
        PluginVersion::parse(env!("CARGO_PKG_VERSION"))
    }
}

/// View a u64 scratch buffer as bytes.
fn bytemuck_bytes(words: &mut [u64]) -> &mut [u8] {
    // Safety: u64 -> u8 reinterpretation of an exclusive slice.
    unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, words.len() * 8) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_common::message::{MsgType, MsgVal};
    use aperture_common::slot::header_ref;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    const PACKET_SIZE: u64 = 64;

    struct Harness {
        decoder: DummyUdpFrameDecoder,
        pool: Arc<SharedBufferManager>,
        ready_rx: mpsc::UnboundedReceiver<ReadyFrame>,
    }

    fn harness(slots: u64, packets_per_frame: u64, timeout_ms: u64) -> Harness {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let name = format!(
            "aperture-decoder-test-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        );

        let mut decoder = DummyUdpFrameDecoder::new();
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("udp_packets_per_frame", packets_per_frame);
        config.set_param("udp_packet_size", PACKET_SIZE);
        config.set_param("frame_timeout_ms", timeout_ms);
        decoder.init(&config).unwrap();

        let pool = Arc::new(
            SharedBufferManager::create(&name, slots, decoder.frame_buffer_size() as u64).unwrap(),
        );
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        decoder.attach(pool.clone(), ready_tx);
        for id in 0..slots as u32 {
            decoder.push_empty_buffer(id);
        }

        Harness {
            decoder,
            pool,
            ready_rx,
        }
    }

    fn send_packet(
        decoder: &mut DummyUdpFrameDecoder,
        frame: u32,
        packet: u32,
        sof: bool,
        eof: bool,
        payload: &[u8],
    ) -> FrameReceiveState {
        let header = PacketHeader::encode(frame, packet, sof, eof);
        let from: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        decoder.process_packet_header(&header, 8989, from);
        let dst = decoder.payload_destination();
        dst[..payload.len()].copy_from_slice(payload);
        decoder.process_packet(payload.len())
    }

    #[test]
    fn single_packet_frame_completes() {
        let mut h = harness(4, 1, 1000);
        let payload: Vec<u8> = (1..=255u8).cycle().take(32).collect();

        let state = send_packet(&mut h.decoder, 0, 0, true, true, &payload);
        assert_eq!(state, FrameReceiveState::Complete);

        let ready = h.ready_rx.try_recv().unwrap();
        assert_eq!(ready, ReadyFrame { buffer_id: 0, frame_number: 0 });

        let slot = h.pool.slot_bytes(0).unwrap();
        assert_eq!(&slot[FrameHeader::SIZE..FrameHeader::SIZE + 32], &payload[..]);

        // Safety: slot 0 is quiescent after completion.
        let header = unsafe { header_ref(h.pool.slot_ptr(0).unwrap()) };
        assert_eq!(header.state(), FrameState::Complete);
        assert_eq!(header.packets_received, header.packets_expected);
        let marked: u32 = header.packet_state.iter().map(|&b| u32::from(b)).sum();
        assert_eq!(marked, header.packets_expected);
    }

    #[test]
    fn two_packet_frame_completes_in_either_order() {
        let mut h = harness(2, 2, 1000);
        assert_eq!(
            send_packet(&mut h.decoder, 5, 0, true, false, &[1; 16]),
            FrameReceiveState::Incomplete
        );
        assert_eq!(
            send_packet(&mut h.decoder, 5, 1, false, true, &[2; 16]),
            FrameReceiveState::Complete
        );
        assert_eq!(
            h.ready_rx.try_recv().unwrap(),
            ReadyFrame { buffer_id: 0, frame_number: 5 }
        );

        // Reverse order for the next frame.
        assert_eq!(
            send_packet(&mut h.decoder, 6, 1, false, true, &[3; 16]),
            FrameReceiveState::Incomplete
        );
        assert_eq!(
            send_packet(&mut h.decoder, 6, 0, true, false, &[4; 16]),
            FrameReceiveState::Complete
        );
        assert_eq!(
            h.ready_rx.try_recv().unwrap(),
            ReadyFrame { buffer_id: 1, frame_number: 6 }
        );

        // Payloads landed at their packet offsets.
        let slot = h.pool.slot_bytes(1).unwrap();
        assert_eq!(slot[FrameHeader::SIZE], 4);
        assert_eq!(slot[FrameHeader::SIZE + PACKET_SIZE as usize], 3);
    }

    #[test]
    fn duplicate_packets_are_idempotent() {
        let mut h = harness(1, 2, 1000);
        send_packet(&mut h.decoder, 0, 0, true, false, &[1; 8]);
        let state = send_packet(&mut h.decoder, 0, 0, true, false, &[1; 8]);
        assert_eq!(state, FrameReceiveState::Incomplete);
        assert!(h.ready_rx.try_recv().is_err());
        assert_eq!(h.decoder.packets_received, 1);

        // Safety: only this test touches slot 0.
        let header = unsafe { header_ref(h.pool.slot_ptr(0).unwrap()) };
        assert_eq!(header.packets_received, 1);
    }

    #[test]
    fn incomplete_frame_times_out_with_lost_packet_accounting() {
        let mut h = harness(1, 2, 100);
        send_packet(&mut h.decoder, 7, 0, true, false, &[9; 16]);
        assert!(h.ready_rx.try_recv().is_err());

        std::thread::sleep(std::time::Duration::from_millis(150));
        h.decoder.monitor_buffers();

        assert_eq!(
            h.ready_rx.try_recv().unwrap(),
            ReadyFrame { buffer_id: 0, frame_number: 7 }
        );
        assert_eq!(h.decoder.frames_timedout(), 1);
        assert_eq!(h.decoder.packets_lost, 1);

        // Safety: slot 0 is quiescent after the timeout flush.
        let header = unsafe { header_ref(h.pool.slot_ptr(0).unwrap()) };
        assert_eq!(header.state(), FrameState::TimedOut);
    }

    #[test]
    fn exhausted_pool_switches_to_drop_mode_per_frame() {
        let mut h = harness(1, 1, 1000);
        // Fill the single slot; no release yet.
        send_packet(&mut h.decoder, 0, 0, true, true, &[1; 8]);
        assert!(h.ready_rx.try_recv().is_ok());

        // First packet of the next frame finds no free slot.
        send_packet(&mut h.decoder, 1, 0, true, true, &[2; 8]);
        assert_eq!(h.decoder.frames_dropped, 1);
        assert!(h.ready_rx.try_recv().is_err());

        // A slot freeing up does not rescue the frame already in drop mode.
        h.decoder.push_empty_buffer(0);
        send_packet(&mut h.decoder, 1, 0, true, true, &[2; 8]);
        assert!(h.ready_rx.try_recv().is_err());

        // The next new frame claims the freed slot.
        send_packet(&mut h.decoder, 2, 0, true, true, &[3; 8]);
        assert_eq!(
            h.ready_rx.try_recv().unwrap(),
            ReadyFrame { buffer_id: 0, frame_number: 2 }
        );
    }

    #[test]
    fn repeated_frame_number_starts_a_new_frame() {
        let mut h = harness(2, 1, 1000);
        send_packet(&mut h.decoder, 0, 0, true, true, &[1; 8]);
        assert_eq!(
            h.ready_rx.try_recv().unwrap(),
            ReadyFrame { buffer_id: 0, frame_number: 0 }
        );

        send_packet(&mut h.decoder, 0, 0, true, true, &[2; 8]);
        assert_eq!(
            h.ready_rx.try_recv().unwrap(),
            ReadyFrame { buffer_id: 1, frame_number: 0 }
        );
    }

    #[test]
    fn out_of_range_packet_numbers_are_ignored() {
        let mut h = harness(1, 2, 1000);
        let header = PacketHeader::encode(0, 5, false, false);
        let from: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        h.decoder.process_packet_header(&header, 8989, from);
        assert_eq!(h.decoder.process_packet(8), FrameReceiveState::Incomplete);
        assert_eq!(h.decoder.num_mapped_buffers(), 0);
        assert_eq!(h.decoder.packets_received, 0);
    }

    #[test]
    fn invalid_configuration_is_rejected_and_keeps_previous_values() {
        let mut decoder = DummyUdpFrameDecoder::new();
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("udp_packet_size", 9999u64);
        assert!(decoder.init(&config).is_err());
        assert_eq!(decoder.config.udp_packet_size, 8000);

        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("udp_packets_per_frame", 0u64);
        assert!(decoder.init(&config).is_err());
        assert_eq!(decoder.config.udp_packets_per_frame, 1);
    }

    #[test]
    fn configuration_report_round_trips() {
        let h = harness(1, 2, 500);
        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::RequestConfiguration);
        h.decoder.request_configuration("decoder/", &mut reply);
        assert_eq!(
            reply.get_param::<u64>("decoder/udp_packets_per_frame").unwrap(),
            2
        );
        assert_eq!(reply.get_param::<u64>("decoder/frame_timeout_ms").unwrap(), 500);
    }
}
