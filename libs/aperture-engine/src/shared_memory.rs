use std::sync::Arc;

use tokio::sync::mpsc;

use aperture_api::frame::{Frame, FrameData, FrameRelease, ReleaseSender, SlotLease, frame_ref};
use aperture_api::meta::{Compression, DataType, FrameMetadata};
use aperture_api::plugin::FrameSink;
use aperture_common::message::{IpcMessage, MsgType, MsgVal};
use aperture_common::shm::SharedBufferManager;
use aperture_common::slot::{FrameHeader, FrameState, header_ref};

use crate::error::EngineError;

/// Consumes frame-ready notifications, wraps slots as frames and fans
/// them out to the registered consumers in registration order.
///
/// In zero-copy mode the frame borrows the slot payload and the release
/// fires when the last consumer drops its reference; in copy mode the
/// payload is copied out and the slot is released immediately.
pub struct SharedMemoryController {
    pool: Arc<SharedBufferManager>,
    release_tx: ReleaseSender,
    consumers: Vec<(String, FrameSink)>,
    zero_copy: bool,
    frames_received: u64,
}

impl SharedMemoryController {
    pub fn new(pool: Arc<SharedBufferManager>, release_tx: ReleaseSender, zero_copy: bool) -> Self {
        Self {
            pool,
            release_tx,
            consumers: Vec::new(),
            zero_copy,
            frames_received: 0,
        }
    }

    /// Register a consumer; re-registering a name replaces its sink.
    pub fn register_callback(&mut self, name: impl Into<String>, sink: FrameSink) {
        let name = name.into();
        if let Some(slot) = self.consumers.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = sink;
        } else {
            tracing::info!(consumer = %name, "connected to frame receiver");
            self.consumers.push((name, sink));
        }
    }

    /// Remove a consumer; a no-op for absent names.
    pub fn remove_callback(&mut self, name: &str) {
        self.consumers.retain(|(n, _)| n != name);
    }

    pub fn consumer_names(&self) -> Vec<String> {
        self.consumers.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Handle one `frame_ready{frame, buffer_id}` notification.
    pub async fn handle_frame_ready(
        &mut self,
        frame_number: u32,
        buffer_id: u32,
    ) -> Result<(), EngineError> {
        let slot_ptr = self.pool.slot_ptr(buffer_id)?;
        // Safety: the ready notification transfers the slot to this
        // process; the receiver will not touch it until release.
        let header = unsafe { header_ref(slot_ptr) };

        let payload_len = (u64::from(header.packets_expected) * header.packet_size) as usize;
        if (FrameHeader::SIZE + payload_len) as u64 > self.pool.buffer_size() {
            return Err(EngineError::Config(format!(
                "slot header declares {payload_len} payload bytes but buffers hold {}",
                self.pool.buffer_size()
            )));
        }
        let timed_out = header.state() == FrameState::TimedOut;

        let mut meta = FrameMetadata {
            frame_number: u64::from(frame_number),
            dataset_name: "raw".to_string(),
            dtype: DataType::U8,
            dimensions: vec![payload_len.max(1)],
            compression: Compression::None,
            ..FrameMetadata::default()
        };
        meta.set_parameter("packets_received", u64::from(header.packets_received));
        if timed_out {
            let lost = header.packets_expected - header.packets_received;
            meta.set_parameter("timed_out", 1u64);
            meta.set_parameter("packets_lost", u64::from(lost));
        }

        let data = if self.zero_copy {
            let lease = SlotLease::new(
                self.pool.clone(),
                buffer_id,
                frame_number,
                FrameHeader::SIZE,
                payload_len,
                self.release_tx.clone(),
            )?;
            FrameData::Shared(lease)
        } else {
            let slot = self.pool.slot_bytes(buffer_id)?;
            let copied = slot[FrameHeader::SIZE..FrameHeader::SIZE + payload_len].to_vec();
            let release = FrameRelease {
                frame_number,
                buffer_id,
            };
            if self.release_tx.send(release).is_err() {
                tracing::warn!(buffer_id, "release channel closed");
            }
            FrameData::Owned(copied)
        };

        self.frames_received += 1;
        tracing::debug!(
            frame = frame_number,
            buffer_id,
            timed_out,
            consumers = self.consumers.len(),
            "frame leased from receiver"
        );

        let frame = frame_ref(Frame::new(meta, data));
        for (name, sink) in &self.consumers {
            sink.deliver(frame.clone())
                .await
                .map_err(|e| EngineError::Plugin(e.with_context(format!("consumer '{name}'"))))?;
        }
        Ok(())
    }

    /// Push the end-of-acquisition sentinel to every consumer.
    pub async fn inject_eoa(&self) -> Result<(), EngineError> {
        tracing::info!("injecting end of acquisition");
        let frame = frame_ref(Frame::end_of_acquisition());
        for (name, sink) in &self.consumers {
            sink.deliver(frame.clone())
                .await
                .map_err(|e| EngineError::Plugin(e.with_context(format!("consumer '{name}'"))))?;
        }
        Ok(())
    }

    pub fn status(&self, prefix: &str, msg: &mut IpcMessage) {
        msg.set_param(&format!("{prefix}frames_received"), self.frames_received);
        msg.set_param(&format!("{prefix}zero_copy"), self.zero_copy);
        for name in self.consumer_names() {
            msg.set_param(&format!("{prefix}consumers[]"), name);
        }
    }
}

/// Forward release notifications from dropped slot leases onto the
/// receiver's release channel. Returns the sender side for leases.
pub fn spawn_release_forwarder(
    release_pub: aperture_common::channel::PublishChannel,
) -> ReleaseSender {
    let (tx, mut rx) = mpsc::unbounded_channel::<FrameRelease>();
    tokio::spawn(async move {
        while let Some(release) = rx.recv().await {
            let mut msg = IpcMessage::new(MsgType::Notify, MsgVal::FrameRelease);
            msg.set_param("frame", release.frame_number);
            msg.set_param("buffer_id", release.buffer_id);
            release_pub.send(&msg);
            tracing::debug!(
                frame = release.frame_number,
                buffer_id = release.buffer_id,
                "frame released"
            );
        }
    });
    tx
}
