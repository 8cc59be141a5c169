use serde_json::json;

use aperture_api::error::PluginError;
use aperture_api::frame::FrameRef;
use aperture_api::plugin::{FrameProcessorPlugin, PluginContext, PluginVersion, ProcessFuture};
use aperture_common::channel::PublishChannel;
use aperture_common::message::IpcMessage;

const FRAME_FREQUENCY_CONFIG: &str = "frame_frequency";
const SOCKET_ADDR_CONFIG: &str = "live_view_socket_addr";

const DEFAULT_FRAME_FREQUENCY: u64 = 5;
const DEFAULT_SOCKET_ADDR: &str = "tcp://0.0.0.0:1337";

/// Publishes every Nth frame on a dedicated socket for live display.
///
/// Each published frame is a two-part message: a JSON description
/// (frame number, dtype, dimensions, dataset) followed by the raw image
/// bytes. Viewers connect and drop in without touching the main chain.
pub struct LiveViewPlugin {
    frame_frequency: u64,
    socket_addr: String,
    /// Set when the endpoint changed and the socket must be (re)bound
    /// from the worker before the next publish.
    rebind_pending: bool,
    publisher: Option<PublishChannel>,
    bound_addr: Option<String>,
    frames_seen: u64,
    frames_published: u64,
}

impl Default for LiveViewPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveViewPlugin {
    pub fn new() -> Self {
        Self {
            frame_frequency: DEFAULT_FRAME_FREQUENCY,
            socket_addr: DEFAULT_SOCKET_ADDR.to_string(),
            rebind_pending: true,
            publisher: None,
            bound_addr: None,
            frames_seen: 0,
            frames_published: 0,
        }
    }

    async fn ensure_bound(&mut self) {
        if !self.rebind_pending {
            return;
        }
        match PublishChannel::bind(&self.socket_addr).await {
            Ok(publisher) => {
                let bound = publisher
                    .local_addr()
                    .map(|addr| format!("tcp://{addr}"))
                    .unwrap_or_else(|| self.socket_addr.clone());
                tracing::info!(addr = %bound, "live view socket bound");
                self.bound_addr = Some(bound);
                self.publisher = Some(publisher);
                self.rebind_pending = false;
            }
            Err(e) => {
                // Keep the previous socket, if any; retry on the next frame.
                tracing::warn!(addr = %self.socket_addr, error = %e, "live view bind failed");
            }
        }
    }
}

impl FrameProcessorPlugin for LiveViewPlugin {
    fn process_frame<'a>(
        &'a mut self,
        frame: FrameRef,
        ctx: &'a PluginContext,
    ) -> ProcessFuture<'a> {
        Box::pin(async move {
            self.ensure_bound().await;
            {
                let frame = frame.lock().await;
                if !frame.is_end_of_acquisition() {
                    self.frames_seen += 1;
                    // Selection keys off the frame number itself, so the
                    // published set is stable across dropped frames and
                    // non-zero acquisition starts.
                    let due = self.frame_frequency != 0
                        && frame.meta_data().frame_number % self.frame_frequency == 0;
                    if due && let Some(publisher) = &self.publisher {
                        let meta = frame.meta_data();
                        let header = json!({
                            "frame_number": meta.frame_number,
                            "dataset": meta.dataset_name,
                            "dtype": meta.dtype.as_str(),
                            "dimensions": meta.dimensions,
                            "compression": meta.compression.as_str(),
                        });
                        publisher.send_bytes(header.to_string().into_bytes());
                        publisher.send_bytes(frame.image_bytes().to_vec());
                        self.frames_published += 1;
                    }
                }
            }
            ctx.push(frame).await
        })
    }

    fn configure(
        &mut self,
        config: &IpcMessage,
        _reply: &mut IpcMessage,
    ) -> Result<(), PluginError> {
        if config.has_param(FRAME_FREQUENCY_CONFIG) {
            self.frame_frequency = config.get_param::<u64>(FRAME_FREQUENCY_CONFIG)?;
            tracing::info!(
                frequency = self.frame_frequency,
                "live view frame frequency configured"
            );
        }
        if config.has_param(SOCKET_ADDR_CONFIG) {
            let addr = config.get_param::<String>(SOCKET_ADDR_CONFIG)?;
            if self.bound_addr.as_deref() != Some(addr.as_str()) {
                self.socket_addr = addr;
                self.rebind_pending = true;
            }
        }
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        reply.set_param(
            &format!("{prefix}{FRAME_FREQUENCY_CONFIG}"),
            self.frame_frequency,
        );
        reply.set_param(
            &format!("{prefix}{SOCKET_ADDR_CONFIG}"),
            self.socket_addr.as_str(),
        );
    }

    fn status(&self, prefix: &str, status: &mut IpcMessage) {
        status.set_param(&format!("{prefix}frames_seen"), self.frames_seen);
        status.set_param(&format!("{prefix}frames_published"), self.frames_published);
        if let Some(bound) = &self.bound_addr {
            status.set_param(&format!("{prefix}bound_addr"), bound.as_str());
        }
    }

    fn reset_statistics(&mut self) {
        self.frames_seen = 0;
        self.frames_published = 0;
    }

    fn version(&self) -> PluginVersion {
        PluginVersion::parse(env!("CARGO_PKG_VERSION"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_api::frame::{Frame, FrameData, frame_ref};
    use aperture_api::meta::{DataType, FrameMetadata};
    use aperture_api::plugin::{FrameSink, MetaPublisher};
    use aperture_common::channel::SubscribeChannel;
    use aperture_common::message::{MsgType, MsgVal};
    use aperture_common::reactor::ReactorEvent;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_frame(number: u64, bytes: Vec<u8>) -> FrameRef {
        frame_ref(Frame::new(
            FrameMetadata {
                frame_number: number,
                dataset_name: "raw".into(),
                dtype: DataType::U8,
                dimensions: vec![bytes.len().max(1)],
                ..FrameMetadata::default()
            },
            FrameData::Owned(bytes),
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publishes_every_nth_frame_with_header_and_payload() {
        let mut plugin = LiveViewPlugin::new();
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param(SOCKET_ADDR_CONFIG, "tcp://127.0.0.1:0");
        config.set_param(FRAME_FREQUENCY_CONFIG, 2u64);
        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Configure);
        plugin.configure(&config, &mut reply).unwrap();

        let mut ctx = PluginContext::new("view", MetaPublisher::disabled());
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.add_downstream("next", FrameSink::Async(tx));

        // First frame binds the socket and is published (index 0).
        plugin
            .process_frame(test_frame(0, vec![1, 2, 3]), &ctx)
            .await
            .unwrap();

        let mut status = IpcMessage::new(MsgType::Ack, MsgVal::Status);
        plugin.status("view/", &mut status);
        let bound = status.get_param::<String>("view/bound_addr").unwrap();

        let mut viewer = SubscribeChannel::connect(&bound).await.unwrap();
        let mut events = viewer.take_events().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Frame 1 is skipped (frequency 2), frame 2 is published.
        plugin
            .process_frame(test_frame(1, vec![9]), &ctx)
            .await
            .unwrap();
        plugin
            .process_frame(test_frame(2, vec![4, 5]), &ctx)
            .await
            .unwrap();

        let header = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no live view header")
            .expect("viewer closed");
        let ReactorEvent::Message(header) = header else {
            panic!("expected message event");
        };
        let header: serde_json::Value =
            serde_json::from_slice(&header).expect("header is JSON");
        assert_eq!(header["frame_number"], 2);
        assert_eq!(header["dtype"], "uint8");

        let payload = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no live view payload")
            .expect("viewer closed");
        let ReactorEvent::Message(payload) = payload else {
            panic!("expected message event");
        };
        assert_eq!(payload, vec![4, 5]);

        // All three frames continued down the chain.
        for _ in 0..3 {
            assert!(rx.try_recv().is_ok());
        }

        let mut status = IpcMessage::new(MsgType::Ack, MsgVal::Status);
        plugin.status("view/", &mut status);
        assert_eq!(status.get_param::<u64>("view/frames_seen").unwrap(), 3);
        assert_eq!(status.get_param::<u64>("view/frames_published").unwrap(), 2);
    }
}
