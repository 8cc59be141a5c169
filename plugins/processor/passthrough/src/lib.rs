use aperture_api::frame::FrameRef;
use aperture_api::plugin::{FrameProcessorPlugin, PluginContext, PluginVersion, ProcessFuture};
use aperture_common::message::IpcMessage;

/// Passthrough plugin: forwards every frame unchanged, counting what it
/// has seen. Useful as a chain placeholder and in integration tests.
pub struct PassthroughPlugin {
    frames_processed: u64,
}

impl Default for PassthroughPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl PassthroughPlugin {
    pub fn new() -> Self {
        Self {
            frames_processed: 0,
        }
    }
}

impl FrameProcessorPlugin for PassthroughPlugin {
    fn process_frame<'a>(
        &'a mut self,
        frame: FrameRef,
        ctx: &'a PluginContext,
    ) -> ProcessFuture<'a> {
        Box::pin(async move {
            self.frames_processed += 1;
            ctx.push(frame).await
        })
    }

    fn status(&self, prefix: &str, status: &mut IpcMessage) {
        status.set_param(&format!("{prefix}frames_processed"), self.frames_processed);
    }

    fn reset_statistics(&mut self) {
        self.frames_processed = 0;
    }

    fn version(&self) -> PluginVersion {
        PluginVersion::parse(env!("CARGO_PKG_VERSION"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_api::frame::{Frame, FrameData, frame_ref};
    use aperture_api::meta::FrameMetadata;
    use aperture_api::plugin::{FrameSink, MetaPublisher};
    use aperture_common::message::{MsgType, MsgVal};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn forwards_frames_and_counts() {
        let mut plugin = PassthroughPlugin::new();
        let mut ctx = PluginContext::new("pass", MetaPublisher::disabled());
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.add_downstream("next", FrameSink::Async(tx));

        for n in 0..3u64 {
            let frame = frame_ref(Frame::new(
                FrameMetadata {
                    frame_number: n,
                    ..FrameMetadata::default()
                },
                FrameData::Owned(vec![0u8; 4]),
            ));
            plugin.process_frame(frame, &ctx).await.unwrap();
        }

        for n in 0..3u64 {
            let frame = rx.try_recv().unwrap();
            assert_eq!(frame.lock().await.meta_data().frame_number, n);
        }

        let mut status = IpcMessage::new(MsgType::Ack, MsgVal::Status);
        plugin.status("pass/", &mut status);
        assert_eq!(status.get_param::<u64>("pass/frames_processed").unwrap(), 3);

        plugin.reset_statistics();
        let mut status = IpcMessage::new(MsgType::Ack, MsgVal::Status);
        plugin.status("pass/", &mut status);
        assert_eq!(status.get_param::<u64>("pass/frames_processed").unwrap(), 0);
    }
}
