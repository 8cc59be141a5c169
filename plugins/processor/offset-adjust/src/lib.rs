use aperture_api::error::PluginError;
use aperture_api::frame::FrameRef;
use aperture_api::plugin::{FrameProcessorPlugin, PluginContext, PluginVersion, ProcessFuture};
use aperture_common::message::IpcMessage;

const OFFSET_ADJUSTMENT_CONFIG: &str = "offset_adjustment";
const FIRST_FRAME_CONFIG: &str = "first_frame_number";

/// Adjusts every frame's offset by a configured delta.
///
/// The configured value is armed when the configured first frame number
/// passes through, so a mid-acquisition reconfiguration takes effect at a
/// well-defined frame boundary.
pub struct OffsetAdjustmentPlugin {
    configured_adjustment: i64,
    current_adjustment: i64,
    first_frame_number: u64,
}

impl Default for OffsetAdjustmentPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetAdjustmentPlugin {
    pub fn new() -> Self {
        Self {
            configured_adjustment: 0,
            current_adjustment: 0,
            first_frame_number: 0,
        }
    }
}

impl FrameProcessorPlugin for OffsetAdjustmentPlugin {
    fn process_frame<'a>(
        &'a mut self,
        frame: FrameRef,
        ctx: &'a PluginContext,
    ) -> ProcessFuture<'a> {
        Box::pin(async move {
            {
                let mut frame = frame.lock().await;
                let meta = frame.meta_data_mut();
                if meta.frame_number == self.first_frame_number {
                    self.current_adjustment = self.configured_adjustment;
                }
                meta.adjust_frame_offset(self.current_adjustment);
            }
            ctx.push(frame).await
        })
    }

    fn configure(
        &mut self,
        config: &IpcMessage,
        _reply: &mut IpcMessage,
    ) -> Result<(), PluginError> {
        if config.has_param(OFFSET_ADJUSTMENT_CONFIG) {
            self.configured_adjustment = config.get_param::<i64>(OFFSET_ADJUSTMENT_CONFIG)?;
            tracing::info!(
                adjustment = self.configured_adjustment,
                "offset adjustment configured"
            );
        }
        if config.has_param(FIRST_FRAME_CONFIG) {
            self.first_frame_number = config.get_param::<u64>(FIRST_FRAME_CONFIG)?;
            tracing::info!(
                first_frame = self.first_frame_number,
                "first frame number configured"
            );
        }
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        reply.set_param(
            &format!("{prefix}{OFFSET_ADJUSTMENT_CONFIG}"),
            self.configured_adjustment,
        );
        reply.set_param(
            &format!("{prefix}{FIRST_FRAME_CONFIG}"),
            self.first_frame_number,
        );
    }

    fn version(&self) -> PluginVersion {
        PluginVersion::parse(env!("CARGO_PKG_VERSION"))
    }
}
