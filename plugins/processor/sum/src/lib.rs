use aperture_api::frame::FrameRef;
use aperture_api::meta::DataType;
use aperture_api::plugin::{FrameProcessorPlugin, PluginContext, PluginVersion, ProcessFuture};
use aperture_common::message::IpcMessage;

pub const SUM_PARAM_NAME: &str = "SUM";

/// Computes the pixel sum of each frame and attaches it as the `SUM`
/// parameter.
pub struct SumPlugin {
    frames_summed: u64,
}

impl Default for SumPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl SumPlugin {
    pub fn new() -> Self {
        Self { frames_summed: 0 }
    }
}

fn pixel_sum(dtype: DataType, bytes: &[u8]) -> Option<u64> {
    match dtype {
        DataType::U8 => Some(bytes.iter().map(|&b| u64::from(b)).sum()),
        DataType::U16 => Some(
            bytes
                .chunks_exact(2)
                .map(|c| u64::from(u16::from_le_bytes([c[0], c[1]])))
                .sum(),
        ),
        DataType::U32 => Some(
            bytes
                .chunks_exact(4)
                .map(|c| u64::from(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .sum(),
        ),
        DataType::U64 => Some(
            bytes
                .chunks_exact(8)
                .map(|c| {
                    u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                })
                .fold(0u64, u64::wrapping_add),
        ),
        DataType::F32 | DataType::Unknown => None,
    }
}

impl FrameProcessorPlugin for SumPlugin {
    fn process_frame<'a>(
        &'a mut self,
        frame: FrameRef,
        ctx: &'a PluginContext,
    ) -> ProcessFuture<'a> {
        Box::pin(async move {
            {
                let mut frame = frame.lock().await;
                if !frame.is_end_of_acquisition() {
                    let dtype = frame.meta_data().dtype;
                    match pixel_sum(dtype, frame.image_bytes()) {
                        Some(total) => {
                            frame.meta_data_mut().set_parameter(SUM_PARAM_NAME, total);
                            self.frames_summed += 1;
                        }
                        None => {
                            tracing::debug!(
                                dtype = dtype.as_str(),
                                "pixel sum not defined for this data type"
                            );
                        }
                    }
                }
            }
            ctx.push(frame).await
        })
    }

    fn status(&self, prefix: &str, status: &mut IpcMessage) {
        status.set_param(&format!("{prefix}frames_summed"), self.frames_summed);
    }

    fn reset_statistics(&mut self) {
        self.frames_summed = 0;
    }

    fn version(&self) -> PluginVersion {
        PluginVersion::parse(env!("CARGO_PKG_VERSION"))
    }
}
