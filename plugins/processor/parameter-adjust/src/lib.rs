use std::collections::BTreeMap;

use aperture_api::error::PluginError;
use aperture_api::frame::FrameRef;
use aperture_api::plugin::{FrameProcessorPlugin, PluginContext, PluginVersion, ProcessFuture};
use aperture_common::message::IpcMessage;

const PARAMETER_CONFIG: &str = "parameter";
const ADJUSTMENT_CONFIG: &str = "adjustment";
const FIRST_FRAME_CONFIG: &str = "first_frame_number";

/// Sets configured frame parameters to `frame_number + adjustment`,
/// creating the parameter when absent.
///
/// Like the offset plugin, configured adjustments arm when the first
/// frame number passes through, so earlier frames keep their original
/// parameter values.
pub struct ParameterAdjustmentPlugin {
    configured_adjustments: BTreeMap<String, i64>,
    current_adjustments: BTreeMap<String, i64>,
    first_frame_number: u64,
}

impl Default for ParameterAdjustmentPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterAdjustmentPlugin {
    pub fn new() -> Self {
        Self {
            configured_adjustments: BTreeMap::new(),
            current_adjustments: BTreeMap::new(),
            first_frame_number: 0,
        }
    }
}

impl FrameProcessorPlugin for ParameterAdjustmentPlugin {
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
                    self.current_adjustments = self.configured_adjustments.clone();
                }
                let frame_number = meta.frame_number;
                for (name, adjustment) in &self.current_adjustments {
                    let value = frame_number.wrapping_add_signed(*adjustment);
                    meta.set_parameter(name.clone(), value);
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
        if config.has_param(FIRST_FRAME_CONFIG) {
            self.first_frame_number = config.get_param::<u64>(FIRST_FRAME_CONFIG)?;
            tracing::info!(
                first_frame = self.first_frame_number,
                "first frame number configured"
            );
        }

        if config.has_param(PARAMETER_CONFIG) {
            let parameters = config.get_raw(PARAMETER_CONFIG)?;
            let parameters = parameters
                .as_object()
                .ok_or_else(|| PluginError::config("'parameter' must be an object"))?;

            if parameters.is_empty() {
                tracing::info!("clearing all parameter adjustments");
                self.configured_adjustments.clear();
            } else {
                for name in parameters.keys() {
                    let adjustment = config
                        .get_param::<i64>(&format!("{PARAMETER_CONFIG}/{name}/{ADJUSTMENT_CONFIG}"))?;
                    tracing::info!(parameter = %name, adjustment, "parameter adjustment configured");
                    self.configured_adjustments.insert(name.clone(), adjustment);
                }
            }
        }
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        reply.set_param(
            &format!("{prefix}{FIRST_FRAME_CONFIG}"),
            self.first_frame_number,
        );
        for (name, adjustment) in &self.configured_adjustments {
            reply.set_param(
                &format!("{prefix}{PARAMETER_CONFIG}/{name}/{ADJUSTMENT_CONFIG}"),
                *adjustment,
            );
        }
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

    /// Run one frame carrying `UID = frame_number` through the plugin and
    /// return the UID afterwards.
    async fn run_frame(plugin: &mut ParameterAdjustmentPlugin, number: u64) -> u64 {
        let mut ctx = PluginContext::new("param", MetaPublisher::disabled());
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.add_downstream("next", FrameSink::Async(tx));

        let mut meta = FrameMetadata {
            frame_number: number,
            ..FrameMetadata::default()
        };
        meta.set_parameter("UID", number);
        let frame = frame_ref(Frame::new(meta, FrameData::Owned(Vec::new())));

        plugin.process_frame(frame, &ctx).await.unwrap();
        let out = rx.try_recv().unwrap();
        let uid = out
            .lock()
            .await
            .meta_data()
            .get_parameter::<u64>("UID")
            .unwrap();
        uid
    }

    #[tokio::test]
    async fn adjustment_applies_from_the_first_frame_on() {
        let mut plugin = ParameterAdjustmentPlugin::new();
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("parameter/UID/adjustment", -1i64);
        config.set_param("first_frame_number", 10u64);
        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Configure);
        plugin.configure(&config, &mut reply).unwrap();

        assert_eq!(run_frame(&mut plugin, 9).await, 9);
        assert_eq!(run_frame(&mut plugin, 10).await, 9);
        assert_eq!(run_frame(&mut plugin, 11).await, 10);
    }

    #[tokio::test]
    async fn missing_parameters_are_created() {
        let mut plugin = ParameterAdjustmentPlugin::new();
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("parameter/index/adjustment", 100i64);
        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Configure);
        plugin.configure(&config, &mut reply).unwrap();

        let mut ctx = PluginContext::new("param", MetaPublisher::disabled());
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.add_downstream("next", FrameSink::Async(tx));
        let frame = frame_ref(Frame::new(
            FrameMetadata {
                frame_number: 0,
                ..FrameMetadata::default()
            },
            FrameData::Owned(Vec::new()),
        ));
        plugin.process_frame(frame, &ctx).await.unwrap();

        let out = rx.try_recv().unwrap();
        assert_eq!(
            out.lock()
                .await
                .meta_data()
                .get_parameter::<u64>("index")
                .unwrap(),
            100
        );
    }

    #[tokio::test]
    async fn empty_parameter_object_clears_adjustments() {
        let mut plugin = ParameterAdjustmentPlugin::new();
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("parameter/UID/adjustment", 1i64);
        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Configure);
        plugin.configure(&config, &mut reply).unwrap();
        assert_eq!(plugin.configured_adjustments.len(), 1);

        let mut clear = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        clear.set_param("parameter", serde_json::json!({}));
        plugin.configure(&clear, &mut reply).unwrap();
        assert!(plugin.configured_adjustments.is_empty());
    }

    #[tokio::test]
    async fn configuration_is_reported_under_the_prefix() {
        let mut plugin = ParameterAdjustmentPlugin::new();
        let mut config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        config.set_param("parameter/UID/adjustment", 4i64);
        config.set_param("first_frame_number", 2u64);
        let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Configure);
        plugin.configure(&config, &mut reply).unwrap();

        let mut report = IpcMessage::new(MsgType::Ack, MsgVal::RequestConfiguration);
        plugin.request_configuration("adjust/", &mut report);
        assert_eq!(
            report
                .get_param::<i64>("adjust/parameter/UID/adjustment")
                .unwrap(),
            4
        );
        assert_eq!(
            report.get_param::<u64>("adjust/first_frame_number").unwrap(),
            2
        );
    }
}
