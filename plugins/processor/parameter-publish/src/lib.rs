use serde_json::{Map, Value};

use aperture_api::error::PluginError;
use aperture_api::frame::FrameRef;
use aperture_api::plugin::{FrameProcessorPlugin, PluginContext, PluginVersion, ProcessFuture};
use aperture_common::message::IpcMessage;

const PARAMETERS_CONFIG: &str = "parameters";
const META_ITEM: &str = "frame_parameters";

/// Publishes selected frame parameters on the meta side channel, one item
/// per frame, so external collectors can aggregate per-frame metrics
/// without touching the main chain.
///
/// The frame number is always included; further parameters are selected
/// by configuration.
pub struct ParameterPublishPlugin {
    parameters: Vec<String>,
    frames_published: u64,
}

impl Default for ParameterPublishPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterPublishPlugin {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
            frames_published: 0,
        }
    }
}

impl FrameProcessorPlugin for ParameterPublishPlugin {
    fn process_frame<'a>(
        &'a mut self,
        frame: FrameRef,
        ctx: &'a PluginContext,
    ) -> ProcessFuture<'a> {
        Box::pin(async move {
            {
                let frame = frame.lock().await;
                if !frame.is_end_of_acquisition() {
                    let meta = frame.meta_data();
                    let mut item = Map::new();
                    item.insert("frame_number".into(), meta.frame_number.into());
                    for name in &self.parameters {
                        if let Some((_, value)) =
                            meta.parameters().find(|(param, _)| *param == name.as_str())
                        {
                            item.insert(name.clone(), value.into());
                        }
                    }
                    ctx.publish_meta(META_ITEM, Value::Object(item), &meta.acquisition_id);
                    self.frames_published += 1;
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
        if config.has_param(PARAMETERS_CONFIG) {
            let list = config.get_raw(PARAMETERS_CONFIG)?;
            let list = list
                .as_array()
                .ok_or_else(|| PluginError::config("'parameters' must be an array of names"))?;
            let mut parameters = Vec::with_capacity(list.len());
            for entry in list {
                let name = entry
                    .as_str()
                    .ok_or_else(|| PluginError::config("'parameters' must be an array of names"))?;
                parameters.push(name.to_string());
            }
            tracing::info!(count = parameters.len(), "publishing parameters configured");
            self.parameters = parameters;
        }
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, reply: &mut IpcMessage) {
        for name in &self.parameters {
            reply.set_param(&format!("{prefix}{PARAMETERS_CONFIG}[]"), name.as_str());
        }
    }

    fn status(&self, prefix: &str, status: &mut IpcMessage) {
        status.set_param(&format!("{prefix}frames_published"), self.frames_published);
    }

    fn reset_statistics(&mut self) {
        self.frames_published = 0;
    }

    fn version(&self) -> PluginVersion {
        PluginVersion::parse(env!("CARGO_PKG_VERSION"))
    }
}
