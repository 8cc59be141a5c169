use aperture_api::plugin::FrameProcessorPlugin;
use aperture_plugin_live_view::LiveViewPlugin;
use aperture_plugin_offset_adjust::OffsetAdjustmentPlugin;
use aperture_plugin_parameter_adjust::ParameterAdjustmentPlugin;
use aperture_plugin_parameter_publish::ParameterPublishPlugin;
use aperture_plugin_passthrough::PassthroughPlugin;
use aperture_plugin_sum::SumPlugin;

use crate::error::EngineError;

/// Compile-time plugin registry. Plugins are selected by string identity
/// but resolved at build time; there is no dynamic loading, and the
/// `library` hint accepted by the load command is ignored.
pub fn create_plugin(name: &str) -> Result<Box<dyn FrameProcessorPlugin>, EngineError> {
    match name {
        "passthrough" => Ok(Box::new(PassthroughPlugin::new())),
        "offset_adjust" => Ok(Box::new(OffsetAdjustmentPlugin::new())),
        "parameter_adjust" => Ok(Box::new(ParameterAdjustmentPlugin::new())),
        "sum" => Ok(Box::new(SumPlugin::new())),
        "parameter_publish" => Ok(Box::new(ParameterPublishPlugin::new())),
        "live_view" => Ok(Box::new(LiveViewPlugin::new())),
        other => Err(EngineError::UnknownPlugin(other.to_string())),
    }
}

pub fn plugin_names() -> &'static [&'static str] {
    &[
        "passthrough",
        "offset_adjust",
        "parameter_adjust",
        "sum",
        "parameter_publish",
        "live_view",
    ]
}
