use crate::decoder::FrameDecoder;
use crate::dummy_udp::DummyUdpFrameDecoder;
use crate::error::ReceiverError;

/// Compile-time frame decoder registry. Decoders are selected by string
/// identity but resolved at build time; there is no dynamic loading.
pub fn create_decoder(name: &str) -> Result<Box<dyn FrameDecoder>, ReceiverError> {
    match name {
        "dummy_udp" => Ok(Box::new(DummyUdpFrameDecoder::new())),
        other => Err(ReceiverError::UnknownDecoder(other.to_string())),
    }
}

pub fn decoder_names() -> &'static [&'static str] {
    &["dummy_udp"]
}
