use std::collections::BTreeMap;

use crate::error::{FrameOffsetUnderflow, PluginError};

/// Pixel data type of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataType {
    U8,
    U16,
    U32,
    U64,
    F32,
    #[default]
    Unknown,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::U8 => "uint8",
            DataType::U16 => "uint16",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
            DataType::F32 => "float32",
            DataType::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "uint8" => DataType::U8,
            "uint16" => DataType::U16,
            "uint32" => DataType::U32,
            "uint64" => DataType::U64,
            "float32" => DataType::F32,
            _ => DataType::Unknown,
        }
    }

    /// Bytes per pixel; `None` for the unknown sentinel.
    pub fn size_bytes(&self) -> Option<usize> {
        match self {
            DataType::U8 => Some(1),
            DataType::U16 => Some(2),
            DataType::U32 | DataType::F32 => Some(4),
            DataType::U64 => Some(8),
            DataType::Unknown => None,
        }
    }
}

/// Compression applied to the frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    Lz4,
    BsLz4,
    Blosc,
    #[default]
    Unknown,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::BsLz4 => "bslz4",
            Compression::Blosc => "blosc",
            Compression::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "none" => Compression::None,
            "lz4" => Compression::Lz4,
            "bslz4" => Compression::BsLz4,
            "blosc" => Compression::Blosc,
            _ => Compression::Unknown,
        }
    }
}

/// Scalar variant for per-frame parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::U64(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::I64(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::U64(u64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::F64(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<&ParamValue> for serde_json::Value {
    fn from(v: &ParamValue) -> Self {
        match v {
            ParamValue::U64(n) => serde_json::json!(n),
            ParamValue::I64(n) => serde_json::json!(n),
            ParamValue::F64(n) => serde_json::json!(n),
            ParamValue::Str(s) => serde_json::json!(s),
        }
    }
}

/// Typed extraction of a frame parameter.
pub trait FromFrameParam: Sized {
    const EXPECTED: &'static str;
    fn from_param(value: &ParamValue) -> Option<Self>;
}

impl FromFrameParam for u64 {
    const EXPECTED: &'static str = "u64";
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::U64(v) => Some(*v),
            ParamValue::I64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }
}

impl FromFrameParam for i64 {
    const EXPECTED: &'static str = "i64";
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::I64(v) => Some(*v),
            ParamValue::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl FromFrameParam for f64 {
    const EXPECTED: &'static str = "f64";
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::F64(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromFrameParam for String {
    const EXPECTED: &'static str = "string";
    fn from_param(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Mutable metadata travelling with a frame through the chain.
#[derive(Debug, Clone, Default)]
pub struct FrameMetadata {
    pub frame_number: u64,
    pub dataset_name: String,
    pub dtype: DataType,
    pub dimensions: Vec<usize>,
    pub compression: Compression,
    pub acquisition_id: String,
    pub frame_offset: i64,
    pub outer_chunk_size: usize,
    /// Arbitrary per-frame scalars; prefer the typed accessors below.
    pub parameters: BTreeMap<String, ParamValue>,
}

impl FrameMetadata {
    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.parameters.insert(name.into(), value.into());
    }

    pub fn get_parameter<T: FromFrameParam>(&self, name: &str) -> Result<T, PluginError> {
        let value = self
            .parameters
            .get(name)
            .ok_or_else(|| PluginError::param(format!("missing frame parameter '{name}'")))?;
        T::from_param(value).ok_or_else(|| {
            PluginError::param(format!(
                "frame parameter '{name}': expected {}",
                T::EXPECTED
            ))
        })
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.parameters.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Shift the frame offset by a signed delta.
    pub fn adjust_frame_offset(&mut self, delta: i64) {
        self.frame_offset = self.frame_offset.saturating_add(delta);
    }

    /// Absolute frame number after applying the offset. The consumer that
    /// needs the absolute position performs this computation, so an
    /// out-of-range offset surfaces at the point of use.
    pub fn absolute_frame_number(&self) -> Result<u64, FrameOffsetUnderflow> {
        let absolute = self.frame_number as i128 + i128::from(self.frame_offset);
        if absolute < 0 {
            return Err(FrameOffsetUnderflow {
                frame_number: self.frame_number,
                offset: self.frame_offset,
            });
        }
        Ok(absolute as u64)
    }

    /// Check the dimension invariant: one to three axes, all positive.
    pub fn validate_dimensions(&self) -> Result<(), PluginError> {
        if self.dimensions.is_empty() || self.dimensions.len() > 3 {
            return Err(PluginError::frame(format!(
                "frame {} has {} dimensions, expected 1..=3",
                self.frame_number,
                self.dimensions.len()
            )));
        }
        if self.dimensions.iter().any(|&d| d == 0) {
            return Err(PluginError::frame(format!(
                "frame {} has a zero-length dimension",
                self.frame_number
            )));
        }
        Ok(())
    }

    /// Uncompressed payload size implied by dimensions and dtype.
    pub fn payload_size(&self) -> Option<usize> {
        let pixel = self.dtype.size_bytes()?;
        Some(self.dimensions.iter().product::<usize>() * pixel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_parameters_round_trip() {
        let mut meta = FrameMetadata::default();
        meta.set_parameter("UID", 17u64);
        meta.set_parameter("gain", 1.5f64);
        meta.set_parameter("mode", "spectroscopy");

        assert_eq!(meta.get_parameter::<u64>("UID").unwrap(), 17);
        assert_eq!(meta.get_parameter::<i64>("UID").unwrap(), 17);
        assert_eq!(meta.get_parameter::<f64>("gain").unwrap(), 1.5);
        assert_eq!(
            meta.get_parameter::<String>("mode").unwrap(),
            "spectroscopy"
        );
        assert!(meta.get_parameter::<u64>("absent").is_err());
        assert!(meta.get_parameter::<u64>("mode").is_err());
    }

    #[test]
    fn offset_underflow_is_reported_at_use() {
        let mut meta = FrameMetadata {
            frame_number: 2,
            ..FrameMetadata::default()
        };
        meta.adjust_frame_offset(-3);
        let err = meta.absolute_frame_number().unwrap_err();
        assert_eq!(err.frame_number, 2);
        assert_eq!(err.offset, -3);

        meta.adjust_frame_offset(4);
        assert_eq!(meta.absolute_frame_number().unwrap(), 3);
    }

    #[test]
    fn dimension_invariant() {
        let mut meta = FrameMetadata {
            dimensions: vec![512, 512],
            ..FrameMetadata::default()
        };
        assert!(meta.validate_dimensions().is_ok());

        meta.dimensions = vec![];
        assert!(meta.validate_dimensions().is_err());
        meta.dimensions = vec![1, 2, 3, 4];
        assert!(meta.validate_dimensions().is_err());
        meta.dimensions = vec![512, 0];
        assert!(meta.validate_dimensions().is_err());
    }

    #[test]
    fn payload_size_follows_dtype() {
        let meta = FrameMetadata {
            dtype: DataType::U16,
            dimensions: vec![4, 4],
            ..FrameMetadata::default()
        };
        assert_eq!(meta.payload_size(), Some(32));

        let unknown = FrameMetadata::default();
        assert_eq!(unknown.payload_size(), None);
    }
}
