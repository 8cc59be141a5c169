use chrono::{NaiveDateTime, Timelike};
use serde_json::{Map, Value, json};

use crate::error::{MessageError, ParamError};

/// Type attribute of a control-plane message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Sentinel for messages that failed lenient validation.
    Illegal,
    Cmd,
    Ack,
    Nack,
    Notify,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Illegal => "illegal",
            MsgType::Cmd => "cmd",
            MsgType::Ack => "ack",
            MsgType::Nack => "nack",
            MsgType::Notify => "notify",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "cmd" => Some(MsgType::Cmd),
            "ack" => Some(MsgType::Ack),
            "nack" => Some(MsgType::Nack),
            "notify" => Some(MsgType::Notify),
            _ => None,
        }
    }
}

/// Value attribute of a control-plane message. Closed enum: anything else
/// on the wire is rejected (strict) or mapped to `Illegal` (lenient).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgVal {
    Illegal,
    Reset,
    Status,
    Configure,
    RequestConfiguration,
    Execute,
    RequestCommands,
    RequestVersion,
    BufferConfigRequest,
    BufferPrechargeRequest,
    ResetStatistics,
    Shutdown,
    Identity,
    FrameReady,
    FrameRelease,
    BufferConfig,
    BufferPrecharge,
}

impl MsgVal {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgVal::Illegal => "illegal",
            MsgVal::Reset => "reset",
            MsgVal::Status => "status",
            MsgVal::Configure => "configure",
            MsgVal::RequestConfiguration => "request_configuration",
            MsgVal::Execute => "execute",
            MsgVal::RequestCommands => "request_commands",
            MsgVal::RequestVersion => "request_version",
            MsgVal::BufferConfigRequest => "buffer_config_request",
            MsgVal::BufferPrechargeRequest => "buffer_precharge_request",
            MsgVal::ResetStatistics => "reset_statistics",
            MsgVal::Shutdown => "shutdown",
            MsgVal::Identity => "identity",
            MsgVal::FrameReady => "frame_ready",
            MsgVal::FrameRelease => "frame_release",
            MsgVal::BufferConfig => "buffer_config",
            MsgVal::BufferPrecharge => "buffer_precharge",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "reset" => Some(MsgVal::Reset),
            "status" => Some(MsgVal::Status),
            "configure" => Some(MsgVal::Configure),
            "request_configuration" => Some(MsgVal::RequestConfiguration),
            "execute" => Some(MsgVal::Execute),
            "request_commands" => Some(MsgVal::RequestCommands),
            "request_version" => Some(MsgVal::RequestVersion),
            "buffer_config_request" => Some(MsgVal::BufferConfigRequest),
            "buffer_precharge_request" => Some(MsgVal::BufferPrechargeRequest),
            "reset_statistics" => Some(MsgVal::ResetStatistics),
            "shutdown" => Some(MsgVal::Shutdown),
            "identity" => Some(MsgVal::Identity),
            "frame_ready" => Some(MsgVal::FrameReady),
            "frame_release" => Some(MsgVal::FrameRelease),
            "buffer_config" => Some(MsgVal::BufferConfig),
            "buffer_precharge" => Some(MsgVal::BufferPrecharge),
            _ => None,
        }
    }
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Leaf types extractable from a params tree.
pub trait FromParam: Sized {
    const EXPECTED: &'static str;
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromParam for bool {
    const EXPECTED: &'static str = "bool";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromParam for i32 {
    const EXPECTED: &'static str = "i32";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64().and_then(|v| i32::try_from(v).ok())
    }
}

impl FromParam for u32 {
    const EXPECTED: &'static str = "u32";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_u64().and_then(|v| u32::try_from(v).ok())
    }
}

impl FromParam for i64 {
    const EXPECTED: &'static str = "i64";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

impl FromParam for u64 {
    const EXPECTED: &'static str = "u64";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_u64()
    }
}

impl FromParam for f64 {
    const EXPECTED: &'static str = "f64";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

impl FromParam for String {
    const EXPECTED: &'static str = "string";
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl FromParam for Value {
    const EXPECTED: &'static str = "value";
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

/// Inter-process JSON message envelope:
/// `{msg_type, msg_val, id, timestamp, params}`.
///
/// Parameters are addressed by `/`-separated paths into the params tree.
#[derive(Debug, Clone)]
pub struct IpcMessage {
    msg_type: MsgType,
    msg_val: MsgVal,
    msg_id: u32,
    timestamp: Option<NaiveDateTime>,
    params: Value,
}

impl IpcMessage {
    /// Create a message of the given type and value, stamped with the
    /// current time and an empty params block.
    pub fn new(msg_type: MsgType, msg_val: MsgVal) -> Self {
        // Truncate to microseconds, the wire timestamp precision, so a
        // message compares equal to its own decoded encoding.
        let now = chrono::Utc::now().naive_utc();
        let timestamp = now
            .with_nanosecond(now.nanosecond() / 1_000 * 1_000)
            .unwrap_or(now);
        Self {
            msg_type,
            msg_val,
            msg_id: 0,
            timestamp: Some(timestamp),
            params: Value::Object(Map::new()),
        }
    }

    /// Decode a message from its JSON wire form.
    ///
    /// Strict decoding rejects envelopes whose type or value is outside the
    /// closed enums, whose timestamp is missing or unparseable, or whose
    /// params block is not an object. Lenient decoding maps those to the
    /// `Illegal` sentinels, which the caller may inspect but not act on.
    pub fn from_json(json_msg: &str, strict: bool) -> Result<Self, MessageError> {
        let doc: Value = serde_json::from_str(json_msg).map_err(|e| MessageError::Decode {
            offset: e.column(),
            reason: e.to_string(),
        })?;

        let root = doc
            .as_object()
            .ok_or_else(|| MessageError::Validation("message is not a JSON object".into()))?;

        let msg_type = match root.get("msg_type").and_then(Value::as_str) {
            Some(s) => match MsgType::from_wire(s) {
                Some(t) => t,
                None if strict => {
                    return Err(MessageError::Validation(format!("unknown msg_type '{s}'")));
                }
                None => MsgType::Illegal,
            },
            None if strict => return Err(MessageError::Validation("missing msg_type".into())),
            None => MsgType::Illegal,
        };

        let msg_val = match root.get("msg_val").and_then(Value::as_str) {
            Some(s) => match MsgVal::from_wire(s) {
                Some(v) => v,
                None if strict => {
                    return Err(MessageError::Validation(format!("unknown msg_val '{s}'")));
                }
                None => MsgVal::Illegal,
            },
            None if strict => return Err(MessageError::Validation("missing msg_val".into())),
            None => MsgVal::Illegal,
        };

        let timestamp = match root.get("timestamp").and_then(Value::as_str) {
            Some(s) => match NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                Ok(ts) => Some(ts),
                Err(e) if strict => {
                    return Err(MessageError::Validation(format!("bad timestamp '{s}': {e}")));
                }
                Err(_) => None,
            },
            None if strict => return Err(MessageError::Validation("missing timestamp".into())),
            None => None,
        };

        let params = match root.get("params") {
            Some(p) if p.is_object() => p.clone(),
            Some(_) if strict => {
                return Err(MessageError::Validation("params is not an object".into()));
            }
            None if strict => return Err(MessageError::Validation("missing params object".into())),
            _ => Value::Object(Map::new()),
        };

        let msg_id = root.get("id").and_then(Value::as_u64).unwrap_or(0) as u32;

        Ok(Self {
            msg_type,
            msg_val,
            msg_id,
            timestamp,
            params,
        })
    }

    /// Encode the message to its JSON wire form.
    pub fn encode(&self) -> String {
        let timestamp = self
            .timestamp
            .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default();
        let doc = json!({
            "msg_type": self.msg_type.as_str(),
            "msg_val": self.msg_val.as_str(),
            "id": self.msg_id,
            "timestamp": timestamp,
            "params": self.params,
        });
        doc.to_string()
    }

    /// True when the envelope carries legal type/value attributes, a
    /// timestamp and a params object.
    pub fn is_valid(&self) -> bool {
        self.msg_type != MsgType::Illegal
            && self.msg_val != MsgVal::Illegal
            && self.timestamp.is_some()
            && self.params.is_object()
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn msg_val(&self) -> MsgVal {
        self.msg_val
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub fn set_msg_type(&mut self, msg_type: MsgType) {
        self.msg_type = msg_type;
    }

    pub fn set_msg_val(&mut self, msg_val: MsgVal) {
        self.msg_val = msg_val;
    }

    pub fn set_msg_id(&mut self, msg_id: u32) {
        self.msg_id = msg_id;
    }

    /// The timestamp in ISO-8601 extended format, empty when absent.
    pub fn timestamp(&self) -> String {
        self.timestamp
            .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_default()
    }

    /// Get a typed parameter at a `/`-separated path.
    pub fn get_param<T: FromParam>(&self, path: &str) -> Result<T, ParamError> {
        let leaf = lookup_path(&self.params, path)?;
        T::from_value(leaf).ok_or_else(|| ParamError::type_mismatch(path, T::EXPECTED))
    }

    /// Get a typed parameter, falling back to a default when the path is
    /// missing or holds a value of a different type.
    pub fn get_param_or<T: FromParam>(&self, path: &str, default: T) -> T {
        self.get_param(path).unwrap_or(default)
    }

    /// Borrow the raw params subtree at a path, for recursive descent.
    pub fn get_raw(&self, path: &str) -> Result<&Value, ParamError> {
        lookup_path(&self.params, path)
    }

    pub fn has_param(&self, path: &str) -> bool {
        lookup_path(&self.params, path).is_ok()
    }

    /// Names of the top-level parameters in the params block.
    pub fn param_names(&self) -> Vec<String> {
        match self.params.as_object() {
            Some(map) => map.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Set a parameter at a `/`-separated path, creating intermediate
    /// objects on demand. A trailing `[]` on the final segment appends to
    /// an array, creating it empty on first use.
    pub fn set_param(&mut self, path: &str, value: impl Into<Value>) {
        insert_path(&mut self.params, path, value.into());
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Value {
        &mut self.params
    }

    /// Turn the message into a nack with the given reason.
    pub fn set_nack(&mut self, reason: impl Into<String>) {
        self.msg_type = MsgType::Nack;
        self.set_param("error", reason.into());
    }
}

/// Equality is structural: type, value, timestamp and every params leaf.
/// The id attribute is deliberately excluded.
impl PartialEq for IpcMessage {
    fn eq(&self, other: &Self) -> bool {
        self.msg_type == other.msg_type
            && self.msg_val == other.msg_val
            && self.timestamp == other.timestamp
            && self.params == other.params
    }
}

impl std::fmt::Display for IpcMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Walk a `/`-separated path through a params tree. Every intermediate
/// segment must resolve to an object.
pub(crate) fn lookup_path<'a>(root: &'a Value, path: &str) -> Result<&'a Value, ParamError> {
    let mut current = root;
    for segment in path.split('/') {
        let obj = match current.as_object() {
            Some(obj) => obj,
            None => return Err(ParamError::type_mismatch(path, "object")),
        };
        current = obj.get(segment).ok_or_else(|| ParamError::missing(path))?;
    }
    Ok(current)
}

/// Insert a leaf at a `/`-separated path, creating intermediate objects.
/// A trailing `[]` appends to an array at the final segment.
pub(crate) fn insert_path(root: &mut Value, path: &str, leaf: Value) {
    let (path, append) = match path.strip_suffix("[]") {
        Some(stripped) => (stripped, true),
        None => (path, false),
    };

    let mut current = root;
    let mut segments = path.split('/').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Some(obj) = current.as_object_mut() else {
            return;
        };
        let last = segments.peek().is_none();
        if last {
            if append {
                let slot = obj.entry(segment).or_insert_with(|| Value::Array(Vec::new()));
                if !slot.is_array() {
                    *slot = Value::Array(Vec::new());
                }
                if let Some(array) = slot.as_array_mut() {
                    array.push(leaf);
                }
            } else {
                obj.insert(segment.to_string(), leaf);
            }
            return;
        }
        current = obj
            .entry(segment)
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
