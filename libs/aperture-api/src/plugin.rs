use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use aperture_common::message::IpcMessage;

use crate::error::PluginError;
use crate::frame::FrameRef;

/// Version tuple reported by every plugin and decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub short: String,
    pub long: String,
}

impl PluginVersion {
    /// Parse a semver-style `major.minor.patch` string, defaulting absent
    /// or malformed components to zero.
    pub fn parse(version: &str) -> Self {
        let mut parts = version.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .unwrap_or(0)
        };
        let (major, minor, patch) = (next(), next(), next());
        Self {
            major,
            minor,
            patch,
            short: format!("{major}.{minor}"),
            long: format!("{major}.{minor}.{patch}"),
        }
    }

    /// Write the version fields under `prefix` into a reply message.
    pub fn encode_into(&self, prefix: &str, reply: &mut IpcMessage) {
        reply.set_param(&format!("{prefix}major"), self.major);
        reply.set_param(&format!("{prefix}minor"), self.minor);
        reply.set_param(&format!("{prefix}patch"), self.patch);
        reply.set_param(&format!("{prefix}short"), self.short.as_str());
        reply.set_param(&format!("{prefix}full"), self.long.as_str());
    }
}

/// One downstream edge of a plugin.
///
/// Blocking edges carry a bounded queue and back-pressure the producer;
/// non-blocking edges never block the sender.
pub enum FrameSink {
    Blocking(mpsc::Sender<FrameRef>),
    Async(mpsc::UnboundedSender<FrameRef>),
}

impl FrameSink {
    pub async fn deliver(&self, frame: FrameRef) -> Result<(), PluginError> {
        match self {
            FrameSink::Blocking(tx) => tx
                .send(frame)
                .await
                .map_err(|_| PluginError::logic("downstream queue closed")),
            FrameSink::Async(tx) => tx
                .send(frame)
                .map_err(|_| PluginError::logic("downstream queue closed")),
        }
    }
}

/// One structured item published on the meta side channel.
#[derive(Debug, Clone)]
pub struct MetaItem {
    pub plugin: String,
    pub item: String,
    pub value: serde_json::Value,
    pub header: String,
}

/// Handle onto the processor-wide meta publish channel, shared by all
/// plugins. Publishing is fire-and-forget; without a configured meta
/// endpoint items are dropped.
#[derive(Clone, Default)]
pub struct MetaPublisher {
    tx: Option<mpsc::UnboundedSender<MetaItem>>,
}

impl MetaPublisher {
    pub fn new(tx: mpsc::UnboundedSender<MetaItem>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A publisher that discards everything, for chains without a meta
    /// endpoint.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn publish(
        &self,
        plugin: &str,
        item: &str,
        value: impl Into<serde_json::Value>,
        header: &str,
    ) {
        let Some(tx) = &self.tx else { return };
        let item = MetaItem {
            plugin: plugin.to_string(),
            item: item.to_string(),
            value: value.into(),
            header: header.to_string(),
        };
        if tx.send(item).is_err() {
            tracing::debug!(plugin, "meta channel closed, dropping item");
        }
    }
}

/// Per-plugin context handed to `process_frame`: the plugin's downstream
/// edges and the meta channel.
pub struct PluginContext {
    name: String,
    downstream: Vec<(String, FrameSink)>,
    meta: MetaPublisher,
}

impl PluginContext {
    pub fn new(name: impl Into<String>, meta: MetaPublisher) -> Self {
        Self {
            name: name.into(),
            downstream: Vec::new(),
            meta,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a downstream edge. Re-registering an existing name replaces
    /// its sink, keeping registration idempotent.
    pub fn add_downstream(&mut self, name: impl Into<String>, sink: FrameSink) {
        let name = name.into();
        if let Some(slot) = self.downstream.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = sink;
        } else {
            self.downstream.push((name, sink));
        }
    }

    /// Remove a downstream edge; a no-op for absent names.
    pub fn remove_downstream(&mut self, name: &str) {
        self.downstream.retain(|(n, _)| n != name);
    }

    pub fn clear_downstream(&mut self) {
        self.downstream.clear();
    }

    pub fn downstream_names(&self) -> Vec<String> {
        self.downstream.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Deliver a frame to every downstream edge in registration order.
    /// Blocking edges await queue space; the frame's reference count grows
    /// by one per consumer.
    pub async fn push(&self, frame: FrameRef) -> Result<(), PluginError> {
        for (name, sink) in &self.downstream {
            sink.deliver(frame.clone())
                .await
                .map_err(|e| e.with_context(format!("pushing to '{name}'")))?;
        }
        Ok(())
    }

    pub fn publish_meta(&self, item: &str, value: impl Into<serde_json::Value>, header: &str) {
        self.meta.publish(&self.name, item, value, header);
    }
}

pub type ProcessFuture<'a> = Pin<Box<dyn Future<Output = Result<(), PluginError>> + Send + 'a>>;

/// A frame-processing plugin.
///
/// Each loaded plugin owns one worker task that delivers frames strictly
/// in queue order. `process_frame` may mutate metadata, replace the
/// payload, split a frame into several pushes, or drop it by not pushing.
/// Configuration must be idempotent, and unknown keys must be ignored for
/// forward compatibility.
pub trait FrameProcessorPlugin: Send {
    fn process_frame<'a>(&'a mut self, frame: FrameRef, ctx: &'a PluginContext)
    -> ProcessFuture<'a>;

    fn configure(
        &mut self,
        _config: &IpcMessage,
        _reply: &mut IpcMessage,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    /// Emit the current configuration under `prefix` (the plugin's index
    /// plus a trailing slash).
    fn request_configuration(&self, _prefix: &str, _reply: &mut IpcMessage) {}

    /// Emit health counters under `prefix`.
    fn status(&self, _prefix: &str, _status: &mut IpcMessage) {}

    fn reset_statistics(&mut self) {}

    fn version(&self) -> PluginVersion;
}
