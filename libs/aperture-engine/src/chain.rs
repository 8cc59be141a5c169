use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use aperture_api::frame::FrameRef;
use aperture_api::plugin::{FrameProcessorPlugin, FrameSink, MetaPublisher, PluginContext};
use aperture_common::message::IpcMessage;

use crate::error::EngineError;
use crate::registry;

type SharedPlugin = Arc<tokio::sync::Mutex<Box<dyn FrameProcessorPlugin>>>;
type SharedContext = Arc<tokio::sync::Mutex<PluginContext>>;

/// One loaded plugin: the plugin object, its context (downstream edges),
/// its inbox senders and its worker task.
struct PluginSlot {
    plugin: SharedPlugin,
    ctx: SharedContext,
    blocking_tx: mpsc::Sender<FrameRef>,
    async_tx: mpsc::UnboundedSender<FrameRef>,
    shutdown_tx: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
    last_error: Arc<Mutex<Option<String>>>,
    error_count: Arc<AtomicU64>,
}

/// The plugin chain host: a registry-backed set of plugin workers and the
/// directed acyclic graph of edges between them.
///
/// Each plugin has exactly one worker task consuming its inbox; frames
/// are processed strictly in arrival order. A failing `process_frame`
/// drops that one frame and records the error; the worker keeps running.
pub struct PluginChain {
    slots: HashMap<String, PluginSlot>,
    meta: MetaPublisher,
    queue_bound: usize,
}

impl PluginChain {
    pub fn new(meta: MetaPublisher, queue_bound: usize) -> Self {
        Self {
            slots: HashMap::new(),
            meta,
            queue_bound,
        }
    }

    /// Load a plugin by its registry name under a unique index.
    pub fn load(&mut self, index: &str, name: &str) -> Result<(), EngineError> {
        let plugin = registry::create_plugin(name)?;
        self.load_boxed(index, plugin)
    }

    /// Register an already-constructed plugin and start its worker.
    pub fn load_boxed(
        &mut self,
        index: &str,
        plugin: Box<dyn FrameProcessorPlugin>,
    ) -> Result<(), EngineError> {
        if self.slots.contains_key(index) {
            return Err(EngineError::DuplicatePlugin(index.to_string()));
        }

        let version = plugin.version();
        let plugin: SharedPlugin = Arc::new(tokio::sync::Mutex::new(plugin));
        let ctx: SharedContext = Arc::new(tokio::sync::Mutex::new(PluginContext::new(
            index,
            self.meta.clone(),
        )));

        let (blocking_tx, blocking_rx) = mpsc::channel(self.queue_bound);
        let (async_tx, async_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let last_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let error_count = Arc::new(AtomicU64::new(0));

        let worker = tokio::spawn(worker_loop(
            index.to_string(),
            plugin.clone(),
            ctx.clone(),
            blocking_rx,
            async_rx,
            shutdown_rx,
            last_error.clone(),
            error_count.clone(),
        ));

        tracing::info!(index, version = %version.long, "loaded plugin");
        self.slots.insert(
            index.to_string(),
            PluginSlot {
                plugin,
                ctx,
                blocking_tx,
                async_tx,
                shutdown_tx,
                worker: Some(worker),
                last_error,
                error_count,
            },
        );
        Ok(())
    }

    pub fn contains(&self, index: &str) -> bool {
        self.slots.contains_key(index)
    }

    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.keys().cloned().collect();
        names.sort();
        names
    }

    /// An inbox sink for delivering frames to `index` from outside the
    /// chain (the shared memory controller, the frame counter).
    pub fn sink_for(&self, index: &str, blocking: bool) -> Result<FrameSink, EngineError> {
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| EngineError::PluginNotLoaded(index.to_string()))?;
        Ok(if blocking {
            FrameSink::Blocking(slot.blocking_tx.clone())
        } else {
            FrameSink::Async(slot.async_tx.clone())
        })
    }

    /// Connect `index` to receive frames from `upstream`. Rejected when
    /// the new edge would close a cycle.
    pub async fn connect(
        &mut self,
        index: &str,
        upstream: &str,
        blocking: bool,
    ) -> Result<(), EngineError> {
        if !self.slots.contains_key(index) {
            return Err(EngineError::PluginNotLoaded(index.to_string()));
        }
        let upstream_slot = self
            .slots
            .get(upstream)
            .ok_or_else(|| EngineError::PluginNotLoaded(upstream.to_string()))?;

        if index == upstream || self.reaches(index, upstream).await {
            return Err(EngineError::CycleDetected {
                index: index.to_string(),
                upstream: upstream.to_string(),
            });
        }

        let sink = self.sink_for(index, blocking)?;
        upstream_slot.ctx.lock().await.add_downstream(index, sink);
        tracing::info!(index, upstream, blocking, "connected plugins");
        Ok(())
    }

    pub async fn disconnect(&mut self, index: &str, upstream: &str) -> Result<(), EngineError> {
        let upstream_slot = self
            .slots
            .get(upstream)
            .ok_or_else(|| EngineError::PluginNotLoaded(upstream.to_string()))?;
        upstream_slot.ctx.lock().await.remove_downstream(index);
        Ok(())
    }

    pub async fn disconnect_all(&mut self) {
        for slot in self.slots.values() {
            slot.ctx.lock().await.clear_downstream();
        }
    }

    /// Attach an external sink as a downstream edge of `upstream`.
    pub async fn add_edge_sink(
        &self,
        upstream: &str,
        name: &str,
        sink: FrameSink,
    ) -> Result<(), EngineError> {
        let slot = self
            .slots
            .get(upstream)
            .ok_or_else(|| EngineError::PluginNotLoaded(upstream.to_string()))?;
        slot.ctx.lock().await.add_downstream(name, sink);
        Ok(())
    }

    /// Plugins with no downstream edges.
    pub async fn terminal_plugins(&self) -> Vec<String> {
        let mut terminals = Vec::new();
        for (name, slot) in &self.slots {
            if slot.ctx.lock().await.downstream_names().is_empty() {
                terminals.push(name.clone());
            }
        }
        terminals.sort();
        terminals
    }

    /// True when a path of downstream edges leads from `from` to `to`.
    async fn reaches(&self, from: &str, to: &str) -> bool {
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for (name, slot) in &self.slots {
            adjacency.insert(name.clone(), slot.ctx.lock().await.downstream_names());
        }

        let mut stack = vec![from.to_string()];
        let mut seen = std::collections::HashSet::new();
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some(next) = adjacency.get(&node) {
                stack.extend(next.iter().cloned());
            }
        }
        false
    }

    pub async fn configure(
        &mut self,
        index: &str,
        config: &IpcMessage,
        reply: &mut IpcMessage,
    ) -> Result<(), EngineError> {
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| EngineError::PluginNotLoaded(index.to_string()))?;
        slot.plugin
            .lock()
            .await
            .configure(config, reply)
            .map_err(|e| EngineError::Plugin(e.with_context(format!("plugin '{index}'"))))
    }

    pub async fn status(&self, reply: &mut IpcMessage) {
        for (name, slot) in &self.slots {
            let prefix = format!("{name}/");
            slot.plugin.lock().await.status(&prefix, reply);
            reply.set_param(
                &format!("{prefix}errors"),
                slot.error_count.load(Ordering::Relaxed),
            );
            if let Some(last) = lock_error(&slot.last_error).clone() {
                reply.set_param(&format!("{prefix}last_error"), last);
            }
        }
    }

    pub async fn request_configuration(&self, reply: &mut IpcMessage) {
        for (name, slot) in &self.slots {
            let prefix = format!("{name}/");
            slot.plugin
                .lock()
                .await
                .request_configuration(&prefix, reply);
        }
    }

    pub async fn versions(&self, reply: &mut IpcMessage) {
        for (name, slot) in &self.slots {
            let version = slot.plugin.lock().await.version();
            version.encode_into(&format!("version/plugins/{name}/"), reply);
        }
    }

    pub async fn reset_statistics(&self) {
        for slot in self.slots.values() {
            slot.plugin.lock().await.reset_statistics();
            slot.error_count.store(0, Ordering::Relaxed);
            *lock_error(&slot.last_error) = None;
        }
    }

    /// Signal every worker and wait for the queues to drain.
    pub async fn stop_all(&mut self) {
        for slot in self.slots.values() {
            let _ = slot.shutdown_tx.send(true);
        }
        for (name, slot) in self.slots.iter_mut() {
            if let Some(worker) = slot.worker.take()
                && worker.await.is_err()
            {
                tracing::error!(plugin = %name, "plugin worker panicked");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    name: String,
    plugin: SharedPlugin,
    ctx: SharedContext,
    mut blocking_rx: mpsc::Receiver<FrameRef>,
    mut async_rx: mpsc::UnboundedReceiver<FrameRef>,
    mut shutdown_rx: watch::Receiver<bool>,
    last_error: Arc<Mutex<Option<String>>>,
    error_count: Arc<AtomicU64>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                // Drain whatever is already queued, then exit.
                while let Ok(frame) = blocking_rx.try_recv() {
                    process_one(&name, &plugin, &ctx, frame, &last_error, &error_count).await;
                }
                while let Ok(frame) = async_rx.try_recv() {
                    process_one(&name, &plugin, &ctx, frame, &last_error, &error_count).await;
                }
                break;
            }
            maybe = blocking_rx.recv() => match maybe {
                Some(frame) => {
                    process_one(&name, &plugin, &ctx, frame, &last_error, &error_count).await;
                }
                None => break,
            },
            maybe = async_rx.recv() => match maybe {
                Some(frame) => {
                    process_one(&name, &plugin, &ctx, frame, &last_error, &error_count).await;
                }
                None => break,
            },
        }
    }
    tracing::debug!(plugin = %name, "worker stopped");
}

async fn process_one(
    name: &str,
    plugin: &SharedPlugin,
    ctx: &SharedContext,
    frame: FrameRef,
    last_error: &Arc<Mutex<Option<String>>>,
    error_count: &Arc<AtomicU64>,
) {
    let ctx = ctx.lock().await;
    let mut plugin = plugin.lock().await;
    if let Err(e) = plugin.process_frame(frame, &ctx).await {
        // The failure is scoped to this frame; the chain keeps running.
        tracing::error!(plugin = name, error = %e, "process_frame failed, frame dropped");
        error_count.fetch_add(1, Ordering::Relaxed);
        *lock_error(last_error) = Some(e.to_string());
    }
}

fn lock_error(error: &Mutex<Option<String>>) -> std::sync::MutexGuard<'_, Option<String>> {
    error.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("plugin error slot lock was poisoned, recovering");
        poisoned.into_inner()
    })
}
