use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use aperture_api::frame::FrameRef;
use aperture_api::plugin::PluginVersion;
use aperture_common::channel::{ReplyChannel, RequestChannel, Responder, SubscribeChannel};
use aperture_common::message::{IpcMessage, MsgType, MsgVal};
use aperture_common::reactor::{ChannelEvents, Reactor, ReactorEvent};
use aperture_common::shm::SharedBufferManager;

use crate::chain::PluginChain;
use crate::error::EngineError;
use crate::meta::MetaChannel;
use crate::shared_memory::{SharedMemoryController, spawn_release_forwarder};

/// Top-level configuration keys recognised by the controller, reported by
/// `request_commands`.
const COMMAND_KEYS: &[&str] = &[
    "shutdown",
    "status",
    "debug",
    "ctrl_endpoint",
    "meta_endpoint",
    "fr_setup",
    "plugin",
    "store",
    "execute",
    "inject_eoa",
    "reset_statistics",
    "frames",
    "master",
];

/// Depth cap for stored-configuration replay, so an `execute` chain that
/// stores and executes itself cannot loop forever.
const MAX_CONFIGURE_DEPTH: usize = 16;

type SharedSmc = Arc<tokio::sync::Mutex<SharedMemoryController>>;

struct ControlEvent {
    data: Vec<u8>,
    responder: Option<Responder>,
}

/// Frame accounting against the configured target and master dataset.
struct Counting {
    total: AtomicU64,
    /// 0 disables counting.
    target: AtomicU64,
    master: std::sync::Mutex<String>,
    shutdown: Arc<Notify>,
    shutdown_requested: Arc<AtomicBool>,
}

impl Counting {
    fn observe(&self, dataset_name: &str, end_of_acquisition: bool) {
        if end_of_acquisition {
            return;
        }
        let master = self
            .master
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if !master.is_empty() && dataset_name != master {
            return;
        }
        let total = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        let target = self.target.load(Ordering::SeqCst);
        if target != 0 && total >= target {
            tracing::info!(total, "frame target reached, shutting down");
            self.shutdown_requested.store(true, Ordering::SeqCst);
            self.shutdown.notify_one();
        }
    }
}

/// Cloneable shutdown trigger for a running controller.
#[derive(Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn request_shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// The processor-side configuration dispatcher.
///
/// Owns the plugin chain, the shared memory controller and the meta
/// channel; serves the control endpoint and applies `cmd:configure`
/// envelopes key by key. Any single configuration failure produces a nack
/// and leaves the process running.
pub struct ProcessorController {
    ctrl: Option<ReplyChannel>,
    ctrl_addr: SocketAddr,
    events_tx: mpsc::UnboundedSender<ControlEvent>,
    events_rx: mpsc::UnboundedReceiver<ControlEvent>,

    chain: PluginChain,
    meta: Arc<MetaChannel>,
    smc: Option<SharedSmc>,
    stored: HashMap<String, Value>,
    debug_level: u64,

    counting: Arc<Counting>,
    counting_tx: mpsc::UnboundedSender<FrameRef>,

    shutdown: Arc<Notify>,
    shutdown_requested: Arc<AtomicBool>,
}

impl ProcessorController {
    /// Bind the control endpoint and set up the chain runtime.
    pub async fn bind(ctrl_endpoint: &str) -> Result<Self, EngineError> {
        let ctrl = ReplyChannel::bind(ctrl_endpoint).await?;
        let ctrl_addr = ctrl.local_addr();

        let meta = Arc::new(MetaChannel::new());
        let chain = PluginChain::new(meta.publisher_handle(), 1000);

        let shutdown = Arc::new(Notify::new());
        let shutdown_requested = Arc::new(AtomicBool::new(false));
        let counting = Arc::new(Counting {
            total: AtomicU64::new(0),
            target: AtomicU64::new(0),
            master: std::sync::Mutex::new(String::new()),
            shutdown: shutdown.clone(),
            shutdown_requested: shutdown_requested.clone(),
        });

        let (counting_tx, mut counting_rx) = mpsc::unbounded_channel::<FrameRef>();
        let counting_task_state = counting.clone();
        tokio::spawn(async move {
            while let Some(frame) = counting_rx.recv().await {
                let frame = frame.lock().await;
                counting_task_state.observe(
                    &frame.meta_data().dataset_name,
                    frame.is_end_of_acquisition(),
                );
            }
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            ctrl: Some(ctrl),
            ctrl_addr,
            events_tx,
            events_rx,
            chain,
            meta,
            smc: None,
            stored: HashMap::new(),
            debug_level: 0,
            counting,
            counting_tx,
            shutdown,
            shutdown_requested,
        })
    }

    pub fn ctrl_addr(&self) -> SocketAddr {
        self.ctrl_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            notify: self.shutdown.clone(),
            requested: self.shutdown_requested.clone(),
        }
    }

    /// Apply the startup configuration envelopes, then serve control
    /// requests until shutdown.
    pub async fn run(mut self, startup: Vec<Value>) -> Result<(), EngineError> {
        for params in startup {
            let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
            *msg.params_mut() = params;
            let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Configure);
            self.apply_configure(&msg, &mut reply)
                .await
                .map_err(|e| e.with_context("startup configuration"))?;
        }

        // Control channel events route through the reactor into the
        // dispatch queue consumed below.
        let mut reactor = Reactor::new();
        let reactor_stop = reactor.stop_handle();
        if let Some(mut ctrl) = self.ctrl.take() {
            // A ctrl_endpoint rebind during startup configuration wires
            // its own forwarder; only the untouched channel registers
            // with the reactor here.
            if let Some(ctrl_events) = ctrl.take_events() {
                let events_tx = self.events_tx.clone();
                reactor.register_channel(
                    ctrl_events,
                    Box::new(move |event| {
                        if let ReactorEvent::Request { data, responder } = event {
                            let _ = events_tx.send(ControlEvent {
                                data,
                                responder: Some(responder),
                            });
                        }
                    }),
                );
            }
            self.ctrl = Some(ctrl);
        }
        let reactor_task = tokio::spawn(async move { reactor.run().await });

        tracing::info!(ctrl = %self.ctrl_addr, "frame processor running");

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_control_event(event).await,
                    None => break,
                },
                _ = self.shutdown.notified() => {
                    if self.shutdown_requested.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }

        tracing::info!("frame processor shutting down");
        reactor_stop.stop();
        let _ = reactor_task.await;
        self.chain.stop_all().await;
        Ok(())
    }

    async fn handle_control_event(&mut self, event: ControlEvent) {
        let text = String::from_utf8_lossy(&event.data);
        let msg = match IpcMessage::from_json(&text, true) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, "failed to decode control request");
                if let Some(responder) = &event.responder {
                    let mut reply = IpcMessage::new(MsgType::Nack, MsgVal::Illegal);
                    reply.set_param("error", e.to_string());
                    respond(responder, &reply);
                }
                return;
            }
        };

        let mut reply = IpcMessage::new(MsgType::Ack, msg.msg_val());
        reply.set_msg_id(msg.msg_id());

        if msg.msg_type() != MsgType::Cmd {
            reply.set_nack("expected a command message");
            if let Some(responder) = &event.responder {
                respond(responder, &reply);
            }
            return;
        }

        match msg.msg_val() {
            MsgVal::Configure => {
                if let Err(e) = self.apply_configure(&msg, &mut reply).await {
                    tracing::warn!(error = %e, "configuration rejected");
                    reply.set_nack(e.to_string());
                }
            }
            MsgVal::Status => self.fill_status(&mut reply).await,
            MsgVal::RequestConfiguration => self.fill_configuration(&mut reply).await,
            MsgVal::RequestVersion => self.fill_version(&mut reply).await,
            MsgVal::RequestCommands => {
                for key in COMMAND_KEYS {
                    reply.set_param("commands[]", *key);
                }
            }
            MsgVal::ResetStatistics => {
                self.chain.reset_statistics().await;
                self.counting.total.store(0, Ordering::SeqCst);
            }
            MsgVal::Shutdown => {
                self.shutdown_requested.store(true, Ordering::SeqCst);
                self.shutdown.notify_one();
            }
            MsgVal::Execute => {
                let result = match msg.get_param::<String>("name") {
                    Ok(name) => self.execute_stored(&name, &mut reply).await,
                    Err(e) => Err(EngineError::from(e)),
                };
                if let Err(e) = result {
                    reply.set_nack(e.to_string());
                }
            }
            other => {
                reply.set_nack(format!("unsupported command '{}'", other.as_str()));
            }
        }

        if let Some(responder) = &event.responder {
            respond(responder, &reply);
        }
    }

    async fn execute_stored(
        &mut self,
        name: &str,
        reply: &mut IpcMessage,
    ) -> Result<(), EngineError> {
        let params = self
            .stored
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("no stored configuration '{name}'")))?;
        let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        *msg.params_mut() = params;
        self.apply_configure(&msg, reply).await
    }

    /// Apply a `cmd:configure` envelope. Keys are dispatched in a fixed
    /// precedence: endpoints and the receiver interface first, then the
    /// plugin graph, then plugin-specific configuration, so that a single
    /// envelope can load, connect and configure in one round trip.
    async fn apply_configure(
        &mut self,
        msg: &IpcMessage,
        reply: &mut IpcMessage,
    ) -> Result<(), EngineError> {
        let mut queue = VecDeque::new();
        queue.push_back(msg.clone());
        let mut applied = 0usize;

        while let Some(msg) = queue.pop_front() {
            applied += 1;
            if applied > MAX_CONFIGURE_DEPTH {
                return Err(EngineError::Config(
                    "stored configuration replay is nested too deeply".into(),
                ));
            }
            self.apply_one(&msg, reply, &mut queue).await?;
        }
        Ok(())
    }

    async fn apply_one(
        &mut self,
        msg: &IpcMessage,
        reply: &mut IpcMessage,
        queue: &mut VecDeque<IpcMessage>,
    ) -> Result<(), EngineError> {
        if let Ok(level) = msg.get_param::<u64>("debug") {
            tracing::info!(level, "debug level set");
            self.debug_level = level;
        }

        if msg.has_param("ctrl_endpoint") {
            let endpoint = msg.get_param::<String>("ctrl_endpoint")?;
            self.rebind_ctrl(&endpoint).await?;
        }

        if msg.has_param("meta_endpoint") {
            let endpoint = msg.get_param::<String>("meta_endpoint")?;
            self.meta.bind(&endpoint).await?;
        }

        if msg.has_param("fr_setup") {
            let sub = sub_message(msg, "fr_setup")?;
            self.setup_frame_receiver(&sub).await?;
        }

        if msg.has_param("plugin") {
            let sub = sub_message(msg, "plugin")?;
            self.configure_plugin_graph(&sub).await?;
        }

        if msg.has_param("store") {
            let sub = sub_message(msg, "store")?;
            let name = sub.get_param::<String>("name")?;
            let config = sub.get_raw("config")?.clone();
            tracing::info!(name = %name, "stored configuration");
            self.stored.insert(name, config);
        }

        if msg.has_param("execute") {
            let sub = sub_message(msg, "execute")?;
            let name = sub.get_param::<String>("name")?;
            let params = self
                .stored
                .get(&name)
                .cloned()
                .ok_or_else(|| EngineError::Config(format!("no stored configuration '{name}'")))?;
            let mut stored_msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
            *stored_msg.params_mut() = params;
            tracing::info!(name = %name, "executing stored configuration");
            queue.push_back(stored_msg);
        }

        if msg.has_param("frames") {
            let frames = msg.get_param::<u64>("frames")?;
            if frames != 0 {
                self.counting.target.store(frames, Ordering::SeqCst);
                self.attach_frame_counter().await?;
                tracing::info!(frames, "frame target set");
            }
        }

        if msg.has_param("master") {
            let master = msg.get_param::<String>("master")?;
            tracing::info!(master = %master, "master dataset set");
            *self
                .counting
                .master
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = master;
        }

        if msg.has_param("reset_statistics") {
            self.chain.reset_statistics().await;
            self.counting.total.store(0, Ordering::SeqCst);
        }

        // Plugin-specific configuration, after the graph is established.
        for index in self.chain.plugin_names() {
            if msg.has_param(&index) {
                let sub = sub_message(msg, &index)?;
                self.chain.configure(&index, &sub, reply).await?;
            }
        }

        if msg.has_param("inject_eoa") {
            let smc = self.smc.as_ref().ok_or(EngineError::FrameReceiverNotConfigured)?;
            smc.lock().await.inject_eoa().await?;
        }

        if msg.has_param("shutdown") {
            self.shutdown_requested.store(true, Ordering::SeqCst);
            self.shutdown.notify_one();
        }

        Ok(())
    }

    async fn rebind_ctrl(&mut self, endpoint: &str) -> Result<(), EngineError> {
        let mut ctrl = ReplyChannel::bind(endpoint).await?;
        let events = ctrl
            .take_events()
            .ok_or_else(|| EngineError::Config("ctrl events already taken".into()))?;
        spawn_ctrl_forwarder(events, self.events_tx.clone());
        tracing::info!(endpoint, "control endpoint rebound");
        self.ctrl_addr = ctrl.local_addr();
        // Dropping the previous channel closes its listener.
        self.ctrl = Some(ctrl);
        Ok(())
    }

    /// Connect to the frame receiver: open the shared segment, subscribe
    /// to ready notifications and connect the release channel.
    async fn setup_frame_receiver(&mut self, sub: &IpcMessage) -> Result<(), EngineError> {
        let mut shared_mem = sub.get_param::<String>("fr_shared_mem")?;
        let ready_cnxn = sub.get_param::<String>("fr_ready_cnxn")?;
        let release_cnxn = sub.get_param::<String>("fr_release_cnxn")?;

        // With a control connection available, ask the receiver for its
        // buffer configuration instead of trusting ours.
        if let Ok(ctrl_cnxn) = sub.get_param::<String>("fr_ctrl_cnxn") {
            let mut request = RequestChannel::connect(&ctrl_cnxn).await?;
            let reply = request
                .request(&IpcMessage::new(MsgType::Cmd, MsgVal::BufferConfigRequest))
                .await?;
            if reply.msg_val() == MsgVal::BufferConfig {
                shared_mem = reply.get_param_or("shared_buffer_name", shared_mem);
                tracing::debug!(
                    num_buffers = reply.get_param_or::<u64>("num_buffers", 0),
                    buffer_size = reply.get_param_or::<u64>("buffer_size", 0),
                    "received buffer configuration"
                );
            }
        }

        let pool = Arc::new(SharedBufferManager::open(&shared_mem)?);
        let release_pub =
            aperture_common::channel::PublishChannel::connect(&release_cnxn).await?;
        let release_tx = spawn_release_forwarder(release_pub);

        let mut ready_sub = SubscribeChannel::connect(&ready_cnxn).await?;
        let mut ready_events = ready_sub
            .take_events()
            .ok_or_else(|| EngineError::Config("ready events already taken".into()))?;

        let smc: SharedSmc = Arc::new(tokio::sync::Mutex::new(SharedMemoryController::new(
            pool, release_tx, true,
        )));

        // One forwarder preserves the delivery order of ready
        // notifications into the controller.
        let smc_task = smc.clone();
        tokio::spawn(async move {
            while let Some(event) = ready_events.recv().await {
                let ReactorEvent::Message(data) = event else { continue };
                let text = String::from_utf8_lossy(&data);
                let msg = match IpcMessage::from_json(&text, true) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::error!(error = %e, "bad frame ready notification");
                        continue;
                    }
                };
                if msg.msg_type() != MsgType::Notify || msg.msg_val() != MsgVal::FrameReady {
                    tracing::error!(val = ?msg.msg_val(), "unexpected message on ready channel");
                    continue;
                }
                let frame = msg.get_param_or::<i64>("frame", -1);
                let buffer_id = msg.get_param_or::<i64>("buffer_id", -1);
                if frame < 0 || buffer_id < 0 {
                    tracing::error!("frame ready notification missing parameters");
                    continue;
                }
                let result = smc_task
                    .lock()
                    .await
                    .handle_frame_ready(frame as u32, buffer_id as u32)
                    .await;
                if let Err(e) = result {
                    tracing::error!(error = %e, frame, buffer_id, "frame handling failed");
                }
            }
        });

        tracing::info!(
            shared_mem = %shared_mem,
            ready = %ready_cnxn,
            release = %release_cnxn,
            "frame receiver interface configured"
        );
        self.smc = Some(smc);
        Ok(())
    }

    async fn configure_plugin_graph(&mut self, sub: &IpcMessage) -> Result<(), EngineError> {
        if sub.has_param("load") {
            let load = sub_message(sub, "load")?;
            let index = load.get_param::<String>("index")?;
            let name = load.get_param::<String>("name")?;
            // `library` is accepted for protocol compatibility; plugins
            // resolve through the compile-time registry.
            self.chain.load(&index, &name)?;
        }

        if sub.has_param("connect") {
            let connect = sub_message(sub, "connect")?;
            let index = connect.get_param::<String>("index")?;
            let connection = connect.get_param::<String>("connection")?;
            let blocking = connect.get_param_or("blocking", false);
            if connection == "frame_receiver" {
                let smc = self
                    .smc
                    .as_ref()
                    .ok_or(EngineError::FrameReceiverNotConfigured)?;
                let sink = self.chain.sink_for(&index, blocking)?;
                smc.lock().await.register_callback(&index, sink);
            } else {
                self.chain.connect(&index, &connection, blocking).await?;
            }
        }

        if sub.has_param("disconnect") {
            let disconnect = sub_message(sub, "disconnect")?;
            let index = disconnect.get_param::<String>("index")?;
            let connection = disconnect.get_param::<String>("connection")?;
            if connection == "frame_receiver" {
                if let Some(smc) = &self.smc {
                    smc.lock().await.remove_callback(&index);
                }
            } else {
                self.chain.disconnect(&index, &connection).await?;
            }
        }

        if sub.has_param("disconnect_all") {
            self.chain.disconnect_all().await;
            if let Some(smc) = &self.smc {
                let mut smc = smc.lock().await;
                for name in smc.consumer_names() {
                    smc.remove_callback(&name);
                }
            }
        }

        Ok(())
    }

    /// Attach the frame counter to the plugins that currently terminate
    /// the chain.
    async fn attach_frame_counter(&mut self) -> Result<(), EngineError> {
        let terminals = self.chain.terminal_plugins().await;
        if terminals.is_empty() {
            return Err(EngineError::Config(
                "frame counting requires at least one loaded plugin".into(),
            ));
        }
        for terminal in terminals {
            self.chain
                .add_edge_sink(
                    &terminal,
                    "__frame_count",
                    aperture_api::plugin::FrameSink::Async(self.counting_tx.clone()),
                )
                .await?;
        }
        Ok(())
    }

    async fn fill_status(&mut self, reply: &mut IpcMessage) {
        for name in self.chain.plugin_names() {
            reply.set_param("plugins/names[]", name);
        }
        self.chain.status(reply).await;
        if let Some(smc) = &self.smc {
            smc.lock().await.status("shared_memory/", reply);
        }
        reply.set_param("frames/processed", self.counting.total.load(Ordering::SeqCst));
        reply.set_param("frames/target", self.counting.target.load(Ordering::SeqCst));
    }

    async fn fill_configuration(&mut self, reply: &mut IpcMessage) {
        self.chain.request_configuration(reply).await;
        reply.set_param("debug", self.debug_level);
        reply.set_param(
            "master",
            self.counting
                .master
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .as_str(),
        );
        reply.set_param("frames", self.counting.target.load(Ordering::SeqCst));
        for name in self.stored.keys() {
            reply.set_param("stored[]", name.as_str());
        }
    }

    async fn fill_version(&mut self, reply: &mut IpcMessage) {
        PluginVersion::parse(env!("CARGO_PKG_VERSION")).encode_into("version/", reply);
        self.chain.versions(reply).await;
    }
}

fn spawn_ctrl_forwarder(mut events: ChannelEvents, tx: mpsc::UnboundedSender<ControlEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ReactorEvent::Request { data, responder } = event {
                if tx
                    .send(ControlEvent {
                        data,
                        responder: Some(responder),
                    })
                    .is_err()
                {
                    break;
                }
            }
        }
    });
}

/// Wrap a params subtree as its own message for nested dispatch.
fn sub_message(msg: &IpcMessage, key: &str) -> Result<IpcMessage, EngineError> {
    let value = msg.get_raw(key)?;
    let mut sub = IpcMessage::new(msg.msg_type(), msg.msg_val());
    *sub.params_mut() = if value.is_object() {
        value.clone()
    } else {
        // Bare values like `"inject_eoa": true` carry no nested params.
        serde_json::json!({})
    };
    Ok(sub)
}

fn respond(responder: &Responder, reply: &IpcMessage) {
    if responder.send(reply).is_err() {
        tracing::warn!("control client disconnected before reply");
    }
}
