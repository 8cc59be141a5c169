use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;

use aperture_api::plugin::PluginVersion;
use aperture_common::channel::{PairChannel, PublishChannel, ReplyChannel, Responder, SubscribeChannel};
use aperture_common::context::IpcContext;
use aperture_common::message::{IpcMessage, MsgType, MsgVal};
use aperture_common::reactor::{Reactor, ReactorEvent};
use aperture_common::shm::SharedBufferManager;

use crate::config::ReceiverConfig;
use crate::error::ReceiverError;
use crate::registry;
use crate::rx_service::RxService;

/// Addresses the controller actually bound, for clients configured with
/// ephemeral ports.
#[derive(Debug, Clone)]
pub struct BoundEndpoints {
    pub ctrl: SocketAddr,
    pub frame_ready: SocketAddr,
    pub frame_release: SocketAddr,
    pub rx_ports: Vec<u16>,
}

/// The receiver main half: owns the shared buffer pool and the external
/// channels, spawns the RX service, and routes notifications between the
/// two.
pub struct ReceiverController {
    config: ReceiverConfig,
    ctx: IpcContext,
    endpoints: Arc<OnceLock<BoundEndpoints>>,
}

impl ReceiverController {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            ctx: IpcContext::new(),
            endpoints: Arc::new(OnceLock::new()),
        }
    }

    /// Handle resolving the bound endpoints once `run` has them.
    pub fn endpoints(&self) -> Arc<OnceLock<BoundEndpoints>> {
        self.endpoints.clone()
    }

    pub async fn run(&mut self) -> Result<(), ReceiverError> {
        // Decoder and pool geometry.
        let mut decoder = registry::create_decoder(&self.config.decoder)?;
        let mut decoder_config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
        if self.config.decoder_config.is_object() {
            *decoder_config.params_mut() = self.config.decoder_config.clone();
        }
        decoder
            .init(&decoder_config)
            .map_err(|e| e.with_context("decoder configuration"))?;

        let buffer_size = decoder.frame_buffer_size() as u64;
        let num_buffers = (self.config.max_buffer_mem / buffer_size).max(1);
        let pool = Arc::new(SharedBufferManager::create(
            &self.config.shared_buffer_name,
            num_buffers,
            buffer_size,
        )?);

        // Channels: the pair endpoint must be bound before the RX service
        // connects to it.
        let mut rx_channel = PairChannel::bind(&self.ctx, &self.config.rx_channel_endpoint)?;
        let mut ctrl = ReplyChannel::bind(&self.config.ctrl_endpoint).await?;
        let ready_pub = Arc::new(PublishChannel::bind(&self.config.frame_ready_endpoint).await?);
        let mut release_sub = SubscribeChannel::bind(&self.config.frame_release_endpoint).await?;

        let service = RxService::bind(&self.config, self.ctx.clone(), decoder, pool.clone()).await?;
        let service_handle = service.handle();

        let _ = self.endpoints.set(BoundEndpoints {
            ctrl: ctrl.local_addr(),
            frame_ready: ready_pub
                .local_addr()
                .unwrap_or_else(|| ctrl.local_addr()),
            frame_release: release_sub
                .local_addr()
                .unwrap_or_else(|| ctrl.local_addr()),
            rx_ports: service.local_ports().to_vec(),
        });

        let service_task = tokio::spawn(async move {
            let mut service = service;
            if let Err(e) = service.run().await {
                tracing::error!(error = %e, "rx service failed");
            }
        });

        let mut reactor = Reactor::new();
        let stop = reactor.stop_handle();

        let rx_events = rx_channel
            .take_events()
            .ok_or_else(|| ReceiverError::Config("rx channel events already taken".into()))?;
        let rx_channel = Arc::new(rx_channel);

        // Status cache filled from the RX service's periodic notifications.
        let rx_status: Arc<Mutex<Value>> = Arc::new(Mutex::new(Value::Null));

        // Messages from the RX service.
        {
            let ready_pub = ready_pub.clone();
            let rx_channel = rx_channel.clone();
            let rx_status = rx_status.clone();
            let pool = pool.clone();
            reactor.register_channel(
                rx_events,
                Box::new(move |event| {
                    if let ReactorEvent::Message(data) = event {
                        handle_rx_event(&data, &ready_pub, &rx_channel, &rx_status, &pool);
                    }
                }),
            );
        }

        // Frame release notifications from processors, forwarded to the
        // RX service.
        {
            let release_events = release_sub
                .take_events()
                .ok_or_else(|| ReceiverError::Config("release events already taken".into()))?;
            let rx_channel = rx_channel.clone();
            reactor.register_channel(
                release_events,
                Box::new(move |event| {
                    if let ReactorEvent::Message(data) = event {
                        forward_release(&data, &rx_channel);
                    }
                }),
            );
        }

        // External control requests.
        {
            let ctrl_events = ctrl
                .take_events()
                .ok_or_else(|| ReceiverError::Config("ctrl events already taken".into()))?;
            let rx_status = rx_status.clone();
            let rx_channel = rx_channel.clone();
            let pool = pool.clone();
            let config = self.config.clone();
            let stop = stop.clone();
            reactor.register_channel(
                ctrl_events,
                Box::new(move |event| {
                    if let ReactorEvent::Request { data, responder } = event {
                        handle_ctrl_request(
                            &data, &responder, &rx_status, &rx_channel, &pool, &config, &stop,
                        );
                    }
                }),
            );
        }

        tracing::info!(
            ctrl = %self.config.ctrl_endpoint,
            buffers = num_buffers,
            buffer_size,
            "frame receiver running"
        );

        reactor.run().await;

        tracing::info!("frame receiver shutting down");
        service_handle.stop();
        let _ = service_task.await;
        Ok(())
    }
}

fn decode_strict(data: &[u8]) -> Option<IpcMessage> {
    let text = String::from_utf8_lossy(data);
    match IpcMessage::from_json(&text, true) {
        Ok(msg) => Some(msg),
        Err(e) => {
            tracing::error!(error = %e, "failed to decode message");
            None
        }
    }
}

fn handle_rx_event(
    data: &[u8],
    ready_pub: &PublishChannel,
    rx_channel: &Arc<PairChannel>,
    rx_status: &Arc<Mutex<Value>>,
    pool: &Arc<SharedBufferManager>,
) {
    let Some(msg) = decode_strict(data) else { return };

    match (msg.msg_type(), msg.msg_val()) {
        (MsgType::Notify, MsgVal::FrameReady) => {
            ready_pub.send(&msg);
        }
        (MsgType::Notify, MsgVal::Identity) => {
            tracing::debug!("rx service advertised its identity");
            let reply = IpcMessage::new(MsgType::Ack, MsgVal::Identity);
            if rx_channel.send(&reply).is_err() {
                tracing::warn!("rx channel closed");
            }
        }
        (MsgType::Notify, MsgVal::Status) => {
            let mut cache = lock_value(rx_status);
            *cache = msg.params().clone();
        }
        (MsgType::Cmd, MsgVal::BufferPrechargeRequest) => {
            let mut reply = IpcMessage::new(MsgType::Notify, MsgVal::BufferPrecharge);
            reply.set_param("start_buffer_id", 0u32);
            reply.set_param("num_buffers", pool.num_buffers());
            tracing::debug!(num_buffers = pool.num_buffers(), "precharging rx service");
            if rx_channel.send(&reply).is_err() {
                tracing::warn!("rx channel closed, precharge dropped");
            }
        }
        (MsgType::Ack, _) => {
            tracing::debug!(val = ?msg.msg_val(), "rx service acknowledgement");
        }
        (msg_type, msg_val) => {
            tracing::error!(?msg_type, ?msg_val, "unexpected message from rx service");
        }
    }
}

fn forward_release(data: &[u8], rx_channel: &Arc<PairChannel>) {
    let Some(msg) = decode_strict(data) else { return };
    if msg.msg_type() != MsgType::Notify || msg.msg_val() != MsgVal::FrameRelease {
        tracing::error!(val = ?msg.msg_val(), "unexpected message on release channel");
        return;
    }
    if rx_channel.send(&msg).is_err() {
        tracing::warn!("rx channel closed, frame release dropped");
    }
}

fn handle_ctrl_request(
    data: &[u8],
    responder: &Responder,
    rx_status: &Arc<Mutex<Value>>,
    rx_channel: &Arc<PairChannel>,
    pool: &Arc<SharedBufferManager>,
    config: &ReceiverConfig,
    stop: &aperture_common::reactor::StopHandle,
) {
    let Some(msg) = decode_strict(data) else {
        let mut reply = IpcMessage::new(MsgType::Nack, MsgVal::Illegal);
        reply.set_param("error", "malformed control request");
        respond(responder, &reply);
        return;
    };

    if msg.msg_type() != MsgType::Cmd {
        let mut reply = IpcMessage::new(MsgType::Nack, msg.msg_val());
        reply.set_msg_id(msg.msg_id());
        reply.set_param("error", "expected a command message");
        respond(responder, &reply);
        return;
    }

    let mut reply = IpcMessage::new(MsgType::Ack, msg.msg_val());
    reply.set_msg_id(msg.msg_id());

    match msg.msg_val() {
        MsgVal::Status => {
            if let Some(cached) = lock_value(rx_status).as_object() {
                for (key, value) in cached {
                    reply.set_param(key, value.clone());
                }
            }
            reply.set_param("buffers/total", pool.num_buffers());
            reply.set_param("buffers/size", pool.buffer_size());
        }
        MsgVal::RequestVersion => {
            PluginVersion::parse(env!("CARGO_PKG_VERSION")).encode_into("version/", &mut reply);
        }
        MsgVal::RequestConfiguration => match serde_json::to_value(config) {
            Ok(value) => reply.set_param("config", value),
            Err(e) => reply.set_nack(format!("failed to encode configuration: {e}")),
        },
        MsgVal::BufferConfigRequest => {
            reply.set_msg_type(MsgType::Notify);
            reply.set_msg_val(MsgVal::BufferConfig);
            reply.set_param("shared_buffer_name", config.shared_buffer_name.as_str());
            reply.set_param("num_buffers", pool.num_buffers());
            reply.set_param("buffer_size", pool.buffer_size());
        }
        MsgVal::ResetStatistics => {
            let forward = IpcMessage::new(MsgType::Cmd, MsgVal::ResetStatistics);
            if rx_channel.send(&forward).is_err() {
                reply.set_nack("rx service unavailable");
            }
        }
        MsgVal::Configure => {
            // Runtime reconfiguration is limited to logging verbosity; the
            // decoder geometry is fixed once the pool exists.
            if let Ok(level) = msg.get_param::<u32>("debug") {
                tracing::info!(level, "debug level updated by client");
            }
        }
        MsgVal::Shutdown => {
            tracing::info!("shutdown requested by client");
            stop.stop();
        }
        other => {
            reply.set_nack(format!("unsupported command '{}'", other.as_str()));
        }
    }

    respond(responder, &reply);
}

fn respond(responder: &Responder, reply: &IpcMessage) {
    if responder.send(reply).is_err() {
        tracing::warn!("control client disconnected before reply");
    }
}

fn lock_value(value: &Arc<Mutex<Value>>) -> std::sync::MutexGuard<'_, Value> {
    value.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("status cache lock was poisoned, recovering");
        poisoned.into_inner()
    })
}
