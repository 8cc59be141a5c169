use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use aperture_common::channel::PairChannel;
use aperture_common::context::IpcContext;
use aperture_common::message::{IpcMessage, MsgType, MsgVal};
use aperture_common::reactor::{Reactor, ReactorEvent};
use aperture_common::shm::SharedBufferManager;

use crate::config::ReceiverConfig;
use crate::decoder::{FrameDecoder, ReadyFrame};
use crate::error::ReceiverError;

type SharedDecoder = Arc<Mutex<Box<dyn FrameDecoder>>>;
type ReadyQueue = Arc<Mutex<mpsc::UnboundedReceiver<ReadyFrame>>>;

fn lock_decoder(decoder: &SharedDecoder) -> std::sync::MutexGuard<'_, Box<dyn FrameDecoder>> {
    decoder.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("decoder lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Stop signal for a running RX service, observed by its tick timer.
#[derive(Clone)]
pub struct RxServiceHandle {
    run_flag: Arc<AtomicBool>,
}

impl RxServiceHandle {
    pub fn stop(&self) {
        self.run_flag.store(false, Ordering::SeqCst);
    }
}

/// The receiver-side packet service.
///
/// Owns the UDP sockets, the frame decoder and the pair channel to the
/// receiver controller, all multiplexed on one reactor. Completed or
/// timed-out frames flow out as `notify:frame_ready`; the controller
/// feeds freed slots back as `notify:frame_release`.
pub struct RxService {
    rx_channel_endpoint: String,
    tick_period_ms: u64,
    ctx: IpcContext,
    decoder: SharedDecoder,
    ready_rx: ReadyQueue,
    sockets: Vec<Arc<UdpSocket>>,
    local_ports: Vec<u16>,
    run_flag: Arc<AtomicBool>,
}

impl RxService {
    /// Bind the receive sockets and wire the decoder to the shared pool.
    /// The pair channel endpoint must already be bound by the controller.
    pub async fn bind(
        config: &ReceiverConfig,
        ctx: IpcContext,
        mut decoder: Box<dyn FrameDecoder>,
        pool: Arc<SharedBufferManager>,
    ) -> Result<Self, ReceiverError> {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        decoder.attach(pool, ready_tx);

        let mut sockets = Vec::new();
        let mut local_ports = Vec::new();
        for &port in &config.rx_ports {
            let addr = format!("{}:{port}", config.rx_address);
            let socket = UdpSocket::bind(&addr).await.map_err(|source| {
                aperture_common::error::ChannelError::Bind {
                    endpoint: format!("udp://{addr}"),
                    source,
                }
            })?;
            set_recv_buffer_size(&socket, config.rx_recv_buffer_size);
            let local_port = socket.local_addr().map(|a| a.port()).unwrap_or(port);
            tracing::info!(port = local_port, "listening for frame data");
            local_ports.push(local_port);
            sockets.push(Arc::new(socket));
        }

        Ok(Self {
            rx_channel_endpoint: config.rx_channel_endpoint.clone(),
            tick_period_ms: config.tick_period_ms,
            ctx,
            decoder: Arc::new(Mutex::new(decoder)),
            ready_rx: Arc::new(Mutex::new(ready_rx)),
            sockets,
            local_ports,
            run_flag: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Ports the receive sockets actually bound (resolves port 0).
    pub fn local_ports(&self) -> &[u16] {
        &self.local_ports
    }

    pub fn handle(&self) -> RxServiceHandle {
        RxServiceHandle {
            run_flag: self.run_flag.clone(),
        }
    }

    /// Run the service reactor until stopped.
    pub async fn run(&mut self) -> Result<(), ReceiverError> {
        let mut reactor = Reactor::new();

        let mut channel = PairChannel::connect(&self.ctx, &self.rx_channel_endpoint)?;
        let events = channel
            .take_events()
            .ok_or_else(|| ReceiverError::Config("rx channel events already taken".into()))?;
        let channel = Arc::new(channel);

        // Control messages from the main controller.
        {
            let decoder = self.decoder.clone();
            let channel = channel.clone();
            reactor.register_channel(
                events,
                Box::new(move |event| {
                    if let ReactorEvent::Message(data) = event {
                        handle_rx_message(&decoder, &channel, &data);
                    }
                }),
            );
        }

        // Frame data sockets.
        for socket in &self.sockets {
            let decoder = self.decoder.clone();
            let channel = channel.clone();
            let ready_rx = self.ready_rx.clone();
            reactor.register_socket(
                socket.clone(),
                Box::new(move |event| {
                    if let ReactorEvent::Datagram { data, from, port } = event {
                        handle_datagram(&decoder, &data, from, port);
                        drain_ready(&ready_rx, &channel);
                    }
                }),
            );
        }

        // Tick timer: detect external stop requests.
        {
            let run_flag = self.run_flag.clone();
            let stop = reactor.stop_handle();
            reactor.register_timer(
                self.tick_period_ms,
                0,
                Box::new(move || {
                    if !run_flag.load(Ordering::SeqCst) {
                        tracing::debug!("rx service stop detected in tick timer");
                        stop.stop();
                    }
                }),
            );
        }

        // Buffer monitor timer at the frame timeout interval.
        {
            let timeout_ms = lock_decoder(&self.decoder).frame_timeout_ms();
            let decoder = self.decoder.clone();
            let channel = channel.clone();
            let ready_rx = self.ready_rx.clone();
            reactor.register_timer(
                timeout_ms,
                0,
                Box::new(move || {
                    lock_decoder(&decoder).monitor_buffers();
                    drain_ready(&ready_rx, &channel);

                    let mut status = IpcMessage::new(MsgType::Notify, MsgVal::Status);
                    fill_status(&decoder, &mut status);
                    if channel.send(&status).is_err() {
                        tracing::warn!("rx channel closed, dropping status notification");
                    }
                }),
            );
        }

        // Advertise identity so the controller learns this service is up.
        channel.send(&IpcMessage::new(MsgType::Notify, MsgVal::Identity))?;

        // Request precharge of the empty-buffer queue when it is empty.
        if lock_decoder(&self.decoder).num_empty_buffers() == 0 {
            tracing::debug!("requesting buffer precharge");
            channel.send(&IpcMessage::new(MsgType::Cmd, MsgVal::BufferPrechargeRequest))?;
        }

        reactor.run().await;
        tracing::debug!("rx service reactor exited");
        Ok(())
    }
}

fn set_recv_buffer_size(socket: &UdpSocket, size: usize) {
    let fd = socket.as_raw_fd();
    let value = size as libc::c_int;
    // Safety: fd is a live socket and value outlives the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::warn!(
            size,
            error = %std::io::Error::last_os_error(),
            "failed to set receive buffer size"
        );
    }
}

fn handle_datagram(decoder: &SharedDecoder, data: &[u8], from: std::net::SocketAddr, port: u16) {
    let mut decoder = lock_decoder(decoder);
    let header_size = decoder.packet_header_size();
    if data.len() < header_size {
        tracing::warn!(port, %from, len = data.len(), "runt datagram, ignoring");
        return;
    }
    let (header, payload) = data.split_at(header_size);
    decoder.process_packet_header(header, port, from);

    let destination = decoder.payload_destination();
    let len = payload.len().min(destination.len());
    destination[..len].copy_from_slice(&payload[..len]);
    decoder.process_packet(len);
}

fn drain_ready(ready_rx: &ReadyQueue, channel: &Arc<PairChannel>) {
    let mut queue = ready_rx.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("ready queue lock was poisoned, recovering");
        poisoned.into_inner()
    });
    while let Ok(ready) = queue.try_recv() {
        tracing::debug!(
            frame = ready.frame_number,
            buffer_id = ready.buffer_id,
            "frame ready"
        );
        let mut msg = IpcMessage::new(MsgType::Notify, MsgVal::FrameReady);
        msg.set_param("frame", ready.frame_number);
        msg.set_param("buffer_id", ready.buffer_id);
        if channel.send(&msg).is_err() {
            tracing::warn!("rx channel closed, dropping frame ready notification");
        }
    }
}

fn fill_status(decoder: &SharedDecoder, msg: &mut IpcMessage) {
    let decoder = lock_decoder(decoder);
    msg.set_param("rx_thread/empty_buffers", decoder.num_empty_buffers() as u64);
    msg.set_param("rx_thread/mapped_buffers", decoder.num_mapped_buffers() as u64);
    msg.set_param("rx_thread/frames_timedout", decoder.frames_timedout());
    decoder.status("decoder/", msg);
}

fn handle_rx_message(decoder: &SharedDecoder, channel: &Arc<PairChannel>, data: &[u8]) {
    let text = String::from_utf8_lossy(data);
    let msg = match IpcMessage::from_json(&text, true) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::error!(error = %e, "failed to decode rx channel message");
            return;
        }
    };

    match (msg.msg_type(), msg.msg_val()) {
        (MsgType::Cmd, MsgVal::Status) => {
            let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Status);
            reply.set_msg_id(msg.msg_id());
            fill_status(decoder, &mut reply);
            send_or_warn(channel, &reply);
        }
        (MsgType::Cmd, MsgVal::ResetStatistics) => {
            lock_decoder(decoder).reset_statistics();
            let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::ResetStatistics);
            reply.set_msg_id(msg.msg_id());
            send_or_warn(channel, &reply);
        }
        (MsgType::Cmd, MsgVal::RequestConfiguration) => {
            let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::RequestConfiguration);
            reply.set_msg_id(msg.msg_id());
            lock_decoder(decoder).request_configuration("decoder/", &mut reply);
            send_or_warn(channel, &reply);
        }
        (MsgType::Ack, MsgVal::Identity) => {
            tracing::debug!("identity notification acknowledged");
        }
        (MsgType::Notify, MsgVal::BufferPrecharge) => {
            let start = msg.get_param_or::<i64>("start_buffer_id", -1);
            let count = msg.get_param_or::<i64>("num_buffers", -1);
            if start < 0 || count < 0 {
                tracing::error!("precharge notification missing buffer parameters");
                return;
            }
            let mut decoder = lock_decoder(decoder);
            for buffer_id in start..start + count {
                decoder.push_empty_buffer(buffer_id as u32);
            }
            tracing::debug!(
                count,
                queue_len = decoder.num_empty_buffers(),
                "precharged empty buffers"
            );
        }
        (MsgType::Notify, MsgVal::FrameRelease) => {
            let buffer_id = msg.get_param_or::<i64>("buffer_id", -1);
            if buffer_id < 0 {
                tracing::error!("frame release notification missing buffer id");
                return;
            }
            let mut decoder = lock_decoder(decoder);
            decoder.push_empty_buffer(buffer_id as u32);
            tracing::debug!(
                buffer_id,
                queue_len = decoder.num_empty_buffers(),
                "buffer returned to empty queue"
            );
        }
        (msg_type, msg_val) => {
            tracing::error!(?msg_type, ?msg_val, "unexpected message on rx channel");
            let mut reply = IpcMessage::new(MsgType::Nack, msg_val);
            reply.set_param("error", "unexpected message on rx channel");
            send_or_warn(channel, &reply);
        }
    }
}

fn send_or_warn(channel: &Arc<PairChannel>, msg: &IpcMessage) {
    if channel.send(msg).is_err() {
        tracing::warn!("rx channel closed, dropping reply");
    }
}
