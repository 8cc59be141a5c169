//! RX service driven over a loopback UDP socket against a real shared
//! memory pool, with the test standing in for the receiver controller on
//! the pair channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use aperture_common::channel::PairChannel;
use aperture_common::context::IpcContext;
use aperture_common::message::{IpcMessage, MsgType, MsgVal};
use aperture_common::reactor::ReactorEvent;
use aperture_common::shm::SharedBufferManager;
use aperture_common::slot::FrameHeader;
use aperture_receiver::config::ReceiverConfig;
use aperture_receiver::dummy_udp::PacketHeader;
use aperture_receiver::registry::create_decoder;
use aperture_receiver::rx_service::RxService;

fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "aperture-rxsvc-{tag}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

struct TestRig {
    events: mpsc::UnboundedReceiver<ReactorEvent>,
    channel: Arc<PairChannel>,
    pool: Arc<SharedBufferManager>,
    port: u16,
    handle: aperture_receiver::rx_service::RxServiceHandle,
    task: tokio::task::JoinHandle<()>,
}

async fn start_service(tag: &str, packets_per_frame: u64, timeout_ms: u64, slots: u64) -> TestRig {
    let shm_name = unique_name(tag);
    let config = ReceiverConfig {
        rx_ports: vec![0],
        rx_address: "127.0.0.1".into(),
        shared_buffer_name: shm_name.clone(),
        decoder_config: serde_json::json!({
            "udp_packets_per_frame": packets_per_frame,
            "udp_packet_size": 64,
            "frame_timeout_ms": timeout_ms,
        }),
        tick_period_ms: 20,
        ..ReceiverConfig::default()
    };

    let mut decoder = create_decoder(&config.decoder).unwrap();
    let mut decoder_config = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
    *decoder_config.params_mut() = config.decoder_config.clone();
    decoder.init(&decoder_config).unwrap();

    let pool = Arc::new(
        SharedBufferManager::create(&shm_name, slots, decoder.frame_buffer_size() as u64).unwrap(),
    );

    let ctx = IpcContext::new();
    let mut controller_side = PairChannel::bind(&ctx, &config.rx_channel_endpoint).unwrap();
    let events = controller_side.take_events().unwrap();

    let service = RxService::bind(&config, ctx, decoder, pool.clone())
        .await
        .unwrap();
    let port = service.local_ports()[0];
    let handle = service.handle();
    let task = tokio::spawn(async move {
        let mut service = service;
        service.run().await.unwrap();
    });

    TestRig {
        events,
        channel: Arc::new(controller_side),
        pool,
        port,
        handle,
        task,
    }
}

async fn next_message(events: &mut mpsc::UnboundedReceiver<ReactorEvent>) -> IpcMessage {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for rx channel message")
            .expect("rx channel closed");
        if let ReactorEvent::Message(data) = event {
            return IpcMessage::from_json(&String::from_utf8_lossy(&data), true).unwrap();
        }
    }
}

/// Wait for a message of the given type and value, skipping periodic
/// status notifications and other chatter.
async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<ReactorEvent>,
    msg_type: MsgType,
    val: MsgVal,
) -> IpcMessage {
    for _ in 0..50 {
        let msg = next_message(events).await;
        if msg.msg_type() == msg_type && msg.msg_val() == val {
            return msg;
        }
    }
    panic!("{msg_type:?}:{val:?} never arrived");
}

fn send_udp(port: u16, frame: u32, packet: u32, sof: bool, eof: bool, payload: &[u8]) {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut datagram = PacketHeader::encode(frame, packet, sof, eof).to_vec();
    datagram.extend_from_slice(payload);
    socket
        .send_to(&datagram, ("127.0.0.1", port))
        .expect("udp send failed");
}

fn precharge(channel: &PairChannel, start: u32, count: u32) {
    let mut msg = IpcMessage::new(MsgType::Notify, MsgVal::BufferPrecharge);
    msg.set_param("start_buffer_id", start);
    msg.set_param("num_buffers", count);
    channel.send(&msg).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn single_packet_frame_flows_end_to_end() {
    let mut rig = start_service("single", 1, 1000, 4).await;

    // Startup handshake: identity, then a precharge request because the
    // empty queue starts empty.
    wait_for(&mut rig.events, MsgType::Notify, MsgVal::Identity).await;
    wait_for(&mut rig.events, MsgType::Cmd, MsgVal::BufferPrechargeRequest).await;
    precharge(&rig.channel, 0, 4);
    // Let the precharge land before any frame data arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Scenario: one SOF+EOF packet completes frame 0 into buffer 0.
    let payload: Vec<u8> = (0..32u8).collect();
    send_udp(rig.port, 0, 0, true, true, &payload);
    let ready = wait_for(&mut rig.events, MsgType::Notify, MsgVal::FrameReady).await;
    assert_eq!(ready.get_param::<u32>("frame").unwrap(), 0);
    let buffer_id = ready.get_param::<u32>("buffer_id").unwrap();
    assert_eq!(buffer_id, 0);

    // Slot payload matches what was sent.
    let slot = rig.pool.slot_bytes(buffer_id).unwrap();
    assert_eq!(&slot[FrameHeader::SIZE..FrameHeader::SIZE + 32], &payload[..]);

    // Release the slot and check it is accounted as empty again.
    let mut release = IpcMessage::new(MsgType::Notify, MsgVal::FrameRelease);
    release.set_param("buffer_id", buffer_id);
    release.set_param("frame", 0u32);
    rig.channel.send(&release).unwrap();

    let mut status_req = IpcMessage::new(MsgType::Cmd, MsgVal::Status);
    status_req.set_msg_id(7);
    rig.channel.send(&status_req).unwrap();
    let status = wait_for(&mut rig.events, MsgType::Ack, MsgVal::Status).await;
    assert_eq!(status.get_param::<u64>("rx_thread/empty_buffers").unwrap(), 4);
    assert_eq!(status.get_param::<u64>("rx_thread/mapped_buffers").unwrap(), 0);
    assert_eq!(status.get_param::<u64>("decoder/packets_received").unwrap(), 1);

    rig.handle.stop();
    rig.task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn out_of_order_packets_complete_and_timeouts_flush() {
    let mut rig = start_service("ooo", 2, 300, 2).await;
    wait_for(&mut rig.events, MsgType::Cmd, MsgVal::BufferPrechargeRequest).await;
    precharge(&rig.channel, 0, 2);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Frame 5 arrives EOF-packet first.
    send_udp(rig.port, 5, 1, false, true, &[2; 16]);
    send_udp(rig.port, 5, 0, true, false, &[1; 16]);
    let ready = wait_for(&mut rig.events, MsgType::Notify, MsgVal::FrameReady).await;
    assert_eq!(ready.get_param::<u32>("frame").unwrap(), 5);

    // Frame 7 only ever gets one of its two packets; the monitor flushes
    // it as timed out.
    send_udp(rig.port, 7, 0, true, false, &[3; 16]);
    let ready = wait_for(&mut rig.events, MsgType::Notify, MsgVal::FrameReady).await;
    assert_eq!(ready.get_param::<u32>("frame").unwrap(), 7);

    let status_req = IpcMessage::new(MsgType::Cmd, MsgVal::Status);
    rig.channel.send(&status_req).unwrap();
    let status = wait_for(&mut rig.events, MsgType::Ack, MsgVal::Status).await;
    assert_eq!(status.get_param::<u64>("rx_thread/frames_timedout").unwrap(), 1);
    assert_eq!(status.get_param::<u64>("decoder/packets_lost").unwrap(), 1);

    rig.handle.stop();
    rig.task.await.unwrap();
}
