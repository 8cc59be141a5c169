//! Both halves of the pipeline end to end: a frame receiver fed over
//! loopback UDP handing slots through shared memory to a processor whose
//! plugin chain consumes them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;

use aperture_common::channel::RequestChannel;
use aperture_common::message::{IpcMessage, MsgType, MsgVal};
use aperture_engine::controller::ProcessorController;
use aperture_receiver::config::ReceiverConfig;
use aperture_receiver::controller::{BoundEndpoints, ReceiverController};
use aperture_receiver::dummy_udp::PacketHeader;

fn unique_name() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "aperture-pipe-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

async fn start_receiver(shm_name: &str) -> (BoundEndpoints, tokio::task::JoinHandle<()>) {
    let config = ReceiverConfig {
        ctrl_endpoint: "tcp://127.0.0.1:0".into(),
        frame_ready_endpoint: "tcp://127.0.0.1:0".into(),
        frame_release_endpoint: "tcp://127.0.0.1:0".into(),
        rx_ports: vec![0],
        rx_address: "127.0.0.1".into(),
        shared_buffer_name: shm_name.to_string(),
        max_buffer_mem: 20_000,
        decoder_config: json!({
            "udp_packets_per_frame": 1,
            "udp_packet_size": 64,
            "frame_timeout_ms": 200,
        }),
        tick_period_ms: 20,
        ..ReceiverConfig::default()
    };

    let mut controller = ReceiverController::new(config);
    let endpoints = controller.endpoints();
    let task = tokio::spawn(async move {
        controller.run().await.unwrap();
    });
    let bound = loop {
        if let Some(bound) = endpoints.get() {
            break bound.clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    (bound, task)
}

fn fr_setup(shm_name: &str, bound: &BoundEndpoints) -> serde_json::Value {
    json!({"fr_setup": {
        "fr_shared_mem": shm_name,
        "fr_ready_cnxn": format!("tcp://{}", bound.frame_ready),
        "fr_release_cnxn": format!("tcp://{}", bound.frame_release),
        "fr_ctrl_cnxn": format!("tcp://{}", bound.ctrl),
    }})
}

fn send_frame(port: u16, frame: u32) {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut datagram = PacketHeader::encode(frame, 0, true, true).to_vec();
    datagram.extend_from_slice(&[frame as u8; 64]);
    socket.send_to(&datagram, ("127.0.0.1", port)).unwrap();
}

async fn configure(ctrl: &mut RequestChannel, params: serde_json::Value) {
    let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
    *msg.params_mut() = params;
    let reply = ctrl.request(&msg).await.unwrap();
    assert_eq!(
        reply.msg_type(),
        MsgType::Ack,
        "configure rejected: {:?}",
        reply.get_param::<String>("error")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fanned_out_frames_reach_both_plugins_and_release_once() {
    let shm_name = unique_name();
    let (bound, rx_task) = start_receiver(&shm_name).await;

    let processor = ProcessorController::bind("tcp://127.0.0.1:0").await.unwrap();
    let proc_addr = processor.ctrl_addr();
    let proc_shutdown = processor.shutdown_handle();
    let proc_task = tokio::spawn(async move {
        processor.run(Vec::new()).await.unwrap();
    });

    let mut proc_ctrl = RequestChannel::connect(&format!("tcp://{proc_addr}"))
        .await
        .unwrap();
    let mut rx_ctrl = RequestChannel::connect(&format!("tcp://{}", bound.ctrl))
        .await
        .unwrap();

    configure(&mut proc_ctrl, fr_setup(&shm_name, &bound)).await;
    configure(
        &mut proc_ctrl,
        json!({"plugin": {"load": {"index": "a", "name": "passthrough"}}}),
    )
    .await;
    configure(
        &mut proc_ctrl,
        json!({"plugin": {"load": {"index": "b", "name": "passthrough"}}}),
    )
    .await;
    configure(
        &mut proc_ctrl,
        json!({"plugin": {"connect": {"index": "a", "connection": "frame_receiver"}}}),
    )
    .await;
    configure(
        &mut proc_ctrl,
        json!({"plugin": {"connect": {"index": "b", "connection": "frame_receiver"}}}),
    )
    .await;

    // Let the ready subscription register with the receiver's publisher.
    tokio::time::sleep(Duration::from_millis(300)).await;

    send_frame(bound.rx_ports[0], 0);
    send_frame(bound.rx_ports[0], 1);

    // Both plugins see both frames.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = proc_ctrl
            .request(&IpcMessage::new(MsgType::Cmd, MsgVal::Status))
            .await
            .unwrap();
        let a = status.get_param_or::<u64>("a/frames_processed", 0);
        let b = status.get_param_or::<u64>("b/frames_processed", 0);
        if a == 2 && b == 2 {
            assert_eq!(
                status.get_param::<u64>("shared_memory/frames_received").unwrap(),
                2
            );
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "frames never reached the plugins (a={a}, b={b})"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Each frame produced exactly one release: the pool drains back to
    // fully empty on the receiver side.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let status = rx_ctrl
            .request(&IpcMessage::new(MsgType::Cmd, MsgVal::Status))
            .await
            .unwrap();
        if status.get_param_or::<u64>("rx_thread/empty_buffers", 0) == 4 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "slots never returned to the empty queue"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    proc_shutdown.request_shutdown();
    tokio::time::timeout(Duration::from_secs(5), proc_task)
        .await
        .expect("processor did not stop")
        .unwrap();

    let _ = rx_ctrl
        .request(&IpcMessage::new(MsgType::Cmd, MsgVal::Shutdown))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx_task)
        .await
        .expect("receiver did not stop")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn frame_target_shuts_the_processor_down() {
    let shm_name = unique_name();
    let (bound, rx_task) = start_receiver(&shm_name).await;

    let processor = ProcessorController::bind("tcp://127.0.0.1:0").await.unwrap();
    let proc_addr = processor.ctrl_addr();
    let proc_task = tokio::spawn(async move {
        processor.run(Vec::new()).await.unwrap();
    });

    let mut proc_ctrl = RequestChannel::connect(&format!("tcp://{proc_addr}"))
        .await
        .unwrap();

    configure(&mut proc_ctrl, fr_setup(&shm_name, &bound)).await;
    configure(
        &mut proc_ctrl,
        json!({"plugin": {"load": {"index": "sink", "name": "passthrough"}}}),
    )
    .await;
    configure(
        &mut proc_ctrl,
        json!({"plugin": {"connect": {"index": "sink", "connection": "frame_receiver"}}}),
    )
    .await;
    // Count frames of the raw dataset; stop after three.
    configure(&mut proc_ctrl, json!({"frames": 3, "master": "raw"})).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    for frame in 0..3 {
        send_frame(bound.rx_ports[0], frame);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    tokio::time::timeout(Duration::from_secs(10), proc_task)
        .await
        .expect("frame target did not shut the processor down")
        .unwrap();

    let mut rx_ctrl = RequestChannel::connect(&format!("tcp://{}", bound.ctrl))
        .await
        .unwrap();
    let _ = rx_ctrl
        .request(&IpcMessage::new(MsgType::Cmd, MsgVal::Shutdown))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx_task)
        .await
        .expect("receiver did not stop")
        .unwrap();
}
