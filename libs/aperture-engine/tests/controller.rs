//! ProcessorController configuration dispatch over a live control
//! endpoint.

use std::time::Duration;

use serde_json::json;

use aperture_common::channel::RequestChannel;
use aperture_common::message::{IpcMessage, MsgType, MsgVal};
use aperture_engine::controller::ProcessorController;

async fn start_controller() -> (RequestChannel, tokio::task::JoinHandle<()>) {
    let controller = ProcessorController::bind("tcp://127.0.0.1:0").await.unwrap();
    let addr = controller.ctrl_addr();
    let task = tokio::spawn(async move {
        controller.run(Vec::new()).await.unwrap();
    });
    let ctrl = RequestChannel::connect(&format!("tcp://{addr}"))
        .await
        .unwrap();
    (ctrl, task)
}

async fn configure(ctrl: &mut RequestChannel, params: serde_json::Value) -> IpcMessage {
    let mut msg = IpcMessage::new(MsgType::Cmd, MsgVal::Configure);
    *msg.params_mut() = params;
    ctrl.request(&msg).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn plugin_graph_lifecycle_and_introspection() {
    let (mut ctrl, task) = start_controller().await;

    // Load two plugins and connect them in one envelope each.
    let reply = configure(
        &mut ctrl,
        json!({"plugin": {"load": {"index": "a", "name": "passthrough"}}}),
    )
    .await;
    assert_eq!(reply.msg_type(), MsgType::Ack);

    let reply = configure(
        &mut ctrl,
        json!({"plugin": {"load": {"index": "b", "name": "sum"}}}),
    )
    .await;
    assert_eq!(reply.msg_type(), MsgType::Ack);

    let reply = configure(
        &mut ctrl,
        json!({"plugin": {"connect": {"index": "b", "connection": "a"}}}),
    )
    .await;
    assert_eq!(reply.msg_type(), MsgType::Ack);

    // A cycle is rejected with a nack.
    let reply = configure(
        &mut ctrl,
        json!({"plugin": {"connect": {"index": "a", "connection": "b"}}}),
    )
    .await;
    assert_eq!(reply.msg_type(), MsgType::Nack);
    assert!(
        reply
            .get_param::<String>("error")
            .unwrap()
            .contains("cycle")
    );

    // Duplicate index and unknown plugin name are rejected.
    let reply = configure(
        &mut ctrl,
        json!({"plugin": {"load": {"index": "a", "name": "passthrough"}}}),
    )
    .await;
    assert_eq!(reply.msg_type(), MsgType::Nack);
    let reply = configure(
        &mut ctrl,
        json!({"plugin": {"load": {"index": "x", "name": "no_such_plugin"}}}),
    )
    .await;
    assert_eq!(reply.msg_type(), MsgType::Nack);

    // Connecting to the frame receiver before fr_setup is a nack.
    let reply = configure(
        &mut ctrl,
        json!({"plugin": {"connect": {"index": "a", "connection": "frame_receiver"}}}),
    )
    .await;
    assert_eq!(reply.msg_type(), MsgType::Nack);

    // Plugin-specific keys are forwarded to the named plugin.
    let reply = configure(&mut ctrl, json!({"a": {"anything": 1}})).await;
    assert_eq!(reply.msg_type(), MsgType::Ack);

    // Status lists the plugins and their counters.
    let status = ctrl
        .request(&IpcMessage::new(MsgType::Cmd, MsgVal::Status))
        .await
        .unwrap();
    let names = status.get_raw("plugins/names").unwrap();
    assert_eq!(names.as_array().unwrap().len(), 2);
    assert_eq!(status.get_param::<u64>("a/frames_processed").unwrap(), 0);
    assert_eq!(status.get_param::<u64>("frames/processed").unwrap(), 0);

    // Introspection replies.
    let version = ctrl
        .request(&IpcMessage::new(MsgType::Cmd, MsgVal::RequestVersion))
        .await
        .unwrap();
    assert!(version.has_param("version/major"));
    assert!(version.has_param("version/plugins/a/major"));

    let commands = ctrl
        .request(&IpcMessage::new(MsgType::Cmd, MsgVal::RequestCommands))
        .await
        .unwrap();
    let commands = commands.get_raw("commands").unwrap();
    assert!(
        commands
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "fr_setup")
    );

    let config_reply = ctrl
        .request(&IpcMessage::new(MsgType::Cmd, MsgVal::RequestConfiguration))
        .await
        .unwrap();
    assert!(config_reply.has_param("frames"));

    // Shutdown ends the controller task.
    let reply = ctrl
        .request(&IpcMessage::new(MsgType::Cmd, MsgVal::Shutdown))
        .await
        .unwrap();
    assert_eq!(reply.msg_type(), MsgType::Ack);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("controller did not shut down")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stored_configurations_replay_on_execute() {
    let (mut ctrl, task) = start_controller().await;

    let reply = configure(
        &mut ctrl,
        json!({"store": {"name": "setup", "config": {
            "plugin": {"load": {"index": "c", "name": "sum"}}
        }}}),
    )
    .await;
    assert_eq!(reply.msg_type(), MsgType::Ack);

    // Nothing loaded yet.
    let status = ctrl
        .request(&IpcMessage::new(MsgType::Cmd, MsgVal::Status))
        .await
        .unwrap();
    assert!(status.get_raw("plugins/names").is_err());

    let reply = configure(&mut ctrl, json!({"execute": {"name": "setup"}})).await;
    assert_eq!(reply.msg_type(), MsgType::Ack);

    let status = ctrl
        .request(&IpcMessage::new(MsgType::Cmd, MsgVal::Status))
        .await
        .unwrap();
    assert_eq!(
        status.get_raw("plugins/names").unwrap().as_array().unwrap()[0],
        "c"
    );

    // Executing an unknown name is a nack.
    let reply = configure(&mut ctrl, json!({"execute": {"name": "nope"}})).await;
    assert_eq!(reply.msg_type(), MsgType::Nack);

    let _ = ctrl
        .request(&IpcMessage::new(MsgType::Cmd, MsgVal::Shutdown))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("controller did not shut down")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_and_non_command_messages_get_nacks() {
    let (mut ctrl, task) = start_controller().await;

    let notify = IpcMessage::new(MsgType::Notify, MsgVal::Status);
    let reply = ctrl.request(&notify).await.unwrap();
    assert_eq!(reply.msg_type(), MsgType::Nack);

    let _ = ctrl
        .request(&IpcMessage::new(MsgType::Cmd, MsgVal::Shutdown))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("controller did not shut down")
        .unwrap();
}
