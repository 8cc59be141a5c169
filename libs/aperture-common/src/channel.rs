use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, tcp};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::context::{Endpoint, IpcContext, PairHalf};
use crate::error::ChannelError;
use crate::message::IpcMessage;
use crate::reactor::{ChannelEvents, ReactorEvent};

/// Upper bound on a single framed message; guards the length prefix
/// against corrupt peers.
const MAX_FRAME: u32 = 16 * 1024 * 1024;

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read one length-prefixed frame; `None` on a clean EOF at a frame
/// boundary.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

fn spawn_conn_writer(
    mut writer: tcp::OwnedWriteHalf,
    peer: SocketAddr,
) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &bytes).await {
                tracing::debug!(peer = %peer, error = %e, "connection write failed");
                break;
            }
        }
    });
    tx
}

/// Bidirectional in-process channel connecting two reactors, e.g. the RX
/// thread and the receiver controller. One side binds the endpoint, the
/// other connects.
pub struct PairChannel {
    tx: mpsc::UnboundedSender<ReactorEvent>,
    rx: Option<ChannelEvents>,
}

impl PairChannel {
    pub fn bind(ctx: &IpcContext, endpoint: &str) -> Result<Self, ChannelError> {
        let name = inproc_name(endpoint)?;
        let (bind_tx, conn_rx) = mpsc::unbounded_channel();
        let (conn_tx, bind_rx) = mpsc::unbounded_channel();
        ctx.publish_pair(
            &name,
            PairHalf {
                tx: conn_tx,
                rx: conn_rx,
            },
        );
        Ok(Self {
            tx: bind_tx,
            rx: Some(bind_rx),
        })
    }

    pub fn connect(ctx: &IpcContext, endpoint: &str) -> Result<Self, ChannelError> {
        let name = inproc_name(endpoint)?;
        let half = ctx
            .take_pair(&name)
            .ok_or_else(|| ChannelError::NoPeer(name.clone()))?;
        Ok(Self {
            tx: half.tx,
            rx: Some(half.rx),
        })
    }

    pub fn send(&self, msg: &IpcMessage) -> Result<(), ChannelError> {
        self.tx
            .send(ReactorEvent::Message(msg.encode().into_bytes()))
            .map_err(|_| ChannelError::Closed)
    }

    /// Hand the receive side to a reactor. Yields `None` after the first
    /// call.
    pub fn take_events(&mut self) -> Option<ChannelEvents> {
        self.rx.take()
    }
}

fn inproc_name(endpoint: &str) -> Result<String, ChannelError> {
    match Endpoint::parse(endpoint)? {
        Endpoint::Inproc(name) => Ok(name),
        Endpoint::Tcp(_) => Err(ChannelError::InvalidEndpoint(format!(
            "{endpoint}: pair channels are in-process only"
        ))),
    }
}

fn tcp_addr(endpoint: &str) -> Result<String, ChannelError> {
    match Endpoint::parse(endpoint)? {
        Endpoint::Tcp(addr) => Ok(addr),
        Endpoint::Inproc(_) => Err(ChannelError::InvalidEndpoint(format!(
            "{endpoint}: expected a tcp endpoint"
        ))),
    }
}

/// Routes a reply back to the connection a request arrived on.
#[derive(Clone)]
pub struct Responder {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Responder {
    pub fn send(&self, msg: &IpcMessage) -> Result<(), ChannelError> {
        self.tx
            .send(msg.encode().into_bytes())
            .map_err(|_| ChannelError::Closed)
    }
}

/// Request/reply server side: binds a TCP endpoint, emits one
/// `ReactorEvent::Request` per inbound envelope.
pub struct ReplyChannel {
    events: Option<ChannelEvents>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl ReplyChannel {
    pub async fn bind(endpoint: &str) -> Result<Self, ChannelError> {
        let addr = tcp_addr(endpoint)?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ChannelError::Bind {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "reply channel accept failed");
                        break;
                    }
                };
                let (mut reader, writer) = stream.into_split();
                let reply_tx = spawn_conn_writer(writer, peer);
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    loop {
                        match read_frame(&mut reader).await {
                            Ok(Some(data)) => {
                                let event = ReactorEvent::Request {
                                    data,
                                    responder: Responder {
                                        tx: reply_tx.clone(),
                                    },
                                };
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::debug!(peer = %peer, error = %e, "reply channel read failed");
                                break;
                            }
                        }
                    }
                });
            }
        });

        Ok(Self {
            events: Some(event_rx),
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn take_events(&mut self) -> Option<ChannelEvents> {
        self.events.take()
    }
}

impl Drop for ReplyChannel {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Request/reply client side.
pub struct RequestChannel {
    stream: TcpStream,
}

impl RequestChannel {
    pub async fn connect(endpoint: &str) -> Result<Self, ChannelError> {
        let addr = tcp_addr(endpoint)?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ChannelError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        Ok(Self { stream })
    }

    pub async fn request(&mut self, msg: &IpcMessage) -> Result<IpcMessage, ChannelError> {
        write_frame(&mut self.stream, msg.encode().as_bytes()).await?;
        let reply = read_frame(&mut self.stream)
            .await?
            .ok_or(ChannelError::Closed)?;
        let text = String::from_utf8_lossy(&reply);
        Ok(IpcMessage::from_json(&text, true)?)
    }
}

/// Fan-out notification sender. Binding broadcasts to every connected
/// peer; connecting feeds a single bound `SubscribeChannel`.
pub struct PublishChannel {
    sinks: Arc<Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl PublishChannel {
    pub async fn bind(endpoint: &str) -> Result<Self, ChannelError> {
        let addr = tcp_addr(endpoint)?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ChannelError::Bind {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let sinks: Arc<Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let accept_sinks = sinks.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "publish channel accept failed");
                        break;
                    }
                };
                let (_, writer) = stream.into_split();
                let tx = spawn_conn_writer(writer, peer);
                lock_sinks(&accept_sinks).push(tx);
            }
        });
        Ok(Self {
            sinks,
            local_addr: Some(local_addr),
            accept_task: Some(accept_task),
        })
    }

    pub async fn connect(endpoint: &str) -> Result<Self, ChannelError> {
        let addr = tcp_addr(endpoint)?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ChannelError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let peer = stream.peer_addr()?;
        let (_, writer) = stream.into_split();
        let tx = spawn_conn_writer(writer, peer);
        Ok(Self {
            sinks: Arc::new(Mutex::new(vec![tx])),
            local_addr: None,
            accept_task: None,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Deliver to every live peer; dead connections are pruned.
    pub fn send(&self, msg: &IpcMessage) {
        self.send_bytes(msg.encode().into_bytes());
    }

    /// Deliver a pre-encoded payload, e.g. meta channel items that do not
    /// use the envelope format.
    pub fn send_bytes(&self, bytes: Vec<u8>) {
        lock_sinks(&self.sinks).retain(|tx| tx.send(bytes.clone()).is_ok());
    }

    pub fn peer_count(&self) -> usize {
        lock_sinks(&self.sinks).len()
    }
}

impl Drop for PublishChannel {
    fn drop(&mut self) {
        if let Some(task) = &self.accept_task {
            task.abort();
        }
    }
}

fn lock_sinks(
    sinks: &Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<Vec<u8>>>> {
    sinks.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("publish sink lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Fan-in notification receiver, the counterpart of `PublishChannel`.
pub struct SubscribeChannel {
    events: Option<ChannelEvents>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl SubscribeChannel {
    pub async fn bind(endpoint: &str) -> Result<Self, ChannelError> {
        let addr = tcp_addr(endpoint)?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ChannelError::Bind {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "subscribe channel accept failed");
                        break;
                    }
                };
                let (mut reader, _writer) = stream.into_split();
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    loop {
                        match read_frame(&mut reader).await {
                            Ok(Some(data)) => {
                                if event_tx.send(ReactorEvent::Message(data)).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::debug!(peer = %peer, error = %e, "subscribe read failed");
                                break;
                            }
                        }
                    }
                });
            }
        });
        Ok(Self {
            events: Some(event_rx),
            local_addr: Some(local_addr),
            accept_task: Some(accept_task),
        })
    }

    pub async fn connect(endpoint: &str) -> Result<Self, ChannelError> {
        let addr = tcp_addr(endpoint)?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ChannelError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let peer = stream.peer_addr()?;
        let (mut reader, _writer) = stream.into_split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(data)) => {
                        if event_tx.send(ReactorEvent::Message(data)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "subscribe read failed");
                        break;
                    }
                }
            }
        });
        Ok(Self {
            events: Some(event_rx),
            local_addr: None,
            accept_task: None,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn take_events(&mut self) -> Option<ChannelEvents> {
        self.events.take()
    }
}

impl Drop for SubscribeChannel {
    fn drop(&mut self) {
        if let Some(task) = &self.accept_task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MsgType, MsgVal};
    use std::time::Duration;

    fn notify(val: MsgVal) -> IpcMessage {
        IpcMessage::new(MsgType::Notify, val)
    }

    async fn next_message(events: &mut ChannelEvents) -> IpcMessage {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("channel closed");
        match event {
            ReactorEvent::Message(data) => {
                IpcMessage::from_json(&String::from_utf8_lossy(&data), true).unwrap()
            }
            _ => panic!("expected message event"),
        }
    }

    #[tokio::test]
    async fn pair_channel_rendezvous() {
        let ctx = IpcContext::new();
        let mut bound = PairChannel::bind(&ctx, "inproc://rx_channel").unwrap();
        let mut connected = PairChannel::connect(&ctx, "inproc://rx_channel").unwrap();

        connected.send(&notify(MsgVal::Identity)).unwrap();
        let mut bound_events = bound.take_events().unwrap();
        let msg = next_message(&mut bound_events).await;
        assert_eq!(msg.msg_val(), MsgVal::Identity);

        bound.send(&notify(MsgVal::FrameRelease)).unwrap();
        let mut conn_events = connected.take_events().unwrap();
        let msg = next_message(&mut conn_events).await;
        assert_eq!(msg.msg_val(), MsgVal::FrameRelease);
    }

    #[tokio::test]
    async fn connect_without_bind_fails() {
        let ctx = IpcContext::new();
        assert!(matches!(
            PairChannel::connect(&ctx, "inproc://nobody"),
            Err(ChannelError::NoPeer(_))
        ));
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let mut server = ReplyChannel::bind("tcp://127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", server.local_addr());
        let mut events = server.take_events().unwrap();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ReactorEvent::Request { data, responder } = event {
                    let msg =
                        IpcMessage::from_json(&String::from_utf8_lossy(&data), true).unwrap();
                    let mut reply = IpcMessage::new(MsgType::Ack, msg.msg_val());
                    reply.set_param("seen", true);
                    responder.send(&reply).unwrap();
                }
            }
        });

        let mut client = RequestChannel::connect(&endpoint).await.unwrap();
        let reply = client
            .request(&IpcMessage::new(MsgType::Cmd, MsgVal::Status))
            .await
            .unwrap();
        assert_eq!(reply.msg_type(), MsgType::Ack);
        assert_eq!(reply.msg_val(), MsgVal::Status);
        assert!(reply.get_param::<bool>("seen").unwrap());
    }

    #[tokio::test]
    async fn bound_publisher_fans_out_to_connected_subscribers() {
        let publisher = PublishChannel::bind("tcp://127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", publisher.local_addr().unwrap());

        let mut sub_a = SubscribeChannel::connect(&endpoint).await.unwrap();
        let mut sub_b = SubscribeChannel::connect(&endpoint).await.unwrap();
        let mut events_a = sub_a.take_events().unwrap();
        let mut events_b = sub_b.take_events().unwrap();

        // Give the accept loop a moment to register both peers.
        for _ in 0..50 {
            if publisher.peer_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut msg = notify(MsgVal::FrameReady);
        msg.set_param("frame", 0u32);
        msg.set_param("buffer_id", 0u32);
        publisher.send(&msg);

        assert_eq!(next_message(&mut events_a).await.msg_val(), MsgVal::FrameReady);
        assert_eq!(next_message(&mut events_b).await.msg_val(), MsgVal::FrameReady);
    }

    #[tokio::test]
    async fn connected_publisher_reaches_bound_subscriber() {
        let mut sub = SubscribeChannel::bind("tcp://127.0.0.1:0").await.unwrap();
        let endpoint = format!("tcp://{}", sub.local_addr().unwrap());
        let publisher = PublishChannel::connect(&endpoint).await.unwrap();

        let mut events = sub.take_events().unwrap();
        let mut msg = notify(MsgVal::FrameRelease);
        msg.set_param("buffer_id", 3u32);
        publisher.send(&msg);

        let received = next_message(&mut events).await;
        assert_eq!(received.msg_val(), MsgVal::FrameRelease);
        assert_eq!(received.get_param::<u32>("buffer_id").unwrap(), 3);
    }
}
