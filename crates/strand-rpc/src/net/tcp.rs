//! TCP network backend.
//!
//! Client side: one session per peer, created on first send. A session
//! owns an outbound queue drained by a writer task, plus a reader task
//! that demuxes reply frames into the engine's matcher. A session that
//! fails to connect or breaks mid-stream reports a terminal network
//! failure for every request it still holds, then removes itself so the
//! next send reconnects.
//!
//! Server side: an accept loop binds each inbound connection to a session
//! that requests carry back to the reply path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::addr::EndPoint;
use crate::engine::RpcEngine;
use crate::error::Result;
use crate::message::Message;
use crate::net::{HeaderFormat, Network, NetworkContext, RpcChannel, Session};
use crate::protocol::{self, FIXED_HEADER_SIZE};

/// TCP-backed network instance.
pub struct TcpNetwork {
    engine: Weak<RpcEngine>,
    channel: RpcChannel,
    header_format: HeaderFormat,
    address: RwLock<EndPoint>,
    sessions: Mutex<HashMap<EndPoint, Arc<TcpClientSession>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    self_weak: Weak<TcpNetwork>,
}

impl TcpNetwork {
    /// Factory entry registered under `"tcp"`.
    pub(crate) fn create(ctx: &NetworkContext) -> Result<Arc<dyn Network>> {
        let engine = ctx.engine.clone();
        let channel = ctx.channel;
        let header_format = ctx.header_format;
        let net = Arc::new_cyclic(|weak| TcpNetwork {
            engine,
            channel,
            header_format,
            address: RwLock::new(EndPoint::INVALID),
            sessions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            self_weak: weak.clone(),
        });
        Ok(net)
    }

    fn session_for(&self, peer: EndPoint) -> Arc<TcpClientSession> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get(&peer) {
            return session.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(TcpClientSession { tx });
        sessions.insert(peer, session.clone());

        let engine = self.engine.clone();
        let net = self.self_weak.clone();
        let handle = tokio::spawn(async move {
            client_session_driver(engine, net, peer, rx).await;
        });
        self.tasks.lock().unwrap().push(handle);
        session
    }

    fn drop_session(&self, peer: EndPoint) {
        self.sessions.lock().unwrap().remove(&peer);
    }
}

#[async_trait]
impl Network for TcpNetwork {
    fn channel(&self) -> RpcChannel {
        self.channel
    }

    fn header_format(&self) -> HeaderFormat {
        self.header_format
    }

    fn address(&self) -> EndPoint {
        *self.address.read().unwrap()
    }

    async fn start(&self, port: u16, client_only: bool) -> Result<()> {
        *self.address.write().unwrap() = EndPoint::localhost(port);
        if client_only {
            return Ok(());
        }

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let engine = self.engine.clone();
        let net = self.self_weak.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed, listener stopping");
                        break;
                    }
                };
                debug!(peer = %peer_addr, "accepted connection");
                let _ = stream.set_nodelay(true);
                let peer = match peer_addr {
                    SocketAddr::V4(v4) => EndPoint::from(v4),
                    SocketAddr::V6(_) => {
                        warn!(peer = %peer_addr, "ipv6 peer rejected");
                        continue;
                    }
                };
                let (read_half, write_half) = stream.into_split();
                let (tx, rx) = mpsc::unbounded_channel();
                let session = Arc::new(TcpServerSession { peer, tx });
                tokio::spawn(write_loop(rx, write_half));
                tokio::spawn(server_read_loop(
                    engine.clone(),
                    net.clone(),
                    session,
                    read_half,
                ));
            }
        });
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    fn send_message(&self, msg: Message) {
        let peer = msg.header.to_addr;
        let session = self.session_for(peer);
        if let Err(err) = session.tx.send(msg) {
            // the driver already exited; retry once through a fresh session
            self.drop_session(peer);
            let session = self.session_for(peer);
            if let Err(err) = session.tx.send(err.0) {
                debug!(to = %peer, id = err.0.header.id, "send failed, message dropped");
            }
        }
    }
}

impl Drop for TcpNetwork {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

struct TcpClientSession {
    tx: mpsc::UnboundedSender<Message>,
}

struct TcpServerSession {
    peer: EndPoint,
    tx: mpsc::UnboundedSender<Message>,
}

impl Session for TcpServerSession {
    fn send(&self, msg: Message) {
        if self.tx.send(msg).is_err() {
            debug!(peer = %self.peer, "reply dropped, connection closed");
        }
    }

    fn remote_addr(&self) -> EndPoint {
        self.peer
    }
}

/// Report a terminal failure for a request the session could not deliver.
fn notify_failure(engine: &Weak<RpcEngine>, net: &Weak<TcpNetwork>, msg: Message) {
    if !msg.is_request() {
        return;
    }
    if let (Some(engine), Some(net)) = (engine.upgrade(), net.upgrade()) {
        engine.on_recv_reply(&*net, msg.header.id, None, 0);
    }
}

async fn client_session_driver(
    engine: Weak<RpcEngine>,
    net: Weak<TcpNetwork>,
    peer: EndPoint,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    let stream = match TcpStream::connect(SocketAddr::from(peer)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = %peer, error = %e, "connect failed");
            if let Some(net) = net.upgrade() {
                net.drop_session(peer);
            }
            rx.close();
            while let Ok(msg) = rx.try_recv() {
                notify_failure(&engine, &net, msg);
            }
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    debug!(peer = %peer, "connected");
    let (read_half, mut write_half) = stream.into_split();

    {
        let engine = engine.clone();
        let net = net.clone();
        tokio::spawn(client_read_loop(engine, net, read_half));
    }

    while let Some(msg) = rx.recv().await {
        let bytes = protocol::encode_message(&msg);
        if let Err(e) = write_half.write_all(&bytes).await {
            warn!(peer = %peer, error = %e, "write failed, session closing");
            notify_failure(&engine, &net, msg);
            break;
        }
    }
    if let Some(net) = net.upgrade() {
        net.drop_session(peer);
    }
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        notify_failure(&engine, &net, msg);
    }
}

async fn read_frame(read: &mut OwnedReadHalf) -> Result<Message> {
    let mut fixed = [0u8; FIXED_HEADER_SIZE];
    read.read_exact(&mut fixed).await?;
    let total = protocol::total_frame_len(&fixed)?;
    let mut frame = vec![0u8; total];
    frame[..FIXED_HEADER_SIZE].copy_from_slice(&fixed);
    if total > FIXED_HEADER_SIZE {
        read.read_exact(&mut frame[FIXED_HEADER_SIZE..]).await?;
    }
    let (msg, _) = protocol::decode_message(&frame)?;
    Ok(msg)
}

async fn client_read_loop(
    engine: Weak<RpcEngine>,
    net: Weak<TcpNetwork>,
    mut read: OwnedReadHalf,
) {
    loop {
        let msg = match read_frame(&mut read).await {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "client connection closed");
                break;
            }
        };
        let (Some(engine), Some(net)) = (engine.upgrade(), net.upgrade()) else {
            break;
        };
        if msg.is_request() {
            warn!(rpc = %msg.header.rpc_name, "request on a client connection dropped");
            continue;
        }
        let id = msg.header.id;
        engine.on_recv_reply(&*net, id, Some(msg), 0);
    }
}

async fn server_read_loop(
    engine: Weak<RpcEngine>,
    net: Weak<TcpNetwork>,
    session: Arc<TcpServerSession>,
    mut read: OwnedReadHalf,
) {
    loop {
        let mut msg = match read_frame(&mut read).await {
            Ok(msg) => msg,
            Err(e) => {
                debug!(peer = %session.peer, error = %e, "server connection closed");
                break;
            }
        };
        let (Some(engine), Some(net)) = (engine.upgrade(), net.upgrade()) else {
            break;
        };
        if msg.is_request() {
            msg.session = Some(session.clone());
            engine.on_recv_request(&*net, msg, 0);
        } else {
            let id = msg.header.id;
            engine.on_recv_reply(&*net, id, Some(msg), 0);
        }
    }
}

async fn write_loop(mut rx: mpsc::UnboundedReceiver<Message>, mut write: OwnedWriteHalf) {
    while let Some(msg) = rx.recv().await {
        let bytes = protocol::encode_message(&msg);
        if let Err(e) = write.write_all(&bytes).await {
            debug!(error = %e, "write failed, connection closing");
            break;
        }
    }
}
