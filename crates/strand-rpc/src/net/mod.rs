//! Abstract network layer: transport traits, the factory/aspect builder,
//! and the concrete backends.
//!
//! A network instance serves exactly one `(header format, channel)` pair on
//! the client side, or one `(port, channel)` pair on the server side. The
//! engine owns one table of each and picks the instance per message.

pub mod sim;
pub mod tcp;

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::addr::EndPoint;
use crate::engine::RpcEngine;
use crate::error::{Result, RpcError};
use crate::message::Message;

/// Wire header formats. Independent from the channel; `(format, channel)`
/// selects one client network instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderFormat {
    /// No format; unset.
    Invalid,
    /// The native Strand binary header.
    Native,
}

impl HeaderFormat {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            HeaderFormat::Invalid => 0,
            HeaderFormat::Native => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> HeaderFormat {
        match v {
            1 => HeaderFormat::Native,
            _ => HeaderFormat::Invalid,
        }
    }
}

/// Transport channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcChannel {
    /// Stream transport; connection oriented.
    Tcp,
    /// Datagram transport; replies route by the sender's server port.
    Udp,
}

impl RpcChannel {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            RpcChannel::Tcp => 0,
            RpcChannel::Udp => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> RpcChannel {
        match v {
            1 => RpcChannel::Udp,
            _ => RpcChannel::Tcp,
        }
    }
}

/// A connection-oriented peer session bound to inbound requests; replies
/// prefer it over the network tables.
pub trait Session: Send + Sync {
    /// Send a message back over this session. Ownership transfers to the
    /// session until the bytes are out or dropped.
    fn send(&self, msg: Message);

    /// Address of the remote peer.
    fn remote_addr(&self) -> EndPoint;
}

/// A network instance: one transport backend bound to one channel and one
/// header format.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    /// The channel this instance serves.
    fn channel(&self) -> RpcChannel;

    /// The header format this instance frames with.
    fn header_format(&self) -> HeaderFormat;

    /// The local address of this instance, valid after `start`.
    fn address(&self) -> EndPoint;

    /// Bind and start serving. `client_only` instances open no listener.
    async fn start(&self, port: u16, client_only: bool) -> Result<()>;

    /// Hand a message to the network for transmission. Ownership transfers
    /// to the network until it is sent or dropped.
    fn send_message(&self, msg: Message);

    /// Notify the transport's failure model that a message was dropped by
    /// fault injection, so drops look like genuine loss.
    fn inject_drop(&self, msg: Message, is_send: bool) {
        debug!(
            rpc = %msg.header.rpc_name,
            trace_id = format_args!("{:016x}", msg.header.trace_id),
            is_send,
            "message dropped by fault injection"
        );
    }
}

/// Inputs a network factory needs to construct an instance.
#[derive(Clone)]
pub struct NetworkContext {
    /// The owning engine; networks deliver inbound messages through it.
    pub engine: Weak<RpcEngine>,
    /// Channel the instance will serve.
    pub channel: RpcChannel,
    /// Header format the instance will frame with.
    pub header_format: HeaderFormat,
    /// Receive buffer block size hint.
    pub buffer_block_size: usize,
}

/// Constructs a network instance from its context.
pub type NetworkFactory = Arc<dyn Fn(&NetworkContext) -> Result<Arc<dyn Network>> + Send + Sync>;

/// Wraps a network instance with a decorator layer.
pub type AspectFactory = Arc<dyn Fn(Arc<dyn Network>) -> Arc<dyn Network> + Send + Sync>;

/// Resolves configured factory and aspect names into network stacks, once,
/// at engine start.
pub struct NetworkBuilder {
    factories: HashMap<String, NetworkFactory>,
    aspects: HashMap<String, AspectFactory>,
}

impl NetworkBuilder {
    /// A builder with the built-in backends (`"tcp"`, `"sim"`) and the
    /// built-in `"trace"` aspect registered.
    pub fn new() -> Self {
        let mut b = NetworkBuilder {
            factories: HashMap::new(),
            aspects: HashMap::new(),
        };
        b.register_factory("tcp", Arc::new(|ctx| tcp::TcpNetwork::create(ctx)));
        b.register_factory("sim", Arc::new(|ctx| sim::SimNetwork::create(ctx)));
        b.register_aspect("trace", Arc::new(|inner| Arc::new(TraceAspect { inner })));
        b
    }

    /// Register a custom backend under `name`.
    pub fn register_factory(&mut self, name: impl Into<String>, factory: NetworkFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Register a custom aspect under `name`.
    pub fn register_aspect(&mut self, name: impl Into<String>, aspect: AspectFactory) {
        self.aspects.insert(name.into(), aspect);
    }

    /// Build one network stack: the named backend wrapped by the named
    /// aspects in configured order.
    pub fn build(
        &self,
        factory: &str,
        aspect_names: &[String],
        ctx: &NetworkContext,
    ) -> Result<Arc<dyn Network>> {
        let make = self
            .factories
            .get(factory)
            .ok_or_else(|| RpcError::UnknownFactory(factory.to_string()))?;
        let mut net = make(ctx)?;
        for name in aspect_names {
            let wrap = self
                .aspects
                .get(name)
                .ok_or_else(|| RpcError::UnknownAspect(name.clone()))?;
            net = wrap(net);
        }
        Ok(net)
    }
}

impl Default for NetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in aspect that logs every outbound message before delegating.
struct TraceAspect {
    inner: Arc<dyn Network>,
}

#[async_trait]
impl Network for TraceAspect {
    fn channel(&self) -> RpcChannel {
        self.inner.channel()
    }

    fn header_format(&self) -> HeaderFormat {
        self.inner.header_format()
    }

    fn address(&self) -> EndPoint {
        self.inner.address()
    }

    async fn start(&self, port: u16, client_only: bool) -> Result<()> {
        self.inner.start(port, client_only).await
    }

    fn send_message(&self, msg: Message) {
        debug!(
            rpc = %msg.header.rpc_name,
            to = %msg.header.to_addr,
            id = msg.header.id,
            trace_id = format_args!("{:016x}", msg.header.trace_id),
            "send"
        );
        self.inner.send_message(msg);
    }

    fn inject_drop(&self, msg: Message, is_send: bool) {
        self.inner.inject_drop(msg, is_send);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_and_format_round_trip() {
        for c in [RpcChannel::Tcp, RpcChannel::Udp] {
            assert_eq!(RpcChannel::from_u8(c.as_u8()), c);
        }
        for f in [HeaderFormat::Invalid, HeaderFormat::Native] {
            assert_eq!(HeaderFormat::from_u8(f.as_u8()), f);
        }
    }

    #[test]
    fn test_builder_rejects_unknown_names() {
        let builder = NetworkBuilder::new();
        let ctx = NetworkContext {
            engine: Weak::new(),
            channel: RpcChannel::Tcp,
            header_format: HeaderFormat::Native,
            buffer_block_size: 65536,
        };
        assert!(matches!(
            builder.build("no-such-backend", &[], &ctx),
            Err(RpcError::UnknownFactory(_))
        ));
        assert!(matches!(
            builder.build("sim", &["no-such-aspect".to_string()], &ctx),
            Err(RpcError::UnknownAspect(_))
        ));
    }

    #[test]
    fn test_builder_builds_sim_with_trace_aspect() {
        let builder = NetworkBuilder::new();
        let ctx = NetworkContext {
            engine: Weak::new(),
            channel: RpcChannel::Tcp,
            header_format: HeaderFormat::Native,
            buffer_block_size: 65536,
        };
        let net = builder.build("sim", &["trace".to_string()], &ctx).unwrap();
        assert_eq!(net.channel(), RpcChannel::Tcp);
        assert_eq!(net.header_format(), HeaderFormat::Native);
    }
}
