//! In-process simulated network for testing without sockets.
//!
//! Endpoints register in a process-global fabric keyed by port. Sends
//! encode through the real wire codec, pass the fabric's loss and delay
//! rules, and arrive at the target engine as freshly decoded messages, so
//! multi-node scenarios (drops, resends, redirects) run inside one test
//! process with realistic framing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::addr::EndPoint;
use crate::engine::RpcEngine;
use crate::error::Result;
use crate::message::Message;
use crate::net::{HeaderFormat, Network, NetworkContext, RpcChannel, Session};
use crate::protocol;

struct SimEndpoint {
    engine: Weak<RpcEngine>,
    net: Weak<SimNetwork>,
}

#[derive(Default)]
struct LossRule {
    drop_next: u32,
    drop_all: bool,
    delay_ms: u64,
}

fn fabric() -> &'static Mutex<HashMap<u16, SimEndpoint>> {
    static FABRIC: OnceLock<Mutex<HashMap<u16, SimEndpoint>>> = OnceLock::new();
    FABRIC.get_or_init(|| Mutex::new(HashMap::new()))
}

fn rules() -> &'static Mutex<HashMap<u16, LossRule>> {
    static RULES: OnceLock<Mutex<HashMap<u16, LossRule>>> = OnceLock::new();
    RULES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Drop the next `count` messages addressed to `ep`.
pub fn drop_next(ep: EndPoint, count: u32) {
    rules().lock().unwrap().entry(ep.port).or_default().drop_next = count;
}

/// Drop every message addressed to `ep` until cleared.
pub fn drop_all(ep: EndPoint, enabled: bool) {
    rules().lock().unwrap().entry(ep.port).or_default().drop_all = enabled;
}

/// Delay every message addressed to `ep` by `delay_ms`.
pub fn set_delay(ep: EndPoint, delay_ms: u64) {
    rules().lock().unwrap().entry(ep.port).or_default().delay_ms = delay_ms;
}

/// Remove all rules for `ep`.
pub fn reset(ep: EndPoint) {
    rules().lock().unwrap().remove(&ep.port);
}

/// Route one message through the fabric. Unknown destinations are black
/// holes, exactly like a peer that dropped off the network.
fn transmit(msg: Message) {
    let to = msg.header.to_addr;

    let delay_ms = {
        let mut rules = rules().lock().unwrap();
        match rules.get_mut(&to.port) {
            Some(rule) if rule.drop_all || rule.drop_next > 0 => {
                if !rule.drop_all {
                    rule.drop_next -= 1;
                }
                debug!(
                    rpc = %msg.header.rpc_name,
                    to = %to,
                    id = msg.header.id,
                    "sim fabric dropped message"
                );
                return;
            }
            Some(rule) => rule.delay_ms,
            None => 0,
        }
    };

    let (engine, net) = {
        let fabric = fabric().lock().unwrap();
        match fabric.get(&to.port) {
            Some(endpoint) => match (endpoint.engine.upgrade(), endpoint.net.upgrade()) {
                (Some(engine), Some(net)) => (engine, net),
                _ => {
                    debug!(to = %to, "sim endpoint is gone, message dropped");
                    return;
                }
            },
            None => {
                debug!(to = %to, "no sim endpoint, message dropped");
                return;
            }
        }
    };

    let bytes = protocol::encode_message(&msg);
    tokio::spawn(async move {
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        match protocol::decode_message(&bytes) {
            Ok((mut decoded, _)) => {
                if decoded.is_request() {
                    let peer = decoded.header.from_addr;
                    decoded.session = Some(Arc::new(SimSession { peer }));
                    engine.on_recv_request(&*net, decoded, 0);
                } else {
                    let id = decoded.header.id;
                    engine.on_recv_reply(&*net, id, Some(decoded), 0);
                }
            }
            Err(e) => warn!(error = %e, "sim frame failed to decode"),
        }
    });
}

/// The session handed to inbound requests; replies re-enter the fabric
/// addressed to the requesting peer.
struct SimSession {
    peer: EndPoint,
}

impl Session for SimSession {
    fn send(&self, msg: Message) {
        transmit(msg);
    }

    fn remote_addr(&self) -> EndPoint {
        self.peer
    }
}

/// A simulated network instance.
pub struct SimNetwork {
    engine: Weak<RpcEngine>,
    channel: RpcChannel,
    header_format: HeaderFormat,
    address: RwLock<EndPoint>,
    self_weak: Weak<SimNetwork>,
}

impl SimNetwork {
    /// Factory entry registered under `"sim"`.
    pub(crate) fn create(ctx: &NetworkContext) -> Result<Arc<dyn Network>> {
        let engine = ctx.engine.clone();
        let channel = ctx.channel;
        let header_format = ctx.header_format;
        let net = Arc::new_cyclic(|weak| SimNetwork {
            engine,
            channel,
            header_format,
            address: RwLock::new(EndPoint::INVALID),
            self_weak: weak.clone(),
        });
        Ok(net)
    }
}

#[async_trait]
impl Network for SimNetwork {
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
        let address = EndPoint::localhost(port);
        *self.address.write().unwrap() = address;

        let mut fabric = fabric().lock().unwrap();
        if let Some(existing) = fabric.get(&port) {
            if existing.engine.upgrade().is_some() {
                warn!(port, "sim endpoint re-registered over a live one");
            }
        }
        fabric.insert(
            port,
            SimEndpoint {
                engine: self.engine.clone(),
                net: self.self_weak.clone(),
            },
        );
        debug!(port, client_only, "sim network started");
        Ok(())
    }

    fn send_message(&self, msg: Message) {
        transmit(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskCode;

    fn context() -> NetworkContext {
        NetworkContext {
            engine: Weak::new(),
            channel: RpcChannel::Tcp,
            header_format: HeaderFormat::Native,
            buffer_block_size: 65536,
        }
    }

    #[tokio::test]
    async fn test_start_records_address() {
        let net = SimNetwork::create(&context()).unwrap();
        net.start(45901, false).await.unwrap();
        assert_eq!(net.address(), EndPoint::localhost(45901));
    }

    #[tokio::test]
    async fn test_send_to_unknown_port_is_a_black_hole() {
        let net = SimNetwork::create(&context()).unwrap();
        net.start(45902, true).await.unwrap();

        let code = TaskCode::register("RPC_SIM_TEST_BLACK_HOLE");
        let mut msg = Message::request(code);
        msg.header.from_addr = EndPoint::localhost(45902);
        msg.header.to_addr = EndPoint::localhost(45999);
        // nothing listens on 45999; the send must simply vanish
        net.send_message(msg);
    }

    #[test]
    fn test_loss_rules_are_consumed() {
        let ep = EndPoint::localhost(45903);
        drop_next(ep, 2);
        {
            let mut rules = rules().lock().unwrap();
            let rule = rules.get_mut(&ep.port).unwrap();
            assert_eq!(rule.drop_next, 2);
        }
        reset(ep);
        assert!(rules().lock().unwrap().get(&ep.port).is_none());
    }
}
