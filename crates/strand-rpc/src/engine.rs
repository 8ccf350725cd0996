//! The RPC engine: lifecycle, outbound call routing, the reply path, and
//! inbound dispatch.
//!
//! One engine runs per node. Outbound calls flow through [`RpcEngine::call`],
//! which stamps origin and trace identity and routes by destination kind;
//! inbound traffic enters through [`RpcEngine::on_recv_request`] and
//! [`RpcEngine::on_recv_reply`], invoked by network instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::addr::{EndPoint, GroupAddress, HostAddr, UriAddress, MAX_CLIENT_PORT};
use crate::config::EngineConfig;
use crate::dispatch::{HandlerFuture, ServerDispatcher};
use crate::error::{ErrCode, Result, RpcError};
use crate::matcher::{ClientMatcher, ResponseFuture, ResponseTask, TaskState};
use crate::message::{encode_body, Message};
use crate::net::{HeaderFormat, Network, NetworkBuilder, NetworkContext, RpcChannel};
use crate::resolver::{PartitionResolver, UriResolverManager};
use crate::task::{now_ms, GrpcMode, TaskCode};
use crate::worker::WorkerPool;

/// An outbound message, either tracked by a response task or fire-and-forget.
pub(crate) enum Outbound {
    /// The response task owns the canonical request; a reply or timeout
    /// will complete it.
    Tracked(Arc<ResponseTask>),
    /// No reply expected (one-way sends, forwards, matcher resends).
    Untracked(Message),
}

/// Outcome of offering an inbound message to the replication interceptor.
pub enum Intercepted {
    /// The interceptor took the message; run this task on the pool.
    Handled(HandlerFuture),
    /// The message is not replication traffic after all; dispatch normally.
    Pass(Message),
}

/// Intercepts inbound requests carrying a nonzero partition app id, ahead
/// of the regular handler registry.
pub trait RequestInterceptor: Send + Sync + 'static {
    /// Offer one replication-layer request.
    fn intercept(&self, engine: Arc<RpcEngine>, request: Message) -> Intercepted;
}

/// Exponential backoff gap for resolver-level retries, clamped to one
/// second.
pub(crate) fn retry_gap_ms(retry_count: u32) -> u64 {
    (8u64 << retry_count.min(20)).min(1000)
}

/// The per-node RPC engine.
pub struct RpcEngine {
    self_weak: Weak<RpcEngine>,
    config: EngineConfig,
    matcher: ClientMatcher,
    dispatcher: ServerDispatcher,
    resolvers: UriResolverManager,
    builder: RwLock<NetworkBuilder>,
    client_nets: RwLock<HashMap<(HeaderFormat, RpcChannel), Arc<dyn Network>>>,
    server_nets: RwLock<HashMap<(u16, RpcChannel), Arc<dyn Network>>>,
    primary_addr: RwLock<EndPoint>,
    running: AtomicBool,
    serving: AtomicBool,
    workers: WorkerPool,
    interceptor: RwLock<Option<Arc<dyn RequestInterceptor>>>,
}

impl RpcEngine {
    /// Create an engine with the built-in network backends. Must be called
    /// inside a tokio runtime; the worker pool spawns immediately.
    pub fn new(config: EngineConfig) -> Arc<RpcEngine> {
        RpcEngine::with_builder(config, NetworkBuilder::new())
    }

    /// Create an engine with a customized network builder.
    pub fn with_builder(config: EngineConfig, builder: NetworkBuilder) -> Arc<RpcEngine> {
        let workers = WorkerPool::new(format!("{}.rpc", config.node_name), config.worker_count);
        Arc::new_cyclic(|weak| RpcEngine {
            self_weak: weak.clone(),
            config,
            matcher: ClientMatcher::new(),
            dispatcher: ServerDispatcher::new(),
            resolvers: UriResolverManager::new(),
            builder: RwLock::new(builder),
            client_nets: RwLock::new(HashMap::new()),
            server_nets: RwLock::new(HashMap::new()),
            primary_addr: RwLock::new(EndPoint::INVALID),
            running: AtomicBool::new(false),
            serving: AtomicBool::new(false),
            workers,
            interceptor: RwLock::new(None),
        })
    }

    pub(crate) fn weak(&self) -> Weak<RpcEngine> {
        self.self_weak.clone()
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Node name used in log records.
    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    /// The pending-call table.
    pub fn matcher(&self) -> &ClientMatcher {
        &self.matcher
    }

    /// The URI resolver table.
    pub fn resolvers(&self) -> &UriResolverManager {
        &self.resolvers
    }

    /// This node's primary address, valid after [`RpcEngine::start`].
    pub fn primary_address(&self) -> EndPoint {
        *self.primary_addr.read().unwrap()
    }

    /// Whether `start` has completed.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Gate inbound dispatch; messages received while not serving are
    /// dropped.
    pub fn set_serving(&self, on: bool) {
        self.serving.store(on, Ordering::Release);
    }

    /// Install the replication-layer request interceptor.
    pub fn set_request_interceptor(&self, interceptor: Arc<dyn RequestInterceptor>) {
        *self.interceptor.write().unwrap() = Some(interceptor);
    }

    /// Register an inbound request handler. See [`ServerDispatcher::register`].
    pub fn register_handler(
        &self,
        code: TaskCode,
        alias: &str,
        handler: Arc<dyn crate::dispatch::RequestHandler>,
    ) -> bool {
        self.dispatcher.register(code, alias, handler)
    }

    /// Unregister the handler for `code` and its alias.
    pub fn unregister_handler(&self, code: TaskCode) -> bool {
        self.dispatcher.unregister(code)
    }

    /// Start the engine: apply per-code tuning, build and start the client
    /// and server networks, and compute the primary address. Fails with
    /// [`RpcError::AlreadyRunning`] on a second start.
    pub async fn start(&self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Err(RpcError::AlreadyRunning);
        }

        for (name, tuning) in &self.config.tasks {
            TaskCode::register(name).spec().apply(tuning);
        }

        // client networks: one per (header format, configured channel)
        for format in [HeaderFormat::Native] {
            for (&channel, conf) in &self.config.client {
                let ctx = NetworkContext {
                    engine: self.self_weak.clone(),
                    channel,
                    header_format: format,
                    buffer_block_size: conf.buffer_block_size,
                };
                let net = self
                    .builder
                    .read()
                    .unwrap()
                    .build(&conf.factory, &self.config.aspects, &ctx)?;
                net.start(self.config.app_id, true).await?;
                info!(
                    node = %self.config.node_name,
                    channel = ?channel,
                    format = ?format,
                    "client network started"
                );
                self.client_nets
                    .write()
                    .unwrap()
                    .insert((format, channel), net);
            }
        }

        // server networks: one per configured listening port
        for conf in &self.config.server {
            let ctx = NetworkContext {
                engine: self.self_weak.clone(),
                channel: conf.channel,
                header_format: HeaderFormat::Native,
                buffer_block_size: conf.buffer_block_size,
            };
            let net = self
                .builder
                .read()
                .unwrap()
                .build(&conf.factory, &self.config.aspects, &ctx)?;
            net.start(conf.port, false).await?;
            info!(
                node = %self.config.node_name,
                port = conf.port,
                channel = ?conf.channel,
                "server network started"
            );
            self.server_nets
                .write()
                .unwrap()
                .insert((conf.port, conf.channel), net);
        }

        let base = {
            let nets = self.client_nets.read().unwrap();
            nets.get(&(HeaderFormat::Native, RpcChannel::Tcp))
                .or_else(|| nets.values().next())
                .map(|net| net.address())
                .unwrap_or(EndPoint::INVALID)
        };
        let port = self
            .config
            .ports
            .first()
            .copied()
            .unwrap_or(self.config.app_id);
        *self.primary_addr.write().unwrap() = base.with_port(port);

        info!(
            node = %self.config.node_name,
            primary = %self.primary_address(),
            "rpc engine started"
        );
        self.running.store(true, Ordering::Release);
        self.serving.store(true, Ordering::Release);
        Ok(())
    }

    fn client_net(&self, format: HeaderFormat, channel: RpcChannel) -> Arc<dyn Network> {
        match self.client_nets.read().unwrap().get(&(format, channel)) {
            Some(net) => net.clone(),
            None => panic!("no client network for format {format:?} on channel {channel:?}"),
        }
    }

    /// Issue a call to the request's logical destination and return the
    /// future its caller awaits. The request must carry a destination in
    /// `server_addr`.
    pub fn call(&self, request: Message) -> ResponseFuture {
        let (task, fut) = ResponseTask::new(request);
        let from = self.primary_address();
        let addr = task.with_request(|req| {
            req.header.from_addr = from;
            req.header.trace_id = rand::random::<u64>();
            req.server_addr.clone()
        });
        self.call_address(addr, Outbound::Tracked(task));
        fut
    }

    /// Issue a call without expecting a reply.
    pub fn call_oneway(&self, mut request: Message) {
        request.header.from_addr = self.primary_address();
        request.header.trace_id = rand::random::<u64>();
        let addr = request.server_addr.clone();
        self.call_address(addr, Outbound::Untracked(request));
    }

    pub(crate) fn call_address(&self, addr: HostAddr, out: Outbound) {
        match addr {
            HostAddr::Ip(ep) => self.call_ip(ep, out, false, false),
            HostAddr::Group(group) => self.call_group(&group, out),
            HostAddr::Uri(uri) => self.call_uri(&uri, out),
            HostAddr::Invalid => panic!("call issued with no destination"),
        }
    }

    fn call_group(&self, group: &Arc<GroupAddress>, out: Outbound) {
        let code = match &out {
            Outbound::Tracked(task) => task.with_request(|req| req.local_code),
            Outbound::Untracked(msg) => msg.local_code,
        };
        match code.spec().grpc_mode() {
            GrpcMode::ToLeader => self.call_ip(group.possible_leader(), out, false, false),
            GrpcMode::ToAny => self.call_ip(group.random_member(), out, false, false),
            GrpcMode::ToAll => panic!("group rpc mode ToAll is not implemented"),
        }
    }

    /// Send to a concrete endpoint. With a tracked outbound this registers
    /// the pending entry before the bytes leave, so a fast reply cannot
    /// miss it. `reset_id` gives retries a fresh matcher key;
    /// `set_forwarded` marks server-to-server re-dispatch.
    pub(crate) fn call_ip(
        &self,
        ep: EndPoint,
        out: Outbound,
        reset_id: bool,
        set_forwarded: bool,
    ) {
        assert!(
            ep.port > MAX_CLIENT_PORT,
            "cannot call client-range port {}",
            ep.port
        );

        match out {
            Outbound::Tracked(task) => {
                let wire = task.with_request(|req| {
                    assert!(
                        !req.header.from_addr.is_invalid(),
                        "from address must be set before call_ip"
                    );
                    if reset_id {
                        req.header.id = Message::new_id();
                    }
                    if set_forwarded {
                        req.header.context.is_forwarded = true;
                    }
                    req.header.to_addr = ep;
                    req.clone()
                });
                let spec = wire.local_code.spec();
                let net = self.client_net(wire.hdr_format, spec.rpc_call_channel());
                debug!(
                    rpc = %wire.header.rpc_name,
                    to = %ep,
                    id = wire.header.id,
                    trace_id = format_args!("{:016x}", wire.header.trace_id),
                    "call"
                );
                if !spec.rpc_call_allowed(&wire) {
                    debug!(
                        rpc = %wire.header.rpc_name,
                        trace_id = format_args!("{:016x}", wire.header.trace_id),
                        "rpc request dropped (fault injection)"
                    );
                    let timeout_ms = wire.header.client.timeout_ms.max(0) as u64;
                    net.inject_drop(wire, true);
                    task.complete(ErrCode::Timeout, None, timeout_ms);
                    return;
                }
                self.matcher.register(self, &task);
                net.send_message(wire);
            }
            Outbound::Untracked(mut msg) => {
                assert!(
                    !msg.header.from_addr.is_invalid(),
                    "from address must be set before call_ip"
                );
                if reset_id {
                    msg.header.id = Message::new_id();
                }
                if set_forwarded {
                    msg.header.context.is_forwarded = true;
                }
                msg.header.to_addr = ep;
                let spec = msg.local_code.spec();
                let net = self.client_net(msg.hdr_format, spec.rpc_call_channel());
                if !spec.rpc_call_allowed(&msg) {
                    debug!(
                        rpc = %msg.header.rpc_name,
                        trace_id = format_args!("{:016x}", msg.header.trace_id),
                        "rpc request dropped (fault injection)"
                    );
                    net.inject_drop(msg, true);
                    return;
                }
                net.send_message(msg);
            }
        }
    }

    fn call_uri(&self, uri: &Arc<UriAddress>, out: Outbound) {
        let resolver = uri
            .resolver()
            .or_else(|| self.resolvers.get(uri.uri()));
        match out {
            Outbound::Tracked(task) => {
                let Some(resolver) = resolver else {
                    warn!(uri = uri.uri(), "call failed: no partition resolver");
                    task.complete(ErrCode::ServiceNotFound, None, 0);
                    return;
                };
                let weak = self.weak();
                tokio::spawn(async move {
                    match weak.upgrade() {
                        Some(engine) => engine.uri_retry_driver(resolver, task).await,
                        None => task.complete(ErrCode::NetworkFailure, None, 0),
                    }
                });
            }
            Outbound::Untracked(msg) => {
                let Some(resolver) = resolver else {
                    warn!(uri = uri.uri(), "one-way call dropped: no partition resolver");
                    return;
                };
                let weak = self.weak();
                tokio::spawn(async move {
                    let rr = resolver
                        .resolve(msg.header.client.partition_hash, msg.header.client.timeout_ms)
                        .await;
                    let Some(engine) = weak.upgrade() else {
                        return;
                    };
                    if rr.err == ErrCode::Ok {
                        engine.call_address(rr.addr, Outbound::Untracked(msg));
                    } else {
                        debug!(error = %rr.err, "one-way call dropped: resolve failed");
                    }
                });
            }
        }
    }

    /// The resolver-backed retry loop for tracked URI calls.
    ///
    /// Each attempt resolves the partition afresh, issues the call under a
    /// fresh request id, and inspects the outcome: non-retryable errors
    /// complete the caller's task directly, retryable ones are reported to
    /// the resolver and backed off exponentially while the deadline allows.
    async fn uri_retry_driver(
        self: Arc<Self>,
        resolver: Arc<dyn PartitionResolver>,
        outer: Arc<ResponseTask>,
    ) {
        let (deadline_ms, partition_hash) = outer.with_request(|req| {
            (
                now_ms() + req.header.client.timeout_ms.max(0) as u64,
                req.header.client.partition_hash,
            )
        });

        loop {
            if outer.state() != TaskState::Ready {
                return;
            }
            let remaining = deadline_ms.saturating_sub(now_ms());
            if remaining == 0 {
                outer.complete(ErrCode::Timeout, None, 0);
                return;
            }

            let rr = resolver.resolve(partition_hash, remaining as i32).await;
            if rr.err != ErrCode::Ok {
                outer.complete(rr.err, None, 0);
                return;
            }

            let wire = outer.with_request(|req| {
                if req.header.gpid.value() != rr.gpid.value() {
                    assert_eq!(
                        req.header.gpid.value(),
                        0,
                        "partition id changed across retries"
                    );
                    req.header.gpid = rr.gpid;
                    if req.header.client.thread_hash == 0 {
                        req.header.client.thread_hash = rr.gpid.thread_hash();
                    }
                }
                req.header.client.timeout_ms = remaining as i32;
                // resolver retries re-register, so they take a fresh id
                req.header.id = Message::new_id();
                req.clone()
            });

            let (inner, inner_fut) = ResponseTask::new(wire);
            self.call_address(rr.addr.clone(), Outbound::Tracked(inner));
            let (err, reply) = inner_fut.wait().await;

            let retryable = !matches!(
                err,
                ErrCode::Ok
                    | ErrCode::HandlerNotFound
                    | ErrCode::AppNotExist
                    | ErrCode::OperationDisabled
            );
            let gpid_set = outer.with_request(|req| req.header.gpid.value() != 0);
            if !retryable || !gpid_set {
                outer.complete(err, reply, 0);
                return;
            }

            let (partition_index, retry_count, trace_id) = outer.with_request(|req| {
                let count = req.send_retry_count;
                req.send_retry_count += 1;
                (
                    req.header.gpid.partition_index,
                    count,
                    req.header.trace_id,
                )
            });
            resolver.on_access_failure(partition_index, err);

            let gap = retry_gap_ms(retry_count);
            if now_ms() + gap >= deadline_ms {
                warn!(
                    error = %err,
                    trace_id = format_args!("{:016x}", trace_id),
                    "service access failed with no time left, reporting timeout"
                );
                outer.complete(ErrCode::Timeout, None, 0);
                return;
            }
            debug!(
                error = %err,
                retry = retry_count + 1,
                gap_ms = gap,
                trace_id = format_args!("{:016x}", trace_id),
                "service access failed, backing off"
            );
            tokio::time::sleep(Duration::from_millis(gap)).await;
        }
    }

    /// Send a response back to its caller, stamping the error identity.
    ///
    /// Routing, in order of preference: the originating session when
    /// present and the request was not forwarded; the client network for
    /// forwarded responses (the original session belongs to the forwarding
    /// server, not the caller); the server network matching the request's
    /// origin port when no session exists at all.
    pub fn reply(&self, mut response: Message, err: ErrCode) {
        let session = response.session.clone();
        if session.is_none() && response.header.to_addr.is_invalid() {
            debug!(
                rpc = %response.header.rpc_name,
                trace_id = format_args!("{:016x}", response.header.trace_id),
                "reply dropped (no session and invalid to-address)"
            );
            return;
        }

        response.header.server.set_error(err);

        let spec = if response.local_code.is_invalid() {
            None
        } else {
            Some(response.local_code.spec())
        };
        let no_fail = match &spec {
            Some(spec) => spec.rpc_reply_allowed(&response),
            None => true,
        };
        let channel = spec
            .as_ref()
            .map(|s| s.rpc_call_channel())
            .unwrap_or(RpcChannel::Tcp);

        if let Some(session) = session {
            if !response.header.context.is_forwarded {
                if no_fail {
                    session.send(response);
                } else {
                    debug!(
                        rpc = %response.header.rpc_name,
                        trace_id = format_args!("{:016x}", response.header.trace_id),
                        "rpc reply dropped (fault injection)"
                    );
                }
                return;
            }

            // forwarded request: the session leads back to the forwarding
            // server, so answer the real caller through a client network
            assert!(
                response.header.to_addr.port > MAX_CLIENT_PORT,
                "forwarded responses require a named destination port"
            );
            let net = self.client_net(response.hdr_format, channel);
            if no_fail {
                net.send_message(response);
            } else {
                net.inject_drop(response, true);
            }
            return;
        }

        // datagram-style: route by the origin port's server network
        assert!(
            response.header.to_addr.port > MAX_CLIENT_PORT,
            "sessionless responses require a named destination port"
        );
        let port = response.header.from_addr.port;
        let net = match self.server_nets.read().unwrap().get(&(port, channel)) {
            Some(net) => net.clone(),
            None => panic!("no server network on port {port} for channel {channel:?}"),
        };
        if no_fail {
            net.send_message(response);
        } else {
            net.inject_drop(response, true);
        }
    }

    /// Re-dispatch a request to another server.
    ///
    /// Requests from pure clients cannot be re-targeted (nothing can send
    /// to them unsolicited), so the server answers `ForwardToOthers` with
    /// the new endpoint in the body and the client reissues. Anything else
    /// is forwarded for real: a clone travels to `ep` with the forwarded
    /// bit set, and the eventual response goes straight back to the caller.
    pub fn forward(&self, request: &Message, ep: EndPoint) {
        assert!(request.is_request(), "only requests can be forwarded");
        assert!(
            request.header.context.is_forward_supported,
            "rpc {} does not support forwarding",
            request.header.rpc_name
        );
        assert!(
            ep != self.primary_address(),
            "cannot forward rpc {} to the local node",
            request.header.rpc_name
        );

        if request.header.from_addr.is_pure_client() {
            let mut response = request.create_response();
            match encode_body(&ep) {
                Ok(body) => response.body = body,
                Err(e) => {
                    warn!(error = %e, "failed to encode redirect endpoint");
                    return;
                }
            }
            self.reply(response, ErrCode::ForwardToOthers);
        } else {
            let mut copy = request.clone();
            copy.session = None;
            self.call_ip(ep, Outbound::Untracked(copy), false, true);
        }
    }

    /// Inbound request hook, invoked by networks.
    pub fn on_recv_request(&self, net: &dyn Network, mut msg: Message, delay_ms: u64) {
        if !self.serving.load(Ordering::Acquire) {
            warn!(
                rpc = %msg.header.rpc_name,
                from = %msg.header.from_addr,
                trace_id = format_args!("{:016x}", msg.header.trace_id),
                "request received while engine is not serving, dropped"
            );
            return;
        }

        if msg.header.gpid.app_id > 0 {
            let interceptor = self.interceptor.read().unwrap().clone();
            if let Some(interceptor) = interceptor {
                let Some(engine) = self.self_weak.upgrade() else {
                    return;
                };
                match interceptor.intercept(engine, msg) {
                    Intercepted::Handled(task) => {
                        self.workers.enqueue_after(delay_ms, task);
                        return;
                    }
                    Intercepted::Pass(back) => msg = back,
                }
            }
        }

        match self.dispatcher.on_request(&mut msg) {
            Some(handler) => {
                let spec = msg.local_code.spec();
                if spec.rpc_request_enqueue_allowed(&msg) {
                    let weak = self.weak();
                    self.workers.enqueue_after(delay_ms, async move {
                        if let Some(engine) = weak.upgrade() {
                            handler.handle(engine, msg).await;
                        }
                    });
                } else {
                    debug!(
                        rpc = %msg.header.rpc_name,
                        trace_id = format_args!("{:016x}", msg.header.trace_id),
                        "rpc request dropped (fault injection)"
                    );
                    net.inject_drop(msg, false);
                }
            }
            None => {
                warn!(
                    rpc = %msg.header.rpc_name,
                    from = %msg.header.from_addr,
                    trace_id = format_args!("{:016x}", msg.header.trace_id),
                    "request has no registered handler"
                );
                let response = msg.create_response();
                self.reply(response, ErrCode::HandlerNotFound);
            }
        }
    }

    /// Inbound reply hook, invoked by networks. Returns `true` when the id
    /// matched a pending call.
    pub fn on_recv_reply(
        &self,
        net: &dyn Network,
        id: u64,
        reply: Option<Message>,
        delay_ms: u64,
    ) -> bool {
        self.matcher.on_reply(self, net, id, reply, delay_ms)
    }

    pub(crate) fn on_request_timeout(&self, id: u64) {
        self.matcher.on_timeout(self, id);
    }
}

impl std::fmt::Debug for RpcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEngine")
            .field("node", &self.config.node_name)
            .field("primary", &self.primary_address())
            .field("running", &self.is_running())
            .finish()
    }
}
