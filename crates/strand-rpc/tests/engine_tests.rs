//! End-to-end engine scenarios over the simulated network.
//!
//! Each test uses its own ports, app ids, and task-code names: the sim
//! fabric and the task-code registry are process-global and the tests run
//! concurrently.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use strand_rpc::net::sim;
use strand_rpc::{
    EndPoint, EngineConfig, ErrCode, Gpid, GroupAddress, GrpcMode, HandlerFuture, HostAddr,
    Message, PartitionResolver, ResolveResult, RpcChannel, RpcEngine, ServerNetConfig, TaskCode,
    UriAddress,
};

fn node_config(name: &str, app_id: u16, port: Option<u16>) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.node_name = name.to_string();
    config.app_id = app_id;
    config
        .client
        .get_mut(&RpcChannel::Tcp)
        .unwrap()
        .factory = "sim".to_string();
    if let Some(port) = port {
        config.ports = vec![port];
        config.server.push(ServerNetConfig {
            port,
            channel: RpcChannel::Tcp,
            factory: "sim".to_string(),
            buffer_block_size: 65536,
        });
    }
    config
}

async fn start_node(name: &str, app_id: u16, port: Option<u16>) -> Arc<RpcEngine> {
    let engine = RpcEngine::new(node_config(name, app_id, port));
    engine.start().await.unwrap();
    engine
}

fn echo_handler() -> Arc<dyn strand_rpc::RequestHandler> {
    Arc::new(
        |engine: Arc<RpcEngine>, request: Message| -> HandlerFuture {
            Box::pin(async move {
                let mut response = request.create_response();
                response.body = request.body.clone();
                engine.reply(response, ErrCode::Ok);
            })
        },
    )
}

#[tokio::test]
async fn test_direct_call_echoes() {
    let server = start_node("echo-server", 4610, Some(46101)).await;
    let client = start_node("echo-client", 4611, Some(46102)).await;

    let code = TaskCode::register("RPC_E2E_ECHO");
    assert!(server.register_handler(code, "", echo_handler()));

    let request = Message::request(code)
        .with_server_addr(EndPoint::localhost(46101))
        .with_timeout_ms(1000)
        .with_body(b"ping".to_vec());
    let (err, reply) = client.call(request).wait().await;

    assert_eq!(err, ErrCode::Ok);
    let reply = reply.unwrap();
    assert_eq!(reply.body, b"ping");
    assert!(!reply.is_request());
    assert_eq!(client.matcher().pending_count(), 0);
}

#[tokio::test]
async fn test_timeout_without_resend() {
    let client = start_node("timeout-client", 4620, Some(46201)).await;

    let code = TaskCode::register("RPC_E2E_TIMEOUT");
    let request = Message::request(code)
        .with_server_addr(EndPoint::localhost(46999)) // nothing listens here
        .with_timeout_ms(100);

    let started = Instant::now();
    let (err, reply) = client.call(request).wait().await;

    assert_eq!(err, ErrCode::Timeout);
    assert!(reply.is_none());
    assert!(started.elapsed() >= Duration::from_millis(95));
    assert_eq!(client.matcher().pending_count(), 0);
}

#[tokio::test]
async fn test_oversized_resend_window_does_not_arm_resend() {
    let client = start_node("window-client", 4625, Some(46251)).await;

    // window longer than the caller budget: plain timeout semantics apply
    let code = TaskCode::register("RPC_E2E_WIDE_WINDOW");
    code.spec().set_resend_timeout_ms(500);

    let request = Message::request(code)
        .with_server_addr(EndPoint::localhost(46998))
        .with_timeout_ms(100);

    let started = Instant::now();
    let (err, _) = client.call(request).wait().await;
    assert_eq!(err, ErrCode::Timeout);
    // a mis-armed resend window would not fire before 500 ms
    assert!(started.elapsed() < Duration::from_millis(300));
}

#[tokio::test]
async fn test_resend_reuses_request_id_and_recovers() {
    let server = start_node("resend-server", 4630, Some(46301)).await;
    let client = start_node("resend-client", 4631, Some(46302)).await;

    let code = TaskCode::register("RPC_E2E_RESEND");
    code.spec().set_resend_timeout_ms(50);

    let seen_ids = Arc::new(Mutex::new(Vec::new()));
    let seen = seen_ids.clone();
    server.register_handler(
        code,
        "",
        Arc::new(move |engine: Arc<RpcEngine>, request: Message| -> HandlerFuture {
            let seen = seen.clone();
            Box::pin(async move {
                seen.lock().await.push(request.header.id);
                let mut response = request.create_response();
                response.body = request.body.clone();
                engine.reply(response, ErrCode::Ok);
            })
        }),
    );

    // first transmission is lost; the resend must carry the same id
    let target = EndPoint::localhost(46301);
    sim::drop_next(target, 1);

    let request = Message::request(code)
        .with_server_addr(target)
        .with_timeout_ms(400)
        .with_body(b"again".to_vec());
    let original_id = request.header.id;

    let started = Instant::now();
    let (err, reply) = client.call(request).wait().await;

    assert_eq!(err, ErrCode::Ok);
    assert_eq!(reply.unwrap().body, b"again");
    assert!(started.elapsed() >= Duration::from_millis(45));

    let ids = seen_ids.lock().await.clone();
    assert_eq!(ids, vec![original_id]);
    assert_eq!(client.matcher().pending_count(), 0);
    sim::reset(target);
}

#[tokio::test]
async fn test_group_leader_updated_by_redirect() {
    let node_x = start_node("redirect-x", 4640, Some(46401)).await;
    let node_y = start_node("redirect-y", 4641, Some(46402)).await;
    // pure client: no listening port, primary port = app id
    let client = start_node("redirect-client", 904, None).await;

    let x = EndPoint::localhost(46401);
    let y = EndPoint::localhost(46402);

    let code = TaskCode::register("RPC_E2E_REDIRECT");
    code.spec().set_grpc_mode(GrpcMode::ToLeader);

    // X is not the right owner and redirects everyone to Y
    node_x.register_handler(
        code,
        "",
        Arc::new(move |engine: Arc<RpcEngine>, request: Message| -> HandlerFuture {
            Box::pin(async move {
                engine.forward(&request, y);
            })
        }),
    );
    node_y.register_handler(code, "", echo_handler());

    let group = GroupAddress::new("replica-group", vec![x, y], true);
    group.set_leader(x);

    let request = Message::request(code)
        .with_server_addr(HostAddr::Group(group.clone()))
        .with_timeout_ms(1000)
        .with_body(b"find the leader".to_vec());
    let (err, reply) = client.call(request).wait().await;

    assert_eq!(err, ErrCode::Ok);
    assert_eq!(reply.unwrap().body, b"find the leader");
    assert_eq!(group.leader(), Some(y));
}

#[tokio::test]
async fn test_uri_retry_backs_off_until_success() {
    struct CountingResolver {
        target: EndPoint,
        resolves: AtomicU32,
        failures: AtomicU32,
    }

    #[async_trait::async_trait]
    impl PartitionResolver for CountingResolver {
        async fn resolve(&self, _partition_hash: u64, _timeout_ms: i32) -> ResolveResult {
            self.resolves.fetch_add(1, Ordering::Relaxed);
            ResolveResult {
                err: ErrCode::Ok,
                gpid: Gpid {
                    app_id: 5,
                    partition_index: 2,
                },
                addr: HostAddr::Ip(self.target),
            }
        }

        fn on_access_failure(&self, partition_index: i32, err: ErrCode) {
            assert_eq!(partition_index, 2);
            assert_eq!(err, ErrCode::InvalidState);
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    let server = start_node("uri-server", 4650, Some(46501)).await;
    let client = start_node("uri-client", 905, None).await;

    let code = TaskCode::register("RPC_E2E_URI");
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts_seen = attempts.clone();
    server.register_handler(
        code,
        "",
        Arc::new(move |engine: Arc<RpcEngine>, request: Message| -> HandlerFuture {
            let attempts = attempts_seen.clone();
            Box::pin(async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let mut response = request.create_response();
                if attempt <= 3 {
                    engine.reply(response, ErrCode::InvalidState);
                } else {
                    response.body = b"settled".to_vec();
                    engine.reply(response, ErrCode::Ok);
                }
            })
        }),
    );

    let resolver = Arc::new(CountingResolver {
        target: EndPoint::localhost(46501),
        resolves: AtomicU32::new(0),
        failures: AtomicU32::new(0),
    });
    let uri = UriAddress::new("strand://settled-service");
    client.resolvers().attach(&uri, resolver.clone());

    let request = Message::request(code)
        .with_server_addr(HostAddr::Uri(uri))
        .with_timeout_ms(5000)
        .with_partition_hash(77);

    let started = Instant::now();
    let (err, reply) = client.call(request).wait().await;

    assert_eq!(err, ErrCode::Ok);
    assert_eq!(reply.unwrap().body, b"settled");
    assert_eq!(attempts.load(Ordering::Relaxed), 4);
    assert_eq!(resolver.failures.load(Ordering::Relaxed), 3);
    assert!(resolver.resolves.load(Ordering::Relaxed) >= 4);
    // backoff gaps 8, 16, 32 ms must have elapsed
    assert!(started.elapsed() >= Duration::from_millis(56));
    assert!(started.elapsed() < Duration::from_millis(5000));
}

#[tokio::test]
async fn test_forwarded_reply_travels_via_client_network() {
    let s1 = start_node("forward-s1", 4660, Some(46601)).await;
    let s2 = start_node("forward-s2", 4661, Some(46602)).await;
    let client = start_node("forward-client", 4662, Some(46603)).await;

    let s1_ep = EndPoint::localhost(46601);

    let code = TaskCode::register("RPC_E2E_FORWARD");
    s2.register_handler(
        code,
        "",
        Arc::new(move |engine: Arc<RpcEngine>, request: Message| -> HandlerFuture {
            Box::pin(async move {
                engine.forward(&request, s1_ep);
            })
        }),
    );
    s1.register_handler(
        code,
        "",
        Arc::new(|engine: Arc<RpcEngine>, request: Message| -> HandlerFuture {
            Box::pin(async move {
                let mut response = request.create_response();
                response.body = b"HELLO".to_vec();
                engine.reply(response, ErrCode::Ok);
            })
        }),
    );

    let request = Message::request(code)
        .with_server_addr(EndPoint::localhost(46602))
        .with_timeout_ms(1000);
    let (err, reply) = client.call(request).wait().await;

    assert_eq!(err, ErrCode::Ok);
    let reply = reply.unwrap();
    assert_eq!(reply.body, b"HELLO");
    assert!(reply.header.context.is_forwarded);
    assert_eq!(reply.error(), ErrCode::Ok);
}

#[tokio::test]
async fn test_unregister_severs_dispatch() {
    let server = start_node("unregister-server", 4670, Some(46701)).await;
    let client = start_node("unregister-client", 4671, Some(46702)).await;

    let code = TaskCode::register("RPC_E2E_UNREGISTER");
    server.register_handler(code, "", echo_handler());

    let target = EndPoint::localhost(46701);
    let first = Message::request(code)
        .with_server_addr(target)
        .with_timeout_ms(1000);
    let (err, _) = client.call(first).wait().await;
    assert_eq!(err, ErrCode::Ok);

    assert!(server.unregister_handler(code));

    let second = Message::request(code)
        .with_server_addr(target)
        .with_timeout_ms(1000);
    let (err, reply) = client.call(second).wait().await;
    assert_eq!(err, ErrCode::HandlerNotFound);
    assert!(reply.is_some());
}

#[tokio::test]
async fn test_call_veto_looks_like_a_timeout() {
    let server = start_node("veto-server", 4680, Some(46801)).await;
    let client = start_node("veto-client", 4681, Some(46802)).await;

    let code = TaskCode::register("RPC_E2E_CALL_VETO");
    code.spec()
        .set_rpc_call_hook(Some(Arc::new(|_msg: &Message| false)));
    server.register_handler(code, "", echo_handler());

    let request = Message::request(code)
        .with_server_addr(EndPoint::localhost(46801))
        .with_timeout_ms(120);
    let started = Instant::now();
    let (err, reply) = client.call(request).wait().await;

    assert_eq!(err, ErrCode::Timeout);
    assert!(reply.is_none());
    // the veto must look like loss, not fail fast
    assert!(started.elapsed() >= Duration::from_millis(110));
    code.spec().set_rpc_call_hook(None);
}

#[tokio::test]
async fn test_not_serving_drops_requests() {
    let server = start_node("paused-server", 4690, Some(46901)).await;
    let client = start_node("paused-client", 4691, Some(46902)).await;

    let code = TaskCode::register("RPC_E2E_PAUSED");
    server.register_handler(code, "", echo_handler());
    server.set_serving(false);

    let request = Message::request(code)
        .with_server_addr(EndPoint::localhost(46901))
        .with_timeout_ms(100);
    let (err, _) = client.call(request).wait().await;
    assert_eq!(err, ErrCode::Timeout);
}

#[tokio::test]
async fn test_tcp_end_to_end_echo() {
    let mut server_config = EngineConfig::default();
    server_config.node_name = "tcp-server".to_string();
    server_config.app_id = 4700;
    server_config.ports = vec![47001];
    server_config.server.push(ServerNetConfig {
        port: 47001,
        channel: RpcChannel::Tcp,
        factory: "tcp".to_string(),
        buffer_block_size: 65536,
    });
    let server = RpcEngine::new(server_config);
    server.start().await.unwrap();

    let mut client_config = EngineConfig::default();
    client_config.node_name = "tcp-client".to_string();
    client_config.app_id = 1001;
    let client = RpcEngine::new(client_config);
    client.start().await.unwrap();

    let code = TaskCode::register("RPC_E2E_TCP_ECHO");
    server.register_handler(code, "", echo_handler());

    let request = Message::request(code)
        .with_server_addr(EndPoint::localhost(47001))
        .with_timeout_ms(2000)
        .with_body(b"over tcp".to_vec());
    let (err, reply) = client.call(request).wait().await;

    assert_eq!(err, ErrCode::Ok);
    assert_eq!(reply.unwrap().body, b"over tcp");
}
