//! Shared utilities for integration tests.
//!
//! Provides a reactor running on its own thread, a JSON-RPC server bound to
//! an ephemeral port with both transports enabled, and throwaway TLS
//! material signed by a test CA.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]
#![allow(clippy::expect_used, reason = "test setup failures must abort the test")]

use std::{
    net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener},
    path::PathBuf,
    sync::{Arc, mpsc},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use hostwire::{
    acceptor::{Acceptor, AcceptorHandle},
    framed::FramedProtocol,
    jsonrpc::{JsonRpcServer, MethodTable, Params, RpcError, WorkerPool},
    reactor::{Reactor, ReactorHandle},
    stomp::StompProtocol,
    tls::ServerTls,
    transport::RequestHandler,
};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use serde_json::{Value, json};
use tempfile::TempDir;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Error code returned by the `Test.fail` method.
pub const FAIL_CODE: i64 = 4242;

/// A reactor looping on a dedicated thread; stopped and joined on drop.
pub struct ReactorThread {
    handle: ReactorHandle,
    join: Option<JoinHandle<()>>,
}

impl ReactorThread {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        let join = thread::Builder::new()
            .name("test-reactor".into())
            .spawn(move || {
                let mut reactor = Reactor::new().expect("reactor");
                tx.send(reactor.handle()).expect("send reactor handle");
                reactor.process_requests().expect("reactor loop");
            })
            .expect("spawn reactor thread");
        Self {
            handle: rx.recv().expect("reactor handle"),
            join: Some(join),
        }
    }

    pub fn handle(&self) -> &ReactorHandle { &self.handle }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Methods served by [`TestServer`].
pub fn methods() -> MethodTable {
    MethodTable::new()
        .method("Test.echo", |params: Params| {
            params
                .arg(0, "value")
                .cloned()
                .ok_or_else(|| RpcError::InvalidParams("value is required".into()))
        })
        .method("Test.add", |params: Params| {
            let (a, b): (i64, i64) = params.parse()?;
            Ok(json!(a + b))
        })
        .method("Test.sleep", |params: Params| {
            let millis = params.arg(0, "millis").and_then(Value::as_u64).unwrap_or(0);
            thread::sleep(Duration::from_millis(millis));
            Ok(json!(millis))
        })
        .method("Test.fail", |_| {
            Err(RpcError::Application {
                code: FAIL_CODE,
                message: "requested failure".into(),
                data: Some(json!({ "retry": false })),
            })
        })
}

/// Knobs for [`TestServer::start_with`].
#[derive(Default)]
pub struct ServerOptions {
    pub tls: Option<ServerTls>,
    pub detection_timeout: Option<Duration>,
    /// Reuse a specific port, e.g. to restart a server in place.
    pub port: Option<u16>,
}

/// A JSON-RPC server listening on localhost with the framed and STOMP
/// transports.
pub struct TestServer {
    pub addr: SocketAddr,
    pub framed: Arc<FramedProtocol>,
    pub stomp: Arc<StompProtocol>,
    listener: AcceptorHandle,
    reactor: ReactorThread,
}

impl TestServer {
    pub fn start() -> Self { Self::start_with(ServerOptions::default()) }

    pub fn start_with(options: ServerOptions) -> Self {
        let pool = WorkerPool::new(4, 64).expect("worker pool");
        let handler: Arc<dyn RequestHandler> =
            Arc::new(JsonRpcServer::new(Arc::new(methods()), Arc::new(pool)));
        let framed = Arc::new(FramedProtocol::new(Arc::clone(&handler)));
        let stomp = Arc::new(StompProtocol::new(handler));

        let reactor = ReactorThread::spawn();
        let mut acceptor = Acceptor::new()
            .protocol(Arc::clone(&framed) as _)
            .protocol(Arc::clone(&stomp) as _);
        if let Some(tls) = options.tls {
            acceptor = acceptor.tls(tls);
        }
        if let Some(timeout) = options.detection_timeout {
            acceptor = acceptor.detection_timeout(timeout);
        }
        let listener = acceptor
            .bind(reactor.handle(), "127.0.0.1", options.port.unwrap_or(0))
            .expect("bind acceptor");
        Self {
            addr: listener.local_addr(),
            framed,
            stomp,
            listener,
            reactor,
        }
    }

    pub fn port(&self) -> u16 { self.addr.port() }

    /// Stop listening and drop every connection.
    pub fn stop(self) {
        self.listener.stop();
        drop(self.reactor);
    }
}

/// A port nothing is listening on.
pub fn unused_port() -> u16 {
    let listener = StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
    listener.local_addr().expect("local addr").port()
}

/// Poll `condition` until it holds, failing the test after [`WAIT`].
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Wire bytes of a framed payload.
pub fn framed(payload: &[u8]) -> Vec<u8> {
    let mut wire = (payload.len() as u64).to_be_bytes().to_vec();
    wire.extend_from_slice(payload);
    wire
}

/// A test CA plus a server certificate for `localhost` and a client
/// certificate, all written as PEM files into a temporary directory.
pub struct TestPki {
    dir: TempDir,
    pub ca_pem: Vec<u8>,
    pub server_cert_pem: Vec<u8>,
    pub server_key_pem: Vec<u8>,
    pub client_cert_pem: Vec<u8>,
    pub client_key_pem: Vec<u8>,
}

impl TestPki {
    pub fn generate() -> Self {
        let mut ca_params = CertificateParams::default();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "hostwire test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().expect("CA key");
        let ca = ca_params.self_signed(&ca_key).expect("self-sign CA");

        let (server_cert_pem, server_key_pem) = leaf("localhost", &ca, &ca_key);
        let (client_cert_pem, client_key_pem) = leaf("client.local", &ca, &ca_key);

        let pki = Self {
            dir: tempfile::tempdir().expect("temp dir"),
            ca_pem: ca.pem().into_bytes(),
            server_cert_pem,
            server_key_pem,
            client_cert_pem,
            client_key_pem,
        };
        for (name, pem) in [
            ("ca.pem", &pki.ca_pem),
            ("server.pem", &pki.server_cert_pem),
            ("server.key", &pki.server_key_pem),
            ("client.pem", &pki.client_cert_pem),
            ("client.key", &pki.client_key_pem),
        ] {
            std::fs::write(pki.dir.path().join(name), pem).expect("write PEM");
        }
        pki
    }

    /// Path of one of the generated PEM files.
    pub fn path(&self, name: &str) -> PathBuf { self.dir.path().join(name) }
}

fn leaf(name: &str, ca: &Certificate, ca_key: &KeyPair) -> (Vec<u8>, Vec<u8>) {
    let mut params = CertificateParams::new(vec![name.to_owned()]).expect("leaf params");
    params.distinguished_name.push(DnType::CommonName, name);
    let key = KeyPair::generate().expect("leaf key");
    let cert = params.signed_by(&key, ca, ca_key).expect("sign leaf");
    (cert.pem().into_bytes(), key.serialize_pem().into_bytes())
}
