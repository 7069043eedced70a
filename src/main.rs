//! `hostwire` daemon.
//!
//! Binds one port speaking both the framed and the STOMP transport, serves
//! JSON-RPC methods on a worker pool and runs until interrupted.

mod cli;

use std::{error::Error, process::ExitCode, sync::Arc, thread};

use clap::Parser;
use hostwire::{
    acceptor::Acceptor,
    config::Config,
    framed::FramedProtocol,
    jsonrpc::{JsonRpcServer, MethodTable, Params, RpcError, WorkerPool},
    reactor::Reactor,
    stomp::StompProtocol,
    transport::RequestHandler,
};
use serde_json::{Value, json};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn load_config(cli: &cli::Cli) -> Result<Config, Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = &cli.host {
        config.host.clone_from(host);
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.cert.is_some() {
        config.cert_file.clone_from(&cli.cert);
        config.key_file.clone_from(&cli.key);
    }
    if cli.ca.is_some() {
        config.ca_file.clone_from(&cli.ca);
    }
    if let Some(secs) = cli.ssl_handshake_timeout {
        config.ssl_handshake_timeout_secs = secs;
    }
    if let Some(secs) = cli.detector_timeout {
        config.detector_timeout_secs = secs;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(level) = &cli.log_level {
        config.log_level.clone_from(level);
    }
    config.validate()?;
    Ok(config)
}

fn host_methods() -> MethodTable {
    MethodTable::new()
        .method("Host.ping", |_| Ok(json!(true)))
        .method("Host.echo", |params: Params| {
            params
                .arg(0, "text")
                .cloned()
                .ok_or_else(|| RpcError::InvalidParams("Host.echo expects one argument".into()))
        })
        .method("Host.getVersion", |_| {
            Ok(json!({ "name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") }))
        })
        .method("Host.listMethods", |_| {
            Ok(Value::from(vec!["Host.ping", "Host.echo", "Host.getVersion", "Host.listMethods"]))
        })
}

fn run(config: &Config) -> Result<(), Box<dyn Error>> {
    let pool = Arc::new(WorkerPool::new(config.workers, config.worker_capacity)?);
    let server: Arc<dyn RequestHandler> =
        Arc::new(JsonRpcServer::new(Arc::new(host_methods()), Arc::clone(&pool)));

    let mut reactor = Reactor::new()?;
    let framed = FramedProtocol::new(Arc::clone(&server)).with_max_frame_length(config.max_frame_length);
    let stomp = StompProtocol::new(server)
        .with_max_frame_length(config.max_frame_length)
        .with_request_destination(config.request_destination.clone())
        .with_response_destination(config.response_destination.clone());
    let mut acceptor = Acceptor::new()
        .detection_timeout(config.detector_timeout())
        .protocol(Arc::new(framed))
        .protocol(Arc::new(stomp));
    let tls = config.server_tls()?;
    let secure = tls.is_some();
    if let Some(tls) = tls {
        acceptor = acceptor.tls(tls);
    }
    let listener = acceptor.bind(&reactor.handle(), &config.host, config.port)?;
    info!(addr = %listener.local_addr(), tls = secure, "listening");

    let signals = Arc::clone(&pool);
    let stopper = listener.clone();
    thread::Builder::new()
        .name("hostwire-signal".into())
        .spawn(move || {
            if let Err(err) = signals.block_on(tokio::signal::ctrl_c()) {
                warn!(error = %err, "cannot listen for Ctrl-C");
                return;
            }
            info!("interrupted, shutting down");
            stopper.stop();
        })?;

    reactor.process_requests()?;
    info!("stopped");
    Ok(())
}

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("hostwire: {err}");
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "hostwire failed");
            ExitCode::FAILURE
        }
    }
}
