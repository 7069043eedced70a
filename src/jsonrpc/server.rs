//! JSON-RPC request engine for the server transports.

use std::{
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{
    error::RpcError,
    message::{Params, Request, Response, encode_requests, encode_responses},
    pool::WorkerPool,
};
use crate::{
    metrics,
    panic::format_panic,
    session::EventPublisher,
    transport::{RequestHandler, Responder},
};

/// A callable RPC method.
pub type Method = Arc<dyn Fn(Params) -> Result<Value, RpcError> + Send + Sync>;

/// Resolves method names to callables.
pub trait Bridge: Send + Sync {
    /// Look up `method`.
    ///
    /// # Errors
    ///
    /// [`RpcError::MethodNotFound`] when no such method exists.
    fn dispatch(&self, method: &str) -> Result<Method, RpcError>;
}

/// Dispatch key for a wire method name: `Class.method` becomes
/// `Class_method`.
#[must_use]
pub fn method_key(name: &str) -> String { name.replacen('.', "_", 1) }

/// A [`Bridge`] backed by a map of registered closures.
///
/// ```
/// use hostwire::jsonrpc::{Bridge, MethodTable, Params};
/// use serde_json::json;
///
/// let table = MethodTable::new().method("Host.ping", |_params: Params| Ok(json!(true)));
/// let ping = table.dispatch("Host.ping").unwrap();
/// assert_eq!(ping(Params::default()).unwrap(), json!(true));
/// assert!(table.dispatch("Host_ping").is_ok());
/// assert!(table.dispatch("Host.reboot").is_err());
/// ```
#[derive(Default, Clone)]
pub struct MethodTable {
    methods: HashMap<String, Method>,
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("MethodTable").field("methods", &names).finish()
    }
}

impl MethodTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register `method` under `name` (either `Class.method` or
    /// `Class_method`).
    #[must_use]
    pub fn method<F>(mut self, name: &str, method: F) -> Self
    where
        F: Fn(Params) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.methods.insert(method_key(name), Arc::new(method));
        self
    }
}

impl Bridge for MethodTable {
    fn dispatch(&self, method: &str) -> Result<Method, RpcError> {
        self.methods
            .get(&method_key(method))
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(method.to_owned()))
    }
}

/// Runs one request to completion, returning the reply if one is owed.
fn execute(bridge: &dyn Bridge, request: Request) -> Option<Response> {
    let started = Instant::now();
    let Request {
        method, params, id, ..
    } = request;
    let outcome = bridge.dispatch(&method).and_then(|callable| {
        catch_unwind(AssertUnwindSafe(|| callable(params.unwrap_or_default()))).unwrap_or_else(
            |panic| {
                error!(method = %method, panic = %format_panic(panic.as_ref()), "RPC method panicked");
                Err(RpcError::InternalError(format!("method {method} panicked")))
            },
        )
    });
    metrics::inc_rpc_calls();
    if let Err(err) = &outcome {
        metrics::inc_rpc_errors();
        debug!(method = %method, error = %err, "RPC call failed");
    }
    debug!(
        method = %method,
        elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
        "RPC call finished"
    );
    id.map(|id| Response::from_outcome(id, outcome))
}

/// Gathers the replies of one inbound payload and sends them once every
/// request has finished.
struct BatchCollector {
    slots: Mutex<Vec<Option<Response>>>,
    remaining: AtomicUsize,
    batch: bool,
    responder: Arc<dyn Responder>,
}

impl BatchCollector {
    fn new(len: usize, batch: bool, responder: Arc<dyn Responder>) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![None; len]),
            remaining: AtomicUsize::new(len),
            batch,
            responder,
        })
    }

    fn record(&self, index: usize, response: Option<Response>) {
        if let Some(response) = response {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(response);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let responses: Vec<Response> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .flatten()
            .collect();
        if responses.is_empty() {
            return;
        }
        match encode_responses(&responses, self.batch) {
            Ok(payload) => self.responder.respond(payload),
            Err(err) => warn!(error = %err, "failed to encode responses"),
        }
    }
}

/// [`RequestHandler`] that parses JSON-RPC payloads and runs the methods on
/// a [`WorkerPool`].
pub struct JsonRpcServer {
    bridge: Arc<dyn Bridge>,
    pool: Arc<WorkerPool>,
}

impl fmt::Debug for JsonRpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonRpcServer")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl JsonRpcServer {
    /// Serve methods resolved by `bridge`.
    #[must_use]
    pub fn new(bridge: Arc<dyn Bridge>, pool: Arc<WorkerPool>) -> Self { Self { bridge, pool } }

    /// Split a payload into requests, answering unparseable entries directly.
    fn parse(payload: &[u8]) -> (Vec<Result<Request, Response>>, bool) {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(err) => {
                let err = RpcError::ParseError(err.to_string());
                return (vec![Err(Response::error(Value::Null, &err))], false);
            }
        };
        let (values, batch) = match value {
            Value::Array(values) if values.is_empty() => {
                let err = RpcError::InvalidRequest("empty batch".into());
                return (vec![Err(Response::error(Value::Null, &err))], false);
            }
            Value::Array(values) => (values, true),
            value => (vec![value], false),
        };
        let parsed = values
            .into_iter()
            .map(|value| Request::from_value(value).map_err(|(id, err)| Response::error(id, &err)))
            .collect();
        (parsed, batch)
    }
}

impl RequestHandler for JsonRpcServer {
    fn handle_request(&self, payload: Bytes, responder: Arc<dyn Responder>) {
        let (parsed, batch) = Self::parse(&payload);
        let collector = BatchCollector::new(parsed.len(), batch, responder);
        for (index, entry) in parsed.into_iter().enumerate() {
            let request = match entry {
                Ok(request) => request,
                Err(response) => {
                    metrics::inc_rpc_errors();
                    collector.record(index, Some(response));
                    continue;
                }
            };
            let id = request.id.clone();
            let method = request.method.clone();
            if id.is_none() {
                collector.record(index, None);
            }
            let bridge = Arc::clone(&self.bridge);
            let job_collector = Arc::clone(&collector);
            let spawned = self.pool.try_spawn(move || {
                let response = execute(bridge.as_ref(), request);
                if response.is_some() {
                    job_collector.record(index, response);
                }
            });
            if spawned.is_err() {
                warn!(method = %method, "worker pool exhausted, rejecting request");
                metrics::inc_rpc_errors();
                if let Some(id) = id {
                    let err = RpcError::InternalError("worker pool exhausted".into());
                    collector.record(index, Some(Response::error(id, &err)));
                }
            }
        }
    }
}

/// Encode an event notification for `method`.
///
/// # Errors
///
/// Serialization failures.
pub fn event_payload(method: &str, params: Option<Params>) -> Result<Bytes, RpcError> {
    encode_requests(&[Request::notification(method, params)])
}

/// Publish an event notification to every session listening on
/// `destination`, returning how many received it.
///
/// # Errors
///
/// Serialization failures.
pub fn publish_event(
    publisher: &dyn EventPublisher,
    destination: &str,
    method: &str,
    params: Option<Params>,
) -> Result<usize, RpcError> {
    let payload = event_payload(method, params)?;
    Ok(publisher.publish(destination, payload))
}
