//! JSON-RPC client over any [`ClientTransport`].
//!
//! Calls register their request ids in a pending table before the payload
//! is handed to the transport. Responses arrive on the reactor thread and
//! complete the call once every id of the batch is answered. A caller that
//! times out removes its ids, so a late response is logged as unmatched and
//! dropped.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::{
    error::RpcError,
    message::{Inbound, Params, Request, Response, classify, encode_requests},
};
use crate::client::{ClientTransport, Incoming};

/// Topic that receives every event.
pub const ALL_EVENTS: &str = "*";

/// An event delivered to a subscription queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event method name.
    pub method: String,
    /// Event parameters.
    pub params: Option<Params>,
}

/// Queue end fed by a subscription. `None` marks the end of the stream.
pub type EventQueue = UnboundedSender<Option<Event>>;

/// Identifier returned by [`JsonRpcClient::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Validates event parameters before [`JsonRpcClient::notify`] sends them.
pub trait EventSchema: Send + Sync {
    /// Check `params` for the event `event_id`.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidParams`] when the parameters do not fit.
    fn validate(&self, event_id: &str, params: &Map<String, Value>) -> Result<(), RpcError>;
}

/// Schema that accepts every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl EventSchema for AcceptAll {
    fn validate(&self, _event_id: &str, _params: &Map<String, Value>) -> Result<(), RpcError> { Ok(()) }
}

type Callback = Box<dyn FnOnce(Vec<Response>) + Send>;

#[derive(Default)]
struct Progress {
    received: HashMap<String, Response>,
    responses: Option<Vec<Response>>,
    callback: Option<Callback>,
}

struct CallState {
    ids: Vec<String>,
    progress: Mutex<Progress>,
    done: Condvar,
}

impl CallState {
    fn new(ids: Vec<String>) -> Arc<Self> {
        let progress = Progress {
            responses: ids.is_empty().then(Vec::new),
            ..Progress::default()
        };
        Arc::new(Self {
            ids,
            progress: Mutex::new(progress),
            done: Condvar::new(),
        })
    }

    fn progress(&self) -> MutexGuard<'_, Progress> { self.progress.lock().unwrap_or_else(PoisonError::into_inner) }

    fn record(&self, key: String, response: Response) {
        let fire = {
            let mut progress = self.progress();
            progress.received.insert(key, response);
            if progress.responses.is_some() || progress.received.len() < self.ids.len() {
                return;
            }
            let ordered: Vec<Response> = self
                .ids
                .iter()
                .filter_map(|id| progress.received.remove(id))
                .collect();
            progress.responses = Some(ordered.clone());
            self.done.notify_all();
            progress.callback.take().map(|callback| (callback, ordered))
        };
        if let Some((callback, responses)) = fire {
            callback(responses);
        }
    }

    /// Install `callback`, or run it now if the call already completed.
    fn on_complete(&self, callback: Callback) {
        let mut progress = self.progress();
        if let Some(responses) = progress.responses.clone() {
            drop(progress);
            callback(responses);
        } else {
            progress.callback = Some(callback);
        }
    }
}

/// An outstanding batch returned by [`JsonRpcClient::call_async`].
pub struct Call {
    state: Arc<CallState>,
    client: Weak<ClientInner>,
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("ids", &self.state.ids)
            .field("done", &self.is_done())
            .finish()
    }
}

impl Call {
    /// Whether every request of the batch has been answered.
    #[must_use]
    pub fn is_done(&self) -> bool { self.state.progress().responses.is_some() }

    /// Block until the batch completes or `timeout` elapses. Responses come
    /// back in request order.
    ///
    /// # Errors
    ///
    /// [`RpcError::NoResponse`] on timeout; the batch's ids are then
    /// forgotten so late responses are dropped.
    pub fn wait(self, timeout: Duration) -> Result<Vec<Response>, RpcError> {
        let deadline = Instant::now() + timeout;
        let mut progress = self.state.progress();
        while progress.responses.is_none() {
            let now = Instant::now();
            if now >= deadline {
                drop(progress);
                if let Some(client) = self.client.upgrade() {
                    client.abandon(&self.state);
                }
                return Err(RpcError::NoResponse(self.state.ids.join(", ")));
            }
            progress = self
                .state
                .done
                .wait_timeout(progress, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(progress.responses.take().unwrap_or_default())
    }
}

/// Dropping an unfinished `Call` abandons it: its ids leave the pending
/// table and late responses are logged as unmatched. Calls handed to
/// [`JsonRpcClient::call_cb`] stay pending until answered or until the
/// client is closed.
impl Drop for Call {
    fn drop(&mut self) {
        let has_callback = self.state.progress().callback.is_some();
        if has_callback {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            client.abandon(&self.state);
        }
    }
}

struct Subscription {
    topic: String,
    queue: EventQueue,
}

struct ClientInner {
    transport: Box<dyn ClientTransport>,
    pending: DashMap<String, Arc<CallState>>,
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
    next_subscription: AtomicU64,
}

impl ClientInner {
    fn subscriptions(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn forget(&self, ids: &[String]) {
        for id in ids {
            self.pending.remove(id);
        }
    }

    /// Drop the entries `call` still owns; ids reused by a later call stay.
    fn abandon(&self, call: &Arc<CallState>) {
        for id in &call.ids {
            self.pending
                .remove_if(id, |_, owner| Arc::ptr_eq(owner, call));
        }
    }

    fn on_message(&self, message: Incoming) {
        match classify(&message.payload) {
            Ok(Inbound::Responses(responses)) => {
                for response in responses {
                    self.on_response(response);
                }
            }
            Ok(Inbound::Events(events)) => {
                for event in events {
                    self.on_event(event, message.destination.as_deref());
                }
            }
            Err(err) => warn!(error = %err, "dropping malformed message"),
        }
    }

    fn on_response(&self, response: Response) {
        let key = response.id.to_string();
        match self.pending.remove(&key) {
            Some((key, call)) => call.record(key, response),
            None => warn!(id = %key, "unmatched response id"),
        }
    }

    fn on_event(&self, event: Request, destination: Option<&str>) {
        let key = destination.unwrap_or(&event.method).to_owned();
        let event = Event {
            method: event.method,
            params: event.params,
        };
        let subscriptions = self.subscriptions();
        let mut delivered = false;
        for subscription in subscriptions
            .values()
            .filter(|s| s.topic == key || s.topic == ALL_EVENTS)
        {
            delivered = true;
            if subscription.queue.send(Some(event.clone())).is_err() {
                debug!(topic = %subscription.topic, "subscriber went away");
            }
        }
        if !delivered {
            debug!(topic = %key, method = %event.method, "no subscriber for event");
        }
    }
}

/// JSON-RPC client.
///
/// ```no_run
/// use std::time::Duration;
///
/// use hostwire::{
///     client::ClientConfig,
///     framed::FramedClient,
///     jsonrpc::JsonRpcClient,
///     reactor::Reactor,
/// };
/// use serde_json::json;
///
/// let reactor = Reactor::new().expect("reactor");
/// let transport = FramedClient::connect(ClientConfig::new("localhost", 4044), &reactor.handle())
///     .expect("connect");
/// let client = JsonRpcClient::new(transport);
/// let echo = client.request("Host.echo", Some(serde_json::from_value(json!(["hi"])).unwrap()));
/// let responses = client.call(vec![echo], Duration::from_secs(5)).expect("call");
/// assert_eq!(responses[0].result, Some(json!("hi")));
/// ```
pub struct JsonRpcClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl JsonRpcClient {
    /// Take over `transport`, replacing its message handler.
    pub fn new<T: ClientTransport + 'static>(transport: T) -> Self {
        let inner = Arc::new(ClientInner {
            transport: Box::new(transport),
            pending: DashMap::new(),
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
        });
        let weak = Arc::downgrade(&inner);
        inner.transport.set_message_handler(Arc::new(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(message);
            }
        }));
        Self { inner }
    }

    /// Build a request with a fresh id.
    #[must_use]
    pub fn request(&self, method: &str, params: Option<Params>) -> Request {
        Request::new(method, params, self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send `requests` as one batch and return without waiting.
    ///
    /// A batch made only of notifications completes immediately.
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidRequest`] for an empty batch or a repeated id,
    /// [`RpcError::Transport`] if the transport refused the payload.
    pub fn call_async(&self, requests: Vec<Request>) -> Result<Call, RpcError> {
        if requests.is_empty() {
            return Err(RpcError::InvalidRequest("empty batch".into()));
        }
        let payload = encode_requests(&requests)?;
        let ids: Vec<String> = requests
            .iter()
            .filter_map(|request| request.id.as_ref().map(Value::to_string))
            .collect();
        let state = CallState::new(ids);
        for (position, id) in state.ids.iter().enumerate() {
            if state.ids[..position].contains(id) || self.inner.pending.contains_key(id) {
                self.inner.forget(&state.ids[..position]);
                return Err(RpcError::InvalidRequest(format!("duplicate request id {id}")));
            }
            self.inner.pending.insert(id.clone(), Arc::clone(&state));
        }
        if let Err(err) = self.inner.transport.send(payload, None) {
            self.inner.forget(&state.ids);
            return Err(RpcError::Transport(err.to_string()));
        }
        Ok(Call {
            state,
            client: Arc::downgrade(&self.inner),
        })
    }

    /// Send `requests` and block until all are answered or `timeout`
    /// elapses.
    ///
    /// # Errors
    ///
    /// As for [`call_async`](Self::call_async) and [`Call::wait`].
    pub fn call(&self, requests: Vec<Request>, timeout: Duration) -> Result<Vec<Response>, RpcError> {
        self.call_async(requests)?.wait(timeout)
    }

    /// Send `requests`; `callback` receives the responses once all arrive.
    /// It runs on the reactor thread, or right away for notification-only
    /// batches.
    ///
    /// There is no timeout: the ids stay pending until every response
    /// arrives. [`close`](Self::close) abandons them, and the callback then
    /// never runs.
    ///
    /// # Errors
    ///
    /// As for [`call_async`](Self::call_async).
    pub fn call_cb<F>(&self, requests: Vec<Request>, callback: F) -> Result<(), RpcError>
    where
        F: FnOnce(Vec<Response>) + Send + 'static,
    {
        let call = self.call_async(requests)?;
        call.state.on_complete(Box::new(callback));
        Ok(())
    }

    /// Send the event `event_id` to `destination` as a notification.
    ///
    /// # Errors
    ///
    /// The schema's verdict, or [`RpcError::Transport`].
    pub fn notify(
        &self,
        event_id: &str,
        destination: &str,
        schema: &dyn EventSchema,
        params: Map<String, Value>,
    ) -> Result<(), RpcError> {
        schema.validate(event_id, &params)?;
        let request = Request::notification(event_id, Some(Params::Named(params)));
        let payload = encode_requests(&[request])?;
        self.inner
            .transport
            .send(payload, Some(destination))
            .map_err(|err| RpcError::Transport(err.to_string()))
    }

    /// Forward events on `topic` (or every event for [`ALL_EVENTS`]) to
    /// `queue`.
    ///
    /// # Errors
    ///
    /// [`RpcError::Transport`] if the transport refused the subscription.
    pub fn subscribe(&self, topic: &str, queue: EventQueue) -> Result<SubscriptionId, RpcError> {
        if topic != ALL_EVENTS {
            self.inner
                .transport
                .subscribe(topic)
                .map_err(|err| RpcError::Transport(err.to_string()))?;
        }
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.subscriptions().insert(
            id,
            Subscription {
                topic: topic.to_owned(),
                queue,
            },
        );
        Ok(id)
    }

    /// Stop forwarding for `id`, pushing the `None` sentinel into its queue.
    /// Returns `false` if `id` was not subscribed.
    ///
    /// # Errors
    ///
    /// [`RpcError::Transport`] if the transport refused to unsubscribe the
    /// topic once its last subscription went away.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, RpcError> {
        let (subscription, last) = {
            let mut subscriptions = self.inner.subscriptions();
            let Some(subscription) = subscriptions.remove(&id) else {
                return Ok(false);
            };
            let last = !subscriptions
                .values()
                .any(|other| other.topic == subscription.topic);
            (subscription, last)
        };
        if subscription.queue.send(None).is_err() {
            debug!(topic = %subscription.topic, "subscriber went away before unsubscribe");
        }
        if last && subscription.topic != ALL_EVENTS {
            self.inner
                .transport
                .unsubscribe(&subscription.topic)
                .map_err(|err| RpcError::Transport(err.to_string()))?;
        }
        Ok(true)
    }

    /// Number of calls still waiting for responses, counted by id.
    #[must_use]
    pub fn pending(&self) -> usize { self.inner.pending.len() }

    /// Close the transport and abandon every unanswered call.
    pub fn close(&self) {
        self.inner.transport.close();
        let abandoned = self.inner.pending.len();
        self.inner.pending.clear();
        if abandoned > 0 {
            debug!(abandoned, "closed with calls outstanding");
        }
    }
}
