use std::{collections::HashMap, io::ErrorKind, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use shared::{
    error::ListenerError,
    protocol::{CommandReply, READY_BODY, READY_ROUTE, RESPONSE_ROUTE},
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

const INBOUND_QUEUE_DEPTH: usize = 256;
const READY_PROBE_ATTEMPTS: u32 = 20;
const READY_PROBE_DELAY: Duration = Duration::from_millis(500);

/// Target of a dispatched reply. One handler is registered per application
/// name; the dispatcher invokes handlers one at a time, never concurrently.
pub trait ReplyHandler: Send + Sync {
    fn notify(&self, reply: CommandReply);
}

enum Inbound {
    Reply(CommandReply),
    Stop,
}

type HandlerTable = Arc<Mutex<HashMap<String, Arc<dyn ReplyHandler>>>>;

#[derive(Clone)]
struct EndpointState {
    inbound: mpsc::Sender<Inbound>,
}

/// The single inbound endpoint for every application's asynchronous replies.
///
/// Binds one port exclusively for its whole lifetime, accepts replies on
/// `/response` and routes each to the handler registered under the reply's
/// `appname`. Routing runs on a dedicated dispatcher task fed by a bounded
/// queue; the HTTP endpoint only parses and enqueues.
pub struct ResponseListener {
    port: u16,
    handlers: HandlerTable,
    inbound: mpsc::Sender<Inbound>,
    ready_rx: watch::Receiver<bool>,
    _ready_tx: watch::Sender<bool>,
    server: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl ResponseListener {
    /// Binds the reply endpoint and waits for it to answer its readiness
    /// probe. Passing port 0 picks an ephemeral port; `port()` reports the
    /// actual one.
    pub async fn bind(port: u16) -> Result<Self, ListenerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let tcp = TcpListener::bind(addr).await.map_err(|err| {
            if err.kind() == ErrorKind::AddrInUse {
                ListenerError::PortInUse(port)
            } else {
                ListenerError::Bind(err)
            }
        })?;
        let port = tcp.local_addr().map_err(ListenerError::Bind)?.port();

        let (inbound, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = watch::channel(false);
        let handlers: HandlerTable = Arc::new(Mutex::new(HashMap::new()));

        let app = router(EndpointState {
            inbound: inbound.clone(),
        });
        let server = tokio::spawn(async move {
            if let Err(error) = axum::serve(tcp, app).await {
                error!(%error, "response listener endpoint failed");
            }
        });
        let dispatcher = tokio::spawn(dispatch_loop(inbound_rx, handlers.clone()));

        if let Err(err) = await_endpoint_ready(port).await {
            server.abort();
            dispatcher.abort();
            return Err(err);
        }
        let _ = ready_tx.send(true);
        info!(port, "response listener serving");

        Ok(Self {
            port,
            handlers,
            inbound,
            ready_rx,
            _ready_tx: ready_tx,
            server: Some(server),
            dispatcher: Some(dispatcher),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Blocks the caller until the startup handshake has completed. Senders
    /// use this to avoid racing a command against the endpoint coming up.
    pub async fn await_ready(&self) {
        let mut ready = self.ready_rx.clone();
        let _ = ready.wait_for(|flag| *flag).await;
    }

    pub async fn register(
        &self,
        app: &str,
        handler: Arc<dyn ReplyHandler>,
    ) -> Result<(), ListenerError> {
        let mut handlers = self.handlers.lock().await;
        if handlers.contains_key(app) {
            return Err(ListenerError::DuplicateHandler(app.to_string()));
        }
        handlers.insert(app.to_string(), handler);
        Ok(())
    }

    /// Idempotent. Once unregistered, late replies for the name are dropped
    /// with a warning; that is the expected fate of a reply arriving after a
    /// timeout, not an error.
    pub async fn unregister(&self, app: &str) {
        let mut handlers = self.handlers.lock().await;
        if handlers.remove(app).is_none() {
            debug!(app, "unregister: no handler was registered");
        }
    }

    /// The only supported stop path. The endpoint task is cancelled, then a
    /// sentinel is queued behind any pending replies so the dispatcher drains
    /// them before exiting.
    pub async fn terminate(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
            let _ = server.await;
        }
        if self.inbound.send(Inbound::Stop).await.is_err() {
            warn!("response dispatcher already stopped");
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.await.is_err() {
                warn!("response dispatcher did not stop cleanly");
            }
        }
        info!(port = self.port, "response listener terminated");
    }
}

impl Drop for ResponseListener {
    fn drop(&mut self) {
        if let Some(server) = &self.server {
            server.abort();
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.abort();
        }
    }
}

fn router(state: EndpointState) -> Router {
    Router::new()
        .route("/", get(ready_status))
        .route(READY_ROUTE, get(ready_status))
        .route(RESPONSE_ROUTE, post(receive_reply))
        .with_state(state)
}

async fn ready_status() -> &'static str {
    READY_BODY
}

async fn receive_reply(State(state): State<EndpointState>, Json(raw): Json<Value>) -> &'static str {
    match serde_json::from_value::<CommandReply>(raw) {
        Ok(reply) => {
            if state.inbound.send(Inbound::Reply(reply)).await.is_err() {
                warn!("reply arrived after dispatcher shutdown; dropping");
            }
        }
        Err(error) => {
            warn!(%error, "dropping reply without a usable 'appname' field");
        }
    }
    "Response received"
}

async fn dispatch_loop(mut inbound: mpsc::Receiver<Inbound>, handlers: HandlerTable) {
    while let Some(item) = inbound.recv().await {
        match item {
            Inbound::Stop => break,
            Inbound::Reply(reply) => {
                let handler = handlers.lock().await.get(&reply.appname).cloned();
                match handler {
                    Some(handler) => handler.notify(reply),
                    None => {
                        warn!(app = %reply.appname, "received notification for unregistered app")
                    }
                }
            }
        }
    }
    debug!("response dispatcher drained and stopped");
}

async fn await_endpoint_ready(port: u16) -> Result<(), ListenerError> {
    let probe = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}{READY_ROUTE}");
    for _ in 0..READY_PROBE_ATTEMPTS {
        if let Ok(response) = probe.get(&url).send().await {
            if let Ok(text) = response.text().await {
                if text == READY_BODY {
                    return Ok(());
                }
            }
        }
        tokio::time::sleep(READY_PROBE_DELAY).await;
    }
    Err(ListenerError::Unreachable {
        attempts: READY_PROBE_ATTEMPTS,
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
