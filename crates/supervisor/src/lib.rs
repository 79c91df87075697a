use std::{sync::Arc, time::Duration};

use listener::{ReplyHandler, ResponseListener};
use reqwest::{Client, Proxy};
use serde_json::{Map, Value};
use shared::{
    domain::{AppDescriptor, CommandKind, StateMatch},
    error::{CommandError, ListenerError},
    protocol::{
        CommandReply, CommandRequest, ANSWER_HOST_HEADER, ANSWER_PORT_HEADER, COMMAND_ROUTE,
    },
};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tracing::{debug, error, warn};
use url::Url;

/// How long a command POST may take before it counts as a transport failure.
/// This bounds the acknowledgement only; the real answer arrives later on the
/// response listener.
const COMMAND_ACK_TIMEOUT: Duration = Duration::from_secs(1);
const PING_TIMEOUT: Duration = Duration::from_millis(800);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to build the command transport for {app}: {reason}")]
    Setup { app: String, reason: String },
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// One-way command channel to a single application: POSTs the command body
/// and carries the reply address out-of-band in the answer headers.
pub struct CommandTransport {
    http: Client,
    app: String,
    command_url: Url,
    answer_port: u16,
    answer_host: Option<String>,
}

impl CommandTransport {
    pub fn new(
        desc: &AppDescriptor,
        answer_port: u16,
        answer_host: Option<String>,
        proxy: Option<&str>,
    ) -> Result<Self, SupervisorError> {
        let setup = |reason: String| SupervisorError::Setup {
            app: desc.name.clone(),
            reason,
        };
        let mut builder = Client::builder().timeout(COMMAND_ACK_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder
                .proxy(Proxy::all(format!("socks5h://{proxy}")).map_err(|e| setup(e.to_string()))?);
        }
        let http = builder.build().map_err(|e| setup(e.to_string()))?;
        let command_url =
            Url::parse(&format!("http://{}:{}{}", desc.host, desc.port, COMMAND_ROUTE))
                .map_err(|e| setup(e.to_string()))?;
        Ok(Self {
            http,
            app: desc.name.clone(),
            command_url,
            answer_port,
            answer_host,
        })
    }

    pub async fn send(&self, request: &CommandRequest) -> Result<(), CommandError> {
        let mut post = self
            .http
            .post(self.command_url.clone())
            .json(request)
            .header(ANSWER_PORT_HEADER, self.answer_port);
        if let Some(host) = &self.answer_host {
            post = post.header(ANSWER_HOST_HEADER, host);
        }
        let ack = post.send().await.map_err(|err| CommandError::Transport {
            app: self.app.clone(),
            command: request.id.to_string(),
            reason: err.to_string(),
        })?;
        debug!(app = %self.app, command = %request.id, status = %ack.status(), "command acknowledged");
        Ok(())
    }
}

struct QueuedReplyHandler {
    app: String,
    queue: mpsc::UnboundedSender<CommandReply>,
}

impl ReplyHandler for QueuedReplyHandler {
    fn notify(&self, reply: CommandReply) {
        if self.queue.send(reply).is_err() {
            warn!(app = %self.app, "reply arrived after its commander was dropped");
        }
    }
}

/// One-shot command/response exchange with a single application. Owns the
/// private reply queue the listener's dispatcher feeds.
pub struct AppCommander {
    app: String,
    host: String,
    port: u16,
    proxy: Option<String>,
    transport: CommandTransport,
    replies: mpsc::UnboundedReceiver<CommandReply>,
    sent_command: Option<CommandKind>,
}

impl AppCommander {
    /// Returns the commander together with the handler to register with the
    /// response listener under this application's name.
    pub fn new(
        desc: &AppDescriptor,
        answer_port: u16,
        answer_host: Option<String>,
        proxy: Option<String>,
    ) -> Result<(Self, Arc<dyn ReplyHandler>), SupervisorError> {
        let transport = CommandTransport::new(desc, answer_port, answer_host, proxy.as_deref())?;
        let (queue, replies) = mpsc::unbounded_channel();
        let handler = Arc::new(QueuedReplyHandler {
            app: desc.name.clone(),
            queue,
        });
        Ok((
            Self {
                app: desc.name.clone(),
                host: desc.host.clone(),
                port: desc.port,
                proxy,
                transport,
                replies,
                sent_command: None,
            },
            handler,
        ))
    }

    pub async fn send_command(
        &mut self,
        id: CommandKind,
        data: Map<String, Value>,
        entry_state: StateMatch,
        exit_state: StateMatch,
    ) -> Result<(), CommandError> {
        let request = CommandRequest::new(id, data, entry_state, exit_state);
        self.transport.send(&request).await?;
        self.sent_command = Some(id);
        Ok(())
    }

    /// With a zero wait this never blocks and a miss is `NoResponse`; with a
    /// positive wait it blocks up to the deadline and expiry is
    /// `ResponseTimeout`.
    pub async fn check_response(&mut self, wait: Duration) -> Result<CommandReply, CommandError> {
        if wait.is_zero() {
            return match self.replies.try_recv() {
                Ok(reply) => {
                    self.sent_command = None;
                    Ok(reply)
                }
                Err(_) => Err(CommandError::NoResponse {
                    app: self.app.clone(),
                    command: self.command_label(),
                }),
            };
        }
        match timeout(wait, self.replies.recv()).await {
            Ok(Some(reply)) => {
                debug!(app = %self.app, command = %self.command_label(), "received reply");
                self.sent_command = None;
                Ok(reply)
            }
            Ok(None) => Err(CommandError::Transport {
                app: self.app.clone(),
                command: self.command_label(),
                reason: "reply queue closed".to_string(),
            }),
            Err(_) => {
                error!(app = %self.app, command = %self.command_label(), "timeout while waiting for a reply");
                Err(CommandError::ResponseTimeout {
                    app: self.app.clone(),
                    command: self.command_label(),
                })
            }
        }
    }

    /// Raw liveness probe: a bare TCP connect with a sub-second deadline.
    /// When a proxy is configured the connect targets the proxy instead.
    pub async fn ping(&self) -> bool {
        let target = match &self.proxy {
            Some(proxy) => proxy.clone(),
            None => format!("{}:{}", self.host, self.port),
        };
        matches!(
            timeout(PING_TIMEOUT, TcpStream::connect(target)).await,
            Ok(Ok(_))
        )
    }

    fn command_label(&self) -> String {
        self.sent_command
            .map(|kind| kind.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Lightweight application wrapper binding a commander to its listener
/// registration. Tracks the last sent and last successful commands.
pub struct AppSupervisor {
    desc: Arc<AppDescriptor>,
    listener: Arc<ResponseListener>,
    commander: AppCommander,
    last_sent_command: Option<CommandKind>,
    last_ok_command: Option<CommandKind>,
}

impl AppSupervisor {
    pub async fn new(
        desc: Arc<AppDescriptor>,
        listener: Arc<ResponseListener>,
        answer_host: Option<String>,
        proxy: Option<String>,
    ) -> Result<Self, SupervisorError> {
        let (commander, handler) =
            AppCommander::new(&desc, listener.port(), answer_host, proxy)?;
        listener.register(&desc.name, handler).await?;
        Ok(Self {
            desc,
            listener,
            commander,
            last_sent_command: None,
            last_ok_command: None,
        })
    }

    pub fn descriptor(&self) -> &Arc<AppDescriptor> {
        &self.desc
    }

    pub fn last_sent_command(&self) -> Option<CommandKind> {
        self.last_sent_command
    }

    pub fn last_ok_command(&self) -> Option<CommandKind> {
        self.last_ok_command
    }

    /// Callers are expected to collect one command's reply before sending the
    /// next to the same application; with overlapping sends, attribution of
    /// the replies is up to the application's own answer order.
    pub async fn send_command(
        &mut self,
        id: CommandKind,
        data: Map<String, Value>,
        entry_state: StateMatch,
        exit_state: StateMatch,
    ) -> Result<(), CommandError> {
        self.listener.await_ready().await;
        self.last_sent_command = Some(id);
        self.commander
            .send_command(id, data, entry_state, exit_state)
            .await
    }

    pub async fn check_response(&mut self, wait: Duration) -> Result<CommandReply, CommandError> {
        let reply = self.commander.check_response(wait).await?;
        if reply.is_success() {
            self.last_ok_command = self.last_sent_command;
        }
        Ok(reply)
    }

    pub async fn send_command_and_wait(
        &mut self,
        id: CommandKind,
        data: Map<String, Value>,
        entry_state: StateMatch,
        exit_state: StateMatch,
        wait: Duration,
    ) -> Result<CommandReply, CommandError> {
        self.send_command(id, data, entry_state, exit_state).await?;
        self.check_response(wait).await
    }

    pub async fn ping(&self) -> bool {
        self.commander.ping().await
    }

    /// Releases the listener registration; late replies for this application
    /// are dropped with a warning from then on.
    pub async fn terminate(self) {
        self.listener.unregister(&self.desc.name).await;
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
