//! Server-side protocol core: ties endpoints, registry and the group
//! engine together.
//!
//! A [`ResonateServer`] is the observer behind every server-side endpoint,
//! whether the socket was accepted (client-initiated flow) or dialed out to
//! an advertising client (server-initiated flow).

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::endpoint::reconnect::{MonitoredObserver, SessionFactory};
use crate::endpoint::transport::{BoxFrameSink, BoxFrameSource};
use crate::endpoint::{CloseReason, Endpoint, EndpointObserver};
use crate::error::{ResonateError, ResonateResult};
use crate::events::{EndpointEvent, EventEmitter};
use crate::group::{GroupEngine, MediaController, StreamFactory};
use crate::protocol::messages::{ClientHello, Message, ServerHello};
use crate::protocol_constants::PROTOCOL_VERSION;
use crate::registry::ConnectionRegistry;

/// Server identity sent in `server/hello`.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub server_id: String,
    pub name: String,
}

impl ServerIdentity {
    /// Fresh identity with a random id.
    pub fn new(name: &str) -> Self {
        Self {
            server_id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
        }
    }
}

/// The protocol server core.
pub struct ResonateServer {
    identity: ServerIdentity,
    registry: Arc<ConnectionRegistry>,
    engine: Arc<GroupEngine>,
    emitter: Arc<dyn EventEmitter>,
}

impl ResonateServer {
    pub fn new(
        identity: ServerIdentity,
        media: Arc<dyn MediaController>,
        streams: Arc<dyn StreamFactory>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = GroupEngine::new(
            Arc::clone(&registry),
            media,
            streams,
            Arc::clone(&emitter),
        );
        Arc::new(Self {
            identity,
            registry,
            engine,
            emitter,
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<GroupEngine> {
        &self.engine
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Accepts an inbound transport (client-initiated flow).
    pub fn accept(self: &Arc<Self>, sink: BoxFrameSink, source: BoxFrameSource) -> Arc<Endpoint> {
        Endpoint::accept(sink, source, Arc::clone(self) as Arc<dyn EndpointObserver>)
    }

    /// Closes every endpoint and disposes all groups.
    pub fn shutdown(&self) {
        self.engine.shutdown();
        self.registry.close_all(CloseReason::Shutdown);
    }
}

impl EndpointObserver for ResonateServer {
    fn accept_hello(&self, hello: &ClientHello) -> ResonateResult<ServerHello> {
        if hello.supported_roles.is_empty() {
            return Err(ResonateError::PayloadRange(
                "client declared no roles".into(),
            ));
        }
        if hello.version != PROTOCOL_VERSION {
            log::warn!(
                "[Server] Client {} speaks version {}, continuing with {}",
                hello.client_id,
                hello.version,
                PROTOCOL_VERSION
            );
        }
        if let Some(artwork) = hello.artwork_support.as_ref() {
            if artwork.channels.is_empty() || artwork.channels.len() > 4 {
                return Err(ResonateError::PayloadRange(format!(
                    "artwork channel table of length {}",
                    artwork.channels.len()
                )));
            }
        }
        Ok(ServerHello {
            server_id: self.identity.server_id.clone(),
            name: self.identity.name.clone(),
            version: PROTOCOL_VERSION,
        })
    }

    fn on_established(&self, endpoint: &Arc<Endpoint>) {
        let Some(hello) = endpoint.client_hello() else {
            return;
        };
        // Registration first so the group engine can resolve the id.
        self.registry
            .register(&hello.client_id, Arc::clone(endpoint));
        self.engine.attach(endpoint);
        self.emitter.emit_endpoint(EndpointEvent::Connected {
            client_id: hello.client_id.clone(),
            name: hello.name.clone(),
            roles: hello.supported_roles.clone(),
        });
    }

    fn on_message(&self, endpoint: &Arc<Endpoint>, message: Message) {
        let Some(client_id) = endpoint.peer_id().map(str::to_string) else {
            return;
        };
        match message {
            Message::ClientState(state) => {
                self.engine.handle_client_state(&client_id, &state);
            }
            Message::ClientCommand(command) => {
                if let Some(controller) = command.controller {
                    self.engine.handle_command(&client_id, &controller);
                }
            }
            Message::StreamRequestFormat(request) => {
                self.engine.handle_request_format(&client_id, &request);
            }
            other => {
                log::debug!(
                    "[Server] Unhandled {} from {}",
                    other.kind(),
                    client_id
                );
            }
        }
    }

    fn on_disconnected(&self, endpoint: &Arc<Endpoint>, reason: CloseReason, will_retry: bool) {
        let client_id = endpoint.peer_id().map(str::to_string);
        if let Some(id) = client_id.as_deref() {
            self.registry.deregister(id, endpoint);
            // A duplicate-id close means a successor connection already
            // owns this client's registration and group membership.
            if reason != CloseReason::DuplicateClient {
                self.engine.detach(id);
            }
        }
        self.emitter.emit_endpoint(EndpointEvent::Disconnected {
            client_id,
            reason,
            will_retry,
        });
    }
}

/// Session factory for the server-initiated flow: the server dials an
/// advertising client, then runs the normal server-side handshake over
/// the dialed socket.
pub struct ServerSessionFactory {
    server: Arc<ResonateServer>,
}

impl ServerSessionFactory {
    pub fn new(server: Arc<ResonateServer>) -> Arc<Self> {
        Arc::new(Self { server })
    }
}

impl SessionFactory for ServerSessionFactory {
    fn establish(
        &self,
        url: &str,
        sink: BoxFrameSink,
        source: BoxFrameSource,
        done: oneshot::Sender<(CloseReason, bool)>,
    ) -> Arc<Endpoint> {
        log::info!("[Server] Dialed client at {}", url);
        let observer = MonitoredObserver::new(
            Arc::clone(&self.server) as Arc<dyn EndpointObserver>,
            done,
        );
        Endpoint::accept_dialed(sink, source, observer)
    }
}
