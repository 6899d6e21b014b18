//! The connection multiplexer: accepts clients, runs the handshake, owns
//! the [`ClientRegistry`], and routes inbound frames to reserved or user
//! handlers.

use std::future::Future;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

use linkwire_core::{self as core, BoxFuture, Dispatcher, HandlerError};

use crate::cache::MessageCache;
use crate::control::{self, Control};
use crate::error::{Error, Result};
use crate::identity::{validate_address, Address, ClientInfo};
use crate::keepalive::{KeepaliveState, KEEPALIVE_GRACE, KEEPALIVE_INTERVAL};
use crate::registry::{ClientRegistry, ConnectionId, ConnectionIdGenerator};
use crate::value::Target;

const RESERVED_COMMANDS: &[&str] = &["join", "leave", "message", "name_change", "group_change", "*"];

fn is_reserved(command: &str) -> bool {
    RESERVED_COMMANDS.contains(&command)
}

/// Bind and listen with the caller's backlog, which `tokio::net::TcpListener`
/// has no constructor for directly. `socket2` gives us the raw `listen(2)`
/// call; the socket is then handed back to tokio for async I/O.
fn bind_listener(host: &str, port: u16, backlog: u32) -> Result<TcpListener> {
    use socket2::{Domain, Socket, Type};

    let addr: std::net::SocketAddr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::ServerException(format!("could not resolve {host}:{port}")))?;
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let backlog = if backlog == 0 { i32::MAX } else { backlog as i32 };
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Construction-time tunables for [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub header_len: usize,
    /// `<= 0` disables the message cache, matching the reference
    /// implementation's `cache_size` convention.
    pub cache_size: i64,
    pub keepalive: bool,
    /// `0` means unlimited (mapped to `i32::MAX` for the underlying `listen`
    /// call, since the OS has no literal "unlimited" backlog).
    pub backlog: u32,
    /// `None` means unlimited. A newly accepted connection past this limit
    /// is closed before the handshake is read.
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            header_len: core::DEFAULT_HEADER_LEN,
            cache_size: -1,
            keepalive: true,
            backlog: 1024,
            max_connections: None,
        }
    }
}

type JoinLeaveFn = Arc<dyn Fn(ClientInfo) -> BoxFuture<'static, ()> + Send + Sync>;
type MessageFn = Arc<dyn Fn(ClientInfo, String, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;
type RenameFn = Arc<dyn Fn(ClientInfo, Option<String>, Option<String>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct ReservedHandlers {
    join: RwLock<Option<JoinLeaveFn>>,
    leave: RwLock<Option<JoinLeaveFn>>,
    message: RwLock<Option<MessageFn>>,
    name_change: RwLock<Option<RenameFn>>,
    group_change: RwLock<Option<RenameFn>>,
    wildcard: RwLock<Option<MessageFn>>,
}

struct Connection {
    write_half: AsyncMutex<OwnedWriteHalf>,
}

struct ServerState {
    config: ServerConfig,
    local_addr: Address,
    registry: ClientRegistry,
    id_gen: ConnectionIdGenerator,
    connections: RwLock<std::collections::HashMap<ConnectionId, Arc<Connection>>>,
    dispatcher: Dispatcher<ClientInfo>,
    reserved: ReservedHandlers,
    keepalive: KeepaliveState,
    cache: MessageCache,
    closed: AtomicBool,
    shutdown: tokio::sync::Notify,
}

/// A message-oriented TCP server tracking per-connection identity.
///
/// Cheap to clone: internally an `Arc`. Register handlers with [`on`] or the
/// dedicated `on_*` reserved-command methods before calling [`start`].
#[derive(Clone)]
pub struct Server {
    listener: Arc<AsyncMutex<Option<TcpListener>>>,
    state: Arc<ServerState>,
}

impl Server {
    pub async fn bind(host: &str, port: u16, config: ServerConfig) -> Result<Server> {
        validate_address(host, port).map_err(|e| Error::ServerException(e.to_string()))?;
        let listener = bind_listener(host, port, config.backlog)?;
        let local_addr = listener.local_addr()?;
        let cache = MessageCache::new(config.cache_size);
        Ok(Server {
            listener: Arc::new(AsyncMutex::new(Some(listener))),
            state: Arc::new(ServerState {
                config,
                local_addr: Address {
                    host: local_addr.ip().to_string(),
                    port: local_addr.port(),
                },
                registry: ClientRegistry::new(),
                id_gen: ConnectionIdGenerator::new(),
                connections: RwLock::new(std::collections::HashMap::new()),
                dispatcher: Dispatcher::new(),
                reserved: ReservedHandlers::default(),
                keepalive: KeepaliveState::new(),
                cache,
                closed: AtomicBool::new(false),
                shutdown: tokio::sync::Notify::new(),
            }),
        })
    }

    /// The address this server is bound to. Useful after binding to port 0
    /// to discover the OS-assigned ephemeral port.
    pub fn local_addr(&self) -> Address {
        self.state.local_addr.clone()
    }

    /// Shorthand for `local_addr().port`.
    pub fn local_port(&self) -> u16 {
        self.state.local_addr.port
    }

    /// Snapshot of recently dispatched messages, for introspection/tests.
    /// Empty when the cache is disabled (`cache_size < 0`, the default).
    pub fn cached_messages(&self) -> Vec<crate::cache::MessageCacheEntry> {
        self.state.cache.snapshot()
    }

    // -- handler registration -------------------------------------------

    /// Register a handler for a user command. Reserved command names are
    /// rejected unless `override_reserved` is set, in which case the name
    /// is treated as an ordinary user command from then on.
    pub fn on<F, Fut>(
        &self,
        command: impl Into<String>,
        target: Option<Target>,
        threaded: bool,
        override_reserved: bool,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(ClientInfo, linkwire_core::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let command = command.into();
        if is_reserved(&command) && !override_reserved {
            return Err(Error::HandlerArity {
                command,
                expected: "use the dedicated on_<reserved> method, or pass override_reserved = true",
            });
        }
        let target = target.unwrap_or(Target::Bytes);
        let handler = Arc::new(handler);
        self.state
            .dispatcher
            .register(command, "user handler", threaded, false, move |ctx, bytes| {
                let handler = handler.clone();
                async move {
                    match linkwire_core::value::shallow::decode_as(&bytes, target.into()) {
                        Ok(value) => handler(ctx, value)
                            .await
                            .map_err(|e| HandlerError(e.to_string())),
                        Err(e) => {
                            tracing::warn!(error = %e, "user command payload failed type coercion");
                            Ok(())
                        }
                    }
                }
            })
            .map_err(|e| Error::ServerException(e.to_string()))
    }

    pub fn on_join<F, Fut>(&self, handler: F)
    where
        F: Fn(ClientInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.state.reserved.join.write() = Some(Arc::new(move |info| Box::pin(handler(info))));
    }

    pub fn on_leave<F, Fut>(&self, handler: F)
    where
        F: Fn(ClientInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.state.reserved.leave.write() = Some(Arc::new(move |info| Box::pin(handler(info))));
    }

    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(ClientInfo, String, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.state.reserved.message.write() =
            Some(Arc::new(move |info, cmd, msg| Box::pin(handler(info, cmd, msg))));
    }

    pub fn on_wildcard<F, Fut>(&self, handler: F)
    where
        F: Fn(ClientInfo, String, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.state.reserved.wildcard.write() =
            Some(Arc::new(move |info, cmd, msg| Box::pin(handler(info, cmd, msg))));
    }

    pub fn on_name_change<F, Fut>(&self, handler: F)
    where
        F: Fn(ClientInfo, Option<String>, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.state.reserved.name_change.write() =
            Some(Arc::new(move |info, old, new| Box::pin(handler(info, old, new))));
    }

    pub fn on_group_change<F, Fut>(&self, handler: F)
    where
        F: Fn(ClientInfo, Option<String>, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.state.reserved.group_change.write() =
            Some(Arc::new(move |info, old, new| Box::pin(handler(info, old, new))));
    }

    // -- blocking recv -----------------------------------------------------

    /// Block until the next inbound user command (from any client) matching
    /// `command` arrives, or the next arbitrary one if `command` is `None`.
    pub async fn recv(&self, command: Option<&str>) -> Vec<u8> {
        self.state.dispatcher.recv(command).await
    }

    // -- queries -------------------------------------------------------

    pub fn get_client(&self, identifier: &str) -> Result<ClientInfo> {
        self.state
            .registry
            .lookup_by_identifier(identifier)
            .map(|(_, info)| info)
            .ok_or(Error::ClientNotFound)
    }

    pub fn get_group(&self, group: &str) -> Vec<ClientInfo> {
        self.state
            .registry
            .find_by_group(group)
            .into_iter()
            .map(|(_, info)| info)
            .collect()
    }

    pub fn get_all_clients(&self) -> Vec<ClientInfo> {
        self.state.registry.all().into_iter().map(|(_, info)| info).collect()
    }

    // -- sending -------------------------------------------------------

    pub async fn send_client(&self, identifier: &str, command: &str, message: &[u8]) -> Result<()> {
        let (id, _) = self
            .state
            .registry
            .lookup_by_identifier(identifier)
            .ok_or(Error::ClientNotFound)?;
        self.send_raw_to(id, &control::build_command(command, message)).await
    }

    pub async fn send_group(&self, group: &str, command: &str, message: &[u8]) -> Result<()> {
        let members = self.state.registry.find_by_group(group);
        if members.is_empty() {
            return Err(Error::GroupNotFound);
        }
        let payload = control::build_command(command, message);
        for (id, _) in members {
            self.send_raw_to(id, &payload).await?;
        }
        Ok(())
    }

    pub async fn send_all_clients(&self, command: &str, message: &[u8]) -> Result<()> {
        let payload = control::build_command(command, message);
        let ids: Vec<ConnectionId> = self.state.connections.read().keys().copied().collect();
        for id in ids {
            self.send_raw_to(id, &payload).await?;
        }
        Ok(())
    }

    async fn send_raw_to(&self, id: ConnectionId, payload: &[u8]) -> Result<()> {
        let conn = {
            let conns = self.state.connections.read();
            conns.get(&id).cloned()
        };
        let Some(conn) = conn else { return Ok(()) };
        let mut writer = conn.write_half.lock().await;
        core::send_frame(&mut *writer, payload, self.state.config.header_len).await?;
        Ok(())
    }

    // -- disconnection ---------------------------------------------------

    pub async fn disconnect_client(&self, identifier: &str, force: bool, call_leave: bool) -> Result<()> {
        let (id, _) = self
            .state
            .registry
            .lookup_by_identifier(identifier)
            .ok_or(Error::ClientNotFound)?;
        self.disconnect_connection(id, force, call_leave).await;
        Ok(())
    }

    pub async fn disconnect_all_clients(&self, force: bool) {
        let ids: Vec<ConnectionId> = self.state.connections.read().keys().copied().collect();
        for id in ids {
            self.disconnect_connection(id, force, true).await;
        }
    }

    async fn disconnect_connection(&self, id: ConnectionId, force: bool, call_leave: bool) {
        if !force {
            let _ = self.send_raw_to(id, &control::build_disconnect()).await;
        }
        self.state.keepalive.forget(id);
        let removed = self.state.registry.remove(id);
        self.state.connections.write().remove(&id);

        if let Some(info) = removed {
            let broadcast = control::build_client_disconnect(&info);
            let other_ids: Vec<ConnectionId> = self.state.connections.read().keys().copied().collect();
            for other in other_ids {
                let _ = self.send_raw_to(other, &broadcast).await;
            }
            if call_leave {
                if let Some(handler) = self.state.reserved.leave.read().clone() {
                    handler(info).await;
                }
            }
        }
    }

    // -- lifecycle -------------------------------------------------------

    /// Run the accept loop until [`close`](Server::close) is called.
    pub async fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::ServerException("server already started".to_string()))?;

        if self.state.config.keepalive {
            self.spawn_keepalive();
        }

        loop {
            tokio::select! {
                _ = self.state.shutdown.notified() => {
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    if let Some(max) = self.state.config.max_connections {
                        if self.state.connections.read().len() >= max {
                            tracing::warn!(peer = %peer, max, "rejecting connection: max_connections reached");
                            continue;
                        }
                    }
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_connection(stream, peer).await {
                            tracing::warn!(peer = %peer, error = %e, "connection ended with an error");
                        }
                    });
                }
            }
        }
    }

    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.state.shutdown.notify_waiters();
        self.state.connections.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    fn spawn_keepalive(&self) {
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server.state.shutdown.notified() => return,
                    _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {}
                }
                let connected: Vec<ConnectionId> = server.state.connections.read().keys().copied().collect();
                server.state.keepalive.begin_round(connected.iter().copied());
                let probe = control::build_keepalive();
                for id in &connected {
                    let _ = server.send_raw_to(*id, &probe).await;
                }

                tokio::select! {
                    _ = server.state.shutdown.notified() => return,
                    _ = tokio::time::sleep(KEEPALIVE_GRACE) => {}
                }
                for id in server.state.keepalive.end_round() {
                    server.disconnect_connection(id, true, true).await;
                }
            }
        });
    }

    async fn serve_connection(&self, stream: TcpStream, peer: std::net::SocketAddr) -> Result<()> {
        let (mut read_half, write_half) = stream.into_split();
        let header_len = self.state.config.header_len;

        let frame = core::receive_frame(&mut read_half, header_len).await?;
        let Control::ClientHello { name, group } = control::classify(&frame.payload)
            .map_err(|e| Error::ServerException(e.to_string()))?
        else {
            return Err(Error::ServerException(
                "first frame from a new connection must be $CLTHELLO$".to_string(),
            ));
        };

        let address = Address {
            host: peer.ip().to_string(),
            port: peer.port(),
        };
        let info = ClientInfo { address, name, group };
        let id = self.state.id_gen.next();
        self.state
            .registry
            .insert(id, info.clone())
            .map_err(|e| Error::ServerException(e.to_string()))?;
        self.state.connections.write().insert(
            id,
            Arc::new(Connection {
                write_half: AsyncMutex::new(write_half),
            }),
        );

        let broadcast = control::build_client_connect(&info);
        let other_ids: Vec<ConnectionId> = self.state.connections.read().keys().copied().filter(|&i| i != id).collect();
        for other in other_ids {
            let _ = self.send_raw_to(other, &broadcast).await;
        }
        if let Some(handler) = self.state.reserved.join.read().clone() {
            handler(info.clone()).await;
        }

        loop {
            let frame = match core::receive_frame(&mut read_half, header_len).await {
                Ok(frame) => frame,
                Err(linkwire_core::CoreError::Disconnected) => {
                    self.disconnect_connection(id, false, true).await;
                    return Ok(());
                }
                Err(e) => {
                    self.disconnect_connection(id, true, true).await;
                    return Err(e.into());
                }
            };

            let control = match control::classify(&frame.payload) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "dropping unparseable frame");
                    continue;
                }
            };

            if self.handle_control(id, control, frame.header).await? {
                return Ok(());
            }
        }
    }

    /// Returns `Ok(true)` if the connection should stop being served.
    async fn handle_control(&self, id: ConnectionId, control: Control, header: Vec<u8>) -> Result<bool> {
        match control {
            Control::ClientHello { .. } | Control::ClientConnect(_) | Control::ClientDisconnect(_) => {
                // Unexpected after handshake; ignore rather than tear down the
                // connection over a redundant control frame.
                Ok(false)
            }
            Control::UserClose => {
                self.disconnect_connection(id, true, true).await;
                Ok(true)
            }
            Control::Disconnect => Ok(true),
            Control::KeepAck => {
                self.state.keepalive.acknowledge(id);
                Ok(false)
            }
            Control::Keepalive => Ok(false),
            Control::ChangeName(new_name) => {
                self.apply_rename(id, Some(new_name), None).await;
                Ok(false)
            }
            Control::ChangeGroup(new_group) => {
                self.apply_rename(id, None, Some(new_group)).await;
                Ok(false)
            }
            Control::GetClient(identifier) => {
                let reply = match self.state.registry.lookup_by_identifier(&identifier) {
                    Some((_, info)) => control::build_client_info_reply(&info),
                    None => control::build_lookup_miss(),
                };
                self.send_raw_to(id, &reply).await?;
                Ok(false)
            }
            Control::Command { command, message } => {
                self.dispatch_user_command(id, command, message, header).await;
                Ok(false)
            }
        }
    }

    async fn apply_rename(&self, id: ConnectionId, name: Option<String>, group: Option<String>) {
        let name = name.filter(|s| !s.is_empty()).map(Some);
        let group = group.filter(|s| !s.is_empty()).map(Some);
        let Ok((old, new)) = self.state.registry.rename_or_regroup(id, name.clone(), group.clone()) else {
            return;
        };
        if name.is_some() {
            if let Some(handler) = self.state.reserved.name_change.read().clone() {
                handler(new.clone(), old.name.clone(), new.name.clone()).await;
            }
        }
        if group.is_some() {
            if let Some(handler) = self.state.reserved.group_change.read().clone() {
                handler(new.clone(), old.group.clone(), new.group.clone()).await;
            }
        }
    }

    async fn dispatch_user_command(&self, id: ConnectionId, command: String, message: Vec<u8>, header: Vec<u8>) {
        let Some(info) = self.state.registry.get(id) else { return };

        let outcome = self
            .state
            .dispatcher
            .dispatch(info.clone(), &command, message.clone())
            .await;
        let dispatched = matches!(
            outcome,
            core::DispatchOutcome::Handled | core::DispatchOutcome::DeliveredToWaiter
        );
        self.state
            .cache
            .record(header, message.clone(), command.clone(), dispatched);

        if dispatched {
            if let Some(handler) = self.state.reserved.message.read().clone() {
                handler(info, command, message).await;
            }
            return;
        }

        if let Some(handler) = self.state.reserved.wildcard.read().clone() {
            handler(info, command, message).await;
            return;
        }

        tracing::warn!(command = %command, "no handler registered for command");
    }
}
