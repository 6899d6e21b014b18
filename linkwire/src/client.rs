//! The client connection: opens the socket, emits the hello, and drives a
//! background read loop that classifies inbound frames and routes them to
//! reserved handlers, the command dispatcher, or a blocking [`recv`](Client::recv)
//! waiter.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use linkwire_core::{self as core, BoxFuture, Dispatcher, HandlerError};

use crate::cache::MessageCache;
use crate::control::{self, Control, LookupReply};
use crate::error::{Error, Result};
use crate::identity::{Address, ClientInfo};
use crate::value::Target;

/// Construction-time tunables for [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub header_len: usize,
    /// `<= 0` disables the message cache, matching [`crate::server::ServerConfig`].
    pub cache_size: i64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            header_len: core::DEFAULT_HEADER_LEN,
            cache_size: -1,
        }
    }
}

type ConnectFn = Arc<dyn Fn(ClientInfo) -> BoxFuture<'static, ()> + Send + Sync>;
type ForceDisconnectFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct ReservedHandlers {
    client_connect: RwLock<Option<ConnectFn>>,
    client_disconnect: RwLock<Option<ConnectFn>>,
    force_disconnect: RwLock<Option<ForceDisconnectFn>>,
}

/// The name/group remembered at handshake time, so `change_name(None)` and
/// `change_group(None)` know what to restore.
struct Identity {
    initial_name: Option<String>,
    initial_group: Option<String>,
}

struct ClientState {
    config: ClientConfig,
    server_addr: Address,
    local_addr: Address,
    read_half: AsyncMutex<Option<OwnedReadHalf>>,
    write_half: AsyncMutex<OwnedWriteHalf>,
    dispatcher: Dispatcher<()>,
    reserved: ReservedHandlers,
    identity: Identity,
    lookup_waiters: Mutex<VecDeque<oneshot::Sender<LookupReply>>>,
    cache: MessageCache,
    closed: AtomicBool,
    shutdown: tokio::sync::Notify,
}

/// A persistent TCP connection to a [`crate::Server`], with named-command
/// dispatch and in-band identity/keepalive handling.
///
/// Cheap to clone: internally an `Arc`. Register handlers with [`on`] before
/// calling [`start`], since the read loop begins routing frames as soon as
/// it runs.
#[derive(Clone)]
pub struct Client {
    state: Arc<ClientState>,
}

impl Client {
    /// Connect to `host:port` and send the hello. Call
    /// [`start`](Client::start) to begin the read loop after registering
    /// handlers.
    pub async fn connect(
        host: &str,
        port: u16,
        name: Option<&str>,
        group: Option<&str>,
        config: ClientConfig,
    ) -> Result<Client> {
        crate::identity::validate_address(host, port)
            .map_err(|e| Error::ClientException(e.to_string()))?;

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|_| Error::ServerNotRunning)?;
        let local = stream.local_addr()?;
        let (read_half, mut write_half) = stream.into_split();

        core::send_frame(
            &mut write_half,
            &control::build_hello(name, group),
            config.header_len,
        )
        .await?;

        Ok(Client {
            state: Arc::new(ClientState {
                server_addr: Address {
                    host: host.to_string(),
                    port,
                },
                local_addr: Address {
                    host: local.ip().to_string(),
                    port: local.port(),
                },
                read_half: AsyncMutex::new(Some(read_half)),
                write_half: AsyncMutex::new(write_half),
                dispatcher: Dispatcher::new(),
                reserved: ReservedHandlers::default(),
                identity: Identity {
                    initial_name: name.map(String::from),
                    initial_group: group.map(String::from),
                },
                lookup_waiters: Mutex::new(VecDeque::new()),
                cache: MessageCache::new(config.cache_size),
                closed: AtomicBool::new(false),
                shutdown: tokio::sync::Notify::new(),
                config,
            }),
        })
    }

    pub fn cached_messages(&self) -> Vec<crate::cache::MessageCacheEntry> {
        self.state.cache.snapshot()
    }

    pub fn get_server_addr(&self) -> Address {
        self.state.server_addr.clone()
    }

    pub fn get_client_addr(&self) -> Address {
        self.state.local_addr.clone()
    }

    // -- handler registration -------------------------------------------

    /// Register a handler for a user command.
    pub fn on<F, Fut>(
        &self,
        command: impl Into<String>,
        target: Option<Target>,
        threaded: bool,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(linkwire_core::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let target = target.unwrap_or(Target::Bytes);
        let handler = Arc::new(handler);
        self.state
            .dispatcher
            .register(command, "user handler", threaded, false, move |(), bytes| {
                let handler = handler.clone();
                async move {
                    match linkwire_core::value::shallow::decode_as(&bytes, target.into()) {
                        Ok(value) => handler(value).await.map_err(|e| HandlerError(e.to_string())),
                        Err(e) => {
                            tracing::warn!(error = %e, "user command payload failed type coercion");
                            Ok(())
                        }
                    }
                }
            })
            .map_err(|e| Error::ClientException(e.to_string()))
    }

    pub fn on_client_connect<F, Fut>(&self, handler: F)
    where
        F: Fn(ClientInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.state.reserved.client_connect.write() = Some(Arc::new(move |info| Box::pin(handler(info))));
    }

    pub fn on_client_disconnect<F, Fut>(&self, handler: F)
    where
        F: Fn(ClientInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.state.reserved.client_disconnect.write() = Some(Arc::new(move |info| Box::pin(handler(info))));
    }

    pub fn on_force_disconnect<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.state.reserved.force_disconnect.write() = Some(Arc::new(move || Box::pin(handler())));
    }

    // -- sending / receiving ---------------------------------------------

    pub async fn send(&self, command: &str, message: &[u8]) -> Result<()> {
        self.send_raw(&control::build_command(command, message)).await
    }

    /// Block until the next inbound user command matching `command` arrives,
    /// or the next arbitrary one if `command` is `None`.
    pub async fn recv(&self, command: Option<&str>) -> Vec<u8> {
        self.state.dispatcher.recv(command).await
    }

    /// Look up a client on the server by `ip:port` or name.
    pub async fn get_client(&self, identifier: &str) -> Result<ClientInfo> {
        let (tx, rx) = oneshot::channel();
        self.state.lookup_waiters.lock().push_back(tx);
        self.send_raw(&control::build_get_client(identifier)).await?;
        match rx.await {
            Ok(LookupReply::Found(info)) => Ok(info),
            Ok(LookupReply::Miss) | Err(_) => Err(Error::ClientNotFound),
        }
    }

    /// Send `$CHNAME$`. `None` restores the name passed to [`connect`](Client::connect).
    pub async fn change_name(&self, new_name: Option<&str>) -> Result<()> {
        let to_send = new_name
            .map(str::to_string)
            .unwrap_or_else(|| self.state.identity.initial_name.clone().unwrap_or_default());
        self.send_raw(&control::build_change_name(&to_send)).await
    }

    /// Send `$CHGROUP$`. `None` restores the group passed to [`connect`](Client::connect).
    pub async fn change_group(&self, new_group: Option<&str>) -> Result<()> {
        let to_send = new_group
            .map(str::to_string)
            .unwrap_or_else(|| self.state.identity.initial_group.clone().unwrap_or_default());
        self.send_raw(&control::build_change_group(&to_send)).await
    }

    async fn send_raw(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.state.write_half.lock().await;
        core::send_frame(&mut *writer, payload, self.state.config.header_len).await?;
        Ok(())
    }

    // -- lifecycle -------------------------------------------------------

    /// Send `$USRCLOSE$` (if `emit_leave`) and stop the read loop.
    pub async fn close(&self, emit_leave: bool) {
        if emit_leave {
            let _ = self.send_raw(&control::build_user_close()).await;
        }
        self.state.closed.store(true, Ordering::Release);
        self.state.shutdown.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Run the read loop until [`close`](Client::close) is called or the
    /// server disconnects. Consumes the read half stashed by
    /// [`connect`](Client::connect); calling this twice returns
    /// [`Error::ClientException`].
    pub async fn start(&self) -> Result<()> {
        let mut read_half = self
            .state
            .read_half
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::ClientException("client already started".to_string()))?;
        let header_len = self.state.config.header_len;

        loop {
            let frame = tokio::select! {
                _ = self.state.shutdown.notified() => return Ok(()),
                frame = core::receive_frame(&mut read_half, header_len) => frame,
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(linkwire_core::CoreError::Disconnected) => return Err(Error::ServerNotRunning),
                Err(e) => return Err(e.into()),
            };

            match control::classify(&frame.payload) {
                Ok(control) => {
                    if self.handle_control(control, frame.header).await? {
                        return Ok(());
                    }
                }
                Err(_) => {
                    if let Some(reply) = control::try_parse_lookup_reply(&frame.payload) {
                        self.fulfil_lookup(reply);
                    } else {
                        tracing::warn!(
                            bytes = frame.payload.len(),
                            "dropping unparseable frame from server"
                        );
                    }
                }
            }
        }
    }

    fn fulfil_lookup(&self, reply: LookupReply) {
        if let Some(tx) = self.state.lookup_waiters.lock().pop_front() {
            let _ = tx.send(reply);
        }
    }

    /// Returns `Ok(true)` if the read loop should stop.
    async fn handle_control(&self, control: Control, header: Vec<u8>) -> Result<bool> {
        match control {
            Control::Keepalive => {
                self.send_raw(&control::build_keepack()).await?;
                Ok(false)
            }
            Control::Disconnect => {
                if let Some(handler) = self.state.reserved.force_disconnect.read().clone() {
                    handler().await;
                }
                Ok(true)
            }
            Control::ClientConnect(info) => {
                if let Some(handler) = self.state.reserved.client_connect.read().clone() {
                    handler(info).await;
                }
                Ok(false)
            }
            Control::ClientDisconnect(info) => {
                if let Some(handler) = self.state.reserved.client_disconnect.read().clone() {
                    handler(info).await;
                }
                Ok(false)
            }
            Control::Command { command, message } => {
                self.dispatch_user_command(command, message, header).await;
                Ok(false)
            }
            // Not sent server -> client in the reference protocol; tolerated
            // rather than torn down over, matching the server's treatment of
            // unexpected-but-classifiable control frames.
            Control::ClientHello { .. }
            | Control::ChangeName(_)
            | Control::ChangeGroup(_)
            | Control::GetClient(_)
            | Control::KeepAck
            | Control::UserClose => Ok(false),
        }
    }

    async fn dispatch_user_command(&self, command: String, message: Vec<u8>, header: Vec<u8>) {
        let outcome = self.state.dispatcher.dispatch((), &command, message.clone()).await;
        let dispatched = matches!(
            outcome,
            core::DispatchOutcome::Handled | core::DispatchOutcome::DeliveredToWaiter
        );
        self.state.cache.record(header, message, command.clone(), dispatched);
        if !dispatched {
            tracing::warn!(command = %command, "no handler registered for command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn connected_pair(name: Option<&str>, group: Option<&str>) -> (Client, TcpStream) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = Client::connect(
            &addr.ip().to_string(),
            addr.port(),
            name,
            group,
            ClientConfig::default(),
        )
        .await
        .unwrap();
        let mut server_side = accept.await.unwrap();

        // drain the hello frame so subsequent test I/O starts clean
        let frame = core::receive_frame(&mut server_side, core::DEFAULT_HEADER_LEN)
            .await
            .unwrap();
        assert!(control::classify(&frame.payload).is_ok());

        (client, server_side)
    }

    #[tokio::test]
    async fn connect_sends_hello() {
        let (_client, _server_side) = connected_pair(Some("Alice"), Some("g1")).await;
    }

    #[tokio::test]
    async fn keepalive_is_acknowledged_automatically() {
        let (client, mut server_side) = connected_pair(None, None).await;
        let client_task = tokio::spawn(async move { client.start().await });

        core::send_frame(&mut server_side, control::KEEPALIVE.as_bytes(), core::DEFAULT_HEADER_LEN)
            .await
            .unwrap();
        let reply = core::receive_frame(&mut server_side, core::DEFAULT_HEADER_LEN)
            .await
            .unwrap();
        assert_eq!(reply.payload, control::build_keepack());

        server_side.shutdown().await.unwrap();
        let _ = client_task.await;
    }

    #[tokio::test]
    async fn user_command_is_dispatched() {
        let (client, mut server_side) = connected_pair(None, None).await;
        let seen = Arc::new(tokio::sync::Notify::new());
        let seen_for_handler = seen.clone();
        client
            .on("ping", Some(Target::Bytes), false, move |_value| {
                let seen = seen_for_handler.clone();
                async move {
                    seen.notify_one();
                    Ok(())
                }
            })
            .unwrap();
        let client_task = tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });

        core::send_frame(
            &mut server_side,
            &control::build_command("ping", b"x"),
            core::DEFAULT_HEADER_LEN,
        )
        .await
        .unwrap();
        seen.notified().await;

        client.close(false).await;
        let _ = client_task.await;
    }

    #[tokio::test]
    async fn recv_is_fulfilled_and_unrelated_commands_do_not_fulfill_it() {
        let (client, mut server_side) = connected_pair(None, None).await;
        let client_task = tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });

        let recv_client = client.clone();
        let waiter = tokio::spawn(async move { recv_client.recv(Some("pong")).await });
        tokio::task::yield_now().await;

        core::send_frame(
            &mut server_side,
            &control::build_command("unrelated", b"x"),
            core::DEFAULT_HEADER_LEN,
        )
        .await
        .unwrap();
        core::send_frame(
            &mut server_side,
            &control::build_command("pong", b"ok"),
            core::DEFAULT_HEADER_LEN,
        )
        .await
        .unwrap();

        assert_eq!(waiter.await.unwrap(), b"ok");

        client.close(false).await;
        let _ = client_task.await;
    }

    #[tokio::test]
    async fn get_client_resolves_lookup_reply() {
        let (client, mut server_side) = connected_pair(None, None).await;
        let client_task = tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });

        let lookup = tokio::spawn({
            let client = client.clone();
            async move { client.get_client("Alice").await }
        });

        let frame = core::receive_frame(&mut server_side, core::DEFAULT_HEADER_LEN)
            .await
            .unwrap();
        assert_eq!(control::classify(&frame.payload).unwrap(), Control::GetClient("Alice".to_string()));

        let info = ClientInfo {
            address: Address {
                host: "127.0.0.1".to_string(),
                port: 5001,
            },
            name: Some("Alice".to_string()),
            group: None,
        };
        core::send_frame(
            &mut server_side,
            &control::build_client_info_reply(&info),
            core::DEFAULT_HEADER_LEN,
        )
        .await
        .unwrap();

        assert_eq!(lookup.await.unwrap().unwrap(), info);

        client.close(false).await;
        let _ = client_task.await;
    }

    #[tokio::test]
    async fn change_name_none_restores_initial_name() {
        let (client, mut server_side) = connected_pair(Some("Alice"), None).await;
        client.change_name(None).await.unwrap();
        let frame = core::receive_frame(&mut server_side, core::DEFAULT_HEADER_LEN)
            .await
            .unwrap();
        assert_eq!(control::classify(&frame.payload).unwrap(), Control::ChangeName("Alice".to_string()));
    }

    #[tokio::test]
    async fn force_disconnect_fires_on_disconn() {
        let (client, mut server_side) = connected_pair(None, None).await;
        let fired = Arc::new(tokio::sync::Notify::new());
        let fired_for_handler = fired.clone();
        client.on_force_disconnect(move || {
            let fired = fired_for_handler.clone();
            async move { fired.notify_one() }
        });
        let client_task = tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });

        core::send_frame(&mut server_side, &control::build_disconnect(), core::DEFAULT_HEADER_LEN)
            .await
            .unwrap();
        fired.notified().await;
        let _ = client_task.await;
    }
}
