use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::{config::Config, connection::Connection, shutdown::ShutdownController};

/// The listening socket, together with everything the accept loop hands to
/// the connection handlers it spawns.
pub struct Server {
    listener: TcpListener,
    state: ServerState,
    shutdown: ShutdownController,
    drain_window: Duration,
    max_line_len: usize,
}

#[derive(thiserror::Error, Debug)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    addr: String,
    source: tokio::io::Error,
}

impl Server {
    /// Binds the listening socket.
    ///
    /// Fails if the port is taken or the process lacks permission; there is
    /// no recovery from that, the caller is expected to exit.
    pub async fn bind(config: &Config) -> Result<Self, BindError> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| BindError { addr, source })?;

        Ok(Self {
            listener,
            state: ServerState::default(),
            shutdown: ShutdownController::new(),
            drain_window: Duration::from_secs(config.drain_timeout),
            max_line_len: config.max_line_length,
        })
    }

    pub fn local_addr(&self) -> tokio::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown_request` resolves, then drains.
    ///
    /// A fault on one connection never takes down anything but its own
    /// handler; accept errors are logged and the loop keeps accepting.
    pub async fn run(self, shutdown_request: impl Future<Output = ()>) {
        tokio::pin!(shutdown_request);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer),
                    // transient, keep accepting
                    Err(err) => tracing::warn!("failed to accept a connection: {err}"),
                },
                _ = &mut shutdown_request => break,
            }
        }

        self.drain().await;
    }

    // spawn an independent handler task for a newly accepted connection
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.state.register(peer);
        tracing::debug!(id, %peer, "client connected");

        let conn = Connection::new(id, stream, self.max_line_len);
        let forced = self.shutdown.force_signal();
        let state = self.state.clone();
        tokio::spawn(async move {
            match conn.serve(forced).await {
                Ok(()) => tracing::debug!(id, %peer, "client disconnected"),
                Err(err) => tracing::warn!(id, %peer, "closing connection: {err}"),
            }

            state.deregister(id);
        });
    }

    // stop accepting and wait for the active set to empty out, force-closing
    // whatever outlives the drain window
    async fn drain(self) {
        let Self {
            listener,
            state,
            shutdown,
            drain_window,
            ..
        } = self;

        shutdown.begin_drain();
        tracing::info!(
            active = state.active(),
            "shutdown requested, no longer accepting connections"
        );
        // closing the listening socket is what gives later connection
        // attempts their refused-connection semantics
        drop(listener);

        if tokio::time::timeout(drain_window, state.drained())
            .await
            .is_err()
        {
            for (id, peer) in state.peers() {
                tracing::warn!(id, %peer, "connection outlived the drain window, force-closing");
            }

            shutdown.force_close();
            state.drained().await;
        }

        shutdown.mark_stopped();
        tracing::info!(phase = ?shutdown.phase(), "server stopped");
    }
}

/// Tracks the currently active connections.
///
/// Insert/remove are the only cross-task mutations in the server; everything
/// else is owned by exactly one task.
#[derive(Clone)]
struct ServerState {
    inner: Arc<StateInner>,
}

struct StateInner {
    connections: DashMap<u64, SocketAddr>,
    next_id: AtomicU64,
    // mirrors connections.len() so drain() can await emptiness
    active: watch::Sender<usize>,
}

impl Default for ServerState {
    fn default() -> Self {
        let (active, _) = watch::channel(0);

        Self {
            inner: Arc::new(StateInner {
                connections: DashMap::default(),
                next_id: AtomicU64::new(0),
                active,
            }),
        }
    }
}

impl ServerState {
    fn register(&self, peer: SocketAddr) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.connections.insert(id, peer);
        self.inner.active.send_modify(|active| *active += 1);

        id
    }

    fn deregister(&self, id: u64) {
        if self.inner.connections.remove(&id).is_some() {
            self.inner.active.send_modify(|active| *active -= 1);
        }
    }

    fn active(&self) -> usize {
        *self.inner.active.borrow()
    }

    fn peers(&self) -> Vec<(u64, SocketAddr)> {
        self.inner
            .connections
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    // resolves once every active connection has deregistered itself
    async fn drained(&self) {
        let mut active = self.inner.active.subscribe();
        // the sender lives inside self, so this cannot error
        let _ = active.wait_for(|active| *active == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::oneshot,
        task::JoinHandle,
    };

    use super::Server;
    use crate::config::Config;

    fn test_config() -> Config {
        Config {
            port: 0,
            host: "127.0.0.1".into(),
            drain_timeout: 1,
            max_line_length: 1024,
            log_level: "info".into(),
        }
    }

    async fn start_server(config: Config) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
        let server = Server::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(server.run(async {
            let _ = shutdown_rx.await;
        }));

        (addr, shutdown_tx, handle)
    }

    async fn echo_roundtrip(client: &mut TcpStream, line: &[u8]) {
        client.write_all(line).await.unwrap();

        let mut echoed = vec![0u8; line.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, line);
    }

    #[tokio::test]
    async fn check_concurrent_clients_get_their_own_lines() {
        let (addr, _shutdown, _handle) = start_server(test_config()).await;

        let messages: [&[u8]; 5] = [
            b"hello\n",
            b"world\n",
            b"cisco\n",
            b"data-path\n",
            b"testing\n",
        ];

        let mut clients = Vec::new();
        for _ in messages {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }

        for (client, message) in clients.iter_mut().zip(messages) {
            client.write_all(message).await.unwrap();
        }

        for (client, message) in clients.iter_mut().zip(messages) {
            let mut echoed = vec![0u8; message.len()];
            client.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, message);
        }
    }

    #[tokio::test]
    async fn check_client_close_leaves_others_untouched() {
        let (addr, _shutdown, _handle) = start_server(test_config()).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();

        echo_roundtrip(&mut first, b"one\n").await;
        drop(first);

        echo_roundtrip(&mut second, b"two\n").await;
    }

    #[tokio::test]
    async fn check_shutdown_drains_active_connections() {
        // a generous drain window, the client below must outlive the
        // refused-connection checks without being force-closed
        let mut config = test_config();
        config.drain_timeout = 5;

        let (addr, shutdown, handle) = start_server(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        // a roundtrip makes sure the server registered us before draining
        echo_roundtrip(&mut client, b"before\n").await;

        shutdown.send(()).unwrap();

        // new connection attempts are rejected once the listener closes
        let refused = async {
            loop {
                if TcpStream::connect(addr).await.is_err() {
                    break;
                }

                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(1), refused)
            .await
            .unwrap();

        // while the in-flight connection keeps echoing until it hangs up
        echo_roundtrip(&mut client, b"during\n").await;
        drop(client);

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn check_drain_window_force_closes_stragglers() {
        let mut config = test_config();
        config.drain_timeout = 0;

        let (addr, shutdown, handle) = start_server(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        echo_roundtrip(&mut client, b"lingering\n").await;

        // the client never hangs up on its own, yet the server must still stop
        shutdown.send(()).unwrap();
        handle.await.unwrap();

        // the force-closed stream is dead from the client's end
        let mut buf = [0u8; 1];
        let closed = matches!(client.read(&mut buf).await, Ok(0) | Err(_));
        assert!(closed);
    }

    #[tokio::test]
    async fn check_bind_fails_on_taken_port() {
        let (addr, _shutdown, _handle) = start_server(test_config()).await;

        let mut config = test_config();
        config.port = addr.port();

        assert!(Server::bind(&config).await.is_err());
    }
}
