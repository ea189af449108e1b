//! Client facade: one connection to one server plus a local file store.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::error::{Result, RxpError};
use crate::socket::{PeerSocket, Socket, Transport};
use crate::state::{ConnectionState, Role};
use crate::store::FileStore;
use crate::timer::TimerConfig;
use crate::transfer::DOWNLOAD_PREFIX;

#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Our RXP port.
    pub rxp_port: u16,
    /// RXP port the server is expected to answer from.
    pub server_port: u16,
    pub timers: TimerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rxp_port: 3250,
            server_port: 3251,
            timers: TimerConfig::default(),
        }
    }
}

pub struct Client<T: Transport = PeerSocket> {
    conn: Connection<T>,
    store: Arc<dyn FileStore>,
}

impl Client<PeerSocket> {
    /// Bind `local` and target the server at `server`.
    pub async fn bind(
        local: SocketAddr,
        server: SocketAddr,
        config: ClientConfig,
        store: Arc<dyn FileStore>,
    ) -> Result<Self> {
        let transport = PeerSocket::new(Socket::bind(local).await?, server);
        log::info!(
            "[cli] bound {} → server {}",
            transport.local_addr(),
            transport.peer_addr()
        );
        Ok(Self::with_transport(transport, config, store))
    }
}

impl<T: Transport> Client<T> {
    pub fn with_transport(transport: T, config: ClientConfig, store: Arc<dyn FileStore>) -> Self {
        Self {
            conn: Connection::new(
                transport,
                Role::Client,
                config.rxp_port,
                config.server_port,
                config.timers,
            ),
            store,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn connection(&self) -> &Connection<T> {
        &self.conn
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.conn.connect().await
    }

    /// Upload the local file `name`.  Returns the bytes sent.
    ///
    /// A missing local file fails before anything is sent.
    pub async fn post(&mut self, name: &str) -> Result<usize> {
        let data = match self.store.read(name) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RxpError::FileNotFound(name.to_owned()))
            }
            Err(e) => return Err(e.into()),
        };
        let sent = self.conn.upload(name, &data).await;
        self.conn.finish_deferred_close().await?;
        sent?;
        Ok(data.len())
    }

    /// Download `name` and store it as `downloaded_<name>`.  Returns the
    /// stored name.
    pub async fn get(&mut self, name: &str) -> Result<String> {
        let received = self.conn.download(name).await;
        let stored = format!("{DOWNLOAD_PREFIX}{name}");
        let saved = received.and_then(|data| {
            self.store.write(&stored, &data)?;
            log::info!("[cli] saved {stored:?} ({} bytes)", data.len());
            Ok(())
        });
        self.conn.finish_deferred_close().await?;
        saved?;
        Ok(stored)
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.conn.close().await
    }

    /// Wait up to `wait` for a server-initiated close.  Returns `true` once
    /// the connection has been closed by the peer.
    pub async fn poll_peer_close(&mut self, wait: Duration) -> Result<bool> {
        self.conn.poll_peer_close(wait).await
    }

    /// Wait up to `wait` for the server's FIN without answering it, so the
    /// wait can be raced against other input.  Follow with
    /// [`Client::finish_peer_close`].
    pub async fn await_peer_fin(&mut self, wait: Duration) -> Result<bool> {
        self.conn.await_peer_fin(wait).await
    }

    /// Answer a FIN seen earlier, if any.  Returns `true` once closed.
    pub async fn finish_peer_close(&mut self) -> Result<bool> {
        self.conn.finish_deferred_close().await
    }
}
