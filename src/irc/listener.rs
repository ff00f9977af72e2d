//! The IRC listener — accepts local connections and runs one socket task
//! per client.
//!
//! The listener binds to loopback TCP or, when configured, a unix stream
//! socket (chmod 0600 after bind). Each socket task owns its framed
//! stream: it forwards parsed lines and watchdog ticks to the engine and
//! writes whatever the engine sends back. The engine disconnects a client
//! by dropping its sender, which ends the task and closes the socket.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use super::codec::IrcCodec;
use super::message::Message;
use crate::config::Config;
use crate::engine::{ConnId, Input};

/// First client PING after this much silence.
const PING_FIRST: Duration = Duration::from_secs(30);
/// Subsequent PING cadence.
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Combined async read+write trait for type-erased client streams.
pub trait ClientTransport: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send> ClientTransport for T {}

/// A connected client stream suitable for framing with [`IrcCodec`].
/// Both TCP and unix sockets satisfy this type.
pub type ClientStream = Box<dyn ClientTransport>;

/// The bound IRC listener.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind according to the configuration. The TCP listener is
    /// restricted to loopback; the unix socket is chmod 0600 after bind.
    pub async fn bind(cfg: &Config) -> io::Result<Self> {
        if let Some(path) = &cfg.unix_socket {
            // Clean up a stale socket from a previous run.
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
            }
            info!(path = %path.display(), "listening on unix socket");
            Ok(Self::Unix(listener))
        } else {
            let addr = ("127.0.0.1", cfg.port);
            let listener = TcpListener::bind(addr).await?;
            info!(port = cfg.port, "listening on 127.0.0.1");
            Ok(Self::Tcp(listener))
        }
    }

    async fn accept(&self) -> io::Result<(ClientStream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Box::new(stream), addr.to_string()))
            }
            Self::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok((Box::new(stream), "unix".to_owned()))
            }
        }
    }
}

/// Accept loop. Each connection gets an id, a writer channel registered
/// with the engine, and its own socket task.
pub async fn run(
    listener: Listener,
    input_tx: mpsc::UnboundedSender<Input>,
    dump: Arc<AtomicBool>,
) {
    let mut next_conn: ConnId = 1;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept error: {e}");
                continue;
            }
        };
        let conn = next_conn;
        next_conn += 1;
        info!(conn, %peer, "new connection");

        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        if input_tx.send(Input::Connected { conn, tx, peer }).is_err() {
            return; // engine is gone
        }
        tokio::spawn(client_task(stream, conn, input_tx.clone(), rx, dump.clone()));
    }
}

/// One task per client socket: parse inbound lines, write outbound
/// messages, tick the ping watchdog.
async fn client_task(
    stream: ClientStream,
    conn: ConnId,
    input_tx: mpsc::UnboundedSender<Input>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    dump: Arc<AtomicBool>,
) {
    let mut framed = Framed::new(stream, IrcCodec);
    let mut pings = interval_at(Instant::now() + PING_FIRST, PING_INTERVAL);

    loop {
        tokio::select! {
            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(conn, "client protocol error: {e}");
                        break;
                    }
                    None => break, // EOF
                };
                if dump.load(Ordering::Relaxed) {
                    info!(target: "wire", "irc[{conn}]< {}", msg.to_wire());
                }
                if input_tx.send(Input::Line { conn, msg }).is_err() {
                    break;
                }
            }

            out = rx.recv() => {
                match out {
                    Some(msg) => {
                        if dump.load(Ordering::Relaxed) {
                            info!(target: "wire", "irc[{conn}]> {}", msg.to_wire());
                        }
                        if framed.send(msg).await.is_err() {
                            break;
                        }
                    }
                    // The engine dropped us; everything queued has been
                    // written, so close.
                    None => break,
                }
            }

            _ = pings.tick() => {
                if input_tx.send(Input::PingTick { conn }).is_err() {
                    break;
                }
            }
        }
    }

    info!(conn, "disconnected");
    let _ = input_tx.send(Input::Gone { conn });
}
