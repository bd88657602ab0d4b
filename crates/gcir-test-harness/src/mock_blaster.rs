//! A scripted iTach lookalike for protocol-level testing.
//!
//! [`MockBlaster`] listens on a random localhost port, accepts any number of
//! connections, and answers Global Caché commands the way a real device
//! would: `completeir` for `sendir`, an echo for `stopir`, canned version
//! and module listings for queries. The reply behavior for `sendir` is
//! switchable at runtime so tests can exercise the busy, timeout, and
//! device-error paths without real hardware.
//!
//! Request ids are assigned inside the connection under test, so the mock is
//! protocol-aware rather than byte-scripted: it parses each `sendir` and
//! echoes the id it actually received.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use gcir_core::{DeviceEndpoint, Result};
use gcir_protocol::codec::SendIr;

/// Version string reported for `getversion`.
pub const MOCK_VERSION: &str = "710-1001-05";

/// How the mock answers `sendir` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Acknowledge with `completeir` after the configured delay.
    Complete,
    /// Send `busyIR` immediately, then `completeir` after the delay.
    BusyThenComplete,
    /// Never answer; the command times out.
    Silent,
    /// Answer with `ERR_<module>:<port>,<code>`.
    Error {
        /// Numeric error code to report.
        code: u16,
    },
}

struct Shared {
    mode: Mutex<ReplyMode>,
    delay: Mutex<Duration>,
    log: Mutex<Vec<String>>,
    conns: Mutex<Vec<ConnHandle>>,
}

struct ConnHandle {
    inject_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A mock Global Caché device on localhost.
pub struct MockBlaster {
    port: u16,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl MockBlaster {
    /// Bind a listener on a random port and start accepting connections.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let shared = Arc::new(Shared {
            mode: Mutex::new(ReplyMode::Complete),
            delay: Mutex::new(Duration::ZERO),
            log: Mutex::new(Vec::new()),
            conns: Mutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        trace!(%peer, "mock blaster accepted connection");
                        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
                        let cancel = CancellationToken::new();
                        let task = tokio::spawn(serve_conn(
                            stream,
                            Arc::clone(&accept_shared),
                            inject_rx,
                            cancel.clone(),
                        ));
                        lock(&accept_shared.conns).push(ConnHandle {
                            inject_tx,
                            cancel,
                            task,
                        });
                    }
                    Err(_) => return,
                }
            }
        });

        Ok(MockBlaster {
            port,
            shared,
            accept_task,
        })
    }

    /// Endpoint to hand to the connection under test.
    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint::with_port("127.0.0.1", self.port)
    }

    /// Switch the `sendir` reply behavior.
    pub fn set_mode(&self, mode: ReplyMode) {
        *lock(&self.shared.mode) = mode;
    }

    /// Set the delay applied before `completeir` replies.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.shared.delay) = delay;
    }

    /// Every command line received so far, in arrival order, terminators
    /// stripped.
    pub fn received(&self) -> Vec<String> {
        lock(&self.shared.log).clone()
    }

    /// Write a raw line on the most recent connection, e.g. a stray
    /// `completeir` for an id nobody is waiting on.
    pub async fn inject(&self, line: &str) {
        let tx = lock(&self.shared.conns)
            .last()
            .map(|c| c.inject_tx.clone());
        if let Some(tx) = tx {
            let _ = tx.send(line.to_string());
            // Give the connection task a beat to flush the line.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Drop every open connection, simulating a device reboot or cable pull.
    pub async fn kick(&self) {
        let conns: Vec<ConnHandle> = lock(&self.shared.conns).drain(..).collect();
        for conn in conns {
            conn.cancel.cancel();
            let _ = conn.task.await;
        }
    }
}

impl Drop for MockBlaster {
    fn drop(&mut self) {
        self.accept_task.abort();
        for conn in lock(&self.shared.conns).iter() {
            conn.cancel.cancel();
        }
    }
}

async fn serve_conn(
    stream: TcpStream,
    shared: Arc<Shared>,
    mut inject_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            injected = inject_rx.recv() => {
                let Some(line) = injected else { return };
                if writer.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
                let _ = writer.flush().await;
            }

            read = reader.read_until(0x0D, &mut buf) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {
                        if buf.last() != Some(&0x0D) {
                            continue;
                        }
                        let line = String::from_utf8_lossy(&buf).trim().to_string();
                        buf.clear();
                        if line.is_empty() {
                            continue;
                        }
                        lock(&shared.log).push(line.clone());
                        if respond(&line, &mut writer, &shared).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn respond(line: &str, writer: &mut OwnedWriteHalf, shared: &Shared) -> std::io::Result<()> {
    if let Ok(cmd) = SendIr::parse(line) {
        let mode = *lock(&shared.mode);
        let delay = *lock(&shared.delay);
        match mode {
            ReplyMode::Complete => {
                tokio::time::sleep(delay).await;
                write_line(writer, &format!("completeir,{},{}", cmd.address, cmd.id)).await?;
            }
            ReplyMode::BusyThenComplete => {
                write_line(writer, &format!("busyIR,{},{}", cmd.address, cmd.id)).await?;
                tokio::time::sleep(delay).await;
                write_line(writer, &format!("completeir,{},{}", cmd.address, cmd.id)).await?;
            }
            ReplyMode::Silent => {}
            ReplyMode::Error { code } => {
                write_line(writer, &format!("ERR_{},{:03}", cmd.address, code)).await?;
            }
        }
    } else if let Some(addr) = line.strip_prefix("stopir,") {
        write_line(writer, &format!("stopir,{addr}")).await?;
    } else if line == "getversion,0" || line == "getversion" {
        write_line(writer, MOCK_VERSION).await?;
    } else if line == "getdevices" {
        write_line(writer, "device,0,0 ETHERNET").await?;
        write_line(writer, "device,1,3 IR").await?;
        write_line(writer, "endlistdevices").await?;
    } else {
        write_line(writer, "ERR 1").await?;
    }
    Ok(())
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r").await?;
    writer.flush().await
}
