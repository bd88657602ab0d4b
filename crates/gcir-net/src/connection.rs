//! One managed connection to an IR port on a Global Caché device.
//!
//! A [`DeviceConnection`] is the public handle; behind it a spawned actor
//! task owns the TCP socket exclusively and runs the connection state
//! machine (connect, ready, faulted/draining) with exponential-backoff
//! reconnects. The actor serializes the port: at most one command is on the
//! wire at a time, and the next queued command is written only after the
//! previous one received its `completeir` (or errored, or timed out).
//!
//! Requests are submitted over a bounded queue and answered through oneshot
//! channels. `stopir` travels on a separate channel that is serviced even
//! while a `sendir` is outstanding, since its whole point is to cut an
//! ongoing transmission short.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use gcir_core::{
    ConnectionState, DeviceEndpoint, Error, HealthRecord, IrWaveform, LogicalAddress, Result,
};
use gcir_protocol::codec::{self, RequestIdSeq, Response, SendIr};

use crate::backoff::Backoff;

/// Tunable timeouts and limits for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Deadline for query commands (`getversion`, `getdevices`) and for the
    /// `stopir` acknowledgement.
    pub query_timeout: Duration,
    /// Deadline for the health-check query.
    pub health_timeout: Duration,
    /// Slack added to a `sendir` deadline on top of the computed playback
    /// duration.
    pub send_grace: Duration,
    /// Consecutive request timeouts that fault the connection.
    pub fault_after_timeouts: u32,
    /// Outbound queue depth; overflow is reported as `DeviceBusy`.
    pub queue_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            connect_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
            health_timeout: Duration::from_secs(2),
            send_grace: Duration::from_secs(2),
            fault_after_timeouts: 3,
            queue_capacity: 16,
        }
    }
}

/// Outcome of a completed `sendir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// The request id the device acknowledged.
    pub request_id: u16,
    /// Wall time from write to `completeir`.
    pub elapsed: Duration,
}

/// One module line from a `getdevices` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Module number.
    pub module: u8,
    /// Ports on the module.
    pub ports: u8,
    /// Module kind as reported (`IR`, `ETHERNET`, ...).
    pub kind: String,
}

/// Reply payload for query requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryReply {
    /// Device version string.
    Version(String),
    /// `getdevices` module listing.
    Devices(Vec<ModuleInfo>),
}

enum Query {
    Version,
    Devices,
}

enum Request {
    SendIr {
        waveform: IrWaveform,
        repeat: u32,
        deadline: Duration,
        reply: oneshot::Sender<Result<SendReceipt>>,
    },
    Query {
        query: Query,
        deadline: Duration,
        reply: oneshot::Sender<Result<QueryReply>>,
    },
    StopIr {
        reply: oneshot::Sender<Result<()>>,
    },
}

fn fail_request(req: Request, err: Error) {
    match req {
        Request::SendIr { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Request::Query { reply, .. } => {
            let _ = reply.send(Err(err));
        }
        Request::StopIr { reply } => {
            let _ = reply.send(Err(err));
        }
    }
}

/// Handle to one managed `(device, module:port)` connection.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Dropping every
/// handle closes the request channels, which the actor treats as a drain
/// request, so the socket is released on all exit paths.
pub struct DeviceConnection {
    endpoint: DeviceEndpoint,
    address: LogicalAddress,
    options: ConnectionOptions,
    cmd_tx: mpsc::Sender<Request>,
    rt_tx: mpsc::Sender<Request>,
    health: Arc<Mutex<HealthRecord>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceConnection {
    /// Open a connection with default options.
    ///
    /// Spawns the actor task onto the current tokio runtime; the TCP connect
    /// happens in the background and the handle is usable immediately
    /// (requests fail with `NotReady` until the link is up).
    pub fn open(endpoint: DeviceEndpoint, address: LogicalAddress) -> Self {
        Self::open_with_options(endpoint, address, ConnectionOptions::default())
    }

    /// Open a connection with explicit options.
    pub fn open_with_options(
        endpoint: DeviceEndpoint,
        address: LogicalAddress,
        options: ConnectionOptions,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(options.queue_capacity);
        let (rt_tx, rt_rx) = mpsc::channel(4);
        let health = Arc::new(Mutex::new(HealthRecord::default()));
        let cancel = CancellationToken::new();

        let actor = Actor {
            endpoint: endpoint.clone(),
            address,
            options: options.clone(),
            cmd_rx,
            rt_rx,
            health: Arc::clone(&health),
            cancel: cancel.clone(),
            ids: RequestIdSeq::new(),
        };
        let task = tokio::spawn(actor.run());

        DeviceConnection {
            endpoint,
            address,
            options,
            cmd_tx,
            rt_tx,
            health,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// The device endpoint this connection targets.
    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    /// The `module:port` this connection serves.
    pub fn address(&self) -> LogicalAddress {
        self.address
    }

    /// Transmit a waveform `repeat` times and wait for `completeir`.
    ///
    /// The deadline is the computed playback duration plus
    /// [`send_grace`](ConnectionOptions::send_grace). A full queue is
    /// reported as [`Error::DeviceBusy`] without suspending.
    pub async fn send_ir(&self, waveform: &IrWaveform, repeat: u32) -> Result<SendReceipt> {
        let play_ms =
            waveform.base_duration_ms() + repeat as f64 * waveform.repeat_duration_ms();
        let deadline = Duration::from_millis(play_ms.ceil() as u64) + self.options.send_grace;
        let (reply, rx) = oneshot::channel();
        self.submit(
            Request::SendIr {
                waveform: waveform.clone(),
                repeat,
                deadline,
                reply,
            },
            &self.cmd_tx,
        )?;
        rx.await.map_err(|_| Error::NotReady)?
    }

    /// Cancel whatever the port is transmitting.
    ///
    /// Serviced ahead of the queued commands; an in-flight press completes
    /// with [`Error::Cancelled`].
    pub async fn stop_ir(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::StopIr { reply }, &self.rt_tx)?;
        rx.await.map_err(|_| Error::NotReady)?
    }

    /// Query the device version string.
    pub async fn get_version(&self) -> Result<String> {
        self.query_version(self.options.query_timeout).await
    }

    /// Health-check exchange: `getversion,0` with the short health deadline.
    pub async fn check(&self) -> Result<String> {
        self.query_version(self.options.health_timeout).await
    }

    /// Query the module listing (`getdevices`).
    pub async fn get_devices(&self) -> Result<Vec<ModuleInfo>> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            Request::Query {
                query: Query::Devices,
                deadline: self.options.query_timeout,
                reply,
            },
            &self.cmd_tx,
        )?;
        match rx.await.map_err(|_| Error::NotReady)?? {
            QueryReply::Devices(modules) => Ok(modules),
            other => Err(Error::Invariant(format!(
                "device listing query answered with {other:?}"
            ))),
        }
    }

    async fn query_version(&self, deadline: Duration) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            Request::Query {
                query: Query::Version,
                deadline,
                reply,
            },
            &self.cmd_tx,
        )?;
        match rx.await.map_err(|_| Error::NotReady)?? {
            QueryReply::Version(v) => Ok(v),
            other => Err(Error::Invariant(format!(
                "version query answered with {other:?}"
            ))),
        }
    }

    fn submit(&self, req: Request, queue: &mpsc::Sender<Request>) -> Result<()> {
        queue.try_send(req).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::DeviceBusy,
            mpsc::error::TrySendError::Closed(_) => Error::NotReady,
        })
    }

    /// Snapshot of the connection's health record.
    pub fn health(&self) -> HealthRecord {
        self.health
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.health().state
    }

    /// Drain and close the connection.
    ///
    /// The actor finishes (or times out) the in-flight exchange, releases
    /// the socket, and exits. If it has not finished within `deadline` the
    /// task is aborted.
    pub async fn close(&self, deadline: Duration) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(deadline, task).await.is_err() {
                warn!(endpoint = %self.endpoint, address = %self.address,
                      "connection did not drain in time, aborting");
                abort.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

/// Placeholder deadline used while nothing is in flight; the matching select
/// branch is disabled, so it never actually fires.
const IDLE_TICK: Duration = Duration::from_secs(86_400);

enum ServeExit {
    Drained,
    Fault,
}

struct Inflight {
    deadline: tokio::time::Instant,
    started: std::time::Instant,
    kind: InflightKind,
}

enum InflightKind {
    Send {
        id: u16,
        reply: oneshot::Sender<Result<SendReceipt>>,
    },
    Version {
        reply: oneshot::Sender<Result<QueryReply>>,
    },
    Devices {
        modules: Vec<ModuleInfo>,
        reply: oneshot::Sender<Result<QueryReply>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
}

impl Inflight {
    fn fail(self, err: Error) {
        match self.kind {
            InflightKind::Send { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            InflightKind::Version { reply } | InflightKind::Devices { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            InflightKind::Stop { reply } => {
                let _ = reply.send(Err(err));
            }
        }
    }

}

struct Actor {
    endpoint: DeviceEndpoint,
    address: LogicalAddress,
    options: ConnectionOptions,
    cmd_rx: mpsc::Receiver<Request>,
    rt_rx: mpsc::Receiver<Request>,
    health: Arc<Mutex<HealthRecord>>,
    cancel: CancellationToken,
    ids: RequestIdSeq,
}

impl Actor {
    async fn run(mut self) {
        let mut backoff = Backoff::new();
        loop {
            if self.cancel.is_cancelled() {
                self.set_state(ConnectionState::Disconnected);
                return;
            }

            self.set_state(ConnectionState::Connecting);
            debug!(endpoint = %self.endpoint, address = %self.address, "connecting");
            let attempt = tokio::time::timeout(
                self.options.connect_timeout,
                TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.tcp_port)),
            )
            .await;

            match attempt {
                Ok(Ok(stream)) => {
                    backoff.reset();
                    info!(endpoint = %self.endpoint, address = %self.address, "connected");
                    self.mark_ready();
                    match self.serve(stream).await {
                        ServeExit::Drained => {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        ServeExit::Fault => {
                            self.set_state(ConnectionState::Faulted);
                        }
                    }
                }
                Ok(Err(e)) => {
                    warn!(endpoint = %self.endpoint, error = %e, "connect failed");
                    self.record_failure(&format!("connect failed: {e}"));
                    self.set_state(ConnectionState::Faulted);
                }
                Err(_) => {
                    warn!(endpoint = %self.endpoint, "connect timed out");
                    self.record_failure("connect timed out");
                    self.set_state(ConnectionState::Faulted);
                }
            }

            let delay = backoff.next_delay();
            debug!(
                endpoint = %self.endpoint,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
            let wake = tokio::time::Instant::now() + delay;
            loop {
                tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => {
                        self.set_state(ConnectionState::Disconnected);
                        return;
                    }

                    _ = tokio::time::sleep_until(wake) => break,

                    // Fail requests fast while the link is down.
                    maybe = self.rt_rx.recv() => match maybe {
                        Some(req) => fail_request(req, Error::NotReady),
                        None => {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    },

                    maybe = self.cmd_rx.recv() => match maybe {
                        Some(req) => fail_request(req, Error::NotReady),
                        None => {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    },
                }
            }
        }
    }

    async fn serve(&mut self, stream: TcpStream) -> ServeExit {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(endpoint = %self.endpoint, error = %e, "failed to set TCP_NODELAY");
        }
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line_buf: Vec<u8> = Vec::new();
        let mut inflight: Option<Inflight> = None;
        let mut consecutive_timeouts: u32 = 0;

        loop {
            let deadline = inflight
                .as_ref()
                .map(|fl| fl.deadline)
                .unwrap_or_else(|| tokio::time::Instant::now() + IDLE_TICK);
            let have_inflight = inflight.is_some();
            let watch_abandon =
                matches!(&inflight, Some(fl) if matches!(fl.kind, InflightKind::Send { .. }));

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    return self.drain(reader, writer, line_buf, inflight).await;
                }

                maybe = self.rt_rx.recv() => match maybe {
                    Some(Request::StopIr { reply }) => {
                        if let Err(e) = write_line(&mut writer, &codec::encode_stopir(self.address)).await {
                            self.record_failure(&format!("write failed: {e}"));
                            if let Some(fl) = inflight.take() {
                                fl.fail(Error::LinkLost);
                            }
                            let _ = reply.send(Err(map_io_error(e)));
                            return ServeExit::Fault;
                        }
                        match inflight.take() {
                            Some(fl) if matches!(fl.kind, InflightKind::Send { .. }) => {
                                if let InflightKind::Send { id, reply: send_reply } = fl.kind {
                                    warn!(address = %self.address, id, "in-flight press cancelled by stop");
                                    let _ = send_reply.send(Err(Error::Cancelled));
                                }
                                inflight = Some(self.new_inflight(
                                    InflightKind::Stop { reply },
                                    self.options.query_timeout,
                                ));
                            }
                            None => {
                                inflight = Some(self.new_inflight(
                                    InflightKind::Stop { reply },
                                    self.options.query_timeout,
                                ));
                            }
                            Some(other) => {
                                // A query is mid-exchange; the stop was
                                // written, so acknowledge without waiting
                                // and let the query keep its slot.
                                inflight = Some(other);
                                let _ = reply.send(Ok(()));
                            }
                        }
                    }
                    Some(other) => fail_request(other, Error::Invariant(
                        "non-stop request on the stop channel".into(),
                    )),
                    None => {
                        return self.drain(reader, writer, line_buf, inflight).await;
                    }
                },

                maybe = self.cmd_rx.recv(), if !have_inflight => match maybe {
                    Some(req) => match self.write_request(&mut writer, req).await {
                        Ok(started) => inflight = started,
                        Err(()) => return ServeExit::Fault,
                    },
                    None => {
                        return self.drain(reader, writer, line_buf, inflight).await;
                    }
                },

                read = reader.read_until(0x0D, &mut line_buf) => match read {
                    Ok(0) => {
                        warn!(endpoint = %self.endpoint, "connection closed by device");
                        if let Some(fl) = inflight.take() {
                            fl.fail(Error::LinkLost);
                        }
                        self.record_failure("connection closed by device");
                        return ServeExit::Fault;
                    }
                    Ok(_) => {
                        if line_buf.last() == Some(&0x0D) {
                            let raw = String::from_utf8_lossy(&line_buf).into_owned();
                            line_buf.clear();
                            let line = raw.trim();
                            if !line.is_empty() {
                                self.handle_line(line, &mut inflight, &mut consecutive_timeouts);
                            }
                        }
                        // A read without the terminator means EOF is coming;
                        // the next read returns 0 and faults the connection.
                    }
                    Err(e) => {
                        warn!(endpoint = %self.endpoint, error = %e, "socket read error");
                        self.record_failure(&format!("read failed: {e}"));
                        if let Some(fl) = inflight.take() {
                            fl.fail(map_io_error(e));
                        }
                        return ServeExit::Fault;
                    }
                },

                _ = tokio::time::sleep_until(deadline), if have_inflight => {
                    if let Some(fl) = inflight.take() {
                        warn!(address = %self.address, "request deadline expired");
                        fl.fail(Error::Timeout);
                    }
                    self.record_failure("timeout");
                    consecutive_timeouts += 1;
                    if consecutive_timeouts >= self.options.fault_after_timeouts {
                        warn!(
                            endpoint = %self.endpoint,
                            count = consecutive_timeouts,
                            "too many consecutive timeouts, faulting"
                        );
                        return ServeExit::Fault;
                    }
                }

                _ = wait_abandoned(&mut inflight), if watch_abandon => {
                    warn!(address = %self.address, "press abandoned by caller, stopping transmission");
                    inflight = None;
                    if let Err(e) = write_line(&mut writer, &codec::encode_stopir(self.address)).await {
                        self.record_failure(&format!("write failed: {e}"));
                        return ServeExit::Fault;
                    }
                }
            }
        }
    }

    /// Encode and write one queued request; returns the in-flight entry.
    async fn write_request(
        &mut self,
        writer: &mut OwnedWriteHalf,
        req: Request,
    ) -> std::result::Result<Option<Inflight>, ()> {
        match req {
            Request::SendIr {
                waveform,
                repeat,
                deadline,
                reply,
            } => {
                let id = self.ids.next_id();
                let cmd = SendIr::from_waveform(self.address, id, &waveform, repeat);
                trace!(address = %self.address, id, repeat, "writing sendir");
                match write_line(writer, &cmd.encode()).await {
                    Ok(()) => Ok(Some(
                        self.new_inflight(InflightKind::Send { id, reply }, deadline),
                    )),
                    Err(e) => {
                        self.record_failure(&format!("write failed: {e}"));
                        let _ = reply.send(Err(map_io_error(e)));
                        Err(())
                    }
                }
            }
            Request::Query {
                query,
                deadline,
                reply,
            } => {
                let (bytes, kind) = match query {
                    Query::Version => (
                        codec::encode_getversion(),
                        InflightKind::Version { reply },
                    ),
                    Query::Devices => (
                        codec::encode_getdevices(),
                        InflightKind::Devices {
                            modules: Vec::new(),
                            reply,
                        },
                    ),
                };
                trace!(address = %self.address, "writing query");
                match write_line(writer, &bytes).await {
                    Ok(()) => Ok(Some(self.new_inflight(kind, deadline))),
                    Err(e) => {
                        self.record_failure(&format!("write failed: {e}"));
                        if let InflightKind::Version { reply } | InflightKind::Devices { reply, .. } = kind {
                            let _ = reply.send(Err(map_io_error(e)));
                        }
                        Err(())
                    }
                }
            }
            Request::StopIr { .. } => unreachable!("stopir travels on the rt channel"),
        }
    }

    /// Route one inbound line to the in-flight entry.
    fn handle_line(
        &self,
        line: &str,
        inflight: &mut Option<Inflight>,
        consecutive_timeouts: &mut u32,
    ) {
        trace!(endpoint = %self.endpoint, line, "line from device");
        match codec::parse_response(line) {
            Response::CompleteIr { address, id } => {
                if address != self.address {
                    warn!(address = %address, id, "completeir for a port this socket does not serve");
                    return;
                }
                let matches_inflight = matches!(
                    inflight,
                    Some(fl) if matches!(fl.kind, InflightKind::Send { id: want, .. } if want == id)
                );
                if matches_inflight {
                    if let Some(Inflight {
                        started,
                        kind: InflightKind::Send { reply, .. },
                        ..
                    }) = inflight.take()
                    {
                        let receipt = SendReceipt {
                            request_id: id,
                            elapsed: started.elapsed(),
                        };
                        debug!(address = %self.address, id,
                               elapsed_ms = receipt.elapsed.as_millis() as u64, "sendir complete");
                        let _ = reply.send(Ok(receipt));
                        self.record_ok();
                        *consecutive_timeouts = 0;
                    }
                } else {
                    warn!(address = %self.address, id, "dropping completeir for unknown or expired id");
                }
            }
            Response::BusyIr { id, .. } => {
                // Another transmission holds the port. Ours stays queued on
                // the device; its completeir still arrives. Not a failure.
                debug!(address = %self.address, id, "port busy, awaiting completeir");
            }
            Response::StopIr { address } => {
                if matches!(inflight, Some(fl) if matches!(fl.kind, InflightKind::Stop { .. })) {
                    if let Some(Inflight {
                        kind: InflightKind::Stop { reply },
                        ..
                    }) = inflight.take()
                    {
                        debug!(address = %address, "stopir acknowledged");
                        let _ = reply.send(Ok(()));
                        self.record_ok();
                        *consecutive_timeouts = 0;
                    }
                } else {
                    debug!(address = %address, "unsolicited stopir acknowledgement");
                }
            }
            Response::Err { address, code } => {
                warn!(
                    address = %address.unwrap_or(self.address),
                    code,
                    "device reported error"
                );
                self.record_failure(&format!("device error {code}"));
                *consecutive_timeouts = 0;
                if let Some(fl) = inflight.take() {
                    fl.fail(Error::DeviceError(code));
                }
            }
            Response::LearnerEnabled => {
                warn!(endpoint = %self.endpoint, "IR learner enabled, port cannot transmit");
                self.record_failure("IR learner enabled");
                if let Some(fl) = inflight.take() {
                    fl.fail(Error::NotReady);
                }
            }
            Response::Device {
                module,
                ports,
                kind,
            } => {
                if let Some(Inflight {
                    kind: InflightKind::Devices { modules, .. },
                    ..
                }) = inflight
                {
                    modules.push(ModuleInfo {
                        module,
                        ports,
                        kind,
                    });
                } else {
                    debug!(module, ports, "device line outside a getdevices exchange");
                }
            }
            Response::EndListDevices => {
                if matches!(inflight, Some(fl) if matches!(fl.kind, InflightKind::Devices { .. })) {
                    if let Some(Inflight {
                        kind: InflightKind::Devices { modules, reply },
                        ..
                    }) = inflight.take()
                    {
                        let _ = reply.send(Ok(QueryReply::Devices(modules)));
                        self.record_ok();
                        *consecutive_timeouts = 0;
                    }
                } else {
                    debug!("endlistdevices outside a getdevices exchange");
                }
            }
            Response::Info(text) => {
                if matches!(inflight, Some(fl) if matches!(fl.kind, InflightKind::Version { .. })) {
                    if let Some(Inflight {
                        kind: InflightKind::Version { reply },
                        ..
                    }) = inflight.take()
                    {
                        let _ = reply.send(Ok(QueryReply::Version(text)));
                        self.record_ok();
                        *consecutive_timeouts = 0;
                    }
                } else {
                    trace!(line = %text, "unsolicited line from device");
                }
            }
        }
    }

    /// Finish the in-flight exchange (bounded by its deadline), then release
    /// the socket.
    async fn drain(
        &mut self,
        mut reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
        mut line_buf: Vec<u8>,
        mut inflight: Option<Inflight>,
    ) -> ServeExit {
        self.set_state(ConnectionState::Draining);
        debug!(endpoint = %self.endpoint, address = %self.address, "draining");
        let mut scratch_timeouts = 0;

        while let Some(deadline) = inflight.as_ref().map(|fl| fl.deadline) {
            tokio::select! {
                read = reader.read_until(0x0D, &mut line_buf) => match read {
                    Ok(0) => {
                        if let Some(fl) = inflight.take() {
                            fl.fail(Error::LinkLost);
                        }
                        break;
                    }
                    Err(e) => {
                        if let Some(fl) = inflight.take() {
                            fl.fail(map_io_error(e));
                        }
                        break;
                    }
                    Ok(_) => {
                        if line_buf.last() == Some(&0x0D) {
                            let raw = String::from_utf8_lossy(&line_buf).into_owned();
                            line_buf.clear();
                            let line = raw.trim();
                            if !line.is_empty() {
                                self.handle_line(line, &mut inflight, &mut scratch_timeouts);
                            }
                        }
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(fl) = inflight.take() {
                        fl.fail(Error::Timeout);
                        self.record_failure("timeout during drain");
                    }
                    break;
                }
            }
        }

        let _ = writer.shutdown().await;
        debug!(endpoint = %self.endpoint, address = %self.address, "drained");
        ServeExit::Drained
    }

    fn new_inflight(&self, kind: InflightKind, deadline: Duration) -> Inflight {
        Inflight {
            deadline: tokio::time::Instant::now() + deadline,
            started: std::time::Instant::now(),
            kind,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut h = self
            .health
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if h.state != state {
            debug!(endpoint = %self.endpoint, address = %self.address,
                   from = %h.state, to = %state, "state change");
        }
        h.state = state;
    }

    fn mark_ready(&self) {
        let mut h = self
            .health
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        h.state = ConnectionState::Ready;
        h.consecutive_failures = 0;
        h.last_error = None;
    }

    fn record_ok(&self) {
        let mut h = self
            .health
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        h.last_ok_at = Some(std::time::Instant::now());
        h.consecutive_failures = 0;
        h.last_error = None;
    }

    fn record_failure(&self, what: &str) {
        let mut h = self
            .health
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        h.consecutive_failures += 1;
        h.last_error = Some(what.to_string());
    }
}

/// Resolve when the in-flight press's caller drops its reply channel.
async fn wait_abandoned(inflight: &mut Option<Inflight>) {
    match inflight {
        Some(Inflight {
            kind: InflightKind::Send { reply, .. },
            ..
        }) => reply.closed().await,
        _ => std::future::pending().await,
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Map a data-path I/O error to the appropriate [`Error`] variant.
///
/// Known connection-loss kinds collapse to [`Error::LinkLost`]; anything
/// else is preserved as [`Error::Io`] so the caller sees what actually
/// failed.
fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted => Error::LinkLost,
        _ => Error::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcir_test_harness::{MockBlaster, ReplyMode};

    fn test_waveform() -> IrWaveform {
        IrWaveform {
            modulation_freq_hz: 40_000.0,
            base_cycles: vec![10, 40],
            repeat_cycles: vec![40, 10],
            repeat_count_default: 1,
            intra_sig_pause_cycles: 200,
        }
    }

    #[test]
    fn io_error_mapping() {
        for kind in [
            std::io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::NotConnected,
            std::io::ErrorKind::ConnectionAborted,
        ] {
            let mapped = map_io_error(std::io::Error::new(kind, "gone"));
            assert!(matches!(mapped, Error::LinkLost), "{kind:?} -> {mapped:?}");
        }
        // Unclassified kinds keep the underlying error.
        let mapped = map_io_error(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(matches!(mapped, Error::Io(_)), "got {mapped:?}");
    }

    fn fast_options() -> ConnectionOptions {
        ConnectionOptions {
            connect_timeout: Duration::from_secs(2),
            query_timeout: Duration::from_millis(500),
            health_timeout: Duration::from_millis(500),
            send_grace: Duration::from_millis(200),
            fault_after_timeouts: 3,
            queue_capacity: 16,
        }
    }

    async fn connect(blaster: &MockBlaster, options: ConnectionOptions) -> DeviceConnection {
        let conn = DeviceConnection::open_with_options(
            blaster.endpoint(),
            LogicalAddress::new(1, 2),
            options,
        );
        // Let the background connect finish.
        for _ in 0..100 {
            if conn.state() == ConnectionState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(conn.state(), ConnectionState::Ready);
        conn
    }

    #[tokio::test]
    async fn send_completes_with_receipt() {
        let blaster = MockBlaster::start().await.unwrap();
        let conn = connect(&blaster, fast_options()).await;

        let receipt = conn.send_ir(&test_waveform(), 3).await.unwrap();
        assert_eq!(receipt.request_id, 1);

        let lines = blaster.received();
        assert_eq!(lines, vec!["sendir,1:2,1,40000,3,3,10,40,200,40,10"]);

        conn.close(Duration::from_secs(1)).await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn presses_are_serialized_per_port() {
        let blaster = MockBlaster::start().await.unwrap();
        blaster.set_delay(Duration::from_millis(150));
        let conn = Arc::new(connect(&blaster, fast_options()).await);
        let w = test_waveform();

        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(conn.send_ir(&w, 1), conn.send_ir(&w, 1));
        let a = a.unwrap();
        let b = b.unwrap();

        // Distinct ids, issued in order.
        let mut ids = vec![a.request_id, b.request_id];
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);

        // The second press could only start after the first completed.
        assert!(
            started.elapsed() >= Duration::from_millis(290),
            "presses overlapped: {:?}",
            started.elapsed()
        );

        let lines = blaster.received();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("sendir,1:2,1,"));
        assert!(lines[1].starts_with("sendir,1:2,2,"));

        conn.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn busy_then_complete_still_succeeds() {
        let blaster = MockBlaster::start().await.unwrap();
        blaster.set_mode(ReplyMode::BusyThenComplete);
        blaster.set_delay(Duration::from_millis(50));
        let conn = connect(&blaster, fast_options()).await;

        let receipt = conn.send_ir(&test_waveform(), 1).await.unwrap();
        assert_eq!(receipt.request_id, 1);
        assert_eq!(conn.health().consecutive_failures, 0);

        conn.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn device_error_is_surfaced_without_teardown() {
        let blaster = MockBlaster::start().await.unwrap();
        blaster.set_mode(ReplyMode::Error { code: 14 });
        let conn = connect(&blaster, fast_options()).await;

        let result = conn.send_ir(&test_waveform(), 1).await;
        assert!(matches!(result, Err(Error::DeviceError(14))));
        // Response errors do not tear the connection down.
        assert_eq!(conn.state(), ConnectionState::Ready);

        // The port keeps working once the device behaves again.
        blaster.set_mode(ReplyMode::Complete);
        assert!(conn.send_ir(&test_waveform(), 1).await.is_ok());

        conn.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn consecutive_timeouts_fault_the_connection() {
        let blaster = MockBlaster::start().await.unwrap();
        blaster.set_mode(ReplyMode::Silent);
        let conn = connect(&blaster, fast_options()).await;
        let w = test_waveform();

        for _ in 0..3 {
            let result = conn.send_ir(&w, 1).await;
            assert!(matches!(result, Err(Error::Timeout)), "got {result:?}");
        }
        // Third consecutive timeout faults the connection.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let health = conn.health();
        assert_eq!(health.state, ConnectionState::Faulted);
        assert!(health.consecutive_failures >= 3);

        conn.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn requests_fail_fast_while_faulted() {
        // Bind then drop a listener so the port actively refuses.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = DeviceConnection::open_with_options(
            DeviceEndpoint::with_port(addr.ip().to_string(), addr.port()),
            LogicalAddress::new(1, 1),
            fast_options(),
        );
        // Wait for the refused connect to land the actor in backoff.
        for _ in 0..100 {
            if conn.state() == ConnectionState::Faulted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(conn.state(), ConnectionState::Faulted);

        let result = conn.send_ir(&test_waveform(), 1).await;
        assert!(matches!(result, Err(Error::NotReady)), "got {result:?}");

        conn.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_press() {
        let blaster = MockBlaster::start().await.unwrap();
        blaster.set_mode(ReplyMode::Silent);
        let conn = Arc::new(connect(&blaster, fast_options()).await);
        let w = test_waveform();

        let pressing = {
            let conn = Arc::clone(&conn);
            let w = w.clone();
            tokio::spawn(async move { conn.send_ir(&w, 1).await })
        };
        // Let the sendir hit the wire.
        tokio::time::sleep(Duration::from_millis(50)).await;

        conn.stop_ir().await.unwrap();
        let press_result = pressing.await.unwrap();
        assert!(matches!(press_result, Err(Error::Cancelled)), "got {press_result:?}");

        // A late completeir for the cancelled id is dropped harmlessly.
        blaster.inject("completeir,1:2,1\r").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.state(), ConnectionState::Ready);

        // And the port still works.
        blaster.set_mode(ReplyMode::Complete);
        assert!(conn.send_ir(&w, 1).await.is_ok());

        conn.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn queue_overflow_is_device_busy() {
        let blaster = MockBlaster::start().await.unwrap();
        blaster.set_mode(ReplyMode::Silent);
        let options = ConnectionOptions {
            queue_capacity: 1,
            // Keep the presses pending for the whole test.
            send_grace: Duration::from_secs(5),
            ..fast_options()
        };
        let conn = Arc::new(connect(&blaster, options).await);
        let w = test_waveform();

        // First press is dequeued into the in-flight slot...
        let first = {
            let conn = Arc::clone(&conn);
            let w = w.clone();
            tokio::spawn(async move { conn.send_ir(&w, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        // ...the second occupies the single queue slot...
        let second = {
            let conn = Arc::clone(&conn);
            let w = w.clone();
            tokio::spawn(async move { conn.send_ir(&w, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        // ...and the third overflows.
        let third = conn.send_ir(&w, 1).await;
        assert!(matches!(third, Err(Error::DeviceBusy)), "got {third:?}");

        first.abort();
        second.abort();
        conn.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn version_and_device_queries() {
        let blaster = MockBlaster::start().await.unwrap();
        let conn = connect(&blaster, fast_options()).await;

        let version = conn.get_version().await.unwrap();
        assert_eq!(version, "710-1001-05");

        let check = conn.check().await.unwrap();
        assert_eq!(check, "710-1001-05");

        let modules = conn.get_devices().await.unwrap();
        assert_eq!(
            modules,
            vec![
                ModuleInfo { module: 0, ports: 0, kind: "ETHERNET".into() },
                ModuleInfo { module: 1, ports: 3, kind: "IR".into() },
            ]
        );

        conn.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn link_loss_faults_then_reconnects() {
        let blaster = MockBlaster::start().await.unwrap();
        let conn = connect(&blaster, fast_options()).await;

        blaster.kick().await;
        for _ in 0..100 {
            if conn.state() == ConnectionState::Faulted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(conn.state(), ConnectionState::Faulted);

        // Initial backoff is ~1 s (plus or minus 20 %); the link should be back well
        // within 2.5 s.
        for _ in 0..250 {
            if conn.state() == ConnectionState::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert!(conn.send_ir(&test_waveform(), 1).await.is_ok());

        conn.close(Duration::from_secs(1)).await;
    }
}
