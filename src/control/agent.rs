//! Per-host agent.
//!
//! One agent runs on every node: it fetches the cluster membership and the
//! training script from the master, launches one worker per local GPU,
//! drives the rendezvous-port forwarding protocol, relays reconfiguration
//! events to its workers, and supervises worker exits.

use std::path::PathBuf;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    decode_message, encode_message, read_frame, write_frame, CodeInfo, ControlRequest,
    ControlResponse, DistInfo, PortInfo, ProtocolError,
};
use super::worker::{
    control_pipe, AgentMessage, AgentPipe, WorkerEntry, WorkerError, WorkerMessage,
};

/// Bounded timeout for every request/response RPC. The reconfiguration
/// watch stream is long-poll and deliberately exempt.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Rendezvous-port polling interval.
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Give up rendezvous after this many zero-port polls.
const MAX_PORT_POLLS: usize = 600;

/// Connection retry budget: exponential backoff from 100 ms, capped.
const MAX_CONNECT_ATTEMPTS: u32 = 6;
const CONNECT_BACKOFF_BASE: Duration = Duration::from_millis(100);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Master returned error {code}: {message}")]
    Master { code: u32, message: String },

    #[error("Unexpected response, expected {expected}")]
    UnexpectedResponse { expected: &'static str },

    #[error("Could not reach master after {attempts} attempts: {last_error}")]
    ConnectFailed { attempts: u32, last_error: String },

    #[error("Rendezvous port not published in time")]
    RendezvousTimeout,

    #[error("Training script digest mismatch: expected {expected}, found {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Agent index {agent_index} out of range for {num_hosts} host(s)")]
    AgentIndexOutOfRange { agent_index: usize, num_hosts: usize },

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Worker on GPU {gpu_index} failed: {message}")]
    WorkerFailed { gpu_index: usize, message: String },

    #[error("Reconfiguration stream closed: {0}")]
    WatchClosed(String),
}

/// Agent CLI arguments.
#[derive(Debug, Clone)]
pub struct AgentArgs {
    pub master_ip: String,
    pub master_port: u16,
    pub agent_index: usize,
    pub tag: String,
    pub base_dir: PathBuf,
}

/// Request/response client for the master, with reconnect-and-retry on
/// transport errors.
pub struct MasterClient {
    addr: String,
    stream: Option<TcpStream>,
}

impl MasterClient {
    pub fn new(master_ip: &str, master_port: u16) -> Self {
        Self {
            addr: format!("{}:{}", master_ip, master_port),
            stream: None,
        }
    }

    async fn connect(addr: &str) -> Result<TcpStream, AgentError> {
        let mut backoff = CONNECT_BACKOFF_BASE;
        let mut last_error = String::new();
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(addr, attempt, error = %e, "master connect failed");
                    last_error = e.to_string();
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(CONNECT_BACKOFF_CAP);
        }
        Err(AgentError::ConnectFailed {
            attempts: MAX_CONNECT_ATTEMPTS,
            last_error,
        })
    }

    /// Issue one RPC. A transport error invalidates the cached connection
    /// and the call is retried once on a fresh one.
    pub async fn call(&mut self, request: &ControlRequest) -> Result<ControlResponse, AgentError> {
        let encoded = encode_message(request)?;
        for final_attempt in [false, true] {
            if self.stream.is_none() {
                self.stream = Some(Self::connect(&self.addr).await?);
            }
            let stream = self.stream.as_mut().expect("connection established above");

            let result: Result<ControlResponse, AgentError> = async {
                write_frame(stream, &encoded).await?;
                let response_bytes = tokio::time::timeout(RPC_TIMEOUT, read_frame(stream))
                    .await
                    .map_err(|_| {
                        AgentError::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "RPC response timed out",
                        ))
                    })??;
                Ok(decode_message(&response_bytes)?)
            }
            .await;

            match result {
                Ok(ControlResponse::Error { code, message }) => {
                    return Err(AgentError::Master { code, message });
                }
                Ok(response) => return Ok(response),
                Err(e) if final_attempt => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "RPC failed, reconnecting");
                    self.stream = None;
                }
            }
        }
        unreachable!("final attempt returns above")
    }

    pub async fn get_dist_info(&mut self) -> Result<DistInfo, AgentError> {
        match self.call(&ControlRequest::GetDistInfo).await? {
            ControlResponse::DistInfo(dist) => Ok(dist),
            _ => Err(AgentError::UnexpectedResponse { expected: "dist_info" }),
        }
    }

    pub async fn get_code(&mut self) -> Result<CodeInfo, AgentError> {
        match self.call(&ControlRequest::GetCode).await? {
            ControlResponse::CodeInfo(code) => Ok(code),
            _ => Err(AgentError::UnexpectedResponse { expected: "code_info" }),
        }
    }

    pub async fn set_master_rank_port(&mut self, epoch: u64, port: u16) -> Result<(), AgentError> {
        match self
            .call(&ControlRequest::SetMasterRankPort { epoch, port })
            .await?
        {
            ControlResponse::Ack => Ok(()),
            _ => Err(AgentError::UnexpectedResponse { expected: "ack" }),
        }
    }

    pub async fn get_master_rank_port(&mut self) -> Result<u16, AgentError> {
        match self.call(&ControlRequest::GetMasterRankPort).await? {
            ControlResponse::PortInfo(PortInfo { port }) => Ok(port),
            _ => Err(AgentError::UnexpectedResponse { expected: "port_info" }),
        }
    }

    pub async fn report_host_failure(&mut self, ip: &str) -> Result<(), AgentError> {
        match self
            .call(&ControlRequest::ReportHostFailure { ip: ip.to_string() })
            .await?
        {
            ControlResponse::Ack => Ok(()),
            _ => Err(AgentError::UnexpectedResponse { expected: "ack" }),
        }
    }
}

/// Dedicated long-poll connection for reconfiguration events.
pub struct WatchStream {
    stream: TcpStream,
}

impl WatchStream {
    pub async fn open(master_ip: &str, master_port: u16) -> Result<Self, AgentError> {
        let mut stream = MasterClient::connect(&format!("{}:{}", master_ip, master_port)).await?;
        write_frame(&mut stream, &encode_message(&ControlRequest::WatchReconfiguration)?).await?;
        Ok(Self { stream })
    }

    /// Block until the next membership event. No timeout: the stream is
    /// long-poll by design.
    pub async fn next(&mut self) -> Result<DistInfo, AgentError> {
        let bytes = read_frame(&mut self.stream).await?;
        match decode_message::<ControlResponse>(&bytes)? {
            ControlResponse::ReconfigureEvent(dist) => Ok(dist),
            ControlResponse::Error { code, message } => Err(AgentError::Master { code, message }),
            _ => Err(AgentError::UnexpectedResponse {
                expected: "reconfigure_event",
            }),
        }
    }
}

struct WorkerSlot {
    gpu_index: usize,
    pipe: AgentPipe,
}

/// The per-host agent.
pub struct Agent {
    args: AgentArgs,
    client: MasterClient,
    dist: DistInfo,
    code: CodeInfo,
    host_ip: String,
    workers: Vec<WorkerSlot>,
}

impl Agent {
    /// Connect to the master and fetch membership and the training script,
    /// verifying the script digest when one is published.
    pub async fn connect(args: AgentArgs) -> Result<Self, AgentError> {
        let mut client = MasterClient::new(&args.master_ip, args.master_port);
        let dist = client.get_dist_info().await?;
        let code = client.get_code().await?;

        if args.agent_index >= dist.hosts.len() {
            return Err(AgentError::AgentIndexOutOfRange {
                agent_index: args.agent_index,
                num_hosts: dist.hosts.len(),
            });
        }
        let host_ip = dist.hosts[args.agent_index].ip.clone();

        verify_script_digest(&code)?;

        tracing::info!(
            agent_index = args.agent_index,
            host = %host_ip,
            world_size = dist.world_size(),
            "agent connected"
        );

        Ok(Self {
            args,
            client,
            dist,
            code,
            host_ip,
            workers: Vec::new(),
        })
    }

    pub fn dist_info(&self) -> &DistInfo {
        &self.dist
    }

    pub fn code_info(&self) -> &CodeInfo {
        &self.code
    }

    /// True when this agent's host leads the current membership (owns the
    /// rank-0 worker).
    fn is_lead(&self) -> bool {
        self.dist.hosts.first().is_some_and(|h| h.ip == self.host_ip)
    }

    /// Launch one worker per local GPU into `join_set` and hand each its
    /// initial membership.
    fn launch_workers(
        &mut self,
        entry: &WorkerEntry,
        join_set: &mut JoinSet<(usize, Result<(), WorkerError>)>,
    ) {
        let devices = self.dist.hosts[self.args.agent_index].devices;
        for gpu_index in 0..devices {
            tracing::info!(gpu_index, "launching worker");
            let (ctx, pipe) = control_pipe(
                self.host_ip.clone(),
                gpu_index,
                self.args.tag.clone(),
                self.args.base_dir.clone(),
            );
            let _ = pipe.tx.send(AgentMessage::Dist(self.dist.clone()));
            let future = entry(ctx);
            join_set.spawn(async move { (gpu_index, future.await) });
            self.workers.push(WorkerSlot { gpu_index, pipe });
        }
    }

    /// The rendezvous-port forwarding protocol.
    ///
    /// The lead agent receives the port its rank-0 worker bound and
    /// publishes it; every agent then polls the master until the port is
    /// nonzero and forwards it to all local workers.
    async fn forward_master_port(&mut self) -> Result<(), AgentError> {
        let started = std::time::Instant::now();
        let epoch = self.dist.epoch;

        if self.is_lead() {
            tracing::debug!("waiting for rank 0 port");
            let WorkerMessage::Port(port) = self.workers[0]
                .pipe
                .rx
                .recv()
                .await
                .ok_or(WorkerError::Disconnected)?;
            tracing::debug!(port, "received rank 0 port, publishing to master");
            self.client.set_master_rank_port(epoch, port).await?;
        }

        let mut port = 0u16;
        for _ in 0..MAX_PORT_POLLS {
            port = self.client.get_master_rank_port().await?;
            if port != 0 {
                break;
            }
            tokio::time::sleep(PORT_POLL_INTERVAL).await;
        }
        if port == 0 {
            return Err(AgentError::RendezvousTimeout);
        }

        for worker in &self.workers {
            let _ = worker.pipe.tx.send(AgentMessage::Port(port));
        }
        crate::telemetry::record_rendezvous(started.elapsed());
        Ok(())
    }

    /// Relay a membership change to every worker, then re-run the
    /// rendezvous-port protocol for the new epoch.
    async fn handle_reconfiguration(&mut self, dist: DistInfo) -> Result<(), AgentError> {
        tracing::warn!(
            epoch = dist.epoch,
            hosts = dist.hosts.len(),
            "reconfiguration received, notifying workers"
        );
        self.dist = dist.clone();

        for worker in &self.workers {
            let _ = worker.pipe.tx.send(AgentMessage::Reconfigure(dist.clone()));
        }

        if self.dist.host_index_of(&self.host_ip).is_none() {
            // This host was removed from the membership; workers will wind
            // down on their own, nothing left to forward.
            tracing::warn!("this host is no longer part of the cluster");
            return Ok(());
        }
        self.forward_master_port().await
    }

    /// Run the agent to completion: launch workers, rendezvous, then
    /// supervise until every worker exits. Any non-zero worker exit is
    /// reported to the master as a node-loss signal and fails the agent.
    pub async fn run(mut self, entry: WorkerEntry) -> Result<(), AgentError> {
        let mut join_set = JoinSet::new();
        self.launch_workers(&entry, &mut join_set);
        self.forward_master_port().await?;

        // Background watcher on its own long-poll connection.
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<DistInfo>();
        let cancel = CancellationToken::new();
        let watcher_cancel = cancel.clone();
        let master_ip = self.args.master_ip.clone();
        let master_port = self.args.master_port;
        tokio::spawn(async move {
            loop {
                let mut stream = match WatchStream::open(&master_ip, master_port).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "watch stream unavailable");
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        () = watcher_cancel.cancelled() => return,
                        event = stream.next() => match event {
                            Ok(dist) => {
                                if event_tx.send(dist).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "watch stream broken, reopening");
                                break;
                            }
                        }
                    }
                }
            }
        });

        let result = self.supervise(&mut join_set, &mut event_rx).await;
        cancel.cancel();
        result
    }

    /// Select over reconfiguration events and worker exits until all
    /// workers are done. Unlike joining workers in launch order, this
    /// reacts to *any* exit immediately.
    async fn supervise(
        &mut self,
        join_set: &mut JoinSet<(usize, Result<(), WorkerError>)>,
        event_rx: &mut mpsc::UnboundedReceiver<DistInfo>,
    ) -> Result<(), AgentError> {
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(dist) => self.handle_reconfiguration(dist).await?,
                        None => {
                            return Err(AgentError::WatchClosed(
                                "reconfiguration watcher terminated".into(),
                            ));
                        }
                    }
                }
                exited = join_set.join_next() => {
                    match exited {
                        None => {
                            tracing::info!("all workers exited");
                            return Ok(());
                        }
                        Some(Ok((gpu_index, Ok(())))) => {
                            tracing::info!(gpu_index, "worker exited cleanly");
                        }
                        Some(Ok((gpu_index, Err(e)))) => {
                            tracing::error!(gpu_index, error = %e, "worker failed");
                            let ip = self.host_ip.clone();
                            let _ = self.client.report_host_failure(&ip).await;
                            return Err(AgentError::WorkerFailed {
                                gpu_index,
                                message: e.to_string(),
                            });
                        }
                        Some(Err(join_error)) => {
                            tracing::error!(error = %join_error, "worker task aborted");
                            let ip = self.host_ip.clone();
                            let _ = self.client.report_host_failure(&ip).await;
                            return Err(AgentError::WorkerFailed {
                                gpu_index: usize::MAX,
                                message: join_error.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Verify the training script against its published SHA-256 digest.
/// Skipped when the master does not publish one.
fn verify_script_digest(code: &CodeInfo) -> Result<(), AgentError> {
    if code.sha256.is_empty() {
        return Ok(());
    }
    let bytes = std::fs::read(&code.path)?;
    let actual = hex::encode(Sha256::digest(&bytes));
    if actual != code.sha256 {
        return Err(AgentError::DigestMismatch {
            expected: code.sha256.clone(),
            actual,
        });
    }
    Ok(())
}

/// Hex SHA-256 digest of a script file, used by the master at startup.
pub fn script_digest(path: &std::path::Path) -> std::io::Result<String> {
    Ok(hex::encode(Sha256::digest(std::fs::read(path)?)))
}
