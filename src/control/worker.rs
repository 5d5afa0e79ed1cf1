//! Per-GPU worker side of the control plane.
//!
//! A worker talks to its agent over an in-process pipe of tagged messages
//! and runs the training entry. The rank-0 worker generates the rendezvous
//! port by binding a free TCP port; everyone else blocks until the agent
//! forwards the elected port.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use super::protocol::{CodeInfo, DistInfo};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Control pipe to agent closed")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Host {ip} is not part of the cluster")]
    NotInCluster { ip: String },

    #[error("Training script exited with status {status}")]
    ScriptFailed { status: i32 },

    #[error("Worker task failed: {0}")]
    TaskFailed(String),
}

/// Agent-to-worker pipe messages.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    /// Initial (or refreshed) cluster membership.
    Dist(DistInfo),
    /// The elected rendezvous port.
    Port(u16),
    /// Membership changed; rendezvous must be re-run before the next step.
    Reconfigure(DistInfo),
}

/// Worker-to-agent pipe messages.
#[derive(Debug, Clone, Copy)]
pub enum WorkerMessage {
    /// Rank 0 reporting the port it bound.
    Port(u16),
}

/// Agent-held end of one worker's control pipe.
pub struct AgentPipe {
    pub tx: mpsc::UnboundedSender<AgentMessage>,
    pub rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

/// Everything the rendezvous hands to the tensor runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    pub master_addr: String,
    pub master_port: u16,
    pub rank: usize,
    pub world_size: usize,
    pub epoch: u64,
}

impl Rendezvous {
    /// Environment variables external training scripts expect.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        vec![
            ("RANK".into(), self.rank.to_string()),
            ("WORLD_SIZE".into(), self.world_size.to_string()),
            ("MASTER_ADDR".into(), self.master_addr.clone()),
            ("MASTER_PORT".into(), self.master_port.to_string()),
        ]
    }

    /// Export the environment contract into this process, for tensor
    /// runtimes that only read process environment.
    pub fn export_env(&self) {
        for (key, value) in self.env_vars() {
            std::env::set_var(key, value);
        }
    }
}

/// Worker-held control-plane handle, threaded explicitly through the
/// training entry instead of living in a process-wide singleton.
pub struct WorkerContext {
    pub host_ip: String,
    pub gpu_index: usize,
    pub tag: String,
    pub base_dir: PathBuf,
    dist: Option<DistInfo>,
    rx: mpsc::UnboundedReceiver<AgentMessage>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

/// Create a connected (worker, agent) pipe pair.
pub fn control_pipe(
    host_ip: String,
    gpu_index: usize,
    tag: String,
    base_dir: PathBuf,
) -> (WorkerContext, AgentPipe) {
    let (agent_tx, worker_rx) = mpsc::unbounded_channel();
    let (worker_tx, agent_rx) = mpsc::unbounded_channel();
    (
        WorkerContext {
            host_ip,
            gpu_index,
            tag,
            base_dir,
            dist: None,
            rx: worker_rx,
            tx: worker_tx,
        },
        AgentPipe {
            tx: agent_tx,
            rx: agent_rx,
        },
    )
}

impl WorkerContext {
    async fn recv(&mut self) -> Result<AgentMessage, WorkerError> {
        self.rx.recv().await.ok_or(WorkerError::Disconnected)
    }

    /// This worker's global rank under `dist`.
    fn rank_in(&self, dist: &DistInfo) -> Result<usize, WorkerError> {
        let host_index = dist
            .host_index_of(&self.host_ip)
            .ok_or_else(|| WorkerError::NotInCluster {
                ip: self.host_ip.clone(),
            })?;
        Ok(dist.rank_of(host_index, self.gpu_index))
    }

    /// Run the rendezvous-port protocol to completion.
    ///
    /// Restarted from scratch if a membership update arrives mid-protocol;
    /// stale `Port` messages from an earlier epoch are discarded while
    /// waiting for the membership.
    pub async fn rendezvous(&mut self) -> Result<Rendezvous, WorkerError> {
        'restart: loop {
            let dist = loop {
                match self.dist.clone() {
                    Some(dist) => break dist,
                    None => match self.recv().await? {
                        AgentMessage::Dist(dist) | AgentMessage::Reconfigure(dist) => {
                            self.dist = Some(dist);
                        }
                        AgentMessage::Port(_) => {}
                    },
                }
            };

            let rank = self.rank_in(&dist)?;
            if rank == 0 {
                // Bind a free port; the collective library will re-bind it.
                let listener = tokio::net::TcpListener::bind("0.0.0.0:0").await?;
                let port = listener.local_addr()?.port();
                drop(listener);
                tracing::debug!(port, "rank 0 bound rendezvous port");
                self.tx
                    .send(WorkerMessage::Port(port))
                    .map_err(|_| WorkerError::Disconnected)?;
            }

            loop {
                match self.recv().await? {
                    AgentMessage::Port(port) => {
                        return Ok(Rendezvous {
                            master_addr: dist.hosts[0].ip.clone(),
                            master_port: port,
                            rank,
                            world_size: dist.world_size(),
                            epoch: dist.epoch,
                        });
                    }
                    AgentMessage::Dist(dist) | AgentMessage::Reconfigure(dist) => {
                        self.dist = Some(dist);
                        continue 'restart;
                    }
                }
            }
        }
    }

    /// Non-blocking check for a pending reconfiguration, called by the
    /// training loop at iteration boundaries. Drains the pipe and returns
    /// the latest membership if any reconfigure message arrived.
    pub fn poll_reconfigure(&mut self) -> Option<DistInfo> {
        let mut pending = None;
        while let Ok(message) = self.rx.try_recv() {
            match message {
                AgentMessage::Reconfigure(dist) => {
                    self.dist = Some(dist.clone());
                    pending = Some(dist);
                }
                AgentMessage::Dist(dist) => self.dist = Some(dist),
                AgentMessage::Port(_) => {}
            }
        }
        pending
    }

    /// Block until a reconfiguration arrives. Used by idle workers that are
    /// not part of any live pipeline.
    pub async fn wait_reconfigure(&mut self) -> Result<DistInfo, WorkerError> {
        loop {
            if let AgentMessage::Reconfigure(dist) = self.recv().await? {
                self.dist = Some(dist.clone());
                return Ok(dist);
            }
        }
    }

    pub fn current_dist(&self) -> Option<&DistInfo> {
        self.dist.as_ref()
    }
}

/// The training entry a worker runs; injected by the embedding application
/// and by tests.
pub type WorkerEntry =
    Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, Result<(), WorkerError>> + Send + Sync>;

/// Bundled entry: rendezvous, then exec the distributed training script as a
/// child process with the distributed environment variables set.
pub fn script_worker_entry(code: CodeInfo) -> WorkerEntry {
    Arc::new(move |mut ctx: WorkerContext| {
        let code = code.clone();
        Box::pin(async move {
            let rendezvous = ctx.rendezvous().await?;
            tracing::info!(
                rank = rendezvous.rank,
                world_size = rendezvous.world_size,
                script = %code.path.display(),
                "launching training script"
            );

            let gpu_index = ctx.gpu_index;
            let status = tokio::task::spawn_blocking(move || {
                let mut command = std::process::Command::new(&code.path);
                command
                    .args(&code.args)
                    .env("CUDA_VISIBLE_DEVICES", gpu_index.to_string());
                for (key, value) in rendezvous.env_vars() {
                    command.env(key, value);
                }
                command.status()
            })
            .await
            .map_err(|e| WorkerError::TaskFailed(e.to_string()))??;

            if !status.success() {
                return Err(WorkerError::ScriptFailed {
                    status: status.code().unwrap_or(-1),
                });
            }
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::protocol::HostInfo;

    fn dist(epoch: u64) -> DistInfo {
        DistInfo::new(
            epoch,
            vec![
                HostInfo { ip: "127.0.0.1".into(), devices: 1, port: 2222 },
                HostInfo { ip: "127.0.0.2".into(), devices: 1, port: 2222 },
            ],
        )
    }

    #[tokio::test]
    async fn rank0_generates_port_and_completes() {
        let (mut ctx, mut pipe) = control_pipe(
            "127.0.0.1".into(),
            0,
            "test".into(),
            std::env::temp_dir(),
        );
        pipe.tx.send(AgentMessage::Dist(dist(0))).unwrap();

        let handle = tokio::spawn(async move {
            let rendezvous = ctx.rendezvous().await.unwrap();
            (rendezvous, ctx)
        });

        // The agent echoes the generated port back, like the real protocol.
        let WorkerMessage::Port(port) = pipe.rx.recv().await.unwrap();
        assert!(port > 0);
        pipe.tx.send(AgentMessage::Port(port)).unwrap();

        let (rendezvous, _ctx) = handle.await.unwrap();
        assert_eq!(rendezvous.rank, 0);
        assert_eq!(rendezvous.world_size, 2);
        assert_eq!(rendezvous.master_port, port);
        assert_eq!(rendezvous.master_addr, "127.0.0.1");
    }

    #[tokio::test]
    async fn non_zero_rank_waits_for_port() {
        let (mut ctx, pipe) = control_pipe(
            "127.0.0.2".into(),
            0,
            "test".into(),
            std::env::temp_dir(),
        );
        pipe.tx.send(AgentMessage::Dist(dist(0))).unwrap();
        pipe.tx.send(AgentMessage::Port(29500)).unwrap();

        let rendezvous = ctx.rendezvous().await.unwrap();
        assert_eq!(rendezvous.rank, 1);
        assert_eq!(rendezvous.master_port, 29500);
    }

    #[tokio::test]
    async fn reconfigure_restarts_rendezvous() {
        let (mut ctx, pipe) = control_pipe(
            "127.0.0.2".into(),
            0,
            "test".into(),
            std::env::temp_dir(),
        );
        pipe.tx.send(AgentMessage::Dist(dist(0))).unwrap();
        // Membership changes before the port arrives; the worker must adopt
        // the new epoch and only then accept a port.
        pipe.tx.send(AgentMessage::Reconfigure(dist(1))).unwrap();
        pipe.tx.send(AgentMessage::Port(29501)).unwrap();

        let rendezvous = ctx.rendezvous().await.unwrap();
        assert_eq!(rendezvous.epoch, 1);
        assert_eq!(rendezvous.master_port, 29501);
    }

    #[tokio::test]
    async fn poll_reconfigure_returns_latest() {
        let (mut ctx, pipe) = control_pipe(
            "127.0.0.1".into(),
            0,
            "test".into(),
            std::env::temp_dir(),
        );
        assert!(ctx.poll_reconfigure().is_none());

        pipe.tx.send(AgentMessage::Reconfigure(dist(1))).unwrap();
        pipe.tx.send(AgentMessage::Reconfigure(dist(2))).unwrap();
        let latest = ctx.poll_reconfigure().unwrap();
        assert_eq!(latest.epoch, 2);
    }

    #[tokio::test]
    async fn unknown_host_is_rejected() {
        let (mut ctx, pipe) = control_pipe(
            "10.9.9.9".into(),
            0,
            "test".into(),
            std::env::temp_dir(),
        );
        pipe.tx.send(AgentMessage::Dist(dist(0))).unwrap();
        assert!(matches!(
            ctx.rendezvous().await,
            Err(WorkerError::NotInCluster { .. })
        ));
    }
}
