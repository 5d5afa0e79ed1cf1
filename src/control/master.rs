//! Master service: authoritative membership, training script distribution,
//! and rendezvous-port relay.
//!
//! The master is a TCP server speaking the framed protocol of
//! `control::protocol`. State is held behind `watch` channels: the host list
//! (with its epoch) and the current rendezvous port. `WatchReconfiguration`
//! switches a connection into push mode and fans out every membership
//! change.

use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::protocol::{
    decode_message, encode_message, read_frame, write_frame, CodeInfo, ControlRequest,
    ControlResponse, DistInfo, HostInfo, PortInfo, ProtocolError,
};

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Shared master state. Cheap to clone handles out of; all mutation goes
/// through `&self` methods so the RPC handlers can share one instance.
pub struct MasterService {
    code: CodeInfo,
    dist_tx: watch::Sender<DistInfo>,
    /// Current rendezvous port tagged with the epoch it was set in. A port
    /// from an older epoch reads as unset.
    port_tx: watch::Sender<(u64, u16)>,
    state_lock: parking_lot::Mutex<()>,
}

impl MasterService {
    pub fn new(hosts: Vec<HostInfo>, code: CodeInfo) -> Self {
        let (dist_tx, _) = watch::channel(DistInfo::new(0, hosts));
        let (port_tx, _) = watch::channel((0u64, 0u16));
        Self {
            code,
            dist_tx,
            port_tx,
            state_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn dist_info(&self) -> DistInfo {
        self.dist_tx.borrow().clone()
    }

    pub fn code_info(&self) -> CodeInfo {
        self.code.clone()
    }

    /// Record the rendezvous port for `epoch`. Stale epochs are ignored;
    /// within the current epoch the call is idempotent.
    pub fn set_master_rank_port(&self, epoch: u64, port: u16) {
        let _guard = self.state_lock.lock();
        let current_epoch = self.dist_tx.borrow().epoch;
        if epoch != current_epoch {
            tracing::warn!(epoch, current_epoch, port, "ignoring stale rendezvous port");
            return;
        }
        self.port_tx.send_replace((epoch, port));
        tracing::debug!(epoch, port, "rendezvous port set");
    }

    /// The current rendezvous port, or 0 while unset for this epoch.
    pub fn master_rank_port(&self) -> u16 {
        let (epoch, port) = *self.port_tx.borrow();
        if epoch == self.dist_tx.borrow().epoch {
            port
        } else {
            0
        }
    }

    /// Remove a failed host, bump the epoch, invalidate the port, and fan
    /// the new membership out to every watcher. Unknown hosts are ignored
    /// so duplicate reports are harmless.
    pub fn report_host_failure(&self, ip: &str) {
        let _guard = self.state_lock.lock();
        let mut dist = self.dist_tx.borrow().clone();
        let Some(index) = dist.host_index_of(ip) else {
            tracing::debug!(ip, "duplicate host-failure report ignored");
            return;
        };
        dist.hosts.remove(index);
        dist.epoch += 1;
        tracing::warn!(ip, epoch = dist.epoch, hosts = dist.hosts.len(), "host lost");
        self.port_tx.send_replace((dist.epoch, 0));
        self.dist_tx.send_replace(dist);
    }

    pub fn subscribe(&self) -> watch::Receiver<DistInfo> {
        self.dist_tx.subscribe()
    }

    fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::GetDistInfo => ControlResponse::DistInfo(self.dist_info()),
            ControlRequest::GetCode => ControlResponse::CodeInfo(self.code_info()),
            ControlRequest::SetMasterRankPort { epoch, port } => {
                self.set_master_rank_port(epoch, port);
                ControlResponse::Ack
            }
            ControlRequest::GetMasterRankPort => ControlResponse::PortInfo(PortInfo {
                port: self.master_rank_port(),
            }),
            ControlRequest::ReportHostFailure { ip } => {
                self.report_host_failure(&ip);
                ControlResponse::Ack
            }
            // Handled by the connection loop; reaching here is a bug in it.
            ControlRequest::WatchReconfiguration => ControlResponse::Error {
                code: 500,
                message: "watch handled by connection loop".into(),
            },
        }
    }
}

/// Handle one agent connection: request/response until the agent switches
/// the connection into watch mode.
async fn handle_connection(
    stream: tokio::net::TcpStream,
    service: Arc<MasterService>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), MasterError> {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let request_bytes = match read_frame(&mut reader).await {
            Ok(bytes) => bytes,
            Err(ProtocolError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let request: ControlRequest = match decode_message(&request_bytes) {
            Ok(request) => request,
            Err(e) => {
                let response = ControlResponse::Error {
                    code: 400,
                    message: e.to_string(),
                };
                write_frame(&mut writer, &encode_message(&response)?).await?;
                continue;
            }
        };

        if matches!(request, ControlRequest::WatchReconfiguration) {
            // Push mode: stream membership changes until the agent hangs up
            // or the master shuts down. Long-poll, deliberately untimed.
            let mut dist_rx = service.subscribe();
            dist_rx.borrow_and_update();
            loop {
                tokio::select! {
                    changed = dist_rx.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        let dist = dist_rx.borrow_and_update().clone();
                        let event = ControlResponse::ReconfigureEvent(dist);
                        write_frame(&mut writer, &encode_message(&event)?).await?;
                    }
                    _ = shutdown_rx.changed() => return Ok(()),
                }
            }
        }

        let response = service.handle(request);
        write_frame(&mut writer, &encode_message(&response)?).await?;
    }
}

/// Accept loop. The caller binds the listener so tests can use an ephemeral
/// port and read it back before starting the master.
pub async fn run_master(
    listener: TcpListener,
    service: Arc<MasterService>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), MasterError> {
    tracing::info!(addr = %listener.local_addr()?, "master listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "agent connected");
                        let service = Arc::clone(&service);
                        let shutdown_rx = shutdown_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, service, shutdown_rx).await {
                                tracing::warn!(error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept error"),
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("master shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MasterService {
        MasterService::new(
            vec![
                HostInfo { ip: "10.0.0.1".into(), devices: 1, port: 2222 },
                HostInfo { ip: "10.0.0.2".into(), devices: 1, port: 2222 },
            ],
            CodeInfo {
                path: "/train/train.py".into(),
                args: vec!["--foo".into(), "bar".into()],
                sha256: String::new(),
            },
        )
    }

    #[test]
    fn port_is_zero_until_set() {
        let service = service();
        assert_eq!(service.master_rank_port(), 0);
        service.set_master_rank_port(0, 29500);
        assert_eq!(service.master_rank_port(), 29500);
        // Idempotent within the epoch.
        service.set_master_rank_port(0, 29500);
        assert_eq!(service.master_rank_port(), 29500);
    }

    #[test]
    fn host_failure_bumps_epoch_and_resets_port() {
        let service = service();
        service.set_master_rank_port(0, 29500);

        service.report_host_failure("10.0.0.2");
        let dist = service.dist_info();
        assert_eq!(dist.epoch, 1);
        assert_eq!(dist.hosts.len(), 1);
        // The old port belongs to epoch 0 and must read as unset.
        assert_eq!(service.master_rank_port(), 0);

        // A stale set from the old epoch stays ignored.
        service.set_master_rank_port(0, 29500);
        assert_eq!(service.master_rank_port(), 0);
        service.set_master_rank_port(1, 29501);
        assert_eq!(service.master_rank_port(), 29501);
    }

    #[test]
    fn duplicate_failure_reports_are_ignored() {
        let service = service();
        service.report_host_failure("10.0.0.2");
        service.report_host_failure("10.0.0.2");
        assert_eq!(service.dist_info().epoch, 1);
    }

    #[test]
    fn watchers_see_membership_changes() {
        let service = service();
        let mut rx = service.subscribe();
        assert_eq!(rx.borrow_and_update().epoch, 0);
        service.report_host_failure("10.0.0.1");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().hosts.len(), 1);
    }
}
