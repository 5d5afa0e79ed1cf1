// Copyright 2024-2026 Oobleck Contributors
// SPDX-License-Identifier: Apache-2.0

//! Control-plane integration: rendezvous happy path over real TCP,
//! host-failure fan-out, and the in-process worker-pool harness.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use oobleck::control::{
    control_pipe, run_master, Agent, AgentArgs, AgentMessage, CodeInfo, DistInfo, HostInfo,
    MasterClient, MasterService, WatchStream, WorkerEntry, WorkerMessage,
};
use oobleck::control::worker::Rendezvous;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn code_info() -> CodeInfo {
    CodeInfo {
        path: "/train/train.py".into(),
        args: vec!["--foo".into(), "bar".into()],
        sha256: String::new(),
    }
}

fn hosts(ips: &[&str]) -> Vec<HostInfo> {
    ips.iter()
        .map(|&ip| HostInfo {
            ip: ip.into(),
            devices: 1,
            port: 2222,
        })
        .collect()
}

/// Bind an ephemeral port and run a master on it.
async fn start_master(
    hosts: Vec<HostInfo>,
) -> (u16, Arc<MasterService>, watch::Sender<bool>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let service = Arc::new(MasterService::new(hosts, code_info()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(run_master(listener, Arc::clone(&service), shutdown_rx));
    (port, service, shutdown_tx)
}

// ============================================================================
// S3: rendezvous happy path
// ============================================================================

#[tokio::test]
async fn s3_single_host_rendezvous() {
    let (master_port, service, _shutdown) = start_master(hosts(&["127.0.0.1"])).await;

    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Rendezvous>();
    let entry: WorkerEntry = Arc::new(move |mut ctx| {
        let tx = result_tx.clone();
        Box::pin(async move {
            let rendezvous = ctx.rendezvous().await?;
            let _ = tx.send(rendezvous);
            Ok(())
        })
    });

    let agent = Agent::connect(AgentArgs {
        master_ip: "127.0.0.1".into(),
        master_port,
        agent_index: 0,
        tag: "test".into(),
        base_dir: std::env::temp_dir(),
    })
    .await
    .unwrap();
    assert_eq!(agent.dist_info().world_size(), 1);
    assert_eq!(agent.code_info().path, code_info().path);

    tokio::time::timeout(TEST_TIMEOUT, agent.run(entry))
        .await
        .expect("agent timed out")
        .unwrap();

    let rendezvous = result_rx.recv().await.unwrap();
    assert_eq!(rendezvous.rank, 0);
    assert_eq!(rendezvous.world_size, 1);
    assert_eq!(rendezvous.master_addr, "127.0.0.1");
    assert!(rendezvous.master_port > 0);

    // The master holds the same port the worker generated.
    assert_eq!(service.master_rank_port(), rendezvous.master_port);
}

// ============================================================================
// RPC surface
// ============================================================================

#[tokio::test]
async fn rpc_roundtrip_over_tcp() {
    let (master_port, _service, _shutdown) =
        start_master(hosts(&["10.0.0.1", "10.0.0.2"])).await;

    let mut client = MasterClient::new("127.0.0.1", master_port);
    let dist = client.get_dist_info().await.unwrap();
    assert_eq!(dist.epoch, 0);
    assert_eq!(dist.hosts.len(), 2);

    let code = client.get_code().await.unwrap();
    assert_eq!(code.args, vec!["--foo".to_string(), "bar".to_string()]);

    assert_eq!(client.get_master_rank_port().await.unwrap(), 0);
    client.set_master_rank_port(0, 29500).await.unwrap();
    assert_eq!(client.get_master_rank_port().await.unwrap(), 29500);
}

#[tokio::test]
async fn host_failure_fans_out_to_watchers_and_resets_port() {
    let (master_port, _service, _shutdown) =
        start_master(hosts(&["10.0.0.1", "10.0.0.2", "10.0.0.3"])).await;

    let mut client = MasterClient::new("127.0.0.1", master_port);
    client.set_master_rank_port(0, 29500).await.unwrap();

    let mut stream = WatchStream::open("127.0.0.1", master_port).await.unwrap();

    client.report_host_failure("10.0.0.2").await.unwrap();

    let dist = tokio::time::timeout(TEST_TIMEOUT, stream.next())
        .await
        .expect("no reconfiguration event")
        .unwrap();
    assert_eq!(dist.epoch, 1);
    assert_eq!(dist.hosts.len(), 2);
    assert!(dist.host_index_of("10.0.0.2").is_none());

    // The epoch change invalidates the rendezvous port.
    assert_eq!(client.get_master_rank_port().await.unwrap(), 0);
}

// ============================================================================
// Worker-pool harness
// ============================================================================

/// Run one worker per (host, gpu) over in-process pipes with a fake agent
/// that rebroadcasts the rank-0 port, and collect each worker's rendezvous.
async fn run_worker_pool(dist: DistInfo) -> Vec<Rendezvous> {
    let mut pipes = Vec::new();
    let mut tasks = Vec::new();

    for host in &dist.hosts {
        for gpu_index in 0..host.devices {
            let (mut ctx, pipe) = control_pipe(
                host.ip.clone(),
                gpu_index,
                "pool".into(),
                std::env::temp_dir(),
            );
            pipe.tx.send(AgentMessage::Dist(dist.clone())).unwrap();
            pipes.push(pipe);
            tasks.push(tokio::spawn(async move { ctx.rendezvous().await }));
        }
    }

    // Fake agent: receive the port from the rank-0 pipe, send it everywhere.
    let WorkerMessage::Port(port) = pipes[0].rx.recv().await.unwrap();
    for pipe in &pipes {
        pipe.tx.send(AgentMessage::Port(port)).unwrap();
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }
    results
}

#[tokio::test]
async fn worker_pool_agrees_on_port_and_ranks() {
    let dist = DistInfo::new(
        0,
        vec![
            HostInfo { ip: "127.0.0.1".into(), devices: 2, port: 2222 },
            HostInfo { ip: "127.0.0.2".into(), devices: 2, port: 2222 },
        ],
    );

    let results = tokio::time::timeout(TEST_TIMEOUT, run_worker_pool(dist))
        .await
        .expect("worker pool timed out");

    assert_eq!(results.len(), 4);
    let port = results[0].master_port;
    assert!(port > 0);
    for (rank, rendezvous) in results.iter().enumerate() {
        assert_eq!(rendezvous.rank, rank);
        assert_eq!(rendezvous.world_size, 4);
        assert_eq!(rendezvous.master_port, port);
        assert_eq!(rendezvous.master_addr, "127.0.0.1");
    }
}
