// Copyright 2024-2026 Oobleck Contributors
// Licensed under the Apache License, Version 2.0

//! Elastic control plane: master service, per-host agents, per-GPU workers.
//!
//! The master owns the authoritative host list and the training script.
//! Agents launch workers, forward the rendezvous port, and relay
//! reconfiguration events; workers run the training entry against an
//! explicit control-plane handle.

pub mod agent;
pub mod hostfile;
pub mod master;
pub mod protocol;
pub mod worker;

pub use agent::{Agent, AgentArgs, AgentError, MasterClient, WatchStream};
pub use hostfile::{parse_hostfile, parse_hostfile_str, HostfileError};
pub use master::{run_master, MasterError, MasterService};
pub use protocol::{
    CodeInfo, ControlRequest, ControlResponse, DistInfo, HostInfo, PortInfo, ProtocolError,
};
pub use worker::{
    control_pipe, script_worker_entry, AgentMessage, AgentPipe, Rendezvous, WorkerContext,
    WorkerEntry, WorkerError, WorkerMessage,
};
