//! The controller's RPC server: accepts worker connections and dispatches the six calls
//! in `meshbox_proto::controller` against a shared [`Controller`].
//!
//! One task per connected worker; within a connection, requests are served strictly in
//! arrival order (a worker never has two calls in flight on the same socket), matching
//! how [`crate::worker_client::WorkerClient`] and `meshbox-worker`'s `ControllerClient`
//! both hold a single connection for their whole lifetime.

use std::sync::Arc;

use meshbox_proto::controller::{Ack, ControllerRequest, ControllerResponse, GetDecisionResponse, GetBaseContainersResponse};
use meshbox_proto::wire::{Packet, WireError};
use meshbox_proto::RpcError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{info, warn};

use crate::state::{Controller, ControllerError};

const READ_CHUNK: usize = 4096;

impl From<ControllerError> for RpcError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::SandboxNotFound | ControllerError::MachineNotFound => Self::NotFound,
            ControllerError::SandboxDummy => Self::Cancelled,
            ControllerError::NoMachineAvailable => Self::Internal,
        }
    }
}

/// Dispatches one already-decoded [`ControllerRequest`] against `controller`, returning
/// the response to frame and send back. Pulled out of the connection loop so it can be
/// exercised directly in tests without a socket.
pub fn dispatch(controller: &Controller, request: ControllerRequest) -> ControllerResponse {
    match request {
        ControllerRequest::GetDecision(req) => match controller.get_decision(req.sandbox_id) {
            Ok(decision) => ControllerResponse::Decision(GetDecisionResponse { decision }),
            Err(err) => ControllerResponse::Err(err.into()),
        },
        ControllerRequest::RegisterPages(req) => {
            match controller.register_pages(req.sandbox_id, req.machine_id, &req.payload) {
                Ok(()) => ControllerResponse::Ack(Ack),
                Err(err) => ControllerResponse::Err(err.into()),
            }
        }
        ControllerRequest::GetBaseContainers(req) => {
            let base_pages = controller.get_base_containers(req.sandbox_id, req.machine_id, &req.payload);
            ControllerResponse::BaseContainers(GetBaseContainersResponse { base_pages })
        }
        ControllerRequest::UpdateStatus(req) => {
            match controller.update_status(req.sandbox_id, req.status) {
                Ok(()) => ControllerResponse::Ack(Ack),
                Err(err) => ControllerResponse::Err(err.into()),
            }
        }
        ControllerRequest::UpdateAvailableMemory(req) => {
            match controller.update_available_memory(req.machine_id, req.used_memory_mb) {
                Ok(()) => ControllerResponse::Ack(Ack),
                Err(err) => ControllerResponse::Err(err.into()),
            }
        }
        ControllerRequest::Blacklist(req) => match controller.blacklist(req.sandbox_id) {
            Ok(()) => ControllerResponse::Ack(Ack),
            Err(err) => ControllerResponse::Err(err.into()),
        },
    }
}

/// Runs the controller's RPC server on `addr` until the process is torn down. Each
/// accepted connection is handled on its own task; a connection-level error (decode
/// failure, write failure, peer disconnect) only ends that connection, never the server.
pub async fn serve(controller: Arc<Controller>, addr: impl ToSocketAddrs) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(local_addr = ?listener.local_addr()?, "controller rpc server listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(&controller, socket).await {
                warn!(?peer, error = %err, "controller rpc connection ended");
            }
        });
    }
}

async fn handle_connection(controller: &Controller, mut socket: tokio::net::TcpStream) -> Result<(), WireError> {
    let mut acc = Vec::with_capacity(READ_CHUNK);
    let mut buf = vec![0_u8; READ_CHUNK];
    loop {
        while let Ok((request, consumed)) = Packet::decode::<ControllerRequest>(&acc) {
            let response = dispatch(controller, request);
            let framed = Packet::encode(&response)?;
            if socket.write_all(&framed).await.is_err() {
                return Ok(());
            }
            acc.drain(..consumed);
        }
        let n = match socket.read(&mut buf).await {
            Ok(n) => n,
            Err(_) => return Ok(()),
        };
        if n == 0 {
            return Ok(());
        }
        acc.extend_from_slice(&buf[..n]);
    }
}
