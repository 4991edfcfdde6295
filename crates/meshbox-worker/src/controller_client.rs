//! A worker's client for the controller's RPC surface.
//!
//! One TCP connection per worker, held open for the worker's lifetime and guarded by a
//! `tokio::sync::Mutex` since calls are made from several tasks (the lifecycle loop and
//! the dedup/restore pipeline) but the wire is a strict request/response protocol with
//! no call interleaving.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;

use meshbox_proto::controller::{
    Ack, BlacklistRequest, ControllerRequest, ControllerResponse, GetBaseContainersRequest,
    GetBaseContainersResponse, GetDecisionRequest, GetDecisionResponse, PageHashes,
    RegisterPagesRequest, UpdateAvailableMemoryRequest, UpdateStatusRequest,
};
use meshbox_proto::wire::Packet;
use meshbox_proto::SandboxState;

use crate::error::WorkerError;

/// Round-trip timeout applied to every call into the controller.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);
/// Read chunk size while accumulating a response frame.
const READ_CHUNK: usize = 4096;

/// A connection to the controller's RPC server.
pub struct ControllerClient {
    stream: Mutex<TcpStream>,
}

impl ControllerClient {
    /// Connects to the controller at `addr`.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, WorkerError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| WorkerError::ControllerRpc(format!("connect: {err}")))?;
        Ok(Self { stream: Mutex::new(stream) })
    }

    async fn call(&self, request: &ControllerRequest) -> Result<ControllerResponse, WorkerError> {
        let framed = Packet::encode(request)
            .map_err(|err| WorkerError::ControllerRpc(format!("encode request: {err}")))?;

        tokio::time::timeout(CALL_TIMEOUT, async {
            let mut stream = self.stream.lock().await;
            stream
                .write_all(&framed)
                .await
                .map_err(|err| WorkerError::ControllerRpc(format!("write request: {err}")))?;

            let mut acc = Vec::with_capacity(READ_CHUNK);
            let mut buf = vec![0_u8; READ_CHUNK];
            loop {
                if let Ok((response, _)) = Packet::decode::<ControllerResponse>(&acc) {
                    return Ok(response);
                }
                let n = stream
                    .read(&mut buf)
                    .await
                    .map_err(|err| WorkerError::ControllerRpc(format!("read response: {err}")))?;
                if n == 0 {
                    return Err(WorkerError::ControllerRpc("connection closed mid-response".into()));
                }
                acc.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .map_err(|_| WorkerError::ControllerRpc("timed out".into()))?
    }

    fn unwrap_ack(response: ControllerResponse) -> Result<(), WorkerError> {
        match response {
            ControllerResponse::Ack(Ack) => Ok(()),
            ControllerResponse::Err(err) => Err(WorkerError::ControllerRpc(format!("{err:?}"))),
            other => Err(WorkerError::ControllerRpc(format!("unexpected response: {other:?}"))),
        }
    }

    /// `GetDecision(sandbox_id)`.
    pub async fn get_decision(&self, sandbox_id: u64) -> Result<GetDecisionResponse, WorkerError> {
        match self.call(&ControllerRequest::GetDecision(GetDecisionRequest { sandbox_id })).await? {
            ControllerResponse::Decision(response) => Ok(response),
            ControllerResponse::Err(err) => Err(WorkerError::ControllerRpc(format!("{err:?}"))),
            other => Err(WorkerError::ControllerRpc(format!("unexpected response: {other:?}"))),
        }
    }

    /// `RegisterPages({sandbox_id, machine_id, payload})`.
    pub async fn register_pages(
        &self,
        sandbox_id: u64,
        machine_id: u32,
        payload: Vec<PageHashes>,
    ) -> Result<(), WorkerError> {
        let response = self
            .call(&ControllerRequest::RegisterPages(RegisterPagesRequest { sandbox_id, machine_id, payload }))
            .await?;
        Self::unwrap_ack(response)
    }

    /// `GetBaseContainers({sandbox_id, machine_id, payload})`.
    pub async fn get_base_containers(
        &self,
        sandbox_id: u64,
        machine_id: u32,
        payload: Vec<PageHashes>,
    ) -> Result<GetBaseContainersResponse, WorkerError> {
        match self
            .call(&ControllerRequest::GetBaseContainers(GetBaseContainersRequest {
                sandbox_id,
                machine_id,
                payload,
            }))
            .await?
        {
            ControllerResponse::BaseContainers(response) => Ok(response),
            ControllerResponse::Err(err) => Err(WorkerError::ControllerRpc(format!("{err:?}"))),
            other => Err(WorkerError::ControllerRpc(format!("unexpected response: {other:?}"))),
        }
    }

    /// `UpdateStatus({sandbox_id, status})`.
    pub async fn update_status(&self, sandbox_id: u64, status: SandboxState) -> Result<(), WorkerError> {
        let response = self.call(&ControllerRequest::UpdateStatus(UpdateStatusRequest { sandbox_id, status })).await?;
        Self::unwrap_ack(response)
    }

    /// `UpdateAvailableMemory({machine_id, used_memory_mb})`.
    pub async fn update_available_memory(&self, machine_id: u32, used_memory_mb: u64) -> Result<(), WorkerError> {
        let response = self
            .call(&ControllerRequest::UpdateAvailableMemory(UpdateAvailableMemoryRequest {
                machine_id,
                used_memory_mb,
            }))
            .await?;
        Self::unwrap_ack(response)
    }

    /// `Blacklist({sandbox_id})`.
    pub async fn blacklist(&self, sandbox_id: u64) -> Result<(), WorkerError> {
        let response = self.call(&ControllerRequest::Blacklist(BlacklistRequest { sandbox_id })).await?;
        Self::unwrap_ack(response)
    }
}
