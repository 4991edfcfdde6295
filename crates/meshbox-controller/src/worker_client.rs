//! The scheduler's client for a worker's RPC surface.
//!
//! One TCP connection per worker, held open for the controller's lifetime and guarded by
//! a `tokio::sync::Mutex` (calls are issued from several scheduler tasks but the wire is a
//! strict request/response protocol with no call interleaving). Every call carries its own
//! deadline via `tokio::time::timeout`, per §4.4's explicit-deadline requirement — this
//! crate never blocks a scheduler thread indefinitely on a worker that has gone away.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;

use meshbox_proto::worker::{
    PurgeRequest, RestartRequest, RestoreRequest, SpawnRequest, TerminateRequest, UsedMemoryResponse,
    WorkerRequest, WorkerResponse,
};

/// Read chunk size while accumulating a response frame.
const READ_CHUNK: usize = 4096;

/// Errors a call against a worker's RPC surface can surface.
#[derive(Debug, thiserror::Error)]
pub enum WorkerClientError {
    /// The call exceeded its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// A transport-level failure (connect, write, read, or decode).
    #[error("transport error: {0}")]
    Transport(String),
    /// The worker's RPC surface returned an explicit error.
    #[error("worker rpc error: {0:?}")]
    Rpc(meshbox_proto::RpcError),
}

/// A connection to one worker's RPC server.
pub struct WorkerClient {
    stream: Mutex<TcpStream>,
}

impl WorkerClient {
    /// Connects to the worker at `addr`.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, WorkerClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| WorkerClientError::Transport(format!("connect: {err}")))?;
        Ok(Self { stream: Mutex::new(stream) })
    }

    async fn call(
        &self,
        request: &WorkerRequest,
        deadline: Duration,
    ) -> Result<WorkerResponse, WorkerClientError> {
        let framed = meshbox_proto::wire::Packet::encode(request)
            .map_err(|err| WorkerClientError::Transport(format!("encode request: {err}")))?;

        tokio::time::timeout(deadline, async {
            let mut stream = self.stream.lock().await;
            stream
                .write_all(&framed)
                .await
                .map_err(|err| WorkerClientError::Transport(format!("write request: {err}")))?;

            let mut acc = Vec::with_capacity(READ_CHUNK);
            let mut buf = vec![0_u8; READ_CHUNK];
            loop {
                if let Ok((response, _)) =
                    meshbox_proto::wire::Packet::decode::<WorkerResponse>(&acc)
                {
                    return Ok(response);
                }
                let n = stream
                    .read(&mut buf)
                    .await
                    .map_err(|err| WorkerClientError::Transport(format!("read response: {err}")))?;
                if n == 0 {
                    return Err(WorkerClientError::Transport(
                        "connection closed mid-response".into(),
                    ));
                }
                acc.extend_from_slice(&buf[..n]);
            }
        })
        .await
        .map_err(|_| WorkerClientError::DeadlineExceeded)?
    }

    fn unwrap_used_memory(response: WorkerResponse) -> Result<UsedMemoryResponse, WorkerClientError> {
        match response {
            WorkerResponse::UsedMemory(used) => Ok(used),
            WorkerResponse::Err(err) => Err(WorkerClientError::Rpc(err)),
            WorkerResponse::Ack => Err(WorkerClientError::Transport(
                "unexpected Ack response to a used-memory call".into(),
            )),
        }
    }

    /// `Spawn({sandbox_id, application, environment})`, with the cold-start deadline.
    pub async fn spawn(
        &self,
        sandbox_id: u64,
        application: String,
        environment: String,
        deadline: Duration,
    ) -> Result<UsedMemoryResponse, WorkerClientError> {
        let response = self
            .call(
                &WorkerRequest::Spawn(SpawnRequest { sandbox_id, application, environment }),
                deadline,
            )
            .await?;
        Self::unwrap_used_memory(response)
    }

    /// `Restart({sandbox_id})`, with the warm-start deadline.
    pub async fn restart(
        &self,
        sandbox_id: u64,
        deadline: Duration,
    ) -> Result<UsedMemoryResponse, WorkerClientError> {
        let response = self
            .call(&WorkerRequest::Restart(RestartRequest { sandbox_id }), deadline)
            .await?;
        Self::unwrap_used_memory(response)
    }

    /// `Restore({sandbox_id})`, with the dedup-restore deadline.
    pub async fn restore(
        &self,
        sandbox_id: u64,
        deadline: Duration,
    ) -> Result<UsedMemoryResponse, WorkerClientError> {
        let response = self
            .call(&WorkerRequest::Restore(RestoreRequest { sandbox_id }), deadline)
            .await?;
        Self::unwrap_used_memory(response)
    }

    /// `Purge({sandbox_id})`.
    pub async fn purge(
        &self,
        sandbox_id: u64,
        deadline: Duration,
    ) -> Result<UsedMemoryResponse, WorkerClientError> {
        let response = self
            .call(&WorkerRequest::Purge(PurgeRequest { sandbox_id }), deadline)
            .await?;
        Self::unwrap_used_memory(response)
    }

    /// `Terminate()`: tells the worker to begin its graceful, 2 s-grace exit.
    pub async fn terminate(&self, deadline: Duration) -> Result<(), WorkerClientError> {
        match self.call(&WorkerRequest::Terminate(TerminateRequest), deadline).await? {
            WorkerResponse::Ack => Ok(()),
            WorkerResponse::Err(err) => Err(WorkerClientError::Rpc(err)),
            WorkerResponse::UsedMemory(_) => Err(WorkerClientError::Transport(
                "unexpected used-memory response to Terminate".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerClient;
    use meshbox_proto::wire::Packet;
    use meshbox_proto::worker::{UsedMemoryResponse, WorkerRequest, WorkerResponse};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    // ── 1. spawn round-trips against a minimal in-process server ──
    #[tokio::test]
    async fn spawn_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut acc = Vec::new();
            let mut buf = [0_u8; 4096];
            loop {
                if let Ok((request, _)) = Packet::decode::<WorkerRequest>(&acc) {
                    assert!(matches!(request, WorkerRequest::Spawn(_)));
                    let response = WorkerResponse::UsedMemory(UsedMemoryResponse { used_memory_mb: 128 });
                    let framed = Packet::encode(&response).unwrap();
                    socket.write_all(&framed).await.unwrap();
                    break;
                }
                let n = socket.read(&mut buf).await.unwrap();
                acc.extend_from_slice(&buf[..n]);
            }
        });

        let client = WorkerClient::connect(addr).await.unwrap();
        let response = client
            .spawn(0, "app0".into(), "env0".into(), Duration::from_millis(3500))
            .await
            .unwrap();
        assert_eq!(response.used_memory_mb, 128);
    }

    // ── 2. a server that never answers trips the deadline, not a hang ──
    #[tokio::test]
    async fn unanswered_call_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let client = WorkerClient::connect(addr).await.unwrap();
        let err = client.restart(0, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, super::WorkerClientError::DeadlineExceeded));
    }
}
