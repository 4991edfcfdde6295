//! The worker's RPC server: accepts controller connections and dispatches the five calls
//! in `meshbox_proto::worker` against a shared [`Worker`].
//!
//! Mirrors `meshbox-controller`'s server shape: one task per connection, length-prefixed
//! CBOR frames decoded in arrival order off a single accumulating buffer.

use std::sync::Arc;
use std::time::Duration;

use meshbox_proto::worker::{TerminateRequest, UsedMemoryResponse, WorkerRequest, WorkerResponse};
use meshbox_proto::wire::{Packet, WireError};
use meshbox_proto::RpcError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{info, warn};

use crate::error::WorkerError;
use crate::lifecycle::Worker;

const READ_CHUNK: usize = 4096;
/// Grace period between observing a `Terminate` and the server loop actually exiting.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

impl From<WorkerError> for RpcError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::SandboxNotFound => Self::NotFound,
            WorkerError::StatePrecondition => Self::Cancelled,
            WorkerError::HelperFailure(_) => Self::HelperFailure,
            WorkerError::RuntimeCall(_) | WorkerError::ControllerRpc(_) | WorkerError::Io(_) => Self::Internal,
            WorkerError::Memxfer(inner) => match inner {
                meshbox_memxfer::MemxferError::Backpressure => Self::Backpressure,
                meshbox_memxfer::MemxferError::NotFound => Self::NotFound,
                meshbox_memxfer::MemxferError::RegistrationFailed => Self::Internal,
            },
        }
    }
}

fn unwrap_used_memory(result: Result<UsedMemoryResponse, WorkerError>) -> WorkerResponse {
    match result {
        Ok(response) => WorkerResponse::UsedMemory(response),
        Err(err) => WorkerResponse::Err(err.into()),
    }
}

/// Dispatches one already-decoded [`WorkerRequest`] against `worker`, returning the
/// response to frame and send back. A `Terminate` both flips the worker's shutdown flag
/// and tells the caller to close the connection after replying.
pub fn dispatch(worker: &Worker, request: WorkerRequest) -> (WorkerResponse, bool) {
    match request {
        WorkerRequest::Spawn(req) => {
            (unwrap_used_memory(worker.spawn(req.sandbox_id, req.application, req.environment)), false)
        }
        WorkerRequest::Restart(req) => (unwrap_used_memory(worker.restart(req.sandbox_id)), false),
        WorkerRequest::Restore(req) => (unwrap_used_memory(worker.restore(req.sandbox_id)), false),
        WorkerRequest::Purge(req) => (unwrap_used_memory(worker.purge(req.sandbox_id)), false),
        WorkerRequest::Terminate(TerminateRequest) => {
            worker.terminate();
            (WorkerResponse::Ack, true)
        }
    }
}

/// Runs the worker's RPC server on `addr` until `worker` observes a `Terminate` and the
/// accept loop is torn down by the caller, or the process exits.
pub async fn serve(worker: Arc<Worker>, addr: impl ToSocketAddrs) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(local_addr = ?listener.local_addr()?, "worker rpc server listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(&worker, socket).await {
                warn!(?peer, error = %err, "worker rpc connection ended");
            }
        });
    }
}

async fn handle_connection(worker: &Worker, mut socket: tokio::net::TcpStream) -> Result<(), WireError> {
    let mut acc = Vec::with_capacity(READ_CHUNK);
    let mut buf = vec![0_u8; READ_CHUNK];
    loop {
        while let Ok((request, consumed)) = Packet::decode::<WorkerRequest>(&acc) {
            let (response, should_close) = dispatch(worker, request);
            let framed = Packet::encode(&response)?;
            if socket.write_all(&framed).await.is_err() {
                return Ok(());
            }
            acc.drain(..consumed);
            if should_close {
                tokio::time::sleep(TERMINATE_GRACE).await;
                return Ok(());
            }
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

#[cfg(test)]
mod tests {
    use super::dispatch;
    use crate::controller_client::ControllerClient;
    use crate::dedup::DedupCodec;
    use crate::delta::SparseDeltaCodec;
    use crate::lifecycle::{Worker, WorkerConfig};
    use crate::runtime::InMemoryRuntime;
    use meshbox_config::params::FingerprintParams;
    use meshbox_memxfer::transport::InMemoryTransport;
    use meshbox_memxfer::{MemxferPipeline, PipelineConfig};
    use meshbox_proto::worker::{SpawnRequest, TerminateRequest, WorkerRequest, WorkerResponse};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn worker() -> Worker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // No requests expected in these dispatch-level tests; keep the listener alive.
            let _ = listener.accept().await;
        });
        let controller = ControllerClient::connect(addr).await.unwrap();
        let transport = Arc::new(InMemoryTransport::default());
        let pipeline = Arc::new(MemxferPipeline::new(transport, PipelineConfig::default()));
        let dedup = DedupCodec { delta: Arc::new(SparseDeltaCodec), pipeline };
        let config = WorkerConfig {
            machine_id: 0,
            applications: HashMap::new(),
            fingerprint: FingerprintParams {
                chunks_per_page: 2,
                idle_time_s: 30,
                nopause: false,
                adaptive: false,
                patch_threshold: 4096,
            },
            dump_dir: std::env::temp_dir(),
        };
        Worker::new(config, Arc::new(InMemoryRuntime::default()), Arc::new(controller), dedup, "/tmp/meshbox-rpc-test-pipe")
    }

    // ── 1. dispatching Spawn places the sandbox and returns its used memory ──
    #[tokio::test]
    async fn dispatch_spawn_succeeds() {
        let worker = worker().await;
        let (response, should_close) = dispatch(
            &worker,
            WorkerRequest::Spawn(SpawnRequest { sandbox_id: 1, application: "app0".into(), environment: "env0".into() }),
        );
        assert!(matches!(response, WorkerResponse::UsedMemory(_)));
        assert!(!should_close);
    }

    // ── 2. dispatching Terminate acks and signals the connection to close ──
    #[tokio::test]
    async fn dispatch_terminate_signals_close() {
        let worker = worker().await;
        let (response, should_close) = dispatch(&worker, WorkerRequest::Terminate(TerminateRequest));
        assert!(matches!(response, WorkerResponse::Ack));
        assert!(should_close);
        assert!(worker.is_shutting_down());
    }

    // ── 3. restarting a sandbox that was never spawned surfaces as a not-found error ──
    #[tokio::test]
    async fn dispatch_restart_unknown_sandbox_is_not_found() {
        let worker = worker().await;
        let (response, _) = dispatch(&worker, WorkerRequest::Restart(meshbox_proto::worker::RestartRequest { sandbox_id: 99 }));
        assert!(matches!(response, WorkerResponse::Err(meshbox_proto::RpcError::NotFound)));
    }
}
