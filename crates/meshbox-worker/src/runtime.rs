//! The sandbox runtime's local daemon, modeled as a narrow trait.
//!
//! The daemon itself (container checkpoint/restore, pause/unpause, start/stop) is an
//! external collaborator the worker never implements, only calls into over a unix
//! socket using a small HTTP/1.1 subset. [`SandboxRuntime`] names that surface;
//! [`UnixSocketRuntime`] is the production client, [`InMemoryRuntime`] a test double
//! that records calls and returns a configured status.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use meshbox_proto::runtime::{RuntimeCall, CONNECT_TIMEOUT, REQUEST_TIMEOUT};

use crate::error::WorkerError;

/// Calls the worker makes against a sandbox's local runtime daemon.
pub trait SandboxRuntime: Send + Sync {
    /// Issues `call` against the daemon and returns its body (empty for calls that
    /// return no content).
    fn call(&self, call: &RuntimeCall) -> Result<Vec<u8>, WorkerError>;
}

/// Production [`SandboxRuntime`]: a minimal HTTP/1.1 client over a unix domain socket,
/// matching how the local daemon is actually reached (no ecosystem HTTP client in this
/// workspace's dependency stack speaks unix sockets, so this hand-rolls just enough of
/// the protocol to issue one request and read one response).
#[derive(Debug, Clone)]
pub struct UnixSocketRuntime {
    socket_path: PathBuf,
}

impl UnixSocketRuntime {
    /// Builds a client that connects to the daemon's socket at `socket_path` for every
    /// call.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self { socket_path: socket_path.into() }
    }
}

impl SandboxRuntime for UnixSocketRuntime {
    fn call(&self, call: &RuntimeCall) -> Result<Vec<u8>, WorkerError> {
        let (method, path) = call.method_and_path();
        let mut stream = connect(&self.socket_path)?;
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"
        );
        stream
            .write_all(request.as_bytes())
            .map_err(|err| WorkerError::RuntimeCall(format!("write request: {err}")))?;

        let (status, body) = read_response(&stream)?;
        if status != call.expected_status() {
            return Err(WorkerError::RuntimeCall(format!(
                "{method} {} returned {status}, expected {}",
                path,
                call.expected_status()
            )));
        }
        Ok(body)
    }
}

fn connect(socket_path: &std::path::Path) -> Result<UnixStream, WorkerError> {
    let stream = UnixStream::connect(socket_path)
        .map_err(|err| WorkerError::RuntimeCall(format!("connect: {err}")))?;
    stream
        .set_read_timeout(Some(REQUEST_TIMEOUT))
        .map_err(|err| WorkerError::RuntimeCall(format!("set read timeout: {err}")))?;
    stream
        .set_write_timeout(Some(CONNECT_TIMEOUT))
        .map_err(|err| WorkerError::RuntimeCall(format!("set write timeout: {err}")))?;
    Ok(stream)
}

/// Reads a minimal HTTP/1.1 response: a status line, headers terminated by a blank
/// line, and a `Content-Length`-bounded body. Chunked transfer encoding is not
/// supported; the daemon is expected to always send a length.
fn read_response(stream: &UnixStream) -> Result<(u16, Vec<u8>), WorkerError> {
    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .map_err(|err| WorkerError::RuntimeCall(format!("read status line: {err}")))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| WorkerError::RuntimeCall(format!("malformed status line: {status_line:?}")))?;

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .map_err(|err| WorkerError::RuntimeCall(format!("read header: {err}")))?;
        if line == "\r\n" || line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:").or_else(|| line.strip_prefix("content-length:")) {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let mut body = vec![0_u8; content_length];
    if content_length > 0 {
        reader
            .read_exact(&mut body)
            .map_err(|err| WorkerError::RuntimeCall(format!("read body: {err}")))?;
    }
    Ok((status, body))
}

/// Test double for [`SandboxRuntime`]: returns a fixed status for every call and
/// records the calls it received, so lifecycle tests can assert on what was issued
/// without a real daemon.
#[derive(Debug, Default)]
pub struct InMemoryRuntime {
    calls: Mutex<Vec<RuntimeCall>>,
    /// Status to answer every call with. Defaults to each call's own expected status.
    pub forced_status: Mutex<Option<u16>>,
}

impl InMemoryRuntime {
    /// Returns every call recorded so far, in issue order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().map_or_else(|e| e.into_inner().clone(), |g| g.clone())
    }
}

impl SandboxRuntime for InMemoryRuntime {
    fn call(&self, call: &RuntimeCall) -> Result<Vec<u8>, WorkerError> {
        self.calls.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(call.clone());
        let forced = *self.forced_status.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let status = forced.unwrap_or_else(|| call.expected_status());
        if status != call.expected_status() {
            return Err(WorkerError::RuntimeCall(format!(
                "forced status {status}, expected {}",
                call.expected_status()
            )));
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── 1. in-memory runtime records calls in order ──
    #[test]
    fn in_memory_runtime_records_calls() {
        let runtime = InMemoryRuntime::default();
        runtime.call(&RuntimeCall::Pause { name: "cont1".into() }).unwrap();
        runtime.call(&RuntimeCall::Unpause { name: "cont1".into() }).unwrap();
        assert_eq!(runtime.calls().len(), 2);
    }

    // ── 2. forcing a wrong status surfaces as an error ──
    #[test]
    fn in_memory_runtime_forced_mismatch_errors() {
        let runtime = InMemoryRuntime::default();
        *runtime.forced_status.lock().unwrap() = Some(500);
        let err = runtime.call(&RuntimeCall::Checkpoint { name: "cont1".into() });
        assert!(err.is_err());
    }

    // ── 3. read_response parses a status line and content-length body ──
    #[test]
    fn read_response_parses_status_and_body() {
        let (client, server) = UnixStream::pair().expect("socket pair");
        let handle = std::thread::spawn(move || read_response(&client));
        {
            let mut server = server;
            server
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 5\r\n\r\nhello")
                .unwrap();
        }
        let (status, body) = handle.join().expect("reader thread").expect("read_response");
        assert_eq!(status, 201);
        assert_eq!(body, b"hello");
    }
}
