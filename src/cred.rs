/// Client for the credential collaborator (smartcard/TPM gateway).
///
/// The collaborator owns all cryptographic primitives; this side only
/// speaks the request/reply framing: a 4-byte big-endian length followed by
/// a JSON record. One connection per outstanding operation, so replies
/// never need demultiplexing and a hook can park directly on the socket fd.
use crate::types::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CredRequest {
    TokenUnlock { uuid: Uuid, passphrase: String },
    WrapKey { uuid: Uuid, key: Vec<u8> },
    UnwrapKey { uuid: Uuid, wrapped: Vec<u8> },
    Sign { data: Vec<u8> },
    Verify { data: Vec<u8>, signature: Vec<u8> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CredReply {
    Ok,
    WrongPassphrase,
    Key(Vec<u8>),
    Signature(Vec<u8>),
    Verified(bool),
    Error(String),
}

#[derive(Clone)]
pub struct CredClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl CredClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> CredClient {
        CredClient {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    /// Wall-clock bound for one request/reply round-trip; exceeding it is a
    /// credential failure for the waiting phase.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a connection and send one request. The returned pending handle
    /// exposes the fd to park on; `complete` reads the reply.
    pub fn submit(&self, request: &CredRequest) -> Result<CredPending> {
        let mut stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            Error::Credential(format!(
                "credential collaborator unreachable at {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        let payload = serde_json::to_vec(request)?;
        let len = (payload.len() as u32).to_be_bytes();
        stream.write_all(&len)?;
        stream.write_all(&payload)?;
        stream.set_nonblocking(true)?;
        debug!("credential request submitted ({} bytes)", payload.len());
        Ok(CredPending { stream })
    }
}

/// An in-flight credential operation. The fd becomes readable when the
/// reply frame arrives.
#[derive(Debug)]
pub struct CredPending {
    stream: UnixStream,
}

impl CredPending {
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Read the reply. Call only after the fd signaled readable; the frame
    /// is small enough that it arrives whole.
    pub fn complete(mut self) -> Result<CredReply> {
        self.stream.set_nonblocking(false)?;
        self.stream
            .set_read_timeout(Some(Duration::from_millis(500)))?;
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > 1 << 20 {
            return Err(Error::Credential(format!(
                "oversized credential reply ({} bytes)",
                len
            )));
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;
        let reply: CredReply = serde_json::from_slice(&payload)
            .map_err(|e| Error::Credential(format!("malformed credential reply: {}", e)))?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    fn serve_one_reply(path: &std::path::Path, reply: CredReply) -> std::thread::JoinHandle<CredRequest> {
        let listener = UnixListener::bind(path).unwrap();
        std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut len_buf = [0u8; 4];
            conn.read_exact(&mut len_buf).unwrap();
            let mut payload = vec![0u8; u32::from_be_bytes(len_buf) as usize];
            conn.read_exact(&mut payload).unwrap();
            let request: CredRequest = serde_json::from_slice(&payload).unwrap();
            let reply_payload = serde_json::to_vec(&reply).unwrap();
            conn.write_all(&(reply_payload.len() as u32).to_be_bytes()).unwrap();
            conn.write_all(&reply_payload).unwrap();
            request
        })
    }

    #[test]
    fn request_reply_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("cred.sock");
        let server = serve_one_reply(&sock, CredReply::Ok);

        let client = CredClient::new(&sock, Duration::from_secs(5));
        let uuid = Uuid::new_v4();
        let pending = client
            .submit(&CredRequest::TokenUnlock {
                uuid,
                passphrase: "trustme".to_string(),
            })
            .unwrap();
        let reply = pending.complete().unwrap();
        assert!(matches!(reply, CredReply::Ok));

        let seen = server.join().unwrap();
        match seen {
            CredRequest::TokenUnlock { uuid: u, .. } => assert_eq!(u, uuid),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn unreachable_collaborator_is_credential_error() {
        let client = CredClient::new("/nonexistent/cred.sock", Duration::from_secs(1));
        let err = client
            .submit(&CredRequest::Sign { data: vec![1, 2, 3] })
            .unwrap_err();
        assert!(matches!(err, Error::Credential(_)));
    }
}
