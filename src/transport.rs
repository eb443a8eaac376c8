//! TCP adapter that stands in for the vhci/virtual-USB transport.
//!
//! There is no emulated wire protocol to match here — HASP's real transport
//! is a kernel-level USB bus, out of scope for this crate — so this module
//! invents a small length-prefixed framing good enough to drive the
//! dispatcher from a test client or a CLI. One TCP port serves one loaded
//! token; each connection gets its own [`TokenState`] and its own tokio
//! task, matching the one-session-per-connection shape of
//! `LoginState::handle_new_connection` in the login server.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::dispatcher::{self, Request, SystemClock};
use crate::error::TransportError;
use crate::key_definition::KeyDefinition;
use crate::token_state::TokenState;

/// Wire shape of one request: `major_fn:u8, p1:u16 LE, p2:u16 LE, p3:u16 LE,
/// out_cap:u32 LE` — 11 bytes, invented for this adapter and not part of the
/// emulated protocol.
const REQUEST_LEN: usize = 1 + 2 + 2 + 2 + 4;

async fn read_request(stream: &mut TcpStream) -> Result<Request, TransportError> {
    let mut buf = [0u8; REQUEST_LEN];
    stream.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::Truncated
        } else {
            TransportError::Io(e)
        }
    })?;
    Ok(Request {
        major_fn: buf[0],
        p1: u16::from_le_bytes([buf[1], buf[2]]),
        p2: u16::from_le_bytes([buf[3], buf[4]]),
        p3: u16::from_le_bytes([buf[5], buf[6]]),
        out_cap: u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]),
    })
}

/// Writes one response: a `u16` LE length prefix followed by the payload.
async fn write_response(stream: &mut TcpStream, payload: &[u8]) -> Result<(), TransportError> {
    let len = payload.len() as u16;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(payload).await?;
    Ok(())
}

/// Serves one emulated token to one connected client until the client
/// disconnects or sends a malformed request.
pub async fn handle_connection(key: KeyDefinition, mut stream: TcpStream) {
    let mut token = TokenState::new(key);
    let clock = SystemClock;
    loop {
        let request = match read_request(&mut stream).await {
            Ok(r) => r,
            Err(TransportError::Truncated) => return,
            Err(e) => {
                tracing::warn!("[transport] read error: {e}");
                return;
            }
        };
        let response = dispatcher::dispatch(&mut token, request, &clock);
        if write_response(&mut stream, &response).await.is_err() {
            return;
        }
    }
}

/// Binds `bind_addr` and serves `key` to every connection, each on its own
/// task with its own session state — mirrors `LoginState::run`'s
/// accept loop.
pub async fn serve(key: Arc<KeyDefinition>, bind_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!("[transport] listening addr={bind_addr}");
    loop {
        let (stream, peer) = listener.accept().await?;
        let key = Arc::clone(&key);
        tracing::info!("[transport] connection peer={peer}");
        tokio::spawn(async move {
            handle_connection((*key).clone(), stream).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_definition::{ED_STRUCT_LEN, MEMORY_LEN, NET_MEMORY_LEN};
    use crate::secure_table::SecureTable;
    use tokio::io::AsyncReadExt as _;

    fn test_key() -> KeyDefinition {
        KeyDefinition {
            name: "test".into(),
            created: "test".into(),
            password: 0x1234_5678,
            key_type: 3,
            memory_type: 0x20,
            options: [0; 14],
            sec_table: SecureTable::derive_from_password(0x1234_5678),
            net_memory: [0; NET_MEMORY_LEN],
            memory: [0; MEMORY_LEN],
            ed_struct: [0; ED_STRUCT_LEN],
        }
    }

    fn encode_request(major_fn: u8, p1: u16, p2: u16, p3: u16, out_cap: u32) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0] = major_fn;
        buf[1..3].copy_from_slice(&p1.to_le_bytes());
        buf[3..5].copy_from_slice(&p2.to_le_bytes());
        buf[5..7].copy_from_slice(&p3.to_le_bytes());
        buf[7..11].copy_from_slice(&out_cap.to_le_bytes());
        buf
    }

    #[tokio::test]
    async fn echo_request_round_trips_over_the_wire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let key = test_key();

        tokio::spawn(async move {
            let (stream, _peer) = listener.accept().await.unwrap();
            handle_connection(key, stream).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&encode_request(dispatcher::KEY_FN_ECHO_REQUEST, 0, 0, 0, 64))
            .await
            .unwrap();

        let mut len_buf = [0u8; 2];
        client.read_exact(&mut len_buf).await.unwrap();
        let len = u16::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.unwrap();
        assert_eq!(payload, vec![0x00]);
    }

    #[tokio::test]
    async fn truncated_request_closes_connection_without_panic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let key = test_key();

        let server = tokio::spawn(async move {
            let (stream, _peer) = listener.accept().await.unwrap();
            handle_connection(key, stream).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x80, 0x01]).await.unwrap();
        drop(client);

        server.await.unwrap();
    }
}
