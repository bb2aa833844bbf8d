//! Unix-domain-socket front-end for the control endpoint: frames
//! `BIND`/`CLOSE`/`READ`/`WRITE` over a length-prefixed byte stream for an
//! out-of-process handshake agent, the way the teacher framed control
//! frames over TCP with a manual length-prefixed parser.
//!
//! Wire format per message: a 4-byte big-endian length prefix, then one
//! opcode byte, then an opcode-specific payload.
//!
//! - `BIND = 0`:  payload = 18-byte flat endpoint; reply = 1-byte status (0 = ok)
//! - `CLOSE = 1`: payload = 18-byte flat endpoint; reply = 1-byte status
//! - `READ = 2`:  no payload; reply = `{src:18, dst:18, data}` or empty if nothing queued
//! - `WRITE = 3`: payload = `{src:18, dst:18, data}`; reply = 1-byte status

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::control::ControlEndpoint;
use crate::endpoint::FLAT_ENDPOINT_LEN;

const OP_BIND: u8 = 0;
const OP_CLOSE: u8 = 1;
const OP_READ: u8 = 2;
const OP_WRITE: u8 = 3;

const MAX_MESSAGE_LEN: usize = 1 << 20;

/// Accepts connections on `path` forever, serving each on its own task.
/// Mirrors the accept loop's exponential backoff on transient errors.
pub async fn serve(path: &Path, control: Arc<ControlEndpoint>) -> crate::error::Result<()> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    tracing::info!(path = %path.display(), "control endpoint listening");

    let mut backoff = 1u64;
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                backoff = 1;
                let control = control.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, control).await {
                        tracing::debug!(error = %e, "control connection ended");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, backoff, "control endpoint accept failed, backing off");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(64);
            }
        }
    }
}

async fn handle_connection(mut stream: UnixStream, control: Arc<ControlEndpoint>) -> crate::error::Result<()> {
    loop {
        let Some(msg) = read_frame(&mut stream).await? else {
            return Ok(());
        };
        let reply = dispatch(&control, &msg).await;
        write_frame(&mut stream, &reply).await?;
    }
}

/// Reads one length-prefixed message, or `None` on a clean EOF before any
/// bytes of the next frame arrive.
async fn read_frame(stream: &mut UnixStream) -> crate::error::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err("control message exceeds maximum length".into());
    }
    let mut buf = BytesMut::zeroed(len);
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf.to_vec()))
}

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> crate::error::Result<()> {
    let mut framed = BytesMut::with_capacity(4 + payload.len());
    framed.put_u32(payload.len() as u32);
    framed.put_slice(payload);
    stream.write_all(&framed).await?;
    Ok(())
}

async fn dispatch(control: &Arc<ControlEndpoint>, msg: &[u8]) -> Vec<u8> {
    if msg.is_empty() {
        return status_reply(false);
    }
    let opcode = msg[0];
    let payload = &msg[1..];
    match opcode {
        OP_BIND => match flat_from(payload) {
            Some(flat) => status_reply(control.bind(flat).await.is_ok()),
            None => status_reply(false),
        },
        OP_CLOSE => match flat_from(payload) {
            Some(flat) => status_reply(control.close(flat).await.is_ok()),
            None => status_reply(false),
        },
        OP_READ => match control.read().await {
            Some(msg) => encode_handshake(&msg),
            None => Vec::new(),
        },
        OP_WRITE => match decode_handshake(payload) {
            Some((src, dst, data)) => status_reply(control.write(src, dst, data).await.is_ok()),
            None => status_reply(false),
        },
        other => {
            tracing::debug!(opcode = other, "unknown control opcode");
            status_reply(false)
        }
    }
}

fn status_reply(ok: bool) -> Vec<u8> {
    vec![if ok { 0 } else { 1 }]
}

fn flat_from(payload: &[u8]) -> Option<[u8; FLAT_ENDPOINT_LEN]> {
    if payload.len() != FLAT_ENDPOINT_LEN {
        return None;
    }
    let mut flat = [0u8; FLAT_ENDPOINT_LEN];
    flat.copy_from_slice(payload);
    Some(flat)
}

fn encode_handshake(msg: &crate::handshake_ring::HandshakeMessage) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(2 * FLAT_ENDPOINT_LEN + msg.data.len());
    buf.put_slice(&msg.src);
    buf.put_slice(&msg.dst);
    buf.put_slice(&msg.data);
    buf.to_vec()
}

fn decode_handshake(payload: &[u8]) -> Option<([u8; FLAT_ENDPOINT_LEN], [u8; FLAT_ENDPOINT_LEN], Vec<u8>)> {
    if payload.len() < 2 * FLAT_ENDPOINT_LEN {
        return None;
    }
    let mut cursor = payload;
    let mut src = [0u8; FLAT_ENDPOINT_LEN];
    src.copy_from_slice(&cursor[..FLAT_ENDPOINT_LEN]);
    cursor.advance(FLAT_ENDPOINT_LEN);
    let mut dst = [0u8; FLAT_ENDPOINT_LEN];
    dst.copy_from_slice(&cursor[..FLAT_ENDPOINT_LEN]);
    cursor.advance(FLAT_ENDPOINT_LEN);
    Some((src, dst, cursor.to_vec()))
}
