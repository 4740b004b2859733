//! Length-prefixed JSON framing shared by the client, Raft, and region
//! surfaces. Each frame is a big-endian u32 length followed by one JSON
//! document; every exchange is one request and one response per connection.

use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on a single frame. Lock messages are small; anything larger is
/// a corrupt or hostile peer.
const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

pub async fn write_frame<T: Serialize>(stream: &mut TcpStream, message: &T) -> Result<()> {
    let bytes = serde_json::to_vec(message)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit", len);
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Connect, send one request, read one response. The whole exchange runs
/// under `deadline` so a stuck peer cannot wedge the caller.
pub async fn call<Req, Resp>(addr: &str, request: &Req, deadline: Duration) -> Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, request).await?;
        read_frame(&mut stream).await
    };
    match tokio::time::timeout(deadline, exchange).await {
        Ok(result) => result,
        Err(_) => bail!("rpc to {} timed out", addr),
    }
}
