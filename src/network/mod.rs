//! Network Module
//!
//! Exposes a coordination store over TCP: the framed codec, the
//! server wrapping a local store and the remote client.

pub mod protocol;
mod server;
mod client;

pub use protocol::{Request, Response, ErrorCode, FrameHeader};
pub use server::StoreServer;
pub use client::{RemoteStore, RemoteStoreConfig};

use crate::error::{Error, Result};

/// Read a raw frame body from a reader
async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_LENGTH {
        return Err(Error::Protocol(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    Ok(body)
}

/// Write a raw frame body to a writer
async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let header = FrameHeader::new(body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;

    Ok(())
}

/// Read a framed request from a reader
pub async fn read_request<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Request> {
    let body = read_frame(reader).await?;
    Ok(Request::deserialize(&body)?)
}

/// Write a framed request to a writer
pub async fn write_request<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    request: &Request,
) -> Result<()> {
    write_frame(writer, &request.serialize()?).await
}

/// Read a framed response from a reader
pub async fn read_response<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Response> {
    let body = read_frame(reader).await?;
    Ok(Response::deserialize(&body)?)
}

/// Write a framed response to a writer
pub async fn write_response<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> Result<()> {
    write_frame(writer, &response.serialize()?).await
}
