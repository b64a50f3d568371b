//! Part Exchange
//!
//! TCP transport for moving finished parts between replicas. Messages are
//! bincode-framed with a length + crc32 header; a replica registers a
//! part supplier under its replica path and peers fetch by endpoint name.

mod client;
mod server;

pub use client::{fetch_part, FetchedPart};
pub use server::{EndpointHolder, ExchangeHandler, ExchangeServer, PartSupplier, SuppliedPart};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

/// Protocol messages of the part exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Request one part from the supplier registered under `endpoint`.
    GetPart { endpoint: String, part_name: String },

    /// A complete part: payload plus the checksums the sender has for it.
    PartData {
        part_name: String,
        rows: u64,
        payload: Vec<u8>,
        checksums: String,
    },

    /// The peer could not serve the request.
    Error { message: String },
}

impl Message {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Fixed-size frame header: body length and crc32 of the body.
pub struct FrameHeader {
    pub length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 8;

    pub fn new(body: &[u8]) -> Self {
        Self {
            length: body.len() as u32,
            checksum: crc32fast::hash(body),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..4].copy_from_slice(&self.length.to_be_bytes());
        bytes[4..].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_be_bytes(bytes[..4].try_into().unwrap()),
            checksum: u32::from_be_bytes(bytes[4..].try_into().unwrap()),
        }
    }
}

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("message checksum mismatch".into()));
    }

    Message::deserialize(&body)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Text framing of a replica's advertised exchange address, stored under
/// `replicas/<r>/host`.
pub fn format_host_entry(host: &str, port: u16) -> String {
    format!("host: {host}\nport: {port}\n")
}

/// Parse the text produced by [`format_host_entry`].
pub fn parse_host_entry(text: &str) -> Result<(String, u16)> {
    let malformed = || Error::Network(format!("malformed host entry: {text:?}"));

    let mut lines = text.lines();
    let host = lines
        .next()
        .and_then(|line| line.strip_prefix("host: "))
        .ok_or_else(malformed)?;
    let port = lines
        .next()
        .and_then(|line| line.strip_prefix("port: "))
        .and_then(|port| port.parse().ok())
        .ok_or_else(malformed)?;
    if lines.next().is_some() {
        return Err(malformed());
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_framing_round_trip() {
        let message = Message::PartData {
            part_name: "20230101_1_1_0".into(),
            rows: 3,
            payload: b"abc".to_vec(),
            checksums: "checksums format version: 1\n".into(),
        };

        let mut buffer = Vec::new();
        write_message(&mut buffer, &message).await.unwrap();
        let mut cursor = std::io::Cursor::new(buffer);
        let read = read_message(&mut cursor).await.unwrap();
        match read {
            Message::PartData { part_name, rows, payload, .. } => {
                assert_eq!(part_name, "20230101_1_1_0");
                assert_eq!(rows, 3);
                assert_eq!(payload, b"abc");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_corrupted_frame_is_rejected() {
        let message = Message::GetPart {
            endpoint: "e".into(),
            part_name: "p".into(),
        };
        let mut buffer = Vec::new();
        write_message(&mut buffer, &message).await.unwrap();
        let last = buffer.len() - 1;
        buffer[last] ^= 0xff;

        let mut cursor = std::io::Cursor::new(buffer);
        assert!(read_message(&mut cursor).await.is_err());
    }

    #[test]
    fn test_host_entry_round_trip() {
        let text = format_host_entry("10.0.0.7", 9412);
        assert_eq!(text, "host: 10.0.0.7\nport: 9412\n");
        assert_eq!(parse_host_entry(&text).unwrap(), ("10.0.0.7".into(), 9412));
        assert!(parse_host_entry("host only\n").is_err());
    }
}
