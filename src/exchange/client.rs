//! Part Fetch Client
//!
//! Downloads one part from a peer replica's exchange endpoint and
//! verifies its checksums before handing it to the store.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};
use crate::exchange::{read_message, write_message, Message};
use crate::part::Checksums;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A downloaded part, verified against the sender's checksums.
pub struct FetchedPart {
    pub part_name: String,
    pub rows: u64,
    pub payload: Vec<u8>,
    pub checksums: Checksums,
}

/// Fetch `part_name` from the exchange endpoint `endpoint` at
/// `host:port`.
pub async fn fetch_part(
    host: &str,
    port: u16,
    endpoint: &str,
    part_name: &str,
) -> Result<FetchedPart> {
    let address = format!("{host}:{port}");
    debug!(%address, part = part_name, "fetching part");

    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
        .await
        .map_err(|_| Error::ConnectionTimeout(address.clone()))?
        .map_err(|err| Error::ConnectionFailed {
            address: address.clone(),
            reason: err.to_string(),
        })?;

    let request = Message::GetPart {
        endpoint: endpoint.to_string(),
        part_name: part_name.to_string(),
    };
    let response = timeout(REQUEST_TIMEOUT, async {
        write_message(&mut stream, &request).await?;
        read_message(&mut stream).await
    })
    .await
    .map_err(|_| Error::ConnectionTimeout(address.clone()))??;

    match response {
        Message::PartData {
            part_name,
            rows,
            payload,
            checksums,
        } => {
            let checksums = Checksums::parse(&checksums)?;
            let mut computed = Checksums::default();
            computed.add("data.bin", &payload);
            computed.add("count.txt", rows.to_string().as_bytes());
            checksums.check_equal(&computed, &part_name, true)?;

            Ok(FetchedPart {
                part_name,
                rows,
                payload,
                checksums,
            })
        }
        Message::Error { message } => Err(Error::Network(message)),
        other => Err(Error::Network(format!("unexpected response: {other:?}"))),
    }
}
