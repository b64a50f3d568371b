//! Part Exchange Server
//!
//! Serves part payloads to peer replicas. Suppliers are registered by
//! endpoint name (the replica's coordinator path); the registration is
//! scoped to an [`EndpointHolder`] and held weakly so that dropping the
//! holder during shutdown detaches the table from the listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::exchange::{read_message, write_message, Message};
use crate::part::{Checksums, PartStore};

/// A part as served to a peer.
pub struct SuppliedPart {
    pub rows: u64,
    pub payload: Vec<u8>,
    pub checksums: Checksums,
}

/// Source of parts for the exchange server.
pub trait PartSupplier: Send + Sync {
    fn supply(&self, part_name: &str) -> Result<SuppliedPart>;
}

impl PartSupplier for PartStore {
    fn supply(&self, part_name: &str) -> Result<SuppliedPart> {
        let meta = self
            .get_part(part_name)
            .ok_or_else(|| Error::PartNotFound(part_name.to_string()))?;
        Ok(SuppliedPart {
            rows: meta.rows,
            payload: self.read_payload(part_name)?,
            checksums: meta.checksums.clone(),
        })
    }
}

/// Registry of exchange endpoints served by this process.
#[derive(Default)]
pub struct ExchangeHandler {
    endpoints: Mutex<HashMap<String, Weak<dyn PartSupplier>>>,
}

impl ExchangeHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a supplier under an endpoint name. The registration lives
    /// as long as the returned holder.
    pub fn register(
        self: &Arc<Self>,
        endpoint: impl Into<String>,
        supplier: &Arc<dyn PartSupplier>,
    ) -> EndpointHolder {
        let endpoint = endpoint.into();
        self.endpoints
            .lock()
            .unwrap()
            .insert(endpoint.clone(), Arc::downgrade(supplier));
        EndpointHolder {
            handler: Arc::clone(self),
            endpoint,
        }
    }

    fn resolve(&self, endpoint: &str) -> Option<Arc<dyn PartSupplier>> {
        self.endpoints.lock().unwrap().get(endpoint)?.upgrade()
    }

    fn deregister(&self, endpoint: &str) {
        self.endpoints.lock().unwrap().remove(endpoint);
    }
}

/// Scoped endpoint registration.
pub struct EndpointHolder {
    handler: Arc<ExchangeHandler>,
    endpoint: String,
}

impl Drop for EndpointHolder {
    fn drop(&mut self) {
        self.handler.deregister(&self.endpoint);
    }
}

/// TCP listener serving part requests for every endpoint of its handler.
pub struct ExchangeServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl ExchangeServer {
    pub async fn bind(addr: &str, handler: Arc<ExchangeHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "part exchange listening");

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(stream, handler).await {
                                debug!(%peer, error = %err, "part exchange connection failed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "part exchange accept failed");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for ExchangeServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve_connection(mut stream: TcpStream, handler: Arc<ExchangeHandler>) -> Result<()> {
    let request = read_message(&mut stream).await?;
    let response = match request {
        Message::GetPart {
            endpoint,
            part_name,
        } => match handler.resolve(&endpoint) {
            Some(supplier) => match supplier.supply(&part_name) {
                Ok(part) => Message::PartData {
                    part_name,
                    rows: part.rows,
                    payload: part.payload,
                    checksums: part.checksums.to_text(),
                },
                Err(err) => Message::Error {
                    message: err.to_string(),
                },
            },
            None => Message::Error {
                message: format!("no endpoint {endpoint}"),
            },
        },
        other => Message::Error {
            message: format!("unexpected request: {other:?}"),
        },
    };
    write_message(&mut stream, &response).await
}
