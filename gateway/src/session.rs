use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, error, info, info_span, warn, Instrument};

use pq_proto::{decode_startup, StartupDescriptor, StartupKind};

use crate::backend::{BackendSupervisor, Provisioner};
use crate::error::SessionError;

const READ_CHUNK: usize = 8192;

/// One client session: decodes the opening handshake, provisions its
/// database, dials the backend, replays the handshake, and splices bytes
/// until either side closes. Owns both sockets for its entire lifetime;
/// never reused across connections.
pub struct ProxySession {
    peer_addr: SocketAddr,
    provisioner: Arc<Provisioner>,
    supervisor: Arc<BackendSupervisor>,
}

impl ProxySession {
    pub fn new(peer_addr: SocketAddr, provisioner: Arc<Provisioner>, supervisor: Arc<BackendSupervisor>) -> Self {
        Self {
            peer_addr,
            provisioner,
            supervisor,
        }
    }

    pub async fn run(self, mut client: TcpStream) -> Result<(), SessionError> {
        let span = info_span!("session", peer = %self.peer_addr);
        async move {
            let mut buf = BytesMut::new();
            let descriptor = loop {
                match decode_startup(&mut buf)? {
                    Some(descriptor) => match descriptor.kind {
                        StartupKind::SslRequest | StartupKind::GssEncRequest => {
                            client.write_all(b"N").await.map_err(|source| SessionError::Peer {
                                addr: self.peer_addr,
                                database: String::new(),
                                source,
                            })?;
                            continue;
                        }
                        StartupKind::CancelRequest { .. } => {
                            debug!("closing CancelRequest connection without forwarding it");
                            return Ok(());
                        }
                        StartupKind::Unsupported { requested_code } => {
                            warn!(requested_code, "unsupported protocol request, closing");
                            return Ok(());
                        }
                        StartupKind::Standard { .. } => break descriptor,
                    },
                    None => {
                        let mut chunk = [0u8; READ_CHUNK];
                        let n = client.read(&mut chunk).await.map_err(|source| SessionError::Peer {
                            addr: self.peer_addr,
                            database: String::new(),
                            source,
                        })?;
                        if n == 0 {
                            return Ok(());
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            };

            self.serve_standard_startup(client, descriptor).await
        }
        .instrument(span)
        .await
    }

    async fn serve_standard_startup(
        &self,
        client: TcpStream,
        descriptor: StartupDescriptor,
    ) -> Result<(), SessionError> {
        let database = descriptor.database().expect("Standard startup always has a database").to_string();
        let span = info_span!("provision", database = %database);
        self.provisioner
            .ensure(&database)
            .instrument(span)
            .await
            .map_err(|source| SessionError::Provision {
                database: database.clone(),
                source,
            })?;

        info!(database = %database, "dialing backend");
        let socket_dial = UnixStream::connect(self.supervisor.socket_file_path()).await.ok();

        match socket_dial {
            Some(backend) => self.splice(client, backend, descriptor, &database).await,
            None => {
                let backend = TcpStream::connect(("127.0.0.1", self.supervisor.tcp_port()))
                    .await
                    .map_err(|source| SessionError::BackendDial {
                        database: database.clone(),
                        source,
                    })?;
                self.splice(client, backend, descriptor, &database).await
            }
        }
    }

    async fn splice<B>(
        &self,
        client: TcpStream,
        mut backend: B,
        descriptor: StartupDescriptor,
        database: &str,
    ) -> Result<(), SessionError>
    where
        B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        backend
            .write_all(&descriptor.raw)
            .await
            .map_err(|source| SessionError::BackendDial {
                database: database.to_string(),
                source,
            })?;

        let (client_read, client_write) = tokio::io::split(client);
        let (backend_read, backend_write) = tokio::io::split(backend);

        // One task per direction, each owning its half of both sockets;
        // the pending-buffer/backpressure state lives in that task's
        // local frame rather than behind a shared lock.
        let c2b = tokio::spawn(pump(client_read, backend_write));
        let b2c = tokio::spawn(pump(backend_read, client_write));
        let c2b_abort = c2b.abort_handle();
        let b2c_abort = b2c.abort_handle();

        // Once one direction finishes (EOF or error), force-close the
        // other: a pathological peer that never closes its own half
        // would otherwise leak the session forever.
        let joined = tokio::select! {
            res = c2b => { b2c_abort.abort(); res }
            res = b2c => { c2b_abort.abort(); res }
        };
        let result = match joined {
            Ok(io_result) => io_result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        };

        if let Err(source) = result {
            if !is_benign_close(&source) {
                error!(database, addr = %self.peer_addr, error = %source, "peer error during splice");
                return Err(SessionError::Peer {
                    addr: self.peer_addr,
                    database: database.to_string(),
                    source,
                });
            }
        }
        Ok(())
    }
}

/// Reads from `reader` and writes to `writer` until EOF or error. A short
/// write stashes the remainder in `pending` and keeps writing it before
/// any further reads, so bytes are never dropped or reordered; this is
/// the backpressure contract for one direction of the splice.
async fn pump<R, W>(mut reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut chunk = [0u8; READ_CHUNK];
    let mut pending = BytesMut::new();

    loop {
        if pending.is_empty() {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                let _ = writer.shutdown().await;
                return Ok(());
            }
            pending.extend_from_slice(&chunk[..n]);
        }

        while !pending.is_empty() {
            let written = writer.write(&pending).await?;
            if written == 0 {
                return Ok(());
            }
            pending.advance(written);
        }
    }
}

fn is_benign_close(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof
    )
}
