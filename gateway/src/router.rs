use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::backend::{BackendSupervisor, Provisioner};
use crate::session::ProxySession;

/// Accept loop binding the Wire Decoder / Provisioner / Proxy Session
/// components together per connection, and enforcing the configured
/// connection ceiling.
pub struct Router {
    listener: TcpListener,
    provisioner: Arc<Provisioner>,
    supervisor: Arc<BackendSupervisor>,
    max_connections: usize,
    active: Arc<AtomicUsize>,
}

impl Router {
    pub async fn bind(
        listen_addr: std::net::SocketAddr,
        max_connections: usize,
        provisioner: Arc<Provisioner>,
        supervisor: Arc<BackendSupervisor>,
    ) -> std::io::Result<Self> {
        let listener = bind_with_reuseaddr(listen_addr)?;
        info!(%listen_addr, "router listening");
        Ok(Self {
            listener,
            provisioner,
            supervisor,
            max_connections,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Runs until `shutdown` resolves, then stops accepting. In-flight
    /// sessions are not forcibly aborted; they close naturally when their
    /// sockets are dropped by the caller's own cleanup.
    pub async fn serve(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("router stopping accept loop");
                        return;
                    }
                }
                accepted = self.listener.accept() => {
                    let (socket, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept() failed");
                            continue;
                        }
                    };

                    if self.active.load(Ordering::Relaxed) >= self.max_connections {
                        warn!(%peer_addr, ceiling = self.max_connections, "connection ceiling reached, rejecting");
                        drop(socket);
                        continue;
                    }

                    let _ = socket.set_nodelay(true);
                    self.active.fetch_add(1, Ordering::Relaxed);

                    let provisioner = self.provisioner.clone();
                    let supervisor = self.supervisor.clone();
                    let active = self.active.clone();

                    tokio::spawn(async move {
                        let session = ProxySession::new(peer_addr, provisioner, supervisor);
                        if let Err(e) = session.run(socket).await {
                            warn!(%peer_addr, error = %e, "session ended with error");
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
            }
        }
    }
}

/// Binds with `SO_REUSEADDR` so a restarted gateway doesn't fail to bind
/// while the previous listener's socket is still draining TIME_WAIT.
fn bind_with_reuseaddr(addr: std::net::SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}
