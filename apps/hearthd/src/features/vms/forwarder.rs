use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One TCP listener per VM, relaying external connections to the guest.
///
/// Each listener task owns the JoinSet of its relay tasks, so aborting the
/// listener tears down every live connection with it.
pub struct ForwarderMap {
    inner: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ForwarderMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `0.0.0.0:host_port` and relay to `guest_ip:guest_port`.
    /// Returns the bound port (useful when callers pass 0 in tests).
    pub async fn start(
        &self,
        vm_id: &str,
        host_port: u16,
        guest_ip: Ipv4Addr,
        guest_port: u16,
    ) -> Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", host_port))
            .await
            .map_err(|err| {
                Error::Backend(format!("cannot bind forwarder port {host_port}: {err}"))
            })?;
        let bound = listener
            .local_addr()
            .map_err(|err| Error::Backend(format!("forwarder local_addr failed: {err}")))?
            .port();

        let target = SocketAddr::from((guest_ip, guest_port));
        let vm = vm_id.to_string();
        let task = tokio::spawn(async move {
            let mut relays = JoinSet::new();
            loop {
                match listener.accept().await {
                    Ok((client, peer)) => {
                        debug!(vm_id = %vm, %peer, "forwarder accepted connection");
                        relays.spawn(async move {
                            if let Err(err) = relay(client, target).await {
                                debug!(%peer, "relay ended with error: {err}");
                            }
                        });
                        while relays.try_join_next().is_some() {}
                    }
                    Err(err) => {
                        // Transient accept failures (EMFILE etc); keep serving.
                        warn!(vm_id = %vm, "forwarder accept failed: {err}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        if let Some(old) = self.inner.lock().unwrap().insert(vm_id.to_string(), task) {
            old.abort();
        }
        Ok(bound)
    }

    /// Close the listener and every live relay for this VM. Idempotent.
    pub fn stop(&self, vm_id: &str) {
        if let Some(task) = self.inner.lock().unwrap().remove(vm_id) {
            task.abort();
        }
    }
}

/// Relay one client connection to the guest.
///
/// The guest dial runs concurrently with reads from the client: anything
/// the client sends before the dial completes is queued and delivered
/// first, so no early bytes are lost while the SSH banner exchange races
/// the connect.
async fn relay(mut client: TcpStream, target: SocketAddr) -> std::io::Result<()> {
    let connect = TcpStream::connect(target);
    tokio::pin!(connect);

    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    let mut client_eof = false;

    let mut guest = loop {
        tokio::select! {
            res = &mut connect => break res?,
            res = client.read(&mut buf), if !client_eof => {
                let n = res?;
                if n == 0 {
                    client_eof = true;
                } else {
                    pending.extend_from_slice(&buf[..n]);
                }
            }
        }
    };

    if !pending.is_empty() {
        guest.write_all(&pending).await?;
    }

    if client_eof {
        // Client already half-closed; propagate it, then drain the guest.
        guest.shutdown().await?;
        let (mut guest_rx, _) = guest.split();
        let (_, mut client_tx) = client.split();
        tokio::io::copy(&mut guest_rx, &mut client_tx).await?;
        client_tx.shutdown().await?;
        return Ok(());
    }

    tokio::io::copy_bidirectional(&mut client, &mut guest).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_echo_guest() -> SocketAddr {
        let guest = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = guest.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match guest.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if sock.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn early_client_bytes_arrive_in_order() {
        let guest_addr = spawn_echo_guest().await;

        let entry = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let entry_addr = entry.local_addr().unwrap();
        let mut client = TcpStream::connect(entry_addr).await.unwrap();
        let (server_side, _) = entry.accept().await.unwrap();
        tokio::spawn(relay(server_side, guest_addr));

        // Write immediately, before the relay's guest dial can have settled.
        client.write_all(b"first").await.unwrap();
        client.write_all(b" second").await.unwrap();

        let mut received = Vec::new();
        while received.len() < b"first second".len() {
            let mut buf = [0u8; 64];
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "guest closed early");
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"first second");
    }

    #[tokio::test]
    async fn registry_round_trip_and_stop() {
        let guest_addr = spawn_echo_guest().await;
        let forwarders = ForwarderMap::new();

        let ip = match guest_addr {
            SocketAddr::V4(v4) => *v4.ip(),
            _ => unreachable!(),
        };
        let port = forwarders
            .start("vm-0011aabbccdd", 0, ip, guest_addr.port())
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        forwarders.stop("vm-0011aabbccdd");
        // Give the abort a moment to release the listener socket.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        // Stopping again is a no-op.
        forwarders.stop("vm-0011aabbccdd");
    }
}
