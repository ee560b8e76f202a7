use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::{Packet, Transport};

/// Default transport: one UDP socket for gossip packets and one TCP listener
/// for streams, bound to the same port.
pub struct NetTransport {
    udp: Arc<UdpSocket>,
    local_addr: SocketAddr,
    packet_rx: Mutex<mpsc::Receiver<Packet>>,
    stream_rx: Mutex<mpsc::Receiver<TcpStream>>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: AtomicBool,
    max_packet_len: usize,
}

impl NetTransport {
    /// Binds UDP and TCP on `bind_addr`. Port 0 picks a free port; the TCP
    /// listener reuses whatever port UDP got.
    pub async fn bind(
        bind_addr: SocketAddr,
        handoff_queue_depth: usize,
        max_packet_len: usize,
    ) -> Result<Self> {
        let udp = Arc::new(
            UdpSocket::bind(bind_addr)
                .await
                .with_context(|| format!("failed to bind UDP on {}", bind_addr))?,
        );
        let local_addr = udp.local_addr()?;
        let tcp = TcpListener::bind(local_addr)
            .await
            .with_context(|| format!("failed to bind TCP on {}", local_addr))?;

        let (packet_tx, packet_rx) = mpsc::channel(handoff_queue_depth);
        let (stream_tx, stream_rx) = mpsc::channel(32);

        let udp_reader = udp.clone();
        let udp_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match udp_reader.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let packet = Packet {
                            buf: buf[..len].to_vec(),
                            from,
                            timestamp: Instant::now(),
                        };
                        // A full handoff queue sheds load the same way the
                        // network would: the packet is simply lost.
                        if packet_tx.try_send(packet).is_err() {
                            debug!("Inbound packet queue full, dropping packet from {}", from);
                        }
                    }
                    Err(e) => {
                        error!("UDP receive failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        let accept_task = tokio::spawn(async move {
            loop {
                match tcp.accept().await {
                    Ok((stream, _)) => {
                        if stream_tx.send(stream).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        error!("TCP accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self {
            udp,
            local_addr,
            packet_rx: Mutex::new(packet_rx),
            stream_rx: Mutex::new(stream_rx),
            tasks: vec![udp_task, accept_task],
            shutdown: AtomicBool::new(false),
            max_packet_len,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Transport for NetTransport {
    fn final_advertise_addr(&self, configured: Option<SocketAddr>) -> Result<SocketAddr> {
        if let Some(addr) = configured {
            return Ok(addr);
        }
        if self.local_addr.ip().is_unspecified() {
            bail!(
                "bound to {}; an advertise address is required when binding to all interfaces",
                self.local_addr
            );
        }
        Ok(self.local_addr)
    }

    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> Result<Instant> {
        if buf.len() > self.max_packet_len {
            bail!(
                "packet of {} bytes exceeds the {} byte limit",
                buf.len(),
                self.max_packet_len
            );
        }
        self.udp
            .send_to(buf, addr)
            .await
            .with_context(|| format!("failed to send packet to {}", addr))?;
        Ok(Instant::now())
    }

    async fn next_packet(&self) -> Option<Packet> {
        if self.shutdown.load(Ordering::SeqCst) {
            return None;
        }
        self.packet_rx.lock().await.recv().await
    }

    async fn dial_timeout(&self, addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial to {} timed out", addr))?
            .with_context(|| format!("failed to connect to {}", addr))?;
        Ok(stream)
    }

    async fn next_stream(&self) -> Option<TcpStream> {
        if self.shutdown.load(Ordering::SeqCst) {
            return None;
        }
        self.stream_rx.lock().await.recv().await
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for task in &self.tasks {
            task.abort();
        }
        // Wake any pending next_packet/next_stream callers.
        self.packet_rx.lock().await.close();
        self.stream_rx.lock().await.close();
        Ok(())
    }
}
