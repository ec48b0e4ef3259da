//! Duplex byte relay between a local pipe pair and a reconnecting TCP peer.
//!
//! ## Architecture
//!
//! ```text
//!  guest_in ──► guest_to_remote ──┐                 ┌──► remote socket
//!                                 ├─► RemoteLink ───┤      (lease N)
//! guest_out ◄── remote_to_guest ◄─┘   Mutex<Slot>   └─── watch<generation>
//! ```
//!
//! Both directions share one [`RemoteLink`]. Each connection is handed out as
//! a [`Lease`] stamped with a generation number. When I/O on a lease fails,
//! the direction that noticed calls [`RemoteLink::reconnect`] with that
//! generation; the first caller replaces the connection, later callers with
//! the same stale generation get the new lease back without dialing.
//!
//! Delivery is at-most-once across a reconnect: a chunk whose write failed is
//! dropped, not retried.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::state_machine::link_sm::{LinkEvent, LinkStateMachine, LinkStatus};

/// Largest chunk moved in one read.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
/// Pause between connect attempts while the remote is unreachable.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub remote: SocketAddr,
    pub chunk_size: usize,
    pub retry_interval: Duration,
}

impl BridgeConfig {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// A generation-stamped handle to the connection that was current when it
/// was taken.
#[derive(Debug, Clone)]
pub struct Lease {
    generation: u64,
    stream: Arc<TcpStream>,
}

impl Lease {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Read whatever is available. Cancel-safe: no bytes are lost if the
    /// future is dropped before it completes.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RemoteLink
// ---------------------------------------------------------------------------

struct Slot {
    machine: LinkStateMachine,
    lease: Lease,
}

/// The single shared connection to the remote endpoint.
pub struct RemoteLink {
    remote: SocketAddr,
    retry_interval: Duration,
    slot: Mutex<Slot>,
    generation: watch::Sender<u64>,
}

impl RemoteLink {
    /// Dial `remote` until it answers. Never gives up.
    pub async fn connect(remote: SocketAddr, retry_interval: Duration) -> Self {
        let mut machine = LinkStateMachine::default();
        let stream = dial(remote, retry_interval, &mut machine, 1).await;
        let (generation, _) = watch::channel(1);
        Self {
            remote,
            retry_interval,
            slot: Mutex::new(Slot {
                machine,
                lease: Lease {
                    generation: 1,
                    stream: Arc::new(stream),
                },
            }),
            generation,
        }
    }

    /// The current lease. Waits while a reconnect is in progress.
    pub async fn current(&self) -> Lease {
        self.slot.lock().await.lease.clone()
    }

    pub async fn status(&self) -> LinkStatus {
        self.slot.lock().await.machine.status()
    }

    /// Times an established connection has been replaced.
    pub async fn losses(&self) -> u64 {
        self.slot.lock().await.machine.losses()
    }

    /// Generation of the current lease, without waiting for the slot.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Notified each time the lease is replaced.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Replace the connection behind lease `stale`.
    ///
    /// A no-op returning the current lease if `stale` was already replaced.
    pub async fn reconnect(&self, stale: u64) -> Lease {
        let mut slot = self.slot.lock().await;
        if slot.lease.generation != stale {
            debug!(
                target: "bridge",
                stale,
                current = slot.lease.generation,
                "connection already replaced"
            );
            return slot.lease.clone();
        }

        slot.machine.handle(LinkEvent::Lost);
        let next = stale + 1;
        let stream = dial(self.remote, self.retry_interval, &mut slot.machine, next).await;
        slot.lease = Lease {
            generation: next,
            stream: Arc::new(stream),
        };
        self.generation.send_replace(next);
        slot.lease.clone()
    }
}

async fn dial(
    remote: SocketAddr,
    retry_interval: Duration,
    machine: &mut LinkStateMachine,
    generation: u64,
) -> TcpStream {
    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        machine.handle(LinkEvent::Dial);
        match TcpStream::connect(remote).await {
            Ok(stream) => {
                machine.handle(LinkEvent::Established { generation });
                return stream;
            }
            Err(e) => {
                machine.handle(LinkEvent::Failed);
                if attempt == 1 {
                    warn!(target: "bridge", %remote, error = %e, "remote unreachable, retrying");
                } else {
                    debug!(target: "bridge", %remote, attempt, error = %e, "connect retry failed");
                }
                tokio::time::sleep(retry_interval).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Relay directions
// ---------------------------------------------------------------------------

/// Copy local input to the remote. Returns on local EOF or read error.
pub async fn guest_to_remote<R>(link: &RemoteLink, mut guest_in: R, chunk_size: usize) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = guest_in.read(&mut buf).await?;
        if n == 0 {
            info!(target: "bridge", "guest input closed");
            return Ok(());
        }

        let lease = link.current().await;
        if let Err(e) = lease.write_all(&buf[..n]).await {
            warn!(
                target: "bridge",
                generation = lease.generation(),
                dropped = n,
                error = %e,
                "remote write failed, dropping chunk"
            );
            link.reconnect(lease.generation()).await;
        }
    }
}

enum Step {
    Read(io::Result<usize>),
    Replaced,
}

/// Copy remote data to the local output. Returns only on a local write error.
pub async fn remote_to_guest<W>(link: &RemoteLink, mut guest_out: W, chunk_size: usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut generations = link.subscribe();
    let mut buf = vec![0u8; chunk_size];
    loop {
        let _seen = *generations.borrow_and_update();
        let lease = link.current().await;

        // Drop the read as soon as the other direction swaps the connection.
        let step = tokio::select! {
            read = lease.read(&mut buf) => Step::Read(read),
            _ = generations.changed() => Step::Replaced,
        };

        match step {
            Step::Replaced => {
                debug!(target: "bridge", stale = lease.generation(), "switching to new connection");
            }
            Step::Read(Ok(0)) => {
                warn!(target: "bridge", generation = lease.generation(), "remote closed connection");
                link.reconnect(lease.generation()).await;
            }
            Step::Read(Err(e)) => {
                warn!(target: "bridge", generation = lease.generation(), error = %e, "remote read failed");
                link.reconnect(lease.generation()).await;
            }
            Step::Read(Ok(n)) => {
                guest_out.write_all(&buf[..n]).await?;
                guest_out.flush().await?;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// A connected relay, ready to [`run`](Bridge::run).
pub struct Bridge<R, W> {
    link: RemoteLink,
    guest_in: R,
    guest_out: W,
    chunk_size: usize,
}

impl<R, W> Bridge<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Connect to the remote, retrying until it accepts.
    pub async fn connect(config: BridgeConfig, guest_in: R, guest_out: W) -> Self {
        info!(target: "bridge", remote = %config.remote, chunk_size = config.chunk_size, "connecting");
        let link = RemoteLink::connect(config.remote, config.retry_interval).await;
        Self {
            link,
            guest_in,
            guest_out,
            chunk_size: config.chunk_size.max(1),
        }
    }

    pub fn link(&self) -> &RemoteLink {
        &self.link
    }

    /// Relay in both directions until a local pipe fails.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            link,
            guest_in,
            guest_out,
            chunk_size,
        } = self;

        let up = async {
            guest_to_remote(&link, guest_in, chunk_size)
                .await
                .context("guest to remote relay")
        };
        let down = async {
            remote_to_guest(&link, guest_out, chunk_size)
                .await
                .context("remote to guest relay")
        };
        tokio::try_join!(up, down)?;
        Ok(())
    }
}
