//! Cell sessions.
//!
//! A [`Cell`] owns one leash (the control connection a backend dialled in
//! on), a pool of bands for request traffic, at most one mount in the
//! multiplexer, and the signal queue that serialises leash writes.

pub mod band;
mod http;
mod signals;

use std::collections::VecDeque;
use std::sync::Arc;

use hlhv_protocol::codec::{self, FrameReader, FrameWriter};
use hlhv_protocol::{FrameError, FrameKind};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub use band::{Band, BandGuard};
pub use signals::Sig;

use crate::conf::Conf;
use crate::error::{LogonError, MountError, ProvideError};
use crate::srvhttps::{HostMux, MountHandler};

/// Any bidirectional stream a session can live on. TLS in production,
/// in-memory pipes in tests.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A boxed session stream.
pub type BoxedIo = Box<dyn Io>;

/// Split a stream into framed halves.
pub(crate) fn split_io(
    io: BoxedIo,
) -> (
    FrameReader<ReadHalf<BoxedIo>>,
    FrameWriter<WriteHalf<BoxedIo>>,
) {
    let (reader, writer) = tokio::io::split(io);
    (FrameReader::new(reader), FrameWriter::new(writer))
}

/// Called exactly once when a cell's leash closes, before anything else is
/// torn down. The wrangler uses it to drop the cell from the store.
pub type CleanupHook = Box<dyn Fn(&Cell) + Send + Sync>;

/// How many requests may queue for a free band before new ones are turned
/// away with a 503.
const WAIT_LIST_CAP: usize = 64;

struct WaitList {
    closed: bool,
    senders: VecDeque<oneshot::Sender<Arc<Band>>>,
}

/// A connected backend.
pub struct Cell {
    uuid: String,
    key: String,
    mux: Arc<HostMux>,
    conf: Arc<Conf>,

    mount: Mutex<Option<String>>,
    bands: Mutex<Vec<Arc<Band>>>,
    waiters: Mutex<WaitList>,

    sig_tx: mpsc::Sender<Sig>,
    sig_rx: Mutex<Option<mpsc::Receiver<Sig>>>,
    shutdown: CancellationToken,
    on_clean: CleanupHook,
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("uuid", &self.uuid)
            .field("mount", &*self.mount.lock())
            .field("bands", &self.bands.lock().len())
            .finish_non_exhaustive()
    }
}

/// Faults on the leash. All of them kick the cell.
#[derive(Debug, thiserror::Error)]
enum LeashFault {
    #[error(transparent)]
    Framing(#[from] FrameError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error("cell sent strange kind code on leash: {0:?}")]
    UnexpectedKind(FrameKind),
}

impl Cell {
    /// A new cell with a freshly minted session key. Call
    /// [`Cell::fire`] with the leash halves to start its loops.
    #[must_use]
    pub fn new(uuid: String, mux: Arc<HostMux>, conf: Arc<Conf>, on_clean: CleanupHook) -> Arc<Self> {
        let (sig_tx, sig_rx) = mpsc::channel(1);
        Arc::new(Self {
            uuid,
            key: uuid::Uuid::new_v4().to_string(),
            mux,
            conf,
            mount: Mutex::new(None),
            bands: Mutex::new(Vec::new()),
            waiters: Mutex::new(WaitList {
                closed: false,
                senders: VecDeque::new(),
            }),
            sig_tx,
            sig_rx: Mutex::new(Some(sig_rx)),
            shutdown: CancellationToken::new(),
            on_clean,
        })
    }

    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The session key bands must present to attach.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Spawn the leash read loop and the signal write loop. No effect if
    /// called twice.
    pub fn fire(
        self: Arc<Self>,
        reader: FrameReader<ReadHalf<BoxedIo>>,
        writer: FrameWriter<WriteHalf<BoxedIo>>,
    ) {
        let Some(sig_rx) = self.sig_rx.lock().take() else {
            return;
        };
        tokio::spawn(self.clone().listen_sig(writer, sig_rx));
        tokio::spawn(self.listen(reader));
    }

    /// Leash read loop: mount and unmount requests until end-of-stream or
    /// a fault, then teardown.
    async fn listen(self: Arc<Self>, mut reader: FrameReader<ReadHalf<BoxedIo>>) {
        loop {
            match reader.read_frame().await {
                Err(e) if e.is_closed() => break,
                Err(e) => {
                    tracing::error!(uuid = %self.uuid, error = %e, "error parsing frame, kicking cell");
                    break;
                }
                Ok((kind, data)) => {
                    if let Err(e) = self.clone().handle_frame(kind, &data) {
                        tracing::error!(uuid = %self.uuid, error = %e, "error handling frame, kicking cell");
                        break;
                    }
                }
            }
        }
        tracing::info!(uuid = %self.uuid, "cell disconnected");
        self.clean_up().await;
    }

    fn handle_frame(self: Arc<Self>, kind: FrameKind, data: &[u8]) -> Result<(), LeashFault> {
        match kind {
            FrameKind::Mount => {
                let frame: hlhv_protocol::Mount = codec::parse_payload(data)?;
                let pattern = format!("{}{}", frame.host, frame.path);
                let mut mount = self.mount.lock();
                if let Some(existing) = mount.as_ref() {
                    return Err(MountError::CellAlreadyMounted(existing.clone()).into());
                }
                let handler: Arc<dyn MountHandler> = self.clone();
                self.mux.mount(&pattern, handler)?;
                *mount = Some(pattern);
                Ok(())
            }
            FrameKind::Unmount => {
                let taken = self.mount.lock().take();
                if let Some(pattern) = taken {
                    let _ = self.mux.unmount(&pattern);
                }
                Ok(())
            }
            other => Err(LeashFault::UnexpectedKind(other)),
        }
    }

    /// Verify a band's presented session key.
    pub fn check_key(&self, presented: &str) -> Result<(), LogonError> {
        if presented != self.key {
            return Err(LogonError::AuthMismatch);
        }
        Ok(())
    }

    /// Attach a band to the pool and, if a requester is waiting, hand it
    /// straight over (already locked on the waiter's behalf).
    pub fn bind(&self, band: Arc<Band>) {
        self.bands.lock().push(band.clone());

        loop {
            let waiter = { self.waiters.lock().senders.pop_front() };
            let Some(waiter) = waiter else { break };
            if !band.try_lock() {
                // someone grabbed it from the pool scan already; keep the
                // waiter queued for the next band
                self.waiters.lock().senders.push_front(waiter);
                break;
            }
            match waiter.send(band.clone()) {
                Ok(()) => break,
                Err(_) => {
                    // that requester gave up; try the next one
                    band.unlock();
                }
            }
        }
    }

    /// Acquire a free band, locked for the caller. When none is free, a
    /// waiter is enqueued and a [`Sig::NeedBand`] asks the cell to dial
    /// another.
    pub async fn provide(&self) -> Result<BandGuard, ProvideError> {
        {
            let bands = self.bands.lock();
            for band in bands.iter() {
                if band.is_open() && band.try_lock() {
                    return Ok(BandGuard::new(band.clone(), self.shutdown.clone()));
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock();
            if waiters.closed {
                return Err(ProvideError::BandwidthExceeded);
            }
            if waiters.senders.len() >= WAIT_LIST_CAP {
                return Err(ProvideError::ServerOverload);
            }
            waiters.senders.push_back(tx);
        }
        tracing::debug!(uuid = %self.uuid, "new band needed");
        self.send_sig(Sig::NeedBand).await;

        match rx.await {
            Ok(band) => Ok(BandGuard::new(band, self.shutdown.clone())),
            Err(_) => Err(ProvideError::BandwidthExceeded),
        }
    }

    /// Close bands idle beyond `maxBandAge` and drop every closed band
    /// from the pool. Bands currently serving a request are exempt.
    /// Returns the number removed.
    pub fn prune(&self) -> usize {
        let max_age = self.conf.max_band_age();
        let mut bands = self.bands.lock();
        for band in bands.iter() {
            if !band.is_locked() && band.idle_for() > max_age {
                band.close();
            }
        }
        let before = bands.len();
        bands.retain(|band| band.is_open());
        before - bands.len()
    }

    /// Teardown. Runs exactly once, when the leash read loop exits.
    async fn clean_up(&self) {
        tracing::debug!(uuid = %self.uuid, "cleaning up cell");
        (self.on_clean)(self);
        self.send_sig(Sig::Cleaning).await;

        let taken = self.mount.lock().take();
        if let Some(pattern) = taken {
            let _ = self.mux.unmount(&pattern);
        }

        self.shutdown.cancel();
        let bands = std::mem::take(&mut *self.bands.lock());
        for band in &bands {
            band.close();
        }

        let mut waiters = self.waiters.lock();
        waiters.closed = true;
        // dropping the senders unblocks everyone in provide()
        waiters.senders.clear();
        tracing::debug!(uuid = %self.uuid, "cleaned up cell");
    }

    #[cfg(test)]
    pub(crate) fn band_count(&self) -> usize {
        self.bands.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn nth_band(&self, index: usize) -> Arc<Band> {
        self.bands.lock()[index].clone()
    }
}
