//! The signal queue: the one path by which frames are written to a leash.
//!
//! Request-forwarding code never touches the leash. Anything that needs a
//! leash write enqueues a signal; the signal loop owns the write half
//! exclusively and serialises everything through it.

use hlhv_protocol::codec::FrameWriter;
use hlhv_protocol::{FrameKind, NeedBand};
use tokio::io::WriteHalf;
use tokio::sync::mpsc;

use super::{BoxedIo, Cell};

/// Signals understood by the leash write loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig {
    /// Terminate the signal loop; sent during teardown.
    Cleaning,
    /// Ask the cell to dial one more band.
    NeedBand,
}

impl Cell {
    /// Leash write loop. Runs until a [`Sig::Cleaning`] arrives or the
    /// queue closes.
    pub(super) async fn listen_sig(
        self: std::sync::Arc<Self>,
        mut writer: FrameWriter<WriteHalf<BoxedIo>>,
        mut sig_queue: mpsc::Receiver<Sig>,
    ) {
        while let Some(sig) = sig_queue.recv().await {
            match sig {
                Sig::Cleaning => break,
                Sig::NeedBand => {
                    tracing::debug!(uuid = %self.uuid(), "requesting new band");
                    if let Err(e) = writer
                        .write_marshal(FrameKind::NeedBand, &NeedBand { count: 1 })
                        .await
                    {
                        tracing::debug!(uuid = %self.uuid(), error = %e, "leash write failed");
                    }
                }
            }
        }
    }

    /// Enqueue a signal. A [`Sig::NeedBand`] that finds the queue full is
    /// dropped, since the queued one already covers it.
    pub(crate) async fn send_sig(&self, sig: Sig) {
        match sig {
            Sig::NeedBand => {
                let _ = self.sig_tx.try_send(sig);
            }
            Sig::Cleaning => {
                let _ = self.sig_tx.send(sig).await;
            }
        }
    }
}
