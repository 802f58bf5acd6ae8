//! The wrangler: accepts cell-facing TLS connections and decides what they
//! are. A connection's first frame must be a logon; cells authenticate
//! with the shared connection password, bands with the owning cell's
//! session key. The wrangler also runs the gardener, which periodically
//! prunes idle bands on every live cell.

use std::collections::HashMap;
use std::io::{Error as IoError, Result as IoResult};
use std::sync::Arc;

use hlhv_protocol::codec::parse_payload;
use hlhv_protocol::{Accept, ConnKind, FrameKind, IAm};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_util::sync::CancellationToken;

use crate::cells::{Band, BoxedIo, Cell, split_io};
use crate::conf::Conf;
use crate::error::LogonError;
use crate::srvhttps::HostMux;
use crate::tls::{self, Keycert};

/// Process-wide mapping from cell uuid to live cell. A cell is present
/// here iff its leash is live.
#[derive(Debug, Default)]
pub struct CellStore {
    lookup: RwLock<HashMap<String, Arc<Cell>>>,
}

impl CellStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uuid: String, cell: Arc<Cell>) {
        self.lookup.write().insert(uuid, cell);
    }

    #[must_use]
    pub fn get(&self, uuid: &str) -> Option<Arc<Cell>> {
        self.lookup.read().get(uuid).cloned()
    }

    pub fn remove(&self, uuid: &str) -> Option<Arc<Cell>> {
        self.lookup.write().remove(uuid)
    }

    /// Snapshot of every live cell, for iteration without holding the
    /// lock.
    #[must_use]
    pub fn cells(&self) -> Vec<Arc<Cell>> {
        self.lookup.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lookup.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lookup.read().is_empty()
    }
}

/// The cell-facing listener.
#[derive(Debug)]
pub struct Wrangler {
    conf: Arc<Conf>,
    mux: Arc<HostMux>,
    store: Arc<CellStore>,
    shutdown: CancellationToken,
    armed: Mutex<Option<Arc<ServerConfig>>>,
}

impl Wrangler {
    #[must_use]
    pub fn new(conf: Arc<Conf>, mux: Arc<HostMux>) -> Self {
        Self {
            conf,
            mux,
            store: Arc::new(CellStore::new()),
            shutdown: CancellationToken::new(),
            armed: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<CellStore> {
        &self.store
    }

    /// Load TLS material and build the listener config.
    pub fn arm(&self) -> IoResult<()> {
        tracing::info!(port = self.conf.port_hlhv(), "arming cell wrangler");
        let keycert = Keycert::load(&self.conf.cert_path(), &self.conf.key_path())?;
        let config = tls::wrangler_config(&keycert)?;
        *self.armed.lock() = Some(Arc::new(config));
        Ok(())
    }

    /// Accept loop plus the gardener. Per-connection errors are logged and
    /// the loop continues; only [`Wrangler::close`] ends it. A bind
    /// failure is fatal and surfaces to the caller.
    pub async fn fire(&self) -> IoResult<()> {
        let config = self
            .armed
            .lock()
            .take()
            .ok_or_else(|| IoError::other("wrangler is not armed"))?;
        let port = self.conf.port_hlhv();
        let listener = TcpListener::bind(format!("[::]:{port}")).await?;
        let acceptor = TlsAcceptor::from(config);
        tracing::info!(port, "cell wrangler listening");

        tokio::spawn(garden(
            self.store.clone(),
            self.conf.clone(),
            self.shutdown.clone(),
        ));

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!(error = %e, "wrangler accept");
                        continue;
                    }
                },
            };
            tracing::info!(%remote_addr, "new connection");

            let acceptor = acceptor.clone();
            let store = self.store.clone();
            let conf = self.conf.clone();
            let mux = self.mux.clone();
            tokio::spawn(async move {
                let deadline = conf.timeout();
                let tls = match tokio::time::timeout(deadline, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => tls,
                    Ok(Err(e)) => {
                        tracing::info!(%remote_addr, error = %e, "kicked");
                        return;
                    }
                    Err(_) => {
                        tracing::info!(%remote_addr, "kicked: logon timed out");
                        return;
                    }
                };
                if let Err(e) = logon(&store, &conf, &mux, Box::new(tls)).await {
                    tracing::info!(%remote_addr, error = %e, "kicked");
                }
            });
        }
        tracing::info!("cell wrangler closed");
        Ok(())
    }

    /// Stop accepting and stop the gardener. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Run the logon protocol on a fresh connection and install the session.
/// Dropping the halves on any error closes the socket.
pub(crate) async fn logon(
    store: &Arc<CellStore>,
    conf: &Arc<Conf>,
    mux: &Arc<HostMux>,
    io: BoxedIo,
) -> Result<(), LogonError> {
    let (mut reader, mut writer) = split_io(io);

    tracing::debug!("waiting for logon");
    let (kind, data) = tokio::time::timeout(conf.timeout(), reader.read_frame())
        .await
        .map_err(|_| LogonError::Timeout)??;
    if kind != FrameKind::IAm {
        return Err(LogonError::NotLogon(kind));
    }
    let frame: IAm = parse_payload(&data)?;

    match frame.conn_kind {
        ConnKind::Cell => {
            if !conf.check_conn_key(&frame.key) {
                return Err(LogonError::AuthMismatch);
            }

            let uuid = uuid::Uuid::new_v4().to_string();
            let hook_store = store.clone();
            let cell = Cell::new(
                uuid.clone(),
                mux.clone(),
                conf.clone(),
                Box::new(move |cell: &Cell| {
                    hook_store.remove(cell.uuid());
                }),
            );
            store.insert(uuid.clone(), cell.clone());

            let accept = Accept {
                uuid: uuid.clone(),
                key: Some(cell.key().to_owned()),
            };
            if let Err(e) = writer.write_marshal(FrameKind::Accept, &accept).await {
                store.remove(&uuid);
                return Err(e.into());
            }

            cell.fire(reader, writer);
            tracing::info!(%uuid, "accepted cell");
            Ok(())
        }
        ConnKind::Band => {
            let uuid = frame.uuid.ok_or(LogonError::MissingUuid)?;
            let cell = store
                .get(&uuid)
                .ok_or_else(|| LogonError::UnknownCell(uuid.clone()))?;
            cell.check_key(&frame.key)?;

            // acknowledge before attaching, so the accept frame can never
            // land behind a forwarded request head
            writer
                .write_marshal(FrameKind::Accept, &Accept { uuid: uuid.clone(), key: None })
                .await?;
            cell.bind(Band::new(reader, writer));
            tracing::info!(%uuid, "accepted band");
            Ok(())
        }
    }
}

/// Every `gardenFreq` seconds, prune idle bands on every live cell.
async fn garden(store: Arc<CellStore>, conf: Arc<Conf>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(conf.garden_freq()) => {}
        }
        for cell in store.cells() {
            let pruned = cell.prune();
            if pruned > 0 {
                tracing::debug!(uuid = %cell.uuid(), pruned, "pruned idle bands");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hlhv_protocol::codec::{FrameReader, FrameWriter};
    use tokio::io::{ReadHalf, WriteHalf};

    use super::*;

    type FarReader = FrameReader<ReadHalf<BoxedIo>>;
    type FarWriter = FrameWriter<WriteHalf<BoxedIo>>;

    struct Rig {
        store: Arc<CellStore>,
        conf: Arc<Conf>,
        mux: Arc<HostMux>,
    }

    fn rig() -> Rig {
        let conf = Arc::new(Conf::new());
        let hash = bcrypt::hash("port manteau", 4).expect("hash");
        conf.load_str(&format!("connKey {hash}\n"));
        let mux = Arc::new(HostMux::new(conf.clone()));
        Rig {
            store: Arc::new(CellStore::new()),
            conf,
            mux,
        }
    }

    /// Run logon on one end of a pipe, drive the other end with `client`.
    async fn logon_with<F, Fut>(rig: &Rig, client: F) -> Result<(), LogonError>
    where
        F: FnOnce(FarReader, FarWriter) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (far_r, far_w) = split_io(Box::new(remote));
        let driver = tokio::spawn(client(far_r, far_w));
        let outcome = logon(&rig.store, &rig.conf, &rig.mux, Box::new(local)).await;
        driver.await.expect("client");
        outcome
    }

    #[tokio::test]
    async fn cell_logon_mints_uuid_and_key() {
        let rig = rig();
        // keep the leash halves alive so the cell stays up
        let (uuid, key, _leash_r, _leash_w) = accepted_cell(&rig).await;
        assert!(!uuid.is_empty());
        assert!(!key.is_empty());
        assert_eq!(rig.store.len(), 1);
        assert!(rig.store.get(&uuid).is_some());
    }

    #[tokio::test]
    async fn cell_logon_with_wrong_password_is_kicked() {
        let rig = rig();
        let outcome = logon_with(&rig, |_far_r, mut far_w| async move {
            far_w
                .write_marshal(
                    FrameKind::IAm,
                    &IAm {
                        conn_kind: ConnKind::Cell,
                        uuid: None,
                        key: "wrong".into(),
                    },
                )
                .await
                .expect("send logon");
        })
        .await;
        assert!(matches!(outcome, Err(LogonError::AuthMismatch)));
        assert!(rig.store.is_empty());
    }

    #[tokio::test]
    async fn first_frame_must_be_a_logon() {
        let rig = rig();
        let outcome = logon_with(&rig, |_far_r, mut far_w| async move {
            far_w
                .write_marshal(FrameKind::Mount, &hlhv_protocol::Unmount {})
                .await
                .expect("send frame");
        })
        .await;
        assert!(matches!(outcome, Err(LogonError::NotLogon(FrameKind::Mount))));
    }

    #[tokio::test]
    async fn malformed_logon_payload_is_kicked() {
        let rig = rig();
        let outcome = logon_with(&rig, |_far_r, mut far_w| async move {
            far_w
                .write_frame(FrameKind::IAm, b"not json")
                .await
                .expect("send frame");
        })
        .await;
        assert!(matches!(outcome, Err(LogonError::Framing(_))));
    }

    #[tokio::test]
    async fn silent_connection_times_out() {
        let rig = rig();
        rig.conf.load_str("timeout 0\n");
        let outcome = logon_with(&rig, |far_r, far_w| async move {
            // hold the pipe open without saying anything
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop((far_r, far_w));
        })
        .await;
        assert!(matches!(outcome, Err(LogonError::Timeout)));
    }

    /// Log a cell on and return its uuid, session key, and leash far end.
    async fn accepted_cell(rig: &Rig) -> (String, String, FarReader, FarWriter) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (mut far_r, mut far_w) = split_io(Box::new(remote));
        far_w
            .write_marshal(
                FrameKind::IAm,
                &IAm {
                    conn_kind: ConnKind::Cell,
                    uuid: None,
                    key: "port manteau".into(),
                },
            )
            .await
            .expect("send logon");
        logon(&rig.store, &rig.conf, &rig.mux, Box::new(local))
            .await
            .expect("logon");
        let (kind, data) = far_r.read_frame().await.expect("accept");
        assert_eq!(kind, FrameKind::Accept);
        let accept: Accept = parse_payload(&data).expect("parse");
        (accept.uuid, accept.key.expect("session key"), far_r, far_w)
    }

    #[tokio::test]
    async fn band_attaches_with_session_key() {
        let rig = rig();
        let (uuid, key, _leash_r, _leash_w) = accepted_cell(&rig).await;

        let band_uuid = uuid.clone();
        logon_with(&rig, move |mut far_r, mut far_w| async move {
            far_w
                .write_marshal(
                    FrameKind::IAm,
                    &IAm {
                        conn_kind: ConnKind::Band,
                        uuid: Some(band_uuid.clone()),
                        key,
                    },
                )
                .await
                .expect("send logon");
            let (kind, data) = far_r.read_frame().await.expect("accept");
            assert_eq!(kind, FrameKind::Accept);
            let accept: Accept = parse_payload(&data).expect("parse");
            assert_eq!(accept.uuid, band_uuid);
            assert!(accept.key.is_none(), "bands get no session key");
        })
        .await
        .expect("band logon");

        let cell = rig.store.get(&uuid).expect("cell");
        assert!(cell.provide().await.is_ok(), "band is in the pool");
    }

    #[tokio::test]
    async fn band_with_wrong_key_is_kicked() {
        let rig = rig();
        let (uuid, _key, _leash_r, _leash_w) = accepted_cell(&rig).await;

        let outcome = logon_with(&rig, move |_far_r, mut far_w| async move {
            far_w
                .write_marshal(
                    FrameKind::IAm,
                    &IAm {
                        conn_kind: ConnKind::Band,
                        uuid: Some(uuid),
                        key: "definitely not it".into(),
                    },
                )
                .await
                .expect("send logon");
        })
        .await;
        assert!(matches!(outcome, Err(LogonError::AuthMismatch)));
    }

    #[tokio::test]
    async fn band_for_unknown_cell_is_kicked() {
        let rig = rig();
        let outcome = logon_with(&rig, |_far_r, mut far_w| async move {
            far_w
                .write_marshal(
                    FrameKind::IAm,
                    &IAm {
                        conn_kind: ConnKind::Band,
                        uuid: Some("nobody-home".into()),
                        key: "whatever".into(),
                    },
                )
                .await
                .expect("send logon");
        })
        .await;
        assert!(matches!(outcome, Err(LogonError::UnknownCell(_))));
    }

    #[tokio::test]
    async fn band_without_uuid_is_kicked() {
        let rig = rig();
        let outcome = logon_with(&rig, |_far_r, mut far_w| async move {
            far_w
                .write_marshal(
                    FrameKind::IAm,
                    &IAm {
                        conn_kind: ConnKind::Band,
                        uuid: None,
                        key: "whatever".into(),
                    },
                )
                .await
                .expect("send logon");
        })
        .await;
        assert!(matches!(outcome, Err(LogonError::MissingUuid)));
    }

    #[tokio::test]
    async fn leash_loss_removes_cell_from_store() {
        let rig = rig();
        let (uuid, _key, leash_r, leash_w) = accepted_cell(&rig).await;
        assert!(rig.store.get(&uuid).is_some());

        drop(leash_r);
        drop(leash_w);

        for _ in 0..400 {
            if rig.store.get(&uuid).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cell was not removed from the store");
    }
}
