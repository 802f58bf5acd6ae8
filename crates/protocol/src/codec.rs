//! Frame transport over any async stream half.
//!
//! The length prefix is handled by [`LengthDelimitedCodec`]; this module
//! adds the kind byte and the JSON payload layer on top.

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::{FrameError, FrameKind};

/// Reads frames from the read half of a connection.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: FramedRead<R, LengthDelimitedCodec>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap a stream half.
    pub fn new(io: R) -> Self {
        Self {
            inner: FramedRead::new(io, LengthDelimitedCodec::new()),
        }
    }

    /// Read the next frame, splitting off the kind byte.
    ///
    /// Returns [`FrameError::Closed`] on an orderly end of stream.
    pub async fn read_frame(&mut self) -> Result<(FrameKind, Bytes), FrameError> {
        let mut frame = match self.inner.next().await {
            None => return Err(FrameError::Closed),
            Some(frame) => frame?,
        };
        if frame.is_empty() {
            return Err(FrameError::MissingKind);
        }
        let kind = FrameKind::try_from(frame[0])?;
        Ok((kind, frame.split_off(1).freeze()))
    }
}

/// Writes frames to the write half of a connection.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: FramedWrite<W, LengthDelimitedCodec>,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Wrap a stream half.
    pub fn new(io: W) -> Self {
        Self {
            inner: FramedWrite::new(io, LengthDelimitedCodec::new()),
        }
    }

    /// Write one frame with a raw payload.
    pub async fn write_frame(&mut self, kind: FrameKind, payload: &[u8]) -> Result<(), FrameError> {
        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        buf.put_u8(kind as u8);
        buf.put_slice(payload);
        self.inner.send(buf.freeze()).await?;
        Ok(())
    }

    /// Serialize `payload` as JSON and write it as one frame.
    pub async fn write_marshal<T>(&mut self, kind: FrameKind, payload: &T) -> Result<(), FrameError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec(payload)?;
        self.write_frame(kind, &data).await
    }
}

/// Decode a JSON control-frame payload.
pub fn parse_payload<T>(data: &[u8]) -> Result<T, FrameError>
where
    T: DeserializeOwned,
{
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnKind, IAm, NeedBand};

    #[tokio::test]
    async fn round_trip_control_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .write_marshal(
                FrameKind::IAm,
                &IAm {
                    conn_kind: ConnKind::Cell,
                    uuid: None,
                    key: "hunter2".into(),
                },
            )
            .await
            .expect("write");

        let (kind, data) = reader.read_frame().await.expect("read");
        assert_eq!(kind, FrameKind::IAm);
        let frame: IAm = parse_payload(&data).expect("parse");
        assert_eq!(frame.conn_kind, ConnKind::Cell);
        assert_eq!(frame.key, "hunter2");
    }

    #[tokio::test]
    async fn raw_body_frame_passes_bytes_through() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let chunk = vec![0xABu8; 1024];
        writer
            .write_frame(FrameKind::HttpReqBody, &chunk)
            .await
            .expect("write");

        let (kind, data) = reader.read_frame().await.expect("read");
        assert_eq!(kind, FrameKind::HttpReqBody);
        assert_eq!(data.len(), 1024);
        assert_eq!(&data[..], &chunk[..]);
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        let mut raw = FramedWrite::new(client, LengthDelimitedCodec::new());
        raw.send(Bytes::from_static(&[0xEE, b'{', b'}']))
            .await
            .expect("send");

        let mut reader = FrameReader::new(server);
        match reader.read_frame().await {
            Err(FrameError::UnknownKind(0xEE)) => {}
            other => panic!("expected UnknownKind, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_peer_reads_as_closed() {
        let (client, server) = tokio::io::duplex(4096);
        drop(client);

        let mut reader = FrameReader::new(server);
        let err = reader.read_frame().await.expect_err("closed");
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn empty_frame_is_a_protocol_error() {
        let (client, server) = tokio::io::duplex(4096);
        let mut raw = FramedWrite::new(client, LengthDelimitedCodec::new());
        raw.send(Bytes::new()).await.expect("send");

        let mut reader = FrameReader::new(server);
        match reader.read_frame().await {
            Err(FrameError::MissingKind) => {}
            other => panic!("expected MissingKind, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn need_band_payload_keys() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .write_marshal(FrameKind::NeedBand, &NeedBand { count: 1 })
            .await
            .expect("write");
        let (kind, data) = reader.read_frame().await.expect("read");
        assert_eq!(kind, FrameKind::NeedBand);
        assert_eq!(&data[..], br#"{"count":1}"#);
    }
}
