//! Streaming packet decode from an async byte source.
//!
//! Reads exactly one frame per call: the length-carrying prefix first, then
//! the remainder. A clean end-of-stream at a frame boundary yields
//! `Ok(None)`; end-of-stream inside a frame is an I/O error.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::codec::{parse_field_header, parse_legacy_payload};
use super::config::{FieldSchema, FramingConfig};
use super::packet::Packet;
use crate::error::{FlowPacketError, Result};

/// Read and decode the next packet from `reader` under `cfg`.
///
/// Returns `Ok(None)` when the reader reports end-of-stream on the first
/// byte of a frame.
pub async fn read_packet<R>(reader: &mut R, cfg: &FramingConfig) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    match cfg {
        FramingConfig::Legacy {
            route_bytes,
            seq_bytes,
        } => read_legacy(reader, *route_bytes, *seq_bytes).await,
        FramingConfig::FieldDriven(schema) => read_field_driven(reader, schema).await,
    }
}

async fn read_legacy<R>(
    reader: &mut R,
    route_bytes: usize,
    seq_bytes: usize,
) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut size_buf = [0u8; 4];
    if !read_frame_start(reader, &mut size_buf).await? {
        return Ok(None);
    }

    let size = u32::from_be_bytes(size_buf) as usize;
    if size == 0 {
        return Err(FlowPacketError::ZeroSize);
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;

    parse_legacy_payload(&payload, route_bytes, seq_bytes).map(Some)
}

async fn read_field_driven<R>(reader: &mut R, schema: &FieldSchema) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut header = vec![0u8; schema.header_size()];
    if !read_frame_start(reader, &mut header).await? {
        return Ok(None);
    }

    let (size, seq, route_values) = parse_field_header(&header, schema);

    let mut body = vec![0u8; size];
    if size > 0 {
        reader.read_exact(&mut body).await?;
    }

    Ok(Some(Packet {
        heartbeat: false,
        ext_code: 0,
        route: schema.combine_route(&route_values),
        seq,
        data: body.into(),
    }))
}

/// Fill `buf` completely, distinguishing a clean end-of-stream (no bytes at
/// all, returns `false`) from a truncated frame (error).
async fn read_frame_start<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(FlowPacketError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame",
            )));
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::super::codec::encode;
    use super::super::config::FieldDef;
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn field(name: &str, bytes: usize, is_route: bool, is_seq: bool) -> FieldDef {
        FieldDef {
            name: name.to_string(),
            bytes,
            is_route,
            is_seq,
        }
    }

    #[tokio::test]
    async fn test_streaming_two_packets_in_order() {
        let cfg = FramingConfig::legacy(2, 2).unwrap();
        let first = Packet::new(10, 1, Bytes::from_static(b"first"));
        let second = Packet::new(20, 2, Bytes::from_static(b"second"));

        let mut stream = Vec::new();
        stream.extend_from_slice(&encode(&first, &cfg).unwrap());
        stream.extend_from_slice(&encode(&second, &cfg).unwrap());

        let mut reader = &stream[..];
        assert_eq!(read_packet(&mut reader, &cfg).await.unwrap(), Some(first));
        assert_eq!(read_packet(&mut reader, &cfg).await.unwrap(), Some(second));
        assert_eq!(read_packet(&mut reader, &cfg).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_streaming_fragmented_packet() {
        let cfg = FramingConfig::legacy(2, 2).unwrap();
        let pkt = Packet::new(77, 5, Bytes::from_static(b"fragmented payload"));
        let frame = encode(&pkt, &cfg).unwrap();
        let mid = frame.len() / 2;

        let (mut tx, mut rx) = tokio::io::duplex(64);
        let (a, b) = (frame[..mid].to_vec(), frame[mid..].to_vec());
        tokio::spawn(async move {
            tx.write_all(&a).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.write_all(&b).await.unwrap();
        });

        let decoded = read_packet(&mut rx, &cfg).await.unwrap();
        assert_eq!(decoded, Some(pkt));
    }

    #[tokio::test]
    async fn test_streaming_heartbeat() {
        let cfg = FramingConfig::legacy(2, 2).unwrap();
        let frame = encode(&Packet::heartbeat(0), &cfg).unwrap();

        let mut reader = &frame[..];
        let decoded = read_packet(&mut reader, &cfg).await.unwrap().unwrap();
        assert!(decoded.is_heartbeat());
    }

    #[tokio::test]
    async fn test_streaming_zero_size_rejected() {
        let cfg = FramingConfig::legacy(2, 2).unwrap();
        let mut reader = &[0u8, 0, 0, 0][..];
        assert!(matches!(
            read_packet(&mut reader, &cfg).await,
            Err(FlowPacketError::ZeroSize)
        ));
    }

    #[tokio::test]
    async fn test_streaming_truncated_frame_is_error() {
        let cfg = FramingConfig::legacy(2, 2).unwrap();
        let pkt = Packet::new(1, 1, Bytes::from_static(b"data"));
        let frame = encode(&pkt, &cfg).unwrap();

        // cut inside the payload
        let mut reader = &frame[..frame.len() - 2];
        assert!(read_packet(&mut reader, &cfg).await.is_err());

        // cut inside the size prefix
        let mut reader = &frame[..2];
        assert!(read_packet(&mut reader, &cfg).await.is_err());
    }

    #[tokio::test]
    async fn test_streaming_field_driven() {
        let cfg = FramingConfig::field_driven(vec![
            field("size", 2, false, false),
            field("route", 2, true, false),
            field("seq", 2, false, true),
        ])
        .unwrap();

        let first = Packet::new(0x1234, 7, Bytes::from_static(b"hi"));
        let second = Packet::new(0x0001, 8, Bytes::new());

        let mut stream = Vec::new();
        stream.extend_from_slice(&encode(&first, &cfg).unwrap());
        stream.extend_from_slice(&encode(&second, &cfg).unwrap());

        let mut reader = &stream[..];
        assert_eq!(read_packet(&mut reader, &cfg).await.unwrap(), Some(first));
        assert_eq!(read_packet(&mut reader, &cfg).await.unwrap(), Some(second));
        assert_eq!(read_packet(&mut reader, &cfg).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_streaming_field_driven_paced_bytes() {
        let cfg = FramingConfig::field_driven(vec![
            field("len", 2, false, false),
            field("seq", 2, false, true),
        ])
        .unwrap();
        let pkt = Packet::new(0, 9, Bytes::from_static(b"slow"));
        let frame = encode(&pkt, &cfg).unwrap();

        let (mut tx, mut rx) = tokio::io::duplex(8);
        let bytes = frame.to_vec();
        tokio::spawn(async move {
            for b in bytes {
                tx.write_all(&[b]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let decoded = read_packet(&mut rx, &cfg).await.unwrap();
        assert_eq!(decoded, Some(pkt));
    }
}
