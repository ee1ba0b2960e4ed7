//! Control-channel framing
//!
//! Reads and writes the `[type:u16 BE][len:u32 BE][payload]` frames of
//! the control stream. Reads use `read_exact`, so short reads from the
//! TLS layer are looped over, never treated as errors; a clean EOF
//! before a header starts is reported as end-of-stream. The writer
//! emits header and payload as one buffer so frames can never
//! interleave on the stream.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use voxlink_common::protocol::{
    CONTROL_HEADER_LEN, MAX_CONTROL_PAYLOAD, MessageType, decode_header, encode_header,
};

use crate::error::ClientError;

/// A control frame as read off the wire
#[derive(Debug, Clone)]
pub struct ControlFrame {
    /// Raw message type; may be outside the known table
    pub msg_type: u16,
    /// Serialized protobuf payload
    pub payload: Bytes,
}

/// Reads control frames from the TLS stream
pub struct ControlReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> ControlReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next frame
    ///
    /// Returns `Ok(None)` on clean end-of-stream (EOF before any header
    /// byte). EOF mid-frame and oversized payloads are errors.
    pub async fn read_frame(&mut self) -> Result<Option<ControlFrame>, ClientError> {
        let mut header = [0u8; CONTROL_HEADER_LEN];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let (msg_type, length) = decode_header(&header);
        if length > MAX_CONTROL_PAYLOAD {
            return Err(ClientError::Protocol(format!(
                "payload length {} exceeds limit",
                length
            )));
        }

        let mut payload = vec![0u8; length as usize];
        self.reader.read_exact(&mut payload).await?;

        Ok(Some(ControlFrame {
            msg_type,
            payload: payload.into(),
        }))
    }
}

/// Writes control frames to the TLS stream
pub struct ControlWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> ControlWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one frame (header + payload in a single buffer) and flush
    pub async fn write_frame(
        &mut self,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        let mut buf = BytesMut::with_capacity(CONTROL_HEADER_LEN + payload.len());
        buf.put_slice(&encode_header(msg_type, payload.len() as u32));
        buf.put_slice(payload);

        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Write a frame with an arbitrary raw type value
    ///
    /// Used to exercise the unknown-type path; real traffic goes through
    /// [`ControlWriter::write_frame`].
    pub async fn write_raw(&mut self, raw_type: u16, payload: &[u8]) -> Result<(), ClientError> {
        let mut buf = BytesMut::with_capacity(CONTROL_HEADER_LEN + payload.len());
        buf.put_slice(&raw_type.to_be_bytes());
        buf.put_slice(&(payload.len() as u32).to_be_bytes());
        buf.put_slice(payload);

        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Gracefully shut down the underlying stream
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, duplex};

    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (client, server) = duplex(1024);
        let mut writer = ControlWriter::new(client);
        let mut reader = ControlReader::new(server);

        writer
            .write_frame(MessageType::Ping, &[1, 2, 3, 4])
            .await
            .unwrap();

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::Ping.to_u16());
        assert_eq!(&frame.payload[..], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let (client, server) = duplex(64);
        let mut writer = ControlWriter::new(client);
        let mut reader = ControlReader::new(server);

        writer
            .write_frame(MessageType::UserList, &[])
            .await
            .unwrap();

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.msg_type, 18);
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let (client, server) = duplex(64);
        drop(client);

        let mut reader = ControlReader::new(server);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_payload_is_error() {
        let (mut client, server) = duplex(64);

        // Header promises 100 bytes; deliver 5, then hang up
        client
            .write_all(&encode_header(MessageType::ChannelState, 100))
            .await
            .unwrap();
        client.write_all(&[0u8; 5]).await.unwrap();
        drop(client);

        let mut reader = ControlReader::new(server);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_eof_mid_header_is_error() {
        let (mut client, server) = duplex(64);
        client.write_all(&[0x00, 0x07, 0x00]).await.unwrap();
        drop(client);

        let mut reader = ControlReader::new(server);
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let (mut client, server) = duplex(64);
        client
            .write_all(&encode_header(MessageType::UserState, MAX_CONTROL_PAYLOAD + 1))
            .await
            .unwrap();

        let mut reader = ControlReader::new(server);
        assert!(matches!(
            reader.read_frame().await,
            Err(ClientError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_large_payload_reassembled_across_chunks() {
        // A 1 MiB payload pushed through a tiny duplex pipe arrives in
        // many small reads; the frame must reassemble intact.
        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let (client, server) = duplex(977); // deliberately odd chunk size
        let writer_task = tokio::spawn(async move {
            let mut writer = ControlWriter::new(client);
            writer
                .write_frame(MessageType::ChannelState, &payload)
                .await
                .unwrap();
        });

        let mut reader = ControlReader::new(server);
        let frame = reader.read_frame().await.unwrap().unwrap();
        writer_task.await.unwrap();

        assert_eq!(frame.msg_type, MessageType::ChannelState.to_u16());
        assert_eq!(frame.payload.len(), expected.len());
        assert_eq!(&frame.payload[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_multiple_frames_in_sequence() {
        let (client, server) = duplex(4096);
        let mut writer = ControlWriter::new(client);
        let mut reader = ControlReader::new(server);

        writer.write_frame(MessageType::Version, &[1]).await.unwrap();
        writer
            .write_frame(MessageType::Authenticate, &[2, 2])
            .await
            .unwrap();
        writer.write_frame(MessageType::Ping, &[3, 3, 3]).await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap().unwrap().msg_type, 0);
        assert_eq!(reader.read_frame().await.unwrap().unwrap().msg_type, 2);
        assert_eq!(
            reader.read_frame().await.unwrap().unwrap().payload.len(),
            3
        );
    }

    #[tokio::test]
    async fn test_unknown_type_still_reads() {
        // Types outside 0..25 must be delivered, not choked on; the
        // dispatch layer decides to skip them.
        let (mut client, server) = duplex(64);
        let mut raw = Vec::new();
        raw.extend_from_slice(&999u16.to_be_bytes());
        raw.extend_from_slice(&2u32.to_be_bytes());
        raw.extend_from_slice(&[0xAB, 0xCD]);
        client.write_all(&raw).await.unwrap();

        let mut reader = ControlReader::new(server);
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.msg_type, 999);
        assert_eq!(&frame.payload[..], &[0xAB, 0xCD]);
    }
}
