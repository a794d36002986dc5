/*
 * Copyright 2020 Joyent, Inc.
 */

//! A minimal asynchronous FCP client, used by the `fcpcall` tool and the
//! integration tests.

use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::errors::CodecError;
use crate::fieldset::FieldSet;
use crate::message::names;
use crate::protocol::{FcpCodec, RawMessage};

pub struct FcpClient {
    reader: FramedRead<OwnedReadHalf, FcpCodec>,
    writer: FramedWrite<OwnedWriteHalf, FcpCodec>,
}

impl FcpClient {
    pub async fn connect(addr: &SocketAddr) -> Result<FcpClient, CodecError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(FcpClient::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> FcpClient {
        let (read_half, write_half) = stream.into_split();
        FcpClient {
            reader: FramedRead::new(read_half, FcpCodec::default()),
            writer: FramedWrite::new(write_half, FcpCodec::default()),
        }
    }

    pub async fn send(&mut self, msg: RawMessage) -> Result<(), CodecError> {
        self.writer.send(msg).await
    }

    /// Writes `bytes` to the socket as they are, bypassing the encoder.
    /// Everything sent before has already been flushed by `send`.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let socket = self.writer.get_mut();
        socket.write_all(bytes).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Sends `name` with `fields`, and with `payload` after a `Data` marker
    /// when given. `DataLength` is filled in from the payload if missing.
    pub async fn send_message(
        &mut self,
        name: &str,
        mut fields: FieldSet,
        payload: Option<Bytes>,
    ) -> Result<(), CodecError> {
        let msg = match payload {
            Some(payload) => {
                if fields.get("DataLength").is_none() {
                    fields.put_single("DataLength", payload.len())?;
                }
                RawMessage::with_payload(name, fields, payload)
            }
            None => RawMessage::new(name, fields),
        };
        self.send(msg).await
    }

    /// Sends a `ClientHello` and waits for the `NodeHello`.
    pub async fn hello(&mut self, name: &str) -> Result<RawMessage, CodecError> {
        let mut fields = FieldSet::new();
        fields.put_single("Name", name)?;
        fields.put_single("ExpectedVersion", "2.0")?;
        self.send_message(names::CLIENT_HELLO, fields, None).await?;
        self.receive_named(names::NODE_HELLO)
            .await?
            .ok_or_else(|| closed_early(names::NODE_HELLO))
    }

    /// The next message from the server, or `None` once it has closed the
    /// connection.
    pub async fn receive(&mut self) -> Result<Option<RawMessage>, CodecError> {
        self.reader.next().await.transpose()
    }

    /// Skips messages until one called `name` arrives.
    pub async fn receive_named(&mut self, name: &str) -> Result<Option<RawMessage>, CodecError> {
        while let Some(msg) = self.receive().await? {
            if msg.name == name {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    /// Collects messages up to and including the first one `done` accepts.
    pub async fn receive_until<F>(&mut self, mut done: F) -> Result<Vec<RawMessage>, CodecError>
    where
        F: FnMut(&RawMessage) -> bool,
    {
        let mut out = Vec::new();
        while let Some(msg) = self.receive().await? {
            let finished = done(&msg);
            out.push(msg);
            if finished {
                return Ok(out);
            }
        }
        Err(closed_early("the expected message"))
    }

    pub async fn close(mut self) -> Result<(), CodecError> {
        self.writer.get_mut().shutdown().await?;
        Ok(())
    }
}

fn closed_early(waiting_for: &str) -> CodecError {
    CodecError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("connection closed while waiting for {}", waiting_for),
    ))
}
