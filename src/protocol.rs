/*
 * Copyright 2020 Joyent, Inc.
 */

//! FCP wire framing.
//!
//! A message is its type name on one line, zero or more `Key=Value` lines and
//! an end marker line. `End` terminates a simple message. `Data` announces a
//! binary payload of exactly the declared length, which follows the marker
//! with no further framing. `EndMessage` is accepted as a synonym for `End`
//! on input.

use std::str;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{CodecError, FieldSetError};
use crate::fieldset::FieldSet;
use crate::message;

pub const END_MARKER: &str = "End";
pub const END_MESSAGE_MARKER: &str = "EndMessage";
pub const DATA_MARKER: &str = "Data";

pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;
pub const DEFAULT_MAX_LINES: usize = 65536;
pub const DEFAULT_MAX_PAYLOAD_LENGTH: u64 = 64 * 1024 * 1024;

/// Bounds applied while reading, to cap the memory a single peer can pin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_line_length: usize,
    pub max_lines: usize,
    pub max_payload_length: u64,
}

impl Default for FrameLimits {
    fn default() -> Self {
        FrameLimits {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_lines: DEFAULT_MAX_LINES,
            max_payload_length: DEFAULT_MAX_PAYLOAD_LENGTH,
        }
    }
}

/// A framed message before any interpretation of its name or fields.
#[derive(Clone, Debug, PartialEq)]
pub struct RawMessage {
    pub name: String,
    pub fields: FieldSet,
    pub end_marker: String,
    pub payload: Option<Bytes>,
    /// The first malformed body line, if any. The frame is still complete
    /// and the stream stays in sync; the message itself is invalid.
    pub body_error: Option<FieldSetError>,
}

impl RawMessage {
    pub fn new(name: impl Into<String>, fields: FieldSet) -> RawMessage {
        RawMessage {
            name: name.into(),
            fields,
            end_marker: END_MARKER.to_string(),
            payload: None,
            body_error: None,
        }
    }

    pub fn with_payload(
        name: impl Into<String>,
        fields: FieldSet,
        payload: Bytes,
    ) -> RawMessage {
        RawMessage {
            name: name.into(),
            fields,
            end_marker: DATA_MARKER.to_string(),
            payload: Some(payload),
            body_error: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key)
    }

    /// Serializes the message into its exact wire form.
    pub fn encode(&self, buf: &mut BytesMut) {
        let body = self.fields.serialize();
        let payload_len = self.payload.as_ref().map_or(0, Bytes::len);
        buf.reserve(self.name.len() + body.len() + payload_len + 8);
        buf.put_slice(self.name.as_bytes());
        buf.put_u8(b'\n');
        buf.put_slice(body.as_bytes());
        match &self.payload {
            Some(payload) => {
                buf.put_slice(DATA_MARKER.as_bytes());
                buf.put_u8(b'\n');
                buf.put_slice(payload);
            }
            None => {
                buf.put_slice(END_MARKER.as_bytes());
                buf.put_u8(b'\n');
            }
        }
    }
}

enum DecodeState {
    Name,
    Body {
        name: String,
        fields: FieldSet,
        lines: usize,
        error: Option<FieldSetError>,
    },
    Payload {
        name: String,
        fields: FieldSet,
        length: usize,
        error: Option<FieldSetError>,
    },
}

/// Stateful decoder/encoder for FCP messages. One instance per direction of
/// a connection; partial messages are carried across `decode` calls.
pub struct FcpCodec {
    limits: FrameLimits,
    state: DecodeState,
    scanned: usize,
}

impl Default for FcpCodec {
    fn default() -> Self {
        FcpCodec::new(FrameLimits::default())
    }
}

impl FcpCodec {
    pub fn new(limits: FrameLimits) -> FcpCodec {
        FcpCodec {
            limits,
            state: DecodeState::Name,
            scanned: 0,
        }
    }

    fn next_line(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<String>, CodecError> {
        let found = buf[self.scanned..].iter().position(|b| *b == b'\n');
        match found {
            Some(offset) => {
                let end = self.scanned + offset;
                self.scanned = 0;
                if end > self.limits.max_line_length {
                    return Err(CodecError::LineTooLong {
                        limit: self.limits.max_line_length,
                    });
                }
                let line = buf.split_to(end + 1);
                let text = str::from_utf8(&line[..end])
                    .map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Some(text.to_string()))
            }
            None => {
                if buf.len() > self.limits.max_line_length {
                    return Err(CodecError::LineTooLong {
                        limit: self.limits.max_line_length,
                    });
                }
                self.scanned = buf.len();
                Ok(None)
            }
        }
    }
}

impl Decoder for FcpCodec {
    type Item = RawMessage;
    type Error = CodecError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, CodecError> {
        loop {
            if let DecodeState::Payload { length, .. } = self.state {
                if buf.len() < length {
                    buf.reserve(length - buf.len());
                    return Ok(None);
                }
                let payload = buf.split_to(length).freeze();
                let state =
                    std::mem::replace(&mut self.state, DecodeState::Name);
                if let DecodeState::Payload {
                    name,
                    fields,
                    error,
                    ..
                } = state
                {
                    let mut msg = RawMessage::with_payload(name, fields, payload);
                    msg.body_error = error;
                    return Ok(Some(msg));
                }
                continue;
            }

            let line = match self.next_line(buf)? {
                Some(line) => line,
                None => return Ok(None),
            };

            match &mut self.state {
                DecodeState::Name => {
                    let name = line.trim();
                    if !name.is_empty() {
                        self.state = DecodeState::Body {
                            name: name.to_string(),
                            fields: FieldSet::new(),
                            lines: 0,
                            error: None,
                        };
                    }
                }
                DecodeState::Body {
                    name,
                    fields,
                    lines,
                    error,
                } => {
                    *lines += 1;
                    if *lines > self.limits.max_lines {
                        return Err(CodecError::TooManyLines {
                            limit: self.limits.max_lines,
                        });
                    }
                    // A bad body line spoils the message, not the stream.
                    let marker = match fields.read_line(&line) {
                        Ok(Some(marker)) => marker,
                        Ok(None) => continue,
                        Err(e) => {
                            if error.is_none() {
                                *error = Some(e);
                            }
                            continue;
                        }
                    };

                    if marker == DATA_MARKER {
                        let length =
                            message::declared_payload_length(name, fields)
                                .map_err(CodecError::PayloadLength)?;
                        if length > self.limits.max_payload_length {
                            return Err(CodecError::PayloadTooLarge {
                                length,
                                limit: self.limits.max_payload_length,
                            });
                        }
                        let name = std::mem::take(name);
                        let fields = std::mem::take(fields);
                        let error = error.take();
                        self.state = DecodeState::Payload {
                            name,
                            fields,
                            length: length as usize,
                            error,
                        };
                    } else {
                        let name = std::mem::take(name);
                        let fields = std::mem::take(fields);
                        let body_error = error.take();
                        self.state = DecodeState::Name;
                        return Ok(Some(RawMessage {
                            name,
                            fields,
                            end_marker: marker,
                            payload: None,
                            body_error,
                        }));
                    }
                }
                DecodeState::Payload { .. } => continue,
            }
        }
    }
}

impl Encoder<RawMessage> for FcpCodec {
    type Error = CodecError;

    fn encode(
        &mut self,
        item: RawMessage,
        buf: &mut BytesMut,
    ) -> Result<(), CodecError> {
        item.encode(buf);
        Ok(())
    }
}
