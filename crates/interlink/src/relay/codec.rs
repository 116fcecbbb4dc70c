//! Binary frame codec for the relay protocol.
//!
//! Every frame starts with a one-byte type tag. Strings are encoded as
//! `{u16 BE length}{UTF-8 bytes}`; integers are big-endian. The DATA payload
//! is the remainder of the frame after its two id fields.
//!
//! ```text
//! HELLO   0x01 | u32 version | str environment | str serverId | str token
//! DATA    0x02 | str target  | str source      | payload...
//! WELCOME 0x03 | u32 version | str environment | str serverId
//! REJECT  0x04 | str reason
//! ```
//!
//! The 4-byte outer length prefix is added by [`super::framing`].

use crate::error::FrameError;
use crate::settings::FrameLimits;

pub const TAG_HELLO: u8 = 0x01;
pub const TAG_DATA: u8 = 0x02;
pub const TAG_WELCOME: u8 = 0x03;
pub const TAG_REJECT: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello {
        protocol_version: u32,
        environment: String,
        server_id: String,
        token: String,
    },
    Welcome {
        protocol_version: u32,
        environment: String,
        server_id: String,
    },
    Reject {
        reason: String,
    },
    Data {
        target_id: String,
        source_id: String,
        payload: Vec<u8>,
    },
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::Hello { .. } => TAG_HELLO,
            Frame::Data { .. } => TAG_DATA,
            Frame::Welcome { .. } => TAG_WELCOME,
            Frame::Reject { .. } => TAG_REJECT,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "HELLO",
            Frame::Data { .. } => "DATA",
            Frame::Welcome { .. } => "WELCOME",
            Frame::Reject { .. } => "REJECT",
        }
    }
}

/// Encodes and decodes frames under fixed size limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    limits: FrameLimits,
}

impl FrameCodec {
    pub fn new(limits: FrameLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> FrameLimits {
        self.limits
    }

    /// Encodes a frame body (without the outer length prefix).
    ///
    /// # Errors
    ///
    /// Fails if any string field or the whole frame exceeds the limits.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::with_capacity(64);
        buf.push(frame.tag());
        match frame {
            Frame::Hello {
                protocol_version,
                environment,
                server_id,
                token,
            } => {
                buf.extend_from_slice(&protocol_version.to_be_bytes());
                self.put_str(&mut buf, "environment", environment)?;
                self.put_str(&mut buf, "serverId", server_id)?;
                self.put_str(&mut buf, "token", token)?;
            }
            Frame::Welcome {
                protocol_version,
                environment,
                server_id,
            } => {
                buf.extend_from_slice(&protocol_version.to_be_bytes());
                self.put_str(&mut buf, "environment", environment)?;
                self.put_str(&mut buf, "serverId", server_id)?;
            }
            Frame::Reject { reason } => {
                self.put_str(&mut buf, "reason", reason)?;
            }
            Frame::Data {
                target_id,
                source_id,
                payload,
            } => {
                self.put_str(&mut buf, "targetServerId", target_id)?;
                self.put_str(&mut buf, "sourceServerId", source_id)?;
                buf.extend_from_slice(payload);
            }
        }
        if buf.len() > self.limits.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                size: buf.len(),
                max: self.limits.max_frame_bytes,
            });
        }
        Ok(buf)
    }

    /// Decodes a frame body.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() > self.limits.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                size: bytes.len(),
                max: self.limits.max_frame_bytes,
            });
        }
        let mut reader = FieldReader {
            buf: bytes,
            pos: 0,
            max_field: self.limits.max_field_bytes,
        };
        let tag = reader.u8()?;
        let frame = match tag {
            TAG_HELLO => Frame::Hello {
                protocol_version: reader.u32()?,
                environment: reader.string("environment")?,
                server_id: reader.string("serverId")?,
                token: reader.string("token")?,
            },
            TAG_WELCOME => Frame::Welcome {
                protocol_version: reader.u32()?,
                environment: reader.string("environment")?,
                server_id: reader.string("serverId")?,
            },
            TAG_REJECT => Frame::Reject {
                reason: reader.string("reason")?,
            },
            TAG_DATA => {
                let target_id = reader.string("targetServerId")?;
                let source_id = reader.string("sourceServerId")?;
                return Ok(Frame::Data {
                    target_id,
                    source_id,
                    payload: reader.rest().to_vec(),
                });
            }
            other => return Err(FrameError::UnknownTag(other)),
        };
        reader.finish(frame)
    }

    fn put_str(&self, buf: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), FrameError> {
        let bytes = value.as_bytes();
        if bytes.len() > self.limits.max_field_bytes {
            return Err(FrameError::FieldTooLarge {
                field,
                size: bytes.len(),
                max: self.limits.max_field_bytes,
            });
        }
        // max_field_bytes never exceeds u16::MAX
        buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        buf.extend_from_slice(bytes);
        Ok(())
    }
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    max_field: usize,
}

impl<'a> FieldReader<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], FrameError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                FrameError::Malformed(format!(
                    "truncated {what}: need {len} bytes at offset {}, have {}",
                    self.pos,
                    self.buf.len() - self.pos
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1, "type tag")?[0])
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let bytes = self.take(4, "protocol version")?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self, field: &'static str) -> Result<String, FrameError> {
        let len_bytes = self.take(2, field)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        if len > self.max_field {
            return Err(FrameError::FieldTooLarge {
                field,
                size: len,
                max: self.max_field,
            });
        }
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| FrameError::Malformed(format!("{field} is not valid UTF-8")))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    fn finish(self, frame: Frame) -> Result<Frame, FrameError> {
        if self.pos != self.buf.len() {
            return Err(FrameError::Malformed(format!(
                "{} trailing bytes after {}",
                self.buf.len() - self.pos,
                frame.kind()
            )));
        }
        Ok(frame)
    }
}
