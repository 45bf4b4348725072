// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol between monitored clients and the exception handler.
//!
//! Every message is a fixed-layout frame: an 8-byte header (`kind`,
//! `payload_len`, both little-endian u32) followed by `payload_len` bytes of
//! packed little-endian fields. There is no self-describing serialization on
//! this path: the client encodes its crash request from inside a signal
//! handler, so encoding writes into a caller-provided buffer and never
//! allocates.
//!
//! Handles travel as u32 on the wire and are widened by sign-extension on
//! 64-bit consumers.

use crate::error::{Error, Result};

/// Bumped whenever the frame layout changes incompatibly. Carried in
/// [`RegisterRequest`]; the server rejects clients speaking another major.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on `payload_len` accepted from a peer.
pub const MAX_PAYLOAD: u32 = 4096;

/// Largest encoded frame; stack buffers of this size hold any message.
pub const MAX_FRAME: usize = 64;

pub const MSG_REGISTER_REQUEST: u32 = 1;
pub const MSG_REGISTER_RESPONSE: u32 = 2;
pub const MSG_CRASH_DUMP_REQUEST: u32 = 3;
pub const MSG_DUMP_COMPLETE: u32 = 4;
pub const MSG_DUMP_FAILED: u32 = 5;
pub const MSG_SHUTDOWN_REQUEST: u32 = 6;
pub const MSG_SET_PTRACER: u32 = 7;

/// Sent by a client once per connection, before any other message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRequest {
    pub protocol_version: u32,
    pub client_process_id: u32,
    pub exception_info_address: u64,
}

/// The server's reply to a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterResponse {
    pub request_dump_event_handle: u32,
}

/// Raised by the client stub from its signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashDumpRequest {
    pub client_process_id: u32,
    pub thread_id: u32,
    pub stack_pointer: u64,
    pub exception_info_address: u64,
    /// Zero when the client supplies no sanitization allowlist.
    pub sanitization_info_address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownRequest {
    pub token: u64,
}

/// Linux broker message: tells the client which pid to allow as tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetPtracer {
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    RegisterRequest(RegisterRequest),
    RegisterResponse(RegisterResponse),
    CrashDumpRequest(CrashDumpRequest),
    DumpComplete,
    DumpFailed,
    ShutdownRequest(ShutdownRequest),
    SetPtracer(SetPtracer),
}

impl Message {
    pub fn kind(&self) -> u32 {
        match self {
            Message::RegisterRequest(_) => MSG_REGISTER_REQUEST,
            Message::RegisterResponse(_) => MSG_REGISTER_RESPONSE,
            Message::CrashDumpRequest(_) => MSG_CRASH_DUMP_REQUEST,
            Message::DumpComplete => MSG_DUMP_COMPLETE,
            Message::DumpFailed => MSG_DUMP_FAILED,
            Message::ShutdownRequest(_) => MSG_SHUTDOWN_REQUEST,
            Message::SetPtracer(_) => MSG_SET_PTRACER,
        }
    }

    /// Encodes the full frame (header + payload) into `buf`, returning the
    /// number of bytes written. Fails with [`Error::Internal`] if `buf` is
    /// too small; a `[u8; MAX_FRAME]` always fits.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = Writer::new(buf);
        w.put_u32(self.kind())?;
        // Patched below once the payload length is known.
        w.put_u32(0)?;
        match self {
            Message::RegisterRequest(m) => {
                w.put_u32(m.protocol_version)?;
                w.put_u32(m.client_process_id)?;
                w.put_u64(m.exception_info_address)?;
            }
            Message::RegisterResponse(m) => {
                w.put_u32(m.request_dump_event_handle)?;
            }
            Message::CrashDumpRequest(m) => {
                w.put_u32(m.client_process_id)?;
                w.put_u32(m.thread_id)?;
                w.put_u64(m.stack_pointer)?;
                w.put_u64(m.exception_info_address)?;
                w.put_u64(m.sanitization_info_address)?;
            }
            Message::DumpComplete | Message::DumpFailed => {}
            Message::ShutdownRequest(m) => {
                w.put_u64(m.token)?;
            }
            Message::SetPtracer(m) => {
                w.put_u32(m.pid)?;
            }
        }
        let total = w.written();
        let payload_len = (total - FRAME_HEADER_LEN) as u32;
        buf[4..8].copy_from_slice(&payload_len.to_le_bytes());
        Ok(total)
    }

    /// Decodes a payload previously framed under `kind`. The payload must be
    /// exactly the message's fixed size; trailing bytes are a protocol error.
    pub fn decode(kind: u32, payload: &[u8]) -> Result<Message> {
        let mut r = Reader::new(payload);
        let message = match kind {
            MSG_REGISTER_REQUEST => Message::RegisterRequest(RegisterRequest {
                protocol_version: r.get_u32()?,
                client_process_id: r.get_u32()?,
                exception_info_address: r.get_u64()?,
            }),
            MSG_REGISTER_RESPONSE => Message::RegisterResponse(RegisterResponse {
                request_dump_event_handle: r.get_u32()?,
            }),
            MSG_CRASH_DUMP_REQUEST => Message::CrashDumpRequest(CrashDumpRequest {
                client_process_id: r.get_u32()?,
                thread_id: r.get_u32()?,
                stack_pointer: r.get_u64()?,
                exception_info_address: r.get_u64()?,
                sanitization_info_address: r.get_u64()?,
            }),
            MSG_DUMP_COMPLETE => Message::DumpComplete,
            MSG_DUMP_FAILED => Message::DumpFailed,
            MSG_SHUTDOWN_REQUEST => Message::ShutdownRequest(ShutdownRequest {
                token: r.get_u64()?,
            }),
            MSG_SET_PTRACER => Message::SetPtracer(SetPtracer { pid: r.get_u32()? }),
            other => return Err(Error::Protocol(format!("unknown message kind {other}"))),
        };
        if !r.is_empty() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after message kind {kind}",
                r.remaining()
            )));
        }
        Ok(message)
    }
}

pub const FRAME_HEADER_LEN: usize = 8;

/// The block a crashing client fills in at a process-stable address and
/// shares read-only with the handler. All fields are stored little-endian
/// in the client's memory; the handler decodes them with [`Self::decode`]
/// after reading [`Self::WIRE_LEN`] bytes out of the client.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExceptionInformation {
    /// Address of the OS-supplied `ucontext_t` in the client.
    pub context_address: u64,
    /// Address of the OS-supplied `siginfo_t` in the client.
    pub siginfo_address: u64,
    pub fault_address: u64,
    /// `si_code` of the delivered signal.
    pub code: i64,
    pub thread_id: u32,
    pub signo: u32,
}

impl ExceptionInformation {
    pub const WIRE_LEN: usize = 40;

    pub fn decode(bytes: &[u8; Self::WIRE_LEN]) -> Self {
        let u64_at = |at: usize| {
            u64::from_le_bytes([
                bytes[at],
                bytes[at + 1],
                bytes[at + 2],
                bytes[at + 3],
                bytes[at + 4],
                bytes[at + 5],
                bytes[at + 6],
                bytes[at + 7],
            ])
        };
        let u32_at =
            |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        ExceptionInformation {
            context_address: u64_at(0),
            siginfo_address: u64_at(8),
            fault_address: u64_at(16),
            code: u64_at(24) as i64,
            thread_id: u32_at(32),
            signo: u32_at(36),
        }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..8].copy_from_slice(&self.context_address.to_le_bytes());
        out[8..16].copy_from_slice(&self.siginfo_address.to_le_bytes());
        out[16..24].copy_from_slice(&self.fault_address.to_le_bytes());
        out[24..32].copy_from_slice(&self.code.to_le_bytes());
        out[32..36].copy_from_slice(&self.thread_id.to_le_bytes());
        out[36..40].copy_from_slice(&self.signo.to_le_bytes());
        out
    }
}

/// Parses a frame header, returning `(kind, payload_len)`.
pub fn decode_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(u32, usize)> {
    let kind = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_PAYLOAD {
        return Err(Error::Protocol(format!("oversized payload ({len} bytes)")));
    }
    Ok((kind, len as usize))
}

/// Widens a 32-bit handle to the 64-bit consumer's pointer width.
///
/// Windows-descended handle values use sign extension so pseudo-handles
/// (small negative values) survive the round trip; the same rule is applied
/// uniformly here.
pub fn sign_extend_handle(handle: u32) -> u64 {
    handle as i32 as i64 as u64
}

struct Writer<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Writer { buf, at: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.at + bytes.len();
        if end > self.buf.len() {
            return Err(Error::Internal("encode buffer too small".into()));
        }
        self.buf[self.at..end].copy_from_slice(bytes);
        self.at = end;
        Ok(())
    }

    fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put(&v.to_le_bytes())
    }

    fn written(&self) -> usize {
        self.at
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.at + n;
        if end > self.buf.len() {
            return Err(Error::Protocol("truncated message payload".into()));
        }
        let out = &self.buf[self.at..end];
        self.at = end;
        Ok(out)
    }

    fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn is_empty(&self) -> bool {
        self.at == self.buf.len()
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let mut buf = [0u8; MAX_FRAME];
        let n = message.encode(&mut buf).unwrap();
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
        let (kind, len) = decode_frame_header(&header).unwrap();
        assert_eq!(FRAME_HEADER_LEN + len, n);
        let decoded = Message::decode(kind, &buf[FRAME_HEADER_LEN..n]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_round_trip_all_messages() {
        round_trip(Message::RegisterRequest(RegisterRequest {
            protocol_version: PROTOCOL_VERSION,
            client_process_id: 4121,
            exception_info_address: 0x7fff_dead_beef_0010,
        }));
        round_trip(Message::RegisterResponse(RegisterResponse {
            request_dump_event_handle: 0xffff_fffe,
        }));
        round_trip(Message::CrashDumpRequest(CrashDumpRequest {
            client_process_id: 4121,
            thread_id: 4130,
            stack_pointer: 0x7ffe_0000_1000,
            exception_info_address: 0x5555_0000_2000,
            sanitization_info_address: 0,
        }));
        round_trip(Message::DumpComplete);
        round_trip(Message::DumpFailed);
        round_trip(Message::ShutdownRequest(ShutdownRequest {
            token: 0x0123_4567_89ab_cdef,
        }));
        round_trip(Message::SetPtracer(SetPtracer { pid: 77 }));
    }

    #[test]
    fn test_fields_are_little_endian_and_packed() {
        let mut buf = [0u8; MAX_FRAME];
        let n = Message::ShutdownRequest(ShutdownRequest {
            token: 0x0102_0304_0506_0708,
        })
        .encode(&mut buf)
        .unwrap();
        assert_eq!(n, 16);
        assert_eq!(&buf[..4], &MSG_SHUTDOWN_REQUEST.to_le_bytes());
        assert_eq!(&buf[4..8], &8u32.to_le_bytes());
        assert_eq!(&buf[8..16], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let payload = [0u8; 12];
        assert!(matches!(
            Message::decode(MSG_SHUTDOWN_REQUEST, &payload),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        assert!(matches!(
            Message::decode(MSG_CRASH_DUMP_REQUEST, &[0u8; 4]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(matches!(
            Message::decode(0x4242, &[]),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[4..].copy_from_slice(&(MAX_PAYLOAD + 1).to_le_bytes());
        assert!(decode_frame_header(&header).is_err());
    }

    #[test]
    fn test_exception_information_round_trip() {
        let info = ExceptionInformation {
            context_address: 0x7ffe_0000_1000,
            siginfo_address: 0x7ffe_0000_2000,
            fault_address: 0xdead_beef,
            code: -6,
            thread_id: 4130,
            signo: 11,
        };
        assert_eq!(ExceptionInformation::decode(&info.encode()), info);
        assert_eq!(
            std::mem::size_of::<ExceptionInformation>(),
            ExceptionInformation::WIRE_LEN
        );
    }

    #[test]
    fn test_sign_extension() {
        assert_eq!(sign_extend_handle(0x0000_0001), 0x1);
        assert_eq!(sign_extend_handle(0xffff_fffe), 0xffff_ffff_ffff_fffe);
        assert_eq!(sign_extend_handle(0x7fff_ffff), 0x7fff_ffff);
    }
}
