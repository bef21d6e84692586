//! Binary protocol between the execution coordinator and the sandboxer
//! sidecar, carried over a Unix domain socket.
//!
//! ## Wire Format
//!
//! ```text
//! [4-byte length][1-byte type][4-byte seq][payload]
//! ```
//!
//! - **length**: big-endian u32, size of (type + seq + payload)
//! - **type**: u8 message type
//! - **seq**: big-endian u32, sequence number (0 for unsolicited messages)
//! - **payload**: type-specific binary data
//!
//! ## Message Types
//!
//! | Type | Direction | Name               | Payload |
//! |------|-----------|--------------------|---------|
//! | 0x00 | S→C       | ready              | (empty) |
//! | 0x01 | C→S       | ping               | (empty) |
//! | 0x02 | S→C       | pong               | (empty) |
//! | 0x03 | C→S       | materialize        | `[16B sandbox_id][4B file_count]{[2B path_len][path][1B flags][4B content_len][content]}*` |
//! | 0x04 | S→C       | materialize_result | `[1B success][32B fingerprint][2B error_len][error]` |
//! | 0x05 | C→S       | discard            | `[16B sandbox_id]` |
//! | 0x06 | S→C       | discard_result     | `[1B success][2B error_len][error]` |
//! | 0x0A | C→S       | shutdown           | (empty) |
//! | 0x0B | S→C       | shutdown_ack       | (empty) |
//! | 0xFF | S→C       | error              | `[2B error_len][error]` |

/// Header size (4-byte length prefix).
pub const HEADER_SIZE: usize = 4;

/// Maximum message body size (64 MB — input file sets can be large).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Minimum body size: type (1) + seq (4).
pub const MIN_BODY_SIZE: usize = 5;

/// Size of a raw sandbox id on the wire.
pub const SANDBOX_ID_SIZE: usize = 16;

/// Size of a raw content fingerprint on the wire (SHA-256).
pub const FINGERPRINT_SIZE: usize = 32;

// Message type constants.
pub const MSG_READY: u8 = 0x00;
pub const MSG_PING: u8 = 0x01;
pub const MSG_PONG: u8 = 0x02;
pub const MSG_MATERIALIZE: u8 = 0x03;
pub const MSG_MATERIALIZE_RESULT: u8 = 0x04;
pub const MSG_DISCARD: u8 = 0x05;
pub const MSG_DISCARD_RESULT: u8 = 0x06;
pub const MSG_SHUTDOWN: u8 = 0x0A;
pub const MSG_SHUTDOWN_ACK: u8 = 0x0B;
pub const MSG_ERROR: u8 = 0xFF;

/// File entry flag: set the executable bit after writing.
pub const FLAG_EXECUTABLE: u8 = 0x01;

/// Protocol error.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    MessageTooLarge(usize),
    MessageTooSmall(usize),
    InvalidPayload(&'static str),
    PayloadTooLarge(&'static str, usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge(size) => write!(f, "message too large: {size}"),
            Self::MessageTooSmall(size) => write!(f, "message too small: {size}"),
            Self::InvalidPayload(msg) => write!(f, "invalid payload: {msg}"),
            Self::PayloadTooLarge(field, size) => {
                write!(f, "payload field too large: {field} ({size} bytes)")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// One declared input file as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFrame<'a> {
    /// Sandbox-relative destination path.
    pub path: &'a str,
    pub contents: &'a [u8],
    pub executable: bool,
}

/// Read a `u8` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u8_at(data: &[u8], offset: usize) -> Option<u8> {
    data.get(offset).copied()
}

/// Read a `u16` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes: [u8; 2] = data.get(offset..offset + 2)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

/// Read a `u32` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// A raw decoded message.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub msg_type: u8,
    pub seq: u32,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a raw message: `[4-byte length][1-byte type][4-byte seq][payload]`.
pub fn encode(msg_type: u8, seq: u32, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let body_len = 1 + 4 + payload.len();
    if body_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body_len));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.push(msg_type);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encode materialize payload:
/// `[16B sandbox_id][4B file_count]{[2B path_len][path][1B flags][4B content_len][content]}*`.
///
/// Returns `Err` if any path exceeds 65535 bytes (u16 field limit).
/// Total message size is validated by [`encode`].
pub fn encode_materialize(
    sandbox_id: &[u8; SANDBOX_ID_SIZE],
    files: &[FileFrame<'_>],
) -> Result<Vec<u8>, ProtocolError> {
    let mut p = Vec::with_capacity(
        SANDBOX_ID_SIZE + 4 + files.iter().map(|f| 7 + f.path.len() + f.contents.len()).sum::<usize>(),
    );
    p.extend_from_slice(sandbox_id);
    p.extend_from_slice(&(files.len() as u32).to_be_bytes());
    for file in files {
        let path_bytes = file.path.as_bytes();
        if path_bytes.len() > u16::MAX as usize {
            return Err(ProtocolError::PayloadTooLarge("path", path_bytes.len()));
        }
        p.extend_from_slice(&(path_bytes.len() as u16).to_be_bytes());
        p.extend_from_slice(path_bytes);
        p.push(if file.executable { FLAG_EXECUTABLE } else { 0 });
        p.extend_from_slice(&(file.contents.len() as u32).to_be_bytes());
        p.extend_from_slice(file.contents);
    }
    Ok(p)
}

/// Encode materialize_result payload: `[1B success][32B fingerprint][2B error_len][error]`.
///
/// Fingerprint is all zeroes on failure. Error message is truncated to
/// 65535 bytes if longer.
pub fn encode_materialize_result(
    success: bool,
    fingerprint: &[u8; FINGERPRINT_SIZE],
    error: &str,
) -> Vec<u8> {
    let err = error.as_bytes();
    let err_len = err.len().min(u16::MAX as usize) as u16;
    let mut p = Vec::with_capacity(1 + FINGERPRINT_SIZE + 2 + err_len as usize);
    p.push(u8::from(success));
    p.extend_from_slice(fingerprint);
    p.extend_from_slice(&err_len.to_be_bytes());
    // err_len <= err.len() is guaranteed by .min() above
    p.extend_from_slice(err.get(..err_len as usize).unwrap_or(err));
    p
}

/// Encode discard payload: `[16B sandbox_id]`.
pub fn encode_discard(sandbox_id: &[u8; SANDBOX_ID_SIZE]) -> Vec<u8> {
    sandbox_id.to_vec()
}

/// Encode discard_result payload: `[1B success][2B error_len][error]`.
///
/// Error message is truncated to 65535 bytes if longer.
pub fn encode_discard_result(success: bool, error: &str) -> Vec<u8> {
    let err = error.as_bytes();
    let err_len = err.len().min(u16::MAX as usize) as u16;
    let mut p = Vec::with_capacity(3 + err_len as usize);
    p.push(u8::from(success));
    p.extend_from_slice(&err_len.to_be_bytes());
    // err_len <= err.len() is guaranteed by .min() above
    p.extend_from_slice(err.get(..err_len as usize).unwrap_or(err));
    p
}

/// Encode error payload: `[2B error_len][error]`.
///
/// Error message is truncated to 65535 bytes if longer.
pub fn encode_error(message: &str) -> Vec<u8> {
    let msg = message.as_bytes();
    let msg_len = msg.len().min(u16::MAX as usize) as u16;
    let mut p = Vec::with_capacity(2 + msg_len as usize);
    p.extend_from_slice(&msg_len.to_be_bytes());
    // msg_len <= msg.len() is guaranteed by .min() above
    p.extend_from_slice(msg.get(..msg_len as usize).unwrap_or(msg));
    p
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

fn read_sandbox_id(payload: &[u8]) -> Result<[u8; SANDBOX_ID_SIZE], ProtocolError> {
    payload
        .get(..SANDBOX_ID_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtocolError::InvalidPayload("sandbox id truncated"))
}

/// Decode materialize payload. Returns `(sandbox_id, files)`.
pub fn decode_materialize(
    payload: &[u8],
) -> Result<([u8; SANDBOX_ID_SIZE], Vec<FileFrame<'_>>), ProtocolError> {
    let sandbox_id = read_sandbox_id(payload)?;
    let count = read_u32_at(payload, SANDBOX_ID_SIZE)
        .ok_or(ProtocolError::InvalidPayload("materialize too short"))? as usize;

    let mut files = Vec::with_capacity(count.min(1024));
    let mut offset = SANDBOX_ID_SIZE + 4;
    for _ in 0..count {
        let path_len = read_u16_at(payload, offset)
            .ok_or(ProtocolError::InvalidPayload("materialize entry truncated"))?
            as usize;
        offset += 2;
        let path = std::str::from_utf8(
            payload
                .get(offset..offset + path_len)
                .ok_or(ProtocolError::InvalidPayload("materialize path truncated"))?,
        )
        .map_err(|_| ProtocolError::InvalidPayload("invalid UTF-8 in path"))?;
        offset += path_len;
        let flags = read_u8_at(payload, offset)
            .ok_or(ProtocolError::InvalidPayload("materialize entry truncated"))?;
        offset += 1;
        let content_len = read_u32_at(payload, offset)
            .ok_or(ProtocolError::InvalidPayload("materialize entry truncated"))?
            as usize;
        offset += 4;
        let contents = payload
            .get(offset..offset + content_len)
            .ok_or(ProtocolError::InvalidPayload(
                "materialize contents truncated",
            ))?;
        offset += content_len;
        files.push(FileFrame {
            path,
            contents,
            executable: (flags & FLAG_EXECUTABLE) != 0,
        });
    }
    Ok((sandbox_id, files))
}

/// Decoded materialize_result fields: `(success, fingerprint, error)`.
pub type MaterializeResult<'a> = (bool, [u8; FINGERPRINT_SIZE], &'a str);

/// Decode materialize_result payload. Returns `(success, fingerprint, error)`.
pub fn decode_materialize_result(payload: &[u8]) -> Result<MaterializeResult<'_>, ProtocolError> {
    let success = read_u8_at(payload, 0)
        .ok_or(ProtocolError::InvalidPayload("materialize_result too short"))?
        == 1;
    let fingerprint: [u8; FINGERPRINT_SIZE] = payload
        .get(1..1 + FINGERPRINT_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtocolError::InvalidPayload(
            "materialize_result fingerprint truncated",
        ))?;
    let err_off = 1 + FINGERPRINT_SIZE;
    let err_len = read_u16_at(payload, err_off)
        .ok_or(ProtocolError::InvalidPayload("materialize_result too short"))?
        as usize;
    let error = std::str::from_utf8(payload.get(err_off + 2..err_off + 2 + err_len).ok_or(
        ProtocolError::InvalidPayload("materialize_result error truncated"),
    )?)
    .map_err(|_| ProtocolError::InvalidPayload("invalid UTF-8 in error"))?;
    Ok((success, fingerprint, error))
}

/// Decode discard payload. Returns the sandbox id.
pub fn decode_discard(payload: &[u8]) -> Result<[u8; SANDBOX_ID_SIZE], ProtocolError> {
    read_sandbox_id(payload)
}

/// Decode discard_result payload. Returns `(success, error)`.
pub fn decode_discard_result(payload: &[u8]) -> Result<(bool, &str), ProtocolError> {
    let success = read_u8_at(payload, 0)
        .ok_or(ProtocolError::InvalidPayload("discard_result too short"))?
        == 1;
    let err_len = read_u16_at(payload, 1)
        .ok_or(ProtocolError::InvalidPayload("discard_result too short"))? as usize;
    let error = std::str::from_utf8(
        payload
            .get(3..3 + err_len)
            .ok_or(ProtocolError::InvalidPayload("discard_result error truncated"))?,
    )
    .map_err(|_| ProtocolError::InvalidPayload("invalid UTF-8 in error"))?;
    Ok((success, error))
}

/// Decode error payload. Returns the error message.
pub fn decode_error(payload: &[u8]) -> Result<&str, ProtocolError> {
    let msg_len = read_u16_at(payload, 0)
        .ok_or(ProtocolError::InvalidPayload("error payload too short"))? as usize;
    std::str::from_utf8(
        payload
            .get(2..2 + msg_len)
            .ok_or(ProtocolError::InvalidPayload("error message truncated"))?,
    )
    .map_err(|_| ProtocolError::InvalidPayload("invalid UTF-8 in error"))
}

// ---------------------------------------------------------------------------
// Decoder (buffered, handles partial reads)
// ---------------------------------------------------------------------------

/// Buffered message decoder for streaming data.
#[derive(Debug)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
        }
    }

    /// Feed data and extract complete messages.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<RawMessage>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut messages = Vec::new();
        let mut offset = 0;

        while offset + HEADER_SIZE <= self.buf.len() {
            let length = match read_u32_at(&self.buf, offset) {
                Some(v) => v as usize,
                None => break,
            };

            if length > MAX_MESSAGE_SIZE {
                self.buf.clear();
                return Err(ProtocolError::MessageTooLarge(length));
            }
            if length < MIN_BODY_SIZE {
                self.buf.clear();
                return Err(ProtocolError::MessageTooSmall(length));
            }

            let total = HEADER_SIZE + length;
            if offset + total > self.buf.len() {
                break;
            }

            let msg_type = match read_u8_at(&self.buf, offset + HEADER_SIZE) {
                Some(v) => v,
                None => break,
            };
            let seq = match read_u32_at(&self.buf, offset + HEADER_SIZE + 1) {
                Some(v) => v,
                None => break,
            };
            let payload = self
                .buf
                .get(offset + HEADER_SIZE + MIN_BODY_SIZE..offset + total)
                .unwrap_or_default()
                .to_vec();

            messages.push(RawMessage {
                msg_type,
                seq,
                payload,
            });
            offset += total;
        }

        // Compact: remove consumed bytes once at the end
        if offset > 0 {
            self.buf.drain(..offset);
        }

        Ok(messages)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
