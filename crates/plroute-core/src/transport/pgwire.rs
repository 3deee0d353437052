//! Client side of the PostgreSQL v3 wire protocol: frontend message
//! builders and a backend message parser.
//! Reference: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RemoteError, Result, RouteError};

pub const PROTOCOL_VERSION: i32 = 196_608;
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

const FORMAT_TEXT: i16 = 0;
const FORMAT_BINARY: i16 = 1;

// ---------- Backend (server → client) messages ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password,
    Sasl,
    Other(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    ParameterStatus { name: String, value: String },
    BackendKeyData { pid: i32, secret: i32 },
    /// Transaction status: 'I' idle, 'T' in transaction, 'E' failed.
    ReadyForQuery(u8),
    RowDescription(Vec<String>),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(RemoteError),
    NoticeResponse(RemoteError),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription(Vec<u32>),
    NotificationResponse,
}

/// Parses one backend message. Returns `Ok(None)` until the buffer holds a
/// complete message.
pub fn parse_backend_message(buf: &mut BytesMut) -> Result<Option<BackendMessage>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len < 4 {
        return Err(protocol(format!("invalid message length {len}")));
    }
    if buf.len() < 1 + len {
        return Ok(None);
    }
    let msg_type = buf[0];
    buf.advance(5);
    let payload = buf.split_to(len - 4).freeze();
    parse_typed_message(msg_type, payload).map(Some)
}

fn protocol(msg: impl Into<String>) -> RouteError {
    RouteError::Protocol(msg.into())
}

fn truncated(msg_type: u8) -> RouteError {
    protocol(format!("truncated '{}' message", msg_type as char))
}

fn parse_typed_message(msg_type: u8, payload: Bytes) -> Result<BackendMessage> {
    let msg = match msg_type {
        b'R' => {
            let code = read_i32(&payload, 0).ok_or_else(|| truncated(msg_type))?;
            BackendMessage::Authentication(match code {
                0 => AuthRequest::Ok,
                3 => AuthRequest::CleartextPassword,
                5 => AuthRequest::Md5Password,
                10 => AuthRequest::Sasl,
                other => AuthRequest::Other(other),
            })
        }
        b'S' => {
            let (name, offset) = read_cstring_offset(&payload, 0).ok_or_else(|| truncated(msg_type))?;
            let value = read_cstring(&payload, offset).ok_or_else(|| truncated(msg_type))?;
            BackendMessage::ParameterStatus { name, value }
        }
        b'K' => {
            let pid = read_i32(&payload, 0).ok_or_else(|| truncated(msg_type))?;
            let secret = read_i32(&payload, 4).ok_or_else(|| truncated(msg_type))?;
            BackendMessage::BackendKeyData { pid, secret }
        }
        b'Z' => BackendMessage::ReadyForQuery(*payload.first().ok_or_else(|| truncated(msg_type))?),
        b'T' => {
            let count = read_i16(&payload, 0).ok_or_else(|| truncated(msg_type))?;
            let mut pos = 2;
            let mut columns = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                let (name, offset) = read_cstring_offset(&payload, pos).ok_or_else(|| truncated(msg_type))?;
                // table oid, attnum, type oid, typlen, typmod, format
                pos = offset + 18;
                if pos > payload.len() {
                    return Err(truncated(msg_type));
                }
                columns.push(name);
            }
            BackendMessage::RowDescription(columns)
        }
        b'D' => {
            let count = read_i16(&payload, 0).ok_or_else(|| truncated(msg_type))?;
            let mut pos = 2;
            let mut values = Vec::with_capacity(count.max(0) as usize);
            for _ in 0..count {
                let len = read_i32(&payload, pos).ok_or_else(|| truncated(msg_type))?;
                pos += 4;
                if len < 0 {
                    values.push(None);
                    continue;
                }
                let len = len as usize;
                if pos + len > payload.len() {
                    return Err(truncated(msg_type));
                }
                values.push(Some(payload.slice(pos..pos + len)));
                pos += len;
            }
            BackendMessage::DataRow(values)
        }
        b'C' => BackendMessage::CommandComplete(read_cstring(&payload, 0).ok_or_else(|| truncated(msg_type))?),
        b'I' => BackendMessage::EmptyQueryResponse,
        b'E' => BackendMessage::ErrorResponse(parse_error_fields(&payload)),
        b'N' => BackendMessage::NoticeResponse(parse_error_fields(&payload)),
        b'1' => BackendMessage::ParseComplete,
        b'2' => BackendMessage::BindComplete,
        b'3' => BackendMessage::CloseComplete,
        b'n' => BackendMessage::NoData,
        b's' => BackendMessage::PortalSuspended,
        b't' => {
            let count = read_i16(&payload, 0).ok_or_else(|| truncated(msg_type))?;
            let mut types = Vec::with_capacity(count.max(0) as usize);
            for i in 0..count.max(0) as usize {
                types.push(read_u32(&payload, 2 + i * 4).ok_or_else(|| truncated(msg_type))?);
            }
            BackendMessage::ParameterDescription(types)
        }
        b'A' => BackendMessage::NotificationResponse,
        other => {
            return Err(protocol(format!(
                "unexpected message type '{}'",
                other as char
            )))
        }
    };
    Ok(msg)
}

fn parse_error_fields(payload: &[u8]) -> RemoteError {
    let mut err = RemoteError::default();
    let mut pos = 0;
    while let Some(&field) = payload.get(pos) {
        if field == 0 {
            break;
        }
        let Some((value, next)) = read_cstring_offset(payload, pos + 1) else {
            break;
        };
        match field {
            b'C' => err.code = Some(value),
            b'M' => err.message = value,
            b'D' => err.detail = Some(value),
            b'H' => err.hint = Some(value),
            b'W' => err.context = Some(value),
            _ => {}
        }
        pos = next;
    }
    err
}

// ---------- Frontend (client → server) message builders ----------

/// Write a StartupMessage.
pub fn startup(buf: &mut BytesMut, params: &[(&str, &str)]) {
    let mut body = BytesMut::new();
    body.put_i32(PROTOCOL_VERSION);
    for (key, value) in params {
        put_cstring(&mut body, key);
        put_cstring(&mut body, value);
    }
    body.put_u8(0);
    buf.put_i32(4 + body.len() as i32);
    buf.extend_from_slice(&body);
}

/// Write a PasswordMessage.
pub fn password(buf: &mut BytesMut, password: &str) {
    buf.put_u8(b'p');
    buf.put_i32(4 + password.len() as i32 + 1);
    put_cstring(buf, password);
}

/// Write a simple Query message.
pub fn query(buf: &mut BytesMut, sql: &str) {
    buf.put_u8(b'Q');
    buf.put_i32(4 + sql.len() as i32 + 1);
    put_cstring(buf, sql);
}

/// Write a Parse message for the unnamed statement.
pub fn parse(buf: &mut BytesMut, sql: &str, param_types: &[u32]) {
    let mut body = BytesMut::new();
    put_cstring(&mut body, "");
    put_cstring(&mut body, sql);
    body.put_i16(param_types.len() as i16);
    for oid in param_types {
        body.put_u32(*oid);
    }
    put_message(buf, b'P', &body);
}

/// Write a Bind message for the unnamed portal. One format code covers all
/// parameters and one covers all result columns.
pub fn bind(buf: &mut BytesMut, params: &[Option<Bytes>], binary: bool) {
    let format = if binary { FORMAT_BINARY } else { FORMAT_TEXT };
    let mut body = BytesMut::new();
    put_cstring(&mut body, "");
    put_cstring(&mut body, "");
    body.put_i16(1);
    body.put_i16(format);
    body.put_i16(params.len() as i16);
    for param in params {
        match param {
            Some(value) => {
                body.put_i32(value.len() as i32);
                body.extend_from_slice(value);
            }
            None => body.put_i32(-1),
        }
    }
    body.put_i16(1);
    body.put_i16(format);
    put_message(buf, b'B', &body);
}

/// Write a Describe message for the unnamed portal.
pub fn describe_portal(buf: &mut BytesMut) {
    put_message(buf, b'D', &[b'P', 0]);
}

/// Write an Execute message fetching all rows of the unnamed portal.
pub fn execute(buf: &mut BytesMut) {
    let mut body = BytesMut::new();
    put_cstring(&mut body, "");
    body.put_i32(0);
    put_message(buf, b'E', &body);
}

pub fn sync(buf: &mut BytesMut) {
    put_message(buf, b'S', &[]);
}

pub fn terminate(buf: &mut BytesMut) {
    put_message(buf, b'X', &[]);
}

/// Write a CancelRequest, sent on its own connection.
pub fn cancel_request(buf: &mut BytesMut, pid: i32, secret: i32) {
    buf.put_i32(16);
    buf.put_i32(CANCEL_REQUEST_CODE);
    buf.put_i32(pid);
    buf.put_i32(secret);
}

/// Parse, Bind, Describe, Execute and Sync for one parameterized statement.
pub fn extended_query(buf: &mut BytesMut, sql: &str, param_types: &[u32], params: &[Option<Bytes>], binary: bool) {
    parse(buf, sql, param_types);
    bind(buf, params, binary);
    describe_portal(buf);
    execute(buf);
    sync(buf);
}

// ---------- Helpers ----------

fn put_message(buf: &mut BytesMut, msg_type: u8, body: &[u8]) {
    buf.put_u8(msg_type);
    buf.put_i32(4 + body.len() as i32);
    buf.extend_from_slice(body);
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

fn read_cstring(data: &[u8], offset: usize) -> Option<String> {
    read_cstring_offset(data, offset).map(|(s, _)| s)
}

fn read_cstring_offset(data: &[u8], offset: usize) -> Option<(String, usize)> {
    let nul_pos = data.get(offset..)?.iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&data[offset..offset + nul_pos]).to_string();
    Some((s, offset + nul_pos + 1))
}

fn read_i16(data: &[u8], offset: usize) -> Option<i16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(i16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_i32(data: &[u8], offset: usize) -> Option<i32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    read_i32(data, offset).map(|v| v as u32)
}
