// Text wire format for the natter pub/sub protocol.
// Every frame is a CRLF-terminated control line, optionally followed by a
// payload of exactly the advertised number of bytes and a closing CRLF.
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

pub const CRLF: &[u8] = b"\r\n";
pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";

/// Widest byte count the manual encoder will produce.
pub const MAX_SIZE_DIGITS: usize = 12;

const DIGITS: &[u8; 10] = b"0123456789";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("empty control line")]
    EmptyControlLine,
    #[error("bad control line: {0:?}")]
    BadControlLine(String),
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("failed to serialize connect options")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize server info")]
    Deserialize(serde_json::Error),
}

/// Writes `len` as decimal digits into the tail of `buf` and returns the
/// written slice.
///
/// ```
/// let mut buf = [0u8; natter_wire::MAX_SIZE_DIGITS];
/// assert_eq!(natter_wire::format_size(1024, &mut buf).unwrap(), b"1024");
/// ```
pub fn format_size(len: usize, buf: &mut [u8; MAX_SIZE_DIGITS]) -> Result<&[u8]> {
    let mut i = buf.len();
    if len == 0 {
        i -= 1;
        buf[i] = DIGITS[0];
        return Ok(&buf[i..]);
    }
    let mut remaining = len;
    while remaining > 0 {
        if i == 0 {
            return Err(Error::PayloadTooLarge(len));
        }
        i -= 1;
        buf[i] = DIGITS[remaining % 10];
        remaining /= 10;
    }
    Ok(&buf[i..])
}

// A subject with whitespace would shift every following field of the frame.
pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() || subject.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err(Error::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

fn put_size(buf: &mut BytesMut, len: usize) -> Result<()> {
    let mut digits = [0u8; MAX_SIZE_DIGITS];
    buf.put_slice(format_size(len, &mut digits)?);
    Ok(())
}

/// Encodes `PUB <subject> [reply-to] <len>\r\n`. The payload and its closing
/// CRLF are written separately so large payloads are never copied.
pub fn encode_pub_header(
    buf: &mut BytesMut,
    subject: &str,
    reply: Option<&str>,
    len: usize,
) -> Result<()> {
    validate_subject(subject)?;
    if let Some(reply) = reply {
        validate_subject(reply)?;
    }
    buf.put_slice(b"PUB ");
    buf.put_slice(subject.as_bytes());
    buf.put_u8(b' ');
    if let Some(reply) = reply {
        buf.put_slice(reply.as_bytes());
        buf.put_u8(b' ');
    }
    put_size(buf, len)?;
    buf.put_slice(CRLF);
    Ok(())
}

/// Encodes a complete PUB frame, payload included.
pub fn encode_pub(
    buf: &mut BytesMut,
    subject: &str,
    reply: Option<&str>,
    payload: &[u8],
) -> Result<()> {
    encode_pub_header(buf, subject, reply, payload.len())?;
    buf.put_slice(payload);
    buf.put_slice(CRLF);
    Ok(())
}

pub fn encode_sub(buf: &mut BytesMut, subject: &str, sid: u64) -> Result<()> {
    validate_subject(subject)?;
    buf.put_slice(b"SUB ");
    buf.put_slice(subject.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(sid.to_string().as_bytes());
    buf.put_slice(CRLF);
    Ok(())
}

pub fn encode_unsub(buf: &mut BytesMut, sid: u64) {
    buf.put_slice(b"UNSUB ");
    buf.put_slice(sid.to_string().as_bytes());
    buf.put_slice(CRLF);
}

/// Encodes `MSG <subject> <sid> [reply-to] <len>\r\n` for the server side of
/// the protocol.
pub fn encode_msg_header(
    buf: &mut BytesMut,
    subject: &str,
    sid: u64,
    reply: Option<&str>,
    len: usize,
) -> Result<()> {
    validate_subject(subject)?;
    if let Some(reply) = reply {
        validate_subject(reply)?;
    }
    buf.put_slice(b"MSG ");
    buf.put_slice(subject.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(sid.to_string().as_bytes());
    buf.put_u8(b' ');
    if let Some(reply) = reply {
        buf.put_slice(reply.as_bytes());
        buf.put_u8(b' ');
    }
    put_size(buf, len)?;
    buf.put_slice(CRLF);
    Ok(())
}

/// Options sent once in the `CONNECT` handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ConnectOptions {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let json = serde_json::to_vec(self).map_err(Error::Serialize)?;
        buf.put_slice(b"CONNECT ");
        buf.put_slice(&json);
        buf.put_slice(CRLF);
        Ok(())
    }
}

/// Payload of the server `INFO` line. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub max_payload: usize,
    #[serde(default)]
    pub proto: u32,
}

impl ServerInfo {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(Error::Deserialize)
    }
}

/// Header fields of an inbound `MSG` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgArgs<'a> {
    pub subject: &'a str,
    pub sid: u64,
    pub reply: Option<&'a str>,
    pub size: usize,
}

/// Header fields of an outbound `PUB` frame, as seen by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubArgs<'a> {
    pub subject: &'a str,
    pub reply: Option<&'a str>,
    pub size: usize,
}

/// Control lines a server sends to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOp<'a> {
    Msg(MsgArgs<'a>),
    Info(&'a str),
    Ping,
    Pong,
    Ok,
    Err(&'a str),
    // Opcodes outside the protocol table are surfaced, not rejected.
    Unknown(&'a str),
}

impl<'a> ServerOp<'a> {
    /// Decodes one control line. Opcode matching is exact and case-sensitive.
    ///
    /// ```
    /// use natter_wire::ServerOp;
    ///
    /// let op = ServerOp::parse("MSG orders 7 5\r\n").expect("parse");
    /// let ServerOp::Msg(args) = op else { panic!("not a MSG") };
    /// assert_eq!((args.subject, args.sid, args.reply, args.size), ("orders", 7, None, 5));
    /// ```
    pub fn parse(line: &'a str) -> Result<Self> {
        let (op, rest) = split_op(line)?;
        match op {
            "MSG" => parse_msg_args(rest).map(ServerOp::Msg),
            "INFO" => Ok(ServerOp::Info(rest)),
            "PING" => Ok(ServerOp::Ping),
            "PONG" => Ok(ServerOp::Pong),
            "+OK" => Ok(ServerOp::Ok),
            "-ERR" => Ok(ServerOp::Err(rest)),
            other => Ok(ServerOp::Unknown(other)),
        }
    }
}

/// Control lines a client sends to a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOp<'a> {
    Connect(&'a str),
    Pub(PubArgs<'a>),
    Sub {
        subject: &'a str,
        queue: Option<&'a str>,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max_msgs: Option<u64>,
    },
    Ping,
    Pong,
    Unknown(&'a str),
}

impl<'a> ClientOp<'a> {
    pub fn parse(line: &'a str) -> Result<Self> {
        let (op, rest) = split_op(line)?;
        match op {
            "CONNECT" => Ok(ClientOp::Connect(rest)),
            "PUB" => parse_pub_args(rest).map(ClientOp::Pub),
            "SUB" => {
                let [a, b, c, d] = fields::<4>(rest);
                match (a, b, c, d) {
                    (Some(subject), Some(sid), None, None) => Ok(ClientOp::Sub {
                        subject,
                        queue: None,
                        sid: parse_num(sid, line)?,
                    }),
                    (Some(subject), Some(queue), Some(sid), None) => Ok(ClientOp::Sub {
                        subject,
                        queue: Some(queue),
                        sid: parse_num(sid, line)?,
                    }),
                    _ => Err(bad_line(line)),
                }
            }
            "UNSUB" => {
                let [a, b, c] = fields::<3>(rest);
                match (a, b, c) {
                    (Some(sid), max_msgs, None) => Ok(ClientOp::Unsub {
                        sid: parse_num(sid, line)?,
                        max_msgs: max_msgs.map(|value| parse_num(value, line)).transpose()?,
                    }),
                    _ => Err(bad_line(line)),
                }
            }
            "PING" => Ok(ClientOp::Ping),
            "PONG" => Ok(ClientOp::Pong),
            other => Ok(ClientOp::Unknown(other)),
        }
    }
}

fn split_op(line: &str) -> Result<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Err(Error::EmptyControlLine);
    }
    match line.split_once([' ', '\t']) {
        Some((op, rest)) => Ok((op, rest.trim_start_matches([' ', '\t']))),
        None => Ok((line, "")),
    }
}

// Takes up to N whitespace-separated fields; the last slot is only filled when
// the line carries more fields than any valid shape allows.
fn fields<const N: usize>(rest: &str) -> [Option<&str>; N] {
    let mut iter = rest.split_ascii_whitespace();
    std::array::from_fn(|_| iter.next())
}

fn parse_msg_args(rest: &str) -> Result<MsgArgs<'_>> {
    match fields::<5>(rest) {
        [Some(subject), Some(sid), Some(size), None, None] => Ok(MsgArgs {
            subject,
            sid: parse_num(sid, rest)?,
            reply: None,
            size: parse_num(size, rest)?,
        }),
        [Some(subject), Some(sid), Some(reply), Some(size), None] => Ok(MsgArgs {
            subject,
            sid: parse_num(sid, rest)?,
            reply: Some(reply),
            size: parse_num(size, rest)?,
        }),
        _ => Err(bad_line(rest)),
    }
}

fn parse_pub_args(rest: &str) -> Result<PubArgs<'_>> {
    match fields::<4>(rest) {
        [Some(subject), Some(size), None, None] => Ok(PubArgs {
            subject,
            reply: None,
            size: parse_num(size, rest)?,
        }),
        [Some(subject), Some(reply), Some(size), None] => Ok(PubArgs {
            subject,
            reply: Some(reply),
            size: parse_num(size, rest)?,
        }),
        _ => Err(bad_line(rest)),
    }
}

fn parse_num<T: std::str::FromStr>(field: &str, line: &str) -> Result<T> {
    field.parse::<T>().map_err(|_| bad_line(line))
}

fn bad_line(line: &str) -> Error {
    Error::BadControlLine(line.trim_end_matches(['\r', '\n']).to_string())
}
