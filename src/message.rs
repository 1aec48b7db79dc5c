//! Message envelope, addressing and payload encodings.
//!
//! A [`Message`] is the only thing that moves between components. It owns its
//! buffer, so whoever currently holds the message holds the buffer: the
//! producer gives it up at send time and gets it back with the response.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result, ReturnCode};

/// Identifies one component: which core it lives on and its instance number.
///
/// Instance 0 on each core is reserved for the host.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    pub core: u8,
    pub instance: u16,
}

impl ComponentId {
    pub const fn new(core: u8, instance: u16) -> Self {
        Self { core, instance }
    }

    /// The host endpoint on `core`.
    pub const fn client(core: u8) -> Self {
        Self { core, instance: 0 }
    }

    pub fn is_client(self) -> bool {
        self.instance == 0
    }

    /// Address of port `port` on this component.
    pub const fn port(self, port: u8) -> Address {
        Address { id: self, port }
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.core, self.instance)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A (core, component, port) triple, packed as `core << 24 | instance << 8 | port`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub id: ComponentId,
    pub port: u8,
}

impl Address {
    pub const fn new(core: u8, instance: u16, port: u8) -> Self {
        Self {
            id: ComponentId::new(core, instance),
            port,
        }
    }

    /// Host address on `core`.
    pub const fn client(core: u8) -> Self {
        Self::new(core, 0, 0)
    }

    pub const fn pack(self) -> u32 {
        ((self.id.core as u32) << 24) | ((self.id.instance as u32) << 8) | self.port as u32
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self::new((raw >> 24) as u8, (raw >> 8) as u16, raw as u8)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.id.core, self.id.instance, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

const OP_BUFFER: u16 = 0x8000;
const OP_RESPONSE: u16 = 0x4000;
const OP_INDEX: u16 = 0x003f;

/// Command selector. The wire value carries flags in its top bits; only the
/// low six bits pick the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Unregister,
    Route,
    Unroute,
    SetParam,
    GetParam,
    EmptyThisBuffer,
    FillThisBuffer,
    Flush,
    Pause,
    Resume,
    SetParamExt,
    GetParamExt,
}

impl Opcode {
    pub fn index(self) -> u16 {
        match self {
            Opcode::Unregister => 0,
            Opcode::Route => 1,
            Opcode::Unroute => 2,
            Opcode::SetParam => 5,
            Opcode::GetParam => 6,
            Opcode::EmptyThisBuffer => 7,
            Opcode::FillThisBuffer => 8,
            Opcode::Flush => 9,
            Opcode::Pause => 11,
            Opcode::Resume => 12,
            Opcode::SetParamExt => 13,
            Opcode::GetParamExt => 14,
        }
    }

    /// Whether this opcode moves a data buffer.
    pub fn carries_buffer(self) -> bool {
        matches!(
            self,
            Opcode::EmptyThisBuffer | Opcode::FillThisBuffer | Opcode::Flush
        )
    }

    /// 16-bit wire value.
    pub fn raw(self) -> u16 {
        let mut raw = self.index() | OP_RESPONSE;
        if self.carries_buffer() {
            raw |= OP_BUFFER;
        }
        raw
    }

    /// Decode a wire value. Flag bits are ignored.
    pub fn from_raw(raw: u16) -> Result<Self> {
        Ok(match raw & OP_INDEX {
            0 => Opcode::Unregister,
            1 => Opcode::Route,
            2 => Opcode::Unroute,
            5 => Opcode::SetParam,
            6 => Opcode::GetParam,
            7 => Opcode::EmptyThisBuffer,
            8 => Opcode::FillThisBuffer,
            9 => Opcode::Flush,
            11 => Opcode::Pause,
            12 => Opcode::Resume,
            13 => Opcode::SetParamExt,
            14 => Opcode::GetParamExt,
            _ => return Err(Error::InvalidOpcode(raw)),
        })
    }
}

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identity of a message.
///
/// Buffers and control messages are recognised on their way back by token,
/// never by content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Token(u64);

impl Token {
    pub fn fresh() -> Self {
        Token(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Outcome carried by a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    Failed(ReturnCode),
}

impl Status {
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }

    pub fn code(self) -> ReturnCode {
        match self {
            Status::Ok => ReturnCode::OK,
            Status::Failed(code) => code,
        }
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        Status::Failed(err.code())
    }
}

/// Stream parameters derived during runtime-init and handed downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u32,
    pub pcm_width: u32,
    /// Bytes per transfer on the producing port.
    pub length: u32,
}

impl StreamParams {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        for v in [self.sample_rate, self.channels, self.pcm_width, self.length] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut words = words(bytes);
        let mut next = || words.next().ok_or(Error::Malformed("stream params"));
        Ok(Self {
            sample_rate: next()?,
            channels: next()?,
            pcm_width: next()?,
            length: next()?,
        })
    }

    /// Bytes in one sample frame (all channels).
    pub fn frame_bytes(&self) -> usize {
        (self.channels * self.pcm_width / 8) as usize
    }
}

/// ROUTE request: where an output port sends, and how its buffer pool looks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteDesc {
    pub dst: Address,
    pub buffers: u32,
    /// Bytes per buffer. 0 lets the producer pick its own transfer size.
    pub length: u32,
    pub align: u32,
}

impl RouteDesc {
    pub fn new(dst: Address, buffers: u32) -> Self {
        Self {
            dst,
            buffers,
            length: 0,
            align: 4,
        }
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        for v in [self.dst.pack(), self.buffers, self.length, self.align] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut words = words(bytes);
        let mut next = || words.next().ok_or(Error::Malformed("route"));
        Ok(Self {
            dst: Address::from_raw(next()?),
            buffers: next()?,
            length: next()?,
            align: next()?,
        })
    }
}

fn words(bytes: &[u8]) -> impl Iterator<Item = u32> + '_ {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
}

/// Encode SET_PARAM / GET_PARAM `(id, value)` pairs.
pub fn encode_params(pairs: &[(u32, u32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pairs.len() * 8);
    for &(id, value) in pairs {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub fn decode_params(bytes: &[u8]) -> Result<Vec<(u32, u32)>> {
    if bytes.len() % 8 != 0 {
        return Err(Error::Malformed("param"));
    }
    let flat: Vec<u32> = words(bytes).collect();
    Ok(flat.chunks_exact(2).map(|p| (p[0], p[1])).collect())
}

/// Encode SET_PARAM_EXT / GET_PARAM_EXT `(id, len, bytes)` records, each
/// padded to a 4-byte boundary.
pub fn encode_params_ext(records: &[(u32, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for &(id, data) in records {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
        out.resize(out.len().next_multiple_of(4), 0);
    }
    out
}

pub fn decode_params_ext(bytes: &[u8]) -> Result<Vec<(u32, Vec<u8>)>> {
    let mut records = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < 8 {
            return Err(Error::Malformed("extended param"));
        }
        let id = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let len = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let padded = len.next_multiple_of(4);
        if rest.len() < 8 + padded {
            return Err(Error::Malformed("extended param"));
        }
        records.push((id, rest[8..8 + len].to_vec()));
        rest = &rest[8 + padded..];
    }
    Ok(records)
}

/// The command/response envelope.
pub struct Message {
    pub src: Address,
    pub dst: Address,
    pub opcode: Opcode,
    /// Valid bytes in `buffer`. A zero-length data message marks end of stream.
    pub length: usize,
    pub buffer: Vec<u8>,
    /// Set on responses only.
    pub status: Option<Status>,
    /// Set on the runtime-init handshake message.
    pub format: Option<StreamParams>,
    pub token: Token,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Message");
        d.field("op", &self.opcode)
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("len", &self.length)
            .field("cap", &self.buffer.len());
        if let Some(status) = self.status {
            d.field("status", &status);
        }
        if let Some(format) = self.format {
            d.field("format", &format);
        }
        d.field("token", &self.token.0).finish()
    }
}

impl Message {
    pub fn new(src: Address, dst: Address, opcode: Opcode, buffer: Vec<u8>) -> Self {
        Self {
            src,
            dst,
            opcode,
            length: buffer.len(),
            buffer,
            status: None,
            format: None,
            token: Token::fresh(),
        }
    }

    pub fn set_param(src: Address, dst: Address, pairs: &[(u32, u32)]) -> Self {
        Self::new(src, dst, Opcode::SetParam, encode_params(pairs))
    }

    /// Ask for parameter values; the response carries `(id, value)` pairs.
    pub fn get_param(src: Address, dst: Address, ids: &[u32]) -> Self {
        let pairs: Vec<_> = ids.iter().map(|&id| (id, 0)).collect();
        Self::new(src, dst, Opcode::GetParam, encode_params(&pairs))
    }

    pub fn set_param_ext(src: Address, dst: Address, records: &[(u32, &[u8])]) -> Self {
        Self::new(src, dst, Opcode::SetParamExt, encode_params_ext(records))
    }

    /// `records` gives each id with the capacity reserved for its value.
    pub fn get_param_ext(src: Address, dst: Address, records: &[(u32, usize)]) -> Self {
        let zeroed: Vec<(u32, Vec<u8>)> = records.iter().map(|&(id, n)| (id, vec![0; n])).collect();
        let refs: Vec<(u32, &[u8])> = zeroed.iter().map(|(id, v)| (*id, v.as_slice())).collect();
        Self::new(src, dst, Opcode::GetParamExt, encode_params_ext(&refs))
    }

    /// ROUTE addressed to the source component's output port.
    pub fn route(src: Address, output: Address, desc: RouteDesc) -> Self {
        Self::new(src, output, Opcode::Route, desc.encode())
    }

    pub fn unroute(src: Address, output: Address) -> Self {
        Self::control(src, output, Opcode::Unroute)
    }

    /// Data message. An empty `data` marks end of stream.
    pub fn empty_this_buffer(src: Address, dst: Address, data: Vec<u8>) -> Self {
        Self::new(src, dst, Opcode::EmptyThisBuffer, data)
    }

    /// Hand an empty buffer of `capacity` bytes to an unrouted output port.
    pub fn fill_this_buffer(src: Address, dst: Address, capacity: usize) -> Self {
        let mut msg = Self::new(src, dst, Opcode::FillThisBuffer, vec![0; capacity]);
        msg.length = 0;
        msg
    }

    pub fn flush(src: Address, dst: Address) -> Self {
        Self::control(src, dst, Opcode::Flush)
    }

    pub fn pause(src: Address, dst: Address) -> Self {
        Self::control(src, dst, Opcode::Pause)
    }

    pub fn resume(src: Address, dst: Address) -> Self {
        Self::control(src, dst, Opcode::Resume)
    }

    pub fn unregister(src: Address, dst: Address) -> Self {
        Self::control(src, dst, Opcode::Unregister)
    }

    /// Payload-free message with a fresh token.
    pub fn control(src: Address, dst: Address, opcode: Opcode) -> Self {
        Self::new(src, dst, opcode, Vec::new())
    }

    /// Runtime-init handshake for the peer at `dst`.
    pub fn format(src: Address, dst: Address, params: StreamParams) -> Self {
        let mut msg = Self::new(src, dst, Opcode::EmptyThisBuffer, params.encode());
        msg.format = Some(params);
        msg
    }

    /// Pool buffer owned by an output port.
    pub(crate) fn pool_buffer(src: Address, dst: Address, capacity: usize) -> Self {
        let mut msg = Self::new(src, dst, Opcode::EmptyThisBuffer, vec![0; capacity]);
        msg.length = 0;
        msg
    }

    pub fn is_response(&self) -> bool {
        self.status.is_some()
    }

    /// Zero-length data message.
    pub fn is_eos(&self) -> bool {
        self.opcode == Opcode::EmptyThisBuffer && self.length == 0 && self.format.is_none()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.length.min(self.buffer.len())]
    }

    /// Turn a request into its response: source and destination swap, the
    /// buffer and token stay.
    pub fn into_response(mut self, status: Status) -> Self {
        core::mem::swap(&mut self.src, &mut self.dst);
        self.status = Some(status);
        self
    }

    /// Turn a response back into a request travelling the original direction.
    pub(crate) fn into_request(mut self) -> Self {
        core::mem::swap(&mut self.src, &mut self.dst);
        self.status = None;
        self
    }
}
