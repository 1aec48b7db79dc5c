//! Vendor codec adapter ABI.
//!
//! Every processing unit drives its vendor codec through one entry point:
//! `(handle, command, index, value)`. The vendor never owns memory; the
//! component allocates what the vendor asks for and lends it back on every
//! processing call through [`CodecIo`].

use core::fmt;

use itertools::{Either, Itertools};
use tracing::{trace, warn};

use crate::error::{Error, Result, ReturnCode};

/// Phase selector for [`ApiCmd::Init`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitPhase {
    /// Load default configuration.
    PreConfigParams,
    /// Static configuration is complete; memory requirements are now fixed.
    PostConfigParams,
    /// One runtime-init step (may consume input).
    Process,
    /// Query whether runtime-init has finished.
    DoneQuery,
}

/// Phase selector for [`ApiCmd::Execute`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecPhase {
    Execute,
    DoneQuery,
}

/// Vendor command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiCmd {
    GetApiSize,
    Init(InitPhase),
    SetConfigParam,
    GetConfigParam,
    GetMemtabsSize,
    SetMemtabsPtr,
    GetNMemtabs,
    GetMemInfoSize,
    GetMemInfoAlignment,
    GetMemInfoType,
    SetMemPtr,
    Execute(ExecPhase),
    SetInputBytes,
    GetOutputBytes,
    GetCurIdxInputBuf,
    InputOver,
}

/// Kind of a memory block requested by the vendor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemType {
    Persist,
    Scratch,
    Input,
    Output,
    Table,
}

impl MemType {
    pub fn raw(self) -> u32 {
        match self {
            MemType::Persist => 0,
            MemType::Scratch => 1,
            MemType::Input => 2,
            MemType::Output => 3,
            MemType::Table => 4,
        }
    }

    pub fn from_raw(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => MemType::Persist,
            1 => MemType::Scratch,
            2 => MemType::Input,
            3 => MemType::Output,
            4 => MemType::Table,
            _ => {
                return Err(Error::Adapter {
                    cmd: ApiCmd::GetMemInfoType,
                    code: ReturnCode::API_INVALID_CMD_TYPE,
                })
            }
        })
    }

    fn name(self) -> &'static str {
        match self {
            MemType::Persist => "persistent",
            MemType::Scratch => "scratch",
            MemType::Input => "input",
            MemType::Output => "output",
            MemType::Table => "table",
        }
    }
}

/// Standard configuration parameter ids understood by the reference codecs
/// and by the runtime-init handshake.
pub mod param {
    pub const CHANNELS: u32 = 0;
    pub const SAMPLE_RATE: u32 = 1;
    pub const PCM_WIDTH: u32 = 2;
    /// Samples per channel in one processing frame.
    pub const FRAME_SAMPLES: u32 = 3;
    pub const INPUTS: u32 = 4;
    pub const OUTPUTS: u32 = 5;
    /// Frames to capture before end of stream. 0 means unbounded.
    pub const SAMPLE_END: u32 = 6;
    /// First presentation timestamp of a mixer track, `TRACK_START + track`.
    /// Handled by the mixer itself, never forwarded to the vendor.
    pub const TRACK_START: u32 = 0x100;
}

/// One memory block owned by a component on behalf of its vendor codec.
pub struct MemBlock {
    pub kind: MemType,
    pub align: usize,
    pub size: usize,
    /// Empty for scratch blocks, which borrow the core scratch arena per call.
    pub data: Vec<u8>,
}

impl fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBlock")
            .field("kind", &self.kind)
            .field("align", &self.align)
            .field("size", &self.size)
            .finish()
    }
}

/// Buffers lent to the vendor for one processing call.
pub struct CodecIo<'a> {
    pub blocks: &'a mut [MemBlock],
    pub scratch: &'a mut [u8],
    /// Input 0 taken straight from a port buffer (bypass mode).
    pub direct: Option<&'a mut [u8]>,
}

impl<'a> CodecIo<'a> {
    /// Split into input and output slices, each in memtab order.
    pub fn split(&mut self) -> (Vec<&mut [u8]>, Vec<&mut [u8]>) {
        let (mut inputs, outputs): (Vec<&mut [u8]>, Vec<&mut [u8]>) = self
            .blocks
            .iter_mut()
            .filter(|b| matches!(b.kind, MemType::Input | MemType::Output))
            .partition_map(|b| match b.kind {
                MemType::Input => Either::Left(b.data.as_mut_slice()),
                _ => Either::Right(b.data.as_mut_slice()),
            });
        if let (Some(direct), Some(first)) = (self.direct.as_deref_mut(), inputs.first_mut()) {
            *first = direct;
        }
        (inputs, outputs)
    }

    /// The `n`th block of `kind`.
    pub fn block(&mut self, kind: MemType, n: usize) -> Option<&mut [u8]> {
        self.blocks
            .iter_mut()
            .filter(|b| b.kind == kind)
            .nth(n)
            .map(|b| b.data.as_mut_slice())
    }
}

/// Value argument of a vendor call.
pub enum ApiValue<'a> {
    None,
    Int(&'a mut u32),
    Bytes(&'a mut [u8]),
    Io(CodecIo<'a>),
}

impl ApiValue<'_> {
    /// Write `v` through an integer out-parameter.
    ///
    /// A byte buffer of at least four bytes receives the value little-endian.
    pub fn put(&mut self, v: u32) -> ReturnCode {
        match self {
            ApiValue::Int(out) => {
                **out = v;
                ReturnCode::OK
            }
            ApiValue::Bytes(b) if b.len() >= 4 => {
                b[..4].copy_from_slice(&v.to_le_bytes());
                ReturnCode::OK
            }
            _ => ReturnCode::API_INVALID_CMD_TYPE,
        }
    }

    /// Read an integer in-parameter. Exactly four bytes read as little-endian.
    pub fn get(&self) -> Option<u32> {
        match self {
            ApiValue::Int(v) => Some(**v),
            ApiValue::Bytes(b) if b.len() == 4 => Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            _ => None,
        }
    }
}

/// A vendor codec implemented in Rust.
pub trait CodecApi: Send {
    fn call(&mut self, cmd: ApiCmd, idx: u32, value: ApiValue<'_>) -> ReturnCode;
}

/// A bare vendor entry point. All of its state lives in `handle`, which the
/// component sizes from `GET_API_SIZE`.
pub type RawEntry = fn(handle: &mut [u8], cmd: ApiCmd, idx: u32, value: ApiValue<'_>) -> ReturnCode;

/// The vendor side of a component, raw or typed, behind one call surface.
pub enum Adapter {
    Raw { entry: RawEntry, handle: Vec<u8> },
    Typed(Box<dyn CodecApi>),
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adapter::Raw { handle, .. } => write!(f, "Adapter::Raw({} byte handle)", handle.len()),
            Adapter::Typed(_) => f.write_str("Adapter::Typed"),
        }
    }
}

impl Adapter {
    pub fn raw(entry: RawEntry) -> Self {
        Adapter::Raw {
            entry,
            handle: Vec::new(),
        }
    }

    pub fn typed(api: impl CodecApi + 'static) -> Self {
        Adapter::Typed(Box::new(api))
    }

    /// Issue one vendor command.
    ///
    /// Fatal codes become [`Error::Adapter`]. Non-fatal codes are logged and
    /// handed back for the caller to interpret.
    pub fn call(&mut self, cmd: ApiCmd, idx: u32, value: ApiValue<'_>) -> Result<ReturnCode> {
        let code = match self {
            Adapter::Raw { entry, handle } => entry(handle, cmd, idx, value),
            Adapter::Typed(api) => api.call(cmd, idx, value),
        };
        if code.is_fatal() {
            return Err(Error::Adapter { cmd, code });
        }
        if !code.is_ok() {
            if code == ReturnCode::EXEC_NO_DATA || code == ReturnCode::EXEC_NO_OUTPUT {
                trace!(?cmd, idx, ?code, "vendor has nothing to do");
            } else {
                warn!(?cmd, idx, ?code, "non-fatal vendor code");
            }
        }
        Ok(code)
    }

    /// Issue a command whose result is an integer.
    pub fn query(&mut self, cmd: ApiCmd, idx: u32) -> Result<u32> {
        let mut v = 0;
        self.call(cmd, idx, ApiValue::Int(&mut v))?;
        Ok(v)
    }

    /// Issue a command taking an integer argument.
    pub fn command(&mut self, cmd: ApiCmd, idx: u32, mut v: u32) -> Result<ReturnCode> {
        self.call(cmd, idx, ApiValue::Int(&mut v))
    }

    pub fn set_config(&mut self, id: u32, value: u32) -> Result<()> {
        self.command(ApiCmd::SetConfigParam, id, value).map(drop)
    }

    pub fn get_config(&mut self, id: u32) -> Result<u32> {
        self.query(ApiCmd::GetConfigParam, id)
    }

    /// Size the raw handle. Typed adapters own their state already.
    pub(crate) fn allocate_handle(&mut self, size: usize) {
        if let Adapter::Raw { handle, .. } = self {
            handle.clear();
            handle.resize(size, 0);
        }
    }

    pub(crate) fn release(&mut self) {
        if let Adapter::Raw { handle, .. } = self {
            *handle = Vec::new();
        }
    }
}

/// The memory a component holds for its vendor codec.
#[derive(Debug, Default)]
pub struct MemoryTable {
    table: Vec<u8>,
    blocks: Vec<MemBlock>,
    scratch_size: usize,
}

impl MemoryTable {
    /// Ask the vendor for its memory layout and allocate every block.
    ///
    /// Scratch requests are checked against `scratch_limit` and borrowed from
    /// the core arena per call instead of being allocated.
    pub fn allocate(adapter: &mut Adapter, scratch_limit: usize) -> Result<Self> {
        let table_size = adapter.query(ApiCmd::GetMemtabsSize, 0)? as usize;
        let mut table = vec![0u8; table_size];
        adapter.call(ApiCmd::SetMemtabsPtr, 0, ApiValue::Bytes(&mut table))?;

        let count = adapter.query(ApiCmd::GetNMemtabs, 0)?;
        let mut blocks = Vec::with_capacity(count as usize);
        let mut scratch_size = 0;
        for idx in 0..count {
            let size = adapter.query(ApiCmd::GetMemInfoSize, idx)? as usize;
            let align = adapter.query(ApiCmd::GetMemInfoAlignment, idx)? as usize;
            let kind = MemType::from_raw(adapter.query(ApiCmd::GetMemInfoType, idx)?)?;
            if !align.is_power_of_two() {
                return Err(Error::BadAlignment(align));
            }

            let data = if kind == MemType::Scratch {
                if size > scratch_limit {
                    return Err(Error::OutOfMemory {
                        what: kind.name(),
                        size,
                    });
                }
                scratch_size = scratch_size.max(size);
                Vec::new()
            } else {
                let mut data = vec![0u8; size];
                adapter.call(ApiCmd::SetMemPtr, idx, ApiValue::Bytes(&mut data))?;
                data
            };
            trace!(idx, ?kind, size, align, "memtab");
            blocks.push(MemBlock {
                kind,
                align,
                size,
                data,
            });
        }

        Ok(Self {
            table,
            blocks,
            scratch_size,
        })
    }

    /// Re-read input/output sizes after configuration changed. Blocks only
    /// grow, so buffered bytes are kept.
    pub fn refresh(&mut self, adapter: &mut Adapter) -> Result<()> {
        for (idx, block) in self.blocks.iter_mut().enumerate() {
            if !matches!(block.kind, MemType::Input | MemType::Output) {
                continue;
            }
            let size = adapter.query(ApiCmd::GetMemInfoSize, idx as u32)? as usize;
            if size > block.data.len() {
                block.data.resize(size, 0);
                adapter.call(ApiCmd::SetMemPtr, idx as u32, ApiValue::Bytes(&mut block.data))?;
            }
            block.size = size;
        }
        Ok(())
    }

    pub fn blocks(&self) -> &[MemBlock] {
        &self.blocks
    }

    pub fn block(&self, kind: MemType, n: usize) -> Option<&MemBlock> {
        self.blocks.iter().filter(|b| b.kind == kind).nth(n)
    }

    pub fn block_mut(&mut self, kind: MemType, n: usize) -> Option<&mut MemBlock> {
        self.blocks.iter_mut().filter(|b| b.kind == kind).nth(n)
    }

    pub fn scratch_size(&self) -> usize {
        self.scratch_size
    }

    /// Bytes held, excluding borrowed scratch.
    pub fn allocated(&self) -> usize {
        self.table.len() + self.blocks.iter().map(|b| b.data.len()).sum::<usize>()
    }

    /// Lend everything to the vendor for one call.
    pub fn io<'a>(&'a mut self, scratch: &'a mut [u8], direct: Option<&'a mut [u8]>) -> CodecIo<'a> {
        let n = self.scratch_size.min(scratch.len());
        CodecIo {
            blocks: &mut self.blocks,
            scratch: &mut scratch[..n],
            direct,
        }
    }

    pub fn release(&mut self) {
        self.table = Vec::new();
        self.blocks.clear();
        self.scratch_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::PcmCopy;

    #[test]
    fn split_orders_inputs_and_outputs() {
        let mut blocks = vec![
            MemBlock { kind: MemType::Persist, align: 4, size: 2, data: vec![9; 2] },
            MemBlock { kind: MemType::Input, align: 4, size: 2, data: vec![1; 2] },
            MemBlock { kind: MemType::Output, align: 4, size: 2, data: vec![2; 2] },
            MemBlock { kind: MemType::Input, align: 4, size: 2, data: vec![3; 2] },
        ];
        let mut scratch: [u8; 0] = [];
        let mut io = CodecIo { blocks: &mut blocks, scratch: &mut scratch, direct: None };
        let (inputs, outputs) = io.split();
        assert_eq!(inputs.len(), 2);
        assert_eq!(outputs.len(), 1);
        assert_eq!(inputs[1][0], 3);
        assert_eq!(outputs[0][0], 2);
    }

    #[test]
    fn direct_input_overrides_first_block() {
        let mut blocks = vec![MemBlock { kind: MemType::Input, align: 4, size: 2, data: vec![1; 2] }];
        let mut direct = [7u8; 5];
        let mut scratch: [u8; 0] = [];
        let mut io = CodecIo { blocks: &mut blocks, scratch: &mut scratch, direct: Some(&mut direct) };
        let (inputs, _) = io.split();
        assert_eq!(inputs[0].len(), 5);
        assert_eq!(inputs[0][0], 7);
    }

    #[test]
    fn allocation_follows_vendor_memtabs() {
        let mut adapter = Adapter::typed(PcmCopy::default());
        adapter.call(ApiCmd::Init(InitPhase::PreConfigParams), 0, ApiValue::None).unwrap();
        adapter.call(ApiCmd::Init(InitPhase::PostConfigParams), 0, ApiValue::None).unwrap();
        let memory = MemoryTable::allocate(&mut adapter, 16 * 1024).unwrap();
        assert!(memory.block(MemType::Persist, 0).is_some());
        assert!(memory.block(MemType::Input, 0).is_some());
        assert!(memory.block(MemType::Output, 0).is_some());
        assert!(memory.scratch_size() > 0);
        assert!(memory.block(MemType::Scratch, 0).unwrap().data.is_empty());
    }

    #[test]
    fn oversized_scratch_is_rejected() {
        let mut adapter = Adapter::typed(PcmCopy::default());
        adapter.call(ApiCmd::Init(InitPhase::PostConfigParams), 0, ApiValue::None).unwrap();
        let err = MemoryTable::allocate(&mut adapter, 1).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { what: "scratch", .. }));
    }

    #[test]
    fn fatal_vendor_code_becomes_error() {
        let mut adapter = Adapter::typed(PcmCopy::default());
        let err = adapter.set_config(param::CHANNELS, 0).unwrap_err();
        match err {
            Error::Adapter { cmd, code } => {
                assert_eq!(cmd, ApiCmd::SetConfigParam);
                assert_eq!(code, ReturnCode::CONFIG_INVALID_PARAM);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
