use tracing::trace;

use super::{answer_memory, Memtab, PcmFormat};
use crate::adapter::{ApiCmd, ApiValue, CodecApi, ExecPhase, InitPhase, MemType};
use crate::error::ReturnCode;

const PERSIST_BYTES: usize = 64;
const SCRATCH_BYTES: usize = 256;
const MAGIC: u32 = u32::from_le_bytes(*b"PCMC");

/// Single-in, single-out PCM passthrough.
///
/// Copies whatever input it is given to its output block, one frame at most
/// per call. Its persistent block holds a checksummed copy of the format,
/// checked before every execute.
#[derive(Debug, Default)]
pub struct PcmCopy {
    format: PcmFormat,
    init_done: bool,
    input_bytes: u32,
    consumed: u32,
    produced: u32,
    input_over: bool,
    done: bool,
}

impl PcmCopy {
    fn memtabs(&self) -> [Memtab; 4] {
        let frame = self.format.frame_bytes();
        [
            (MemType::Persist, PERSIST_BYTES, 8),
            (MemType::Scratch, SCRATCH_BYTES, 8),
            (MemType::Input, frame, 4),
            (MemType::Output, frame, 4),
        ]
    }

    fn reset_stream(&mut self) {
        self.init_done = false;
        self.input_bytes = 0;
        self.consumed = 0;
        self.produced = 0;
        self.input_over = false;
        self.done = false;
    }

    fn header(&self) -> [u32; 6] {
        let [a, b, c, d] = self.format.to_words();
        let sum = MAGIC ^ a ^ b.rotate_left(8) ^ c.rotate_left(16) ^ d.rotate_left(24);
        [MAGIC, a, b, c, d, sum]
    }

    fn write_header(&self, persist: &mut [u8]) {
        for (chunk, word) in persist.chunks_exact_mut(4).zip(self.header()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }

    fn header_intact(&self, persist: &[u8]) -> bool {
        persist
            .chunks_exact(4)
            .zip(self.header())
            .all(|(chunk, word)| chunk == word.to_le_bytes())
    }

    fn execute(&mut self, value: ApiValue<'_>) -> ReturnCode {
        let ApiValue::Io(mut io) = value else {
            return ReturnCode::API_INVALID_CMD_TYPE;
        };
        if !self.init_done {
            return ReturnCode::EXEC_INVALID_STATE;
        }
        let intact = io
            .block(MemType::Persist, 0)
            .is_some_and(|persist| self.header_intact(persist));
        if !intact {
            return ReturnCode::EXEC_INVALID_STATE;
        }

        let (inputs, mut outputs) = io.split();
        let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) else {
            return ReturnCode::EXEC_INVALID_STATE;
        };
        let avail = self.input_bytes as usize;
        if avail > input.len() {
            return ReturnCode::EXEC_BAD_INPUT;
        }
        let n = avail.min(output.len());
        output[..n].copy_from_slice(&input[..n]);

        self.consumed = n as u32;
        self.produced = n as u32;
        self.input_bytes -= n as u32;
        if self.input_over && self.input_bytes == 0 {
            self.done = true;
        }
        trace!(n, done = self.done, "pcm copy");
        if n == 0 && !self.done {
            return ReturnCode::EXEC_NO_DATA;
        }
        ReturnCode::OK
    }
}

impl CodecApi for PcmCopy {
    fn call(&mut self, cmd: ApiCmd, idx: u32, mut value: ApiValue<'_>) -> ReturnCode {
        if let Some(code) = answer_memory(&self.memtabs(), cmd, idx, &mut value) {
            if cmd == ApiCmd::SetMemPtr && idx == 0 && code.is_ok() {
                if let ApiValue::Bytes(persist) = value {
                    self.write_header(persist);
                }
            }
            return code;
        }

        match cmd {
            ApiCmd::GetApiSize => value.put(core::mem::size_of::<Self>() as u32),
            ApiCmd::Init(InitPhase::PreConfigParams) => {
                *self = Self::default();
                ReturnCode::OK
            }
            ApiCmd::Init(InitPhase::PostConfigParams) => {
                self.reset_stream();
                ReturnCode::OK
            }
            ApiCmd::Init(InitPhase::Process) => {
                let ApiValue::Io(mut io) = value else {
                    return ReturnCode::API_INVALID_CMD_TYPE;
                };
                // format is final from here on
                let Some(persist) = io.block(MemType::Persist, 0) else {
                    return ReturnCode::EXEC_INVALID_STATE;
                };
                self.write_header(persist);
                self.init_done = true;
                self.consumed = 0;
                self.produced = 0;
                ReturnCode::OK
            }
            ApiCmd::Init(InitPhase::DoneQuery) => value.put(self.init_done as u32),
            ApiCmd::SetConfigParam => {
                if self.init_done {
                    return ReturnCode::CONFIG_INVALID_STATE;
                }
                let Some(v) = value.get() else {
                    return ReturnCode::CONFIG_INVALID_PARAM;
                };
                self.format.set(idx, v).unwrap_or(ReturnCode::CONFIG_INVALID_PARAM)
            }
            ApiCmd::GetConfigParam => match self.format.get(idx) {
                Some(v) => value.put(v),
                None => ReturnCode::CONFIG_INVALID_PARAM,
            },
            ApiCmd::Execute(ExecPhase::Execute) => self.execute(value),
            ApiCmd::Execute(ExecPhase::DoneQuery) => value.put(self.done as u32),
            ApiCmd::SetInputBytes if idx == 0 => match value.get() {
                Some(n) => {
                    self.input_bytes = n;
                    ReturnCode::OK
                }
                None => ReturnCode::API_INVALID_CMD_TYPE,
            },
            ApiCmd::GetCurIdxInputBuf if idx == 0 => value.put(self.consumed),
            ApiCmd::GetOutputBytes if idx == 0 => value.put(self.produced),
            ApiCmd::InputOver if idx == 0 => {
                self.input_over = true;
                ReturnCode::OK
            }
            ApiCmd::SetInputBytes
            | ApiCmd::GetCurIdxInputBuf
            | ApiCmd::GetOutputBytes
            | ApiCmd::InputOver => ReturnCode::API_INVALID_CMD_TYPE,
            _ => ReturnCode::API_INVALID_CMD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{param, Adapter, MemoryTable};

    fn ready() -> (Adapter, MemoryTable) {
        let mut adapter = Adapter::typed(PcmCopy::default());
        adapter.call(ApiCmd::Init(InitPhase::PreConfigParams), 0, ApiValue::None).unwrap();
        adapter.set_config(param::FRAME_SAMPLES, 4).unwrap();
        adapter.set_config(param::CHANNELS, 1).unwrap();
        adapter.call(ApiCmd::Init(InitPhase::PostConfigParams), 0, ApiValue::None).unwrap();
        let memory = MemoryTable::allocate(&mut adapter, 1024).unwrap();
        (adapter, memory)
    }

    #[test]
    fn copies_input_to_output_after_init() {
        let (mut adapter, mut memory) = ready();
        let mut scratch = vec![0u8; 1024];
        adapter
            .call(ApiCmd::Init(InitPhase::Process), 0, ApiValue::Io(memory.io(&mut scratch, None)))
            .unwrap();
        assert_eq!(adapter.query(ApiCmd::Init(InitPhase::DoneQuery), 0).unwrap(), 1);

        let mut direct = vec![1u8, 2, 3, 4, 5, 6];
        adapter.command(ApiCmd::SetInputBytes, 0, 6).unwrap();
        adapter
            .call(
                ApiCmd::Execute(ExecPhase::Execute),
                0,
                ApiValue::Io(memory.io(&mut scratch, Some(direct.as_mut_slice()))),
            )
            .unwrap();
        assert_eq!(adapter.query(ApiCmd::GetOutputBytes, 0).unwrap(), 6);
        assert_eq!(adapter.query(ApiCmd::GetCurIdxInputBuf, 0).unwrap(), 6);
        let out = memory.block(MemType::Output, 0).unwrap();
        assert_eq!(&out.data[..6], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn config_is_locked_after_runtime_init() {
        let (mut adapter, mut memory) = ready();
        let mut scratch = vec![0u8; 1024];
        adapter
            .call(ApiCmd::Init(InitPhase::Process), 0, ApiValue::Io(memory.io(&mut scratch, None)))
            .unwrap();
        let err = adapter.set_config(param::CHANNELS, 2).unwrap_err();
        assert_eq!(err.code(), ReturnCode::CONFIG_INVALID_STATE);
    }

    #[test]
    fn corrupted_persistent_state_fails_execute() {
        let (mut adapter, mut memory) = ready();
        let mut scratch = vec![0u8; 1024];
        adapter
            .call(ApiCmd::Init(InitPhase::Process), 0, ApiValue::Io(memory.io(&mut scratch, None)))
            .unwrap();
        memory.block_mut(MemType::Persist, 0).unwrap().data[0] ^= 0xff;
        adapter.command(ApiCmd::SetInputBytes, 0, 2).unwrap();
        let err = adapter
            .call(ApiCmd::Execute(ExecPhase::Execute), 0, ApiValue::Io(memory.io(&mut scratch, None)))
            .unwrap_err();
        assert_eq!(err.code(), ReturnCode::EXEC_INVALID_STATE);
    }

    #[test]
    fn reports_done_once_input_over_and_drained() {
        let (mut adapter, mut memory) = ready();
        let mut scratch = vec![0u8; 1024];
        adapter
            .call(ApiCmd::Init(InitPhase::Process), 0, ApiValue::Io(memory.io(&mut scratch, None)))
            .unwrap();
        adapter.command(ApiCmd::SetInputBytes, 0, 0).unwrap();
        let code = adapter
            .call(ApiCmd::Execute(ExecPhase::Execute), 0, ApiValue::Io(memory.io(&mut scratch, None)))
            .unwrap();
        assert_eq!(code, ReturnCode::EXEC_NO_DATA);
        assert_eq!(adapter.query(ApiCmd::Execute(ExecPhase::DoneQuery), 0).unwrap(), 0);

        adapter.call(ApiCmd::InputOver, 0, ApiValue::None).unwrap();
        adapter
            .call(ApiCmd::Execute(ExecPhase::Execute), 0, ApiValue::Io(memory.io(&mut scratch, None)))
            .unwrap();
        assert_eq!(adapter.query(ApiCmd::Execute(ExecPhase::DoneQuery), 0).unwrap(), 1);
    }
}
