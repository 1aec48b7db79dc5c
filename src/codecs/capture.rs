use super::{answer_memory, Memtab, PcmFormat};
use crate::adapter::{param, ApiCmd, ApiValue, CodecApi, ExecPhase, InitPhase, MemType};
use crate::error::ReturnCode;

/// Vendor side of a capture source.
///
/// The capturer copies each hardware frame into the output block itself, so
/// the engine only validates the format and counts frames against
/// `SAMPLE_END`.
#[derive(Debug, Default)]
pub struct CaptureEngine {
    format: PcmFormat,
    sample_end: u32,
    init_done: bool,
    frames: u32,
    done: bool,
}

impl CaptureEngine {
    fn memtabs(&self) -> [Memtab; 2] {
        [
            (MemType::Persist, 16, 4),
            (MemType::Output, self.format.frame_bytes(), 4),
        ]
    }
}

impl CodecApi for CaptureEngine {
    fn call(&mut self, cmd: ApiCmd, idx: u32, mut value: ApiValue<'_>) -> ReturnCode {
        if let Some(code) = answer_memory(&self.memtabs(), cmd, idx, &mut value) {
            return code;
        }
        match cmd {
            ApiCmd::GetApiSize => value.put(core::mem::size_of::<Self>() as u32),
            ApiCmd::Init(InitPhase::PreConfigParams) => {
                *self = Self::default();
                ReturnCode::OK
            }
            ApiCmd::Init(InitPhase::PostConfigParams) => {
                self.init_done = false;
                self.frames = 0;
                self.done = false;
                ReturnCode::OK
            }
            ApiCmd::Init(InitPhase::Process) => {
                self.init_done = true;
                ReturnCode::OK
            }
            ApiCmd::Init(InitPhase::DoneQuery) => value.put(self.init_done as u32),
            ApiCmd::SetConfigParam => match (idx, value.get()) {
                (param::SAMPLE_END, Some(v)) => {
                    self.sample_end = v;
                    ReturnCode::OK
                }
                (_, _) if self.init_done => ReturnCode::CONFIG_INVALID_STATE,
                (_, Some(v)) => self.format.set(idx, v).unwrap_or(ReturnCode::CONFIG_INVALID_PARAM),
                (_, None) => ReturnCode::CONFIG_INVALID_PARAM,
            },
            ApiCmd::GetConfigParam => match idx {
                param::SAMPLE_END => value.put(self.sample_end),
                _ => match self.format.get(idx) {
                    Some(v) => value.put(v),
                    None => ReturnCode::CONFIG_INVALID_PARAM,
                },
            },
            ApiCmd::Execute(ExecPhase::Execute) => {
                if !self.init_done {
                    return ReturnCode::EXEC_INVALID_STATE;
                }
                self.frames = self.frames.saturating_add(1);
                if self.sample_end != 0 && self.frames >= self.sample_end {
                    self.done = true;
                }
                ReturnCode::OK
            }
            ApiCmd::Execute(ExecPhase::DoneQuery) => value.put(self.done as u32),
            ApiCmd::GetOutputBytes if idx == 0 => value.put(self.format.frame_bytes() as u32),
            ApiCmd::GetOutputBytes => ReturnCode::API_INVALID_CMD_TYPE,
            _ => ReturnCode::API_INVALID_CMD,
        }
    }
}
