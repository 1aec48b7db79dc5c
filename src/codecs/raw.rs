//! A bare-function vendor entry point whose state lives in the handle bytes.

use super::{answer_memory, PcmFormat};
use crate::adapter::{ApiCmd, ApiValue, ExecPhase, InitPhase, MemType};
use crate::error::ReturnCode;

const WORDS: usize = 8;
/// Handle size reported through `GET_API_SIZE`.
pub const API_SIZE: usize = WORDS * 4;

const FLAGS: usize = 4;
const INPUT_BYTES: usize = 5;
const CONSUMED: usize = 6;
const PRODUCED: usize = 7;

const INIT_DONE: u32 = 1;
const INPUT_OVER: u32 = 1 << 1;
const DONE: u32 = 1 << 2;

struct State<'h>(&'h mut [u8]);

impl State<'_> {
    fn get(&self, word: usize) -> u32 {
        let b = &self.0[word * 4..word * 4 + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn set(&mut self, word: usize, v: u32) {
        self.0[word * 4..word * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn flag(&self, f: u32) -> bool {
        self.get(FLAGS) & f != 0
    }

    fn raise(&mut self, f: u32) {
        let v = self.get(FLAGS) | f;
        self.set(FLAGS, v);
    }

    fn format(&self) -> PcmFormat {
        PcmFormat::from_words([self.get(0), self.get(1), self.get(2), self.get(3)])
    }

    fn store_format(&mut self, format: PcmFormat) {
        for (i, w) in format.to_words().into_iter().enumerate() {
            self.set(i, w);
        }
    }
}

/// Single-in, single-out PCM passthrough with a raw entry point.
///
/// Behaves like [`PcmCopy`](super::PcmCopy) without a persistent block.
pub fn pcm_passthrough(handle: &mut [u8], cmd: ApiCmd, idx: u32, mut value: ApiValue<'_>) -> ReturnCode {
    if cmd == ApiCmd::GetApiSize {
        return value.put(API_SIZE as u32);
    }
    if handle.len() < API_SIZE {
        return ReturnCode::API_MEM_ALLOC;
    }
    let mut st = State(handle);
    if cmd == ApiCmd::Init(InitPhase::PreConfigParams) {
        st.0.fill(0);
        st.store_format(PcmFormat::default());
        return ReturnCode::OK;
    }

    let format = st.format();
    let frame = format.frame_bytes();
    let tabs = [(MemType::Input, frame, 4), (MemType::Output, frame, 4)];
    if let Some(code) = answer_memory(&tabs, cmd, idx, &mut value) {
        return code;
    }

    match cmd {
        ApiCmd::Init(InitPhase::PostConfigParams) => {
            for w in FLAGS..WORDS {
                st.set(w, 0);
            }
            ReturnCode::OK
        }
        ApiCmd::Init(InitPhase::Process) => {
            st.raise(INIT_DONE);
            ReturnCode::OK
        }
        ApiCmd::Init(InitPhase::DoneQuery) => value.put(st.flag(INIT_DONE) as u32),
        ApiCmd::SetConfigParam => {
            if st.flag(INIT_DONE) {
                return ReturnCode::CONFIG_INVALID_STATE;
            }
            let mut format = format;
            let code = match value.get() {
                Some(v) => format.set(idx, v).unwrap_or(ReturnCode::CONFIG_INVALID_PARAM),
                None => ReturnCode::CONFIG_INVALID_PARAM,
            };
            if code.is_ok() {
                st.store_format(format);
            }
            code
        }
        ApiCmd::GetConfigParam => match format.get(idx) {
            Some(v) => value.put(v),
            None => ReturnCode::CONFIG_INVALID_PARAM,
        },
        ApiCmd::Execute(ExecPhase::Execute) => {
            let ApiValue::Io(mut io) = value else {
                return ReturnCode::API_INVALID_CMD_TYPE;
            };
            if !st.flag(INIT_DONE) {
                return ReturnCode::EXEC_INVALID_STATE;
            }
            let (inputs, mut outputs) = io.split();
            let (Some(input), Some(output)) = (inputs.first(), outputs.first_mut()) else {
                return ReturnCode::EXEC_INVALID_STATE;
            };
            let avail = st.get(INPUT_BYTES) as usize;
            if avail > input.len() {
                return ReturnCode::EXEC_BAD_INPUT;
            }
            let n = avail.min(output.len());
            output[..n].copy_from_slice(&input[..n]);
            st.set(CONSUMED, n as u32);
            st.set(PRODUCED, n as u32);
            st.set(INPUT_BYTES, (avail - n) as u32);
            if st.flag(INPUT_OVER) && avail == n {
                st.raise(DONE);
            }
            if n == 0 && !st.flag(DONE) {
                return ReturnCode::EXEC_NO_DATA;
            }
            ReturnCode::OK
        }
        ApiCmd::Execute(ExecPhase::DoneQuery) => value.put(st.flag(DONE) as u32),
        ApiCmd::SetInputBytes if idx == 0 => match value.get() {
            Some(n) => {
                st.set(INPUT_BYTES, n);
                ReturnCode::OK
            }
            None => ReturnCode::API_INVALID_CMD_TYPE,
        },
        ApiCmd::GetCurIdxInputBuf if idx == 0 => value.put(st.get(CONSUMED)),
        ApiCmd::GetOutputBytes if idx == 0 => value.put(st.get(PRODUCED)),
        ApiCmd::InputOver if idx == 0 => {
            st.raise(INPUT_OVER);
            ReturnCode::OK
        }
        ApiCmd::SetInputBytes | ApiCmd::GetCurIdxInputBuf | ApiCmd::GetOutputBytes | ApiCmd::InputOver => {
            ReturnCode::API_INVALID_CMD_TYPE
        }
        _ => ReturnCode::API_INVALID_CMD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{param, Adapter};

    #[test]
    fn unsized_handle_only_answers_api_size() {
        let mut adapter = Adapter::raw(pcm_passthrough);
        assert_eq!(adapter.query(ApiCmd::GetApiSize, 0).unwrap(), API_SIZE as u32);
        let err = adapter.set_config(param::CHANNELS, 1).unwrap_err();
        assert_eq!(err.code(), ReturnCode::API_MEM_ALLOC);
    }

    #[test]
    fn state_survives_in_handle() {
        let mut adapter = Adapter::raw(pcm_passthrough);
        adapter.allocate_handle(API_SIZE);
        adapter.call(ApiCmd::Init(InitPhase::PreConfigParams), 0, ApiValue::None).unwrap();
        adapter.set_config(param::SAMPLE_RATE, 16_000).unwrap();
        assert_eq!(adapter.get_config(param::SAMPLE_RATE).unwrap(), 16_000);
        assert_eq!(adapter.get_config(param::CHANNELS).unwrap(), 2);
        assert!(adapter.set_config(param::SAMPLE_RATE, 1).is_err());
        assert_eq!(adapter.get_config(param::SAMPLE_RATE).unwrap(), 16_000);
    }
}
