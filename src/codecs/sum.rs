use tracing::trace;

use super::{answer_memory, mix_i16, Memtab, PcmFormat};
use crate::adapter::{param, ApiCmd, ApiValue, CodecApi, ExecPhase, InitPhase, MemType};
use crate::error::ReturnCode;

const MAX_PORTS: u32 = 16;

/// N-in, M-out saturating sum of 16-bit PCM.
///
/// Every output receives the sum of all inputs. When no input has bytes but
/// some are still open, one frame of silence is produced. Done once every
/// input has been marked over and drained.
#[derive(Debug)]
pub struct PcmSum {
    format: PcmFormat,
    inputs: usize,
    outputs: usize,
    configured: bool,
    init_done: bool,
    input_bytes: Vec<u32>,
    consumed: Vec<u32>,
    over: Vec<bool>,
    produced: u32,
    done: bool,
}

impl Default for PcmSum {
    fn default() -> Self {
        Self::new(2, 1)
    }
}

impl PcmSum {
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self {
            format: PcmFormat::default(),
            inputs,
            outputs,
            configured: false,
            init_done: false,
            input_bytes: vec![0; inputs],
            consumed: vec![0; inputs],
            over: vec![false; inputs],
            produced: 0,
            done: false,
        }
    }

    fn memtabs(&self) -> Vec<Memtab> {
        let frame = self.format.frame_bytes();
        let mut tabs = vec![(MemType::Persist, 32, 4)];
        tabs.extend((0..self.inputs).map(|_| (MemType::Input, frame, 4)));
        tabs.extend((0..self.outputs).map(|_| (MemType::Output, frame, 4)));
        tabs
    }

    fn reset_stream(&mut self) {
        self.init_done = false;
        self.input_bytes = vec![0; self.inputs];
        self.consumed = vec![0; self.inputs];
        self.over = vec![false; self.inputs];
        self.produced = 0;
        self.done = false;
    }

    fn set_config(&mut self, id: u32, v: u32) -> ReturnCode {
        match id {
            param::INPUTS | param::OUTPUTS => {
                if self.configured {
                    return ReturnCode::CONFIG_INVALID_STATE;
                }
                if !(1..=MAX_PORTS).contains(&v) {
                    return ReturnCode::CONFIG_INVALID_PARAM;
                }
                if id == param::INPUTS {
                    self.inputs = v as usize;
                } else {
                    self.outputs = v as usize;
                }
                self.reset_stream();
                ReturnCode::OK
            }
            param::PCM_WIDTH if v != 16 => ReturnCode::CONFIG_INVALID_PARAM,
            _ => self.format.set(id, v).unwrap_or(ReturnCode::CONFIG_INVALID_PARAM),
        }
    }

    fn get_config(&self, id: u32) -> Option<u32> {
        match id {
            param::INPUTS => Some(self.inputs as u32),
            param::OUTPUTS => Some(self.outputs as u32),
            _ => self.format.get(id),
        }
    }

    fn execute(&mut self, value: ApiValue<'_>) -> ReturnCode {
        let ApiValue::Io(mut io) = value else {
            return ReturnCode::API_INVALID_CMD_TYPE;
        };
        if !self.init_done {
            return ReturnCode::EXEC_INVALID_STATE;
        }
        let (inputs, mut outputs) = io.split();
        if inputs.len() != self.inputs || outputs.len() != self.outputs {
            return ReturnCode::EXEC_INVALID_STATE;
        }

        let frame = outputs.iter().map(|o| o.len()).min().unwrap_or(0);
        let live: Vec<usize> = self
            .input_bytes
            .iter()
            .zip(&inputs)
            .map(|(&n, buf)| (n as usize).min(buf.len()).min(frame) & !1)
            .collect();

        let mut n = live.iter().copied().max().unwrap_or(0);
        if n == 0 {
            if self.over.iter().all(|&o| o) {
                self.done = true;
                self.produced = 0;
                self.consumed.iter_mut().for_each(|c| *c = 0);
                return ReturnCode::OK;
            }
            // keep the clock running with silence
            n = frame;
        }

        for out in outputs.iter_mut() {
            out[..n].fill(0);
            for (input, &m) in inputs.iter().zip(&live) {
                mix_i16(&mut out[..m], &input[..m]);
            }
        }
        for (i, &m) in live.iter().enumerate() {
            self.consumed[i] = m as u32;
            self.input_bytes[i] -= m as u32;
        }
        self.produced = n as u32;
        trace!(produced = n, ?live, "pcm sum");
        ReturnCode::OK
    }
}

impl CodecApi for PcmSum {
    fn call(&mut self, cmd: ApiCmd, idx: u32, mut value: ApiValue<'_>) -> ReturnCode {
        if let Some(code) = answer_memory(&self.memtabs(), cmd, idx, &mut value) {
            return code;
        }
        let i = idx as usize;

        match cmd {
            ApiCmd::GetApiSize => value.put(core::mem::size_of::<Self>() as u32),
            ApiCmd::Init(InitPhase::PreConfigParams) => {
                *self = Self::new(self.inputs, self.outputs);
                ReturnCode::OK
            }
            ApiCmd::Init(InitPhase::PostConfigParams) => {
                self.configured = true;
                self.reset_stream();
                ReturnCode::OK
            }
            ApiCmd::Init(InitPhase::Process) => {
                self.init_done = true;
                ReturnCode::OK
            }
            ApiCmd::Init(InitPhase::DoneQuery) => value.put(self.init_done as u32),
            ApiCmd::SetConfigParam => match value.get() {
                _ if self.init_done => ReturnCode::CONFIG_INVALID_STATE,
                Some(v) => self.set_config(idx, v),
                None => ReturnCode::CONFIG_INVALID_PARAM,
            },
            ApiCmd::GetConfigParam => match self.get_config(idx) {
                Some(v) => value.put(v),
                None => ReturnCode::CONFIG_INVALID_PARAM,
            },
            ApiCmd::Execute(ExecPhase::Execute) => self.execute(value),
            ApiCmd::Execute(ExecPhase::DoneQuery) => value.put(self.done as u32),
            ApiCmd::SetInputBytes if i < self.inputs => match value.get() {
                Some(n) => {
                    self.input_bytes[i] = n;
                    ReturnCode::OK
                }
                None => ReturnCode::API_INVALID_CMD_TYPE,
            },
            ApiCmd::GetCurIdxInputBuf if i < self.inputs => value.put(self.consumed[i]),
            ApiCmd::GetOutputBytes if i < self.outputs => value.put(self.produced),
            ApiCmd::InputOver if i < self.inputs => {
                self.over[i] = true;
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
