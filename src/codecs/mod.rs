//! Reference vendor codecs.
//!
//! These speak the same command ABI as a real vendor library but only move
//! 16-bit PCM around, which is enough to run a graph end to end.

mod capture;
mod pcm;
pub mod raw;
mod sum;

pub use capture::CaptureEngine;
pub use pcm::PcmCopy;
pub use sum::PcmSum;

use crate::adapter::{param, ApiCmd, ApiValue, MemType};
use crate::error::ReturnCode;

/// Bytes one memtab entry takes in the vendor's table.
const MEMTAB_ENTRY: u32 = 16;

/// PCM format shared by the reference codecs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PcmFormat {
    pub channels: u32,
    pub sample_rate: u32,
    pub pcm_width: u32,
    pub frame_samples: u32,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 48_000,
            pcm_width: 16,
            frame_samples: 256,
        }
    }
}

impl PcmFormat {
    pub fn frame_bytes(&self) -> usize {
        (self.frame_samples * self.channels * self.pcm_width / 8) as usize
    }

    /// Apply a format parameter. `None` if `id` is not a format parameter.
    pub fn set(&mut self, id: u32, v: u32) -> Option<ReturnCode> {
        let (slot, ok) = match id {
            param::CHANNELS => (&mut self.channels, (1..=8).contains(&v)),
            param::SAMPLE_RATE => (&mut self.sample_rate, (8_000..=192_000).contains(&v)),
            param::PCM_WIDTH => (&mut self.pcm_width, matches!(v, 8 | 16 | 24 | 32)),
            param::FRAME_SAMPLES => (&mut self.frame_samples, (1..=4096).contains(&v)),
            _ => return None,
        };
        if !ok {
            return Some(ReturnCode::CONFIG_INVALID_PARAM);
        }
        *slot = v;
        Some(ReturnCode::OK)
    }

    pub fn get(&self, id: u32) -> Option<u32> {
        match id {
            param::CHANNELS => Some(self.channels),
            param::SAMPLE_RATE => Some(self.sample_rate),
            param::PCM_WIDTH => Some(self.pcm_width),
            param::FRAME_SAMPLES => Some(self.frame_samples),
            _ => None,
        }
    }

    pub fn to_words(self) -> [u32; 4] {
        [self.channels, self.sample_rate, self.pcm_width, self.frame_samples]
    }

    pub fn from_words(w: [u32; 4]) -> Self {
        Self {
            channels: w[0],
            sample_rate: w[1],
            pcm_width: w[2],
            frame_samples: w[3],
        }
    }
}

/// One requested memory block: kind, size, alignment.
pub(crate) type Memtab = (MemType, usize, u32);

/// Answer the memory-negotiation commands for a fixed memtab list.
///
/// Returns `None` for commands that are not about memory.
pub(crate) fn answer_memory(
    tabs: &[Memtab],
    cmd: ApiCmd,
    idx: u32,
    value: &mut ApiValue<'_>,
) -> Option<ReturnCode> {
    let entry = tabs.get(idx as usize);
    let code = match cmd {
        ApiCmd::GetMemtabsSize => value.put(tabs.len() as u32 * MEMTAB_ENTRY),
        ApiCmd::SetMemtabsPtr => match value {
            ApiValue::Bytes(b) if b.len() >= tabs.len() * MEMTAB_ENTRY as usize => ReturnCode::OK,
            _ => ReturnCode::API_MEM_ALLOC,
        },
        ApiCmd::GetNMemtabs => value.put(tabs.len() as u32),
        ApiCmd::GetMemInfoSize => match entry {
            Some(&(_, size, _)) => value.put(size as u32),
            None => ReturnCode::API_INVALID_CMD_TYPE,
        },
        ApiCmd::GetMemInfoAlignment => match entry {
            Some(&(_, _, align)) => value.put(align),
            None => ReturnCode::API_INVALID_CMD_TYPE,
        },
        ApiCmd::GetMemInfoType => match entry {
            Some(&(kind, _, _)) => value.put(kind.raw()),
            None => ReturnCode::API_INVALID_CMD_TYPE,
        },
        ApiCmd::SetMemPtr => match (entry, value) {
            (Some(&(_, size, _)), ApiValue::Bytes(b)) if b.len() >= size => ReturnCode::OK,
            (None, _) => ReturnCode::API_INVALID_CMD_TYPE,
            _ => ReturnCode::API_MEM_ALLOC,
        },
        _ => return None,
    };
    Some(code)
}

/// Saturating add of little-endian 16-bit samples from `src` into `dst`.
pub(crate) fn mix_i16(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(2)) {
        let a = i16::from_le_bytes([d[0], d[1]]);
        let b = i16::from_le_bytes([s[0], s[1]]);
        d.copy_from_slice(&a.saturating_add(b).to_le_bytes());
    }
}
