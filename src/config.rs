//! Runtime and component configuration.

/// Per-core runtime settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Core this runtime serves. Messages for other cores are rejected.
    pub core: u8,
    /// Bytes in the shared scratch arena.
    pub scratch_size: usize,
    /// Capacity of input queues and host-fed output queues.
    pub port_depth: usize,
    /// Depth of each interrupt line.
    pub irq_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            core: 0,
            scratch_size: 16 * 1024,
            port_depth: 8,
            irq_capacity: 4,
        }
    }
}

impl RuntimeConfig {
    pub fn with_core(mut self, core: u8) -> Self {
        self.core = core;
        self
    }

    pub fn with_scratch_size(mut self, bytes: usize) -> Self {
        self.scratch_size = bytes;
        self
    }

    pub fn with_port_depth(mut self, depth: usize) -> Self {
        self.port_depth = depth.max(1);
        self
    }

    pub fn with_irq_capacity(mut self, capacity: usize) -> Self {
        self.irq_capacity = capacity.max(1);
        self
    }
}

/// Audio codec options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CodecConfig {
    /// Hand input buffers to the vendor directly instead of copying them into
    /// its input block.
    pub bypass: bool,
}

impl CodecConfig {
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }
}

/// Mixer options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MixerConfig {
    pub tracks: u8,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self { tracks: 2 }
    }
}

impl MixerConfig {
    pub fn with_tracks(mut self, tracks: u8) -> Self {
        self.tracks = tracks;
        self
    }
}

/// MIMO processor options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MimoConfig {
    pub inputs: u8,
    pub outputs: u8,
}

impl Default for MimoConfig {
    fn default() -> Self {
        Self {
            inputs: 2,
            outputs: 1,
        }
    }
}

impl MimoConfig {
    pub fn with_inputs(mut self, inputs: u8) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: u8) -> Self {
        self.outputs = outputs;
        self
    }
}

/// Capturer options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Bytes of the ring between the capture callback and the component.
    pub ring_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { ring_bytes: 64 * 1024 }
    }
}

impl CaptureConfig {
    pub fn with_ring_bytes(mut self, bytes: usize) -> Self {
        self.ring_bytes = bytes;
        self
    }
}
