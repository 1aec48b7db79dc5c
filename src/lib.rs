//! dspflow - cooperative, message-driven dataflow runtime for audio components
//!
//! Design principles:
//! - One runtime per core, single-threaded, every call runs to completion
//! - Components talk only through messages; a null message means "process now"
//! - Vendor codecs are driven through one fixed command entry point
//! - Routed ports never free a buffer a peer may still hold
//! - Capture callbacks only touch a lock-free ring and atomics

pub mod adapter;
pub mod capture;
pub mod codecs;
pub mod component;
pub mod config;
pub mod context;
#[cfg(feature = "cpal_capture")]
pub mod device;
pub mod error;
pub mod graph;
pub mod message;
pub mod port;
pub mod queue;
pub mod runtime;
pub mod scheduler;

pub use adapter::{Adapter, CodecApi};
pub use capture::{CaptureCallback, CaptureDriver, ManualDriver, ManualTrigger};
pub use component::{
    AnyComponent, AudioCapturer, AudioCodec, CaptureSetup, CodecStats, Component, ComponentType, Dispatch, Lifecycle,
    MimoProcessor, Mixer,
};
pub use config::{CaptureConfig, CodecConfig, MimoConfig, MixerConfig, RuntimeConfig};
pub use context::Urgency;
#[cfg(feature = "cpal_capture")]
pub use device::CpalCapture;
pub use error::{Error, Result, ReturnCode};
pub use graph::Topology;
pub use message::{Address, ComponentId, Message, Opcode, RouteDesc, Status, StreamParams};
pub use runtime::Runtime;
