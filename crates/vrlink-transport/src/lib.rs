//! Real-time transport for VR video streaming over UDP.
//!
//! This crate contains:
//! - **Wire format** — fixed little-endian packet headers (`wire`)
//! - **FEC framing** — Reed-Solomon fragmentation and receiver-side reassembly (`codec`, `fec`)
//! - **Transmit queue** — bitrate-capped FIFO drained per burst window (`throttle`)
//! - **Control loops** — adaptive bitrate, IDR scheduling, clock sync (`bitrate`, `idr`, `clock`)
//! - **Pose history** — bounded pose buffer for frame ↔ pose association (`pose`)
//! - **Session and runtime** — per-client shared state and its socket threads (`session`, `runtime`)

pub mod bitrate;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod fec;
pub mod idr;
pub mod pose;
pub mod runtime;
pub mod session;
pub mod stats;
pub mod throttle;
pub mod wire;

pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use runtime::TransportRuntime;
pub use session::{SessionEvent, StreamSession};
