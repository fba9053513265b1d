// src/core/protocol/mod.rs

//! Implements the RESP wire protocol used to talk to cluster nodes.

pub mod resp_frame;
pub mod resp_value;

pub use resp_frame::{RespFrame, RespFrameCodec, command_frame};
pub use resp_value::RespValue;
