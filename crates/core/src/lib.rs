//! Core types for the voxcall TTS engine
//!
//! This crate provides the foundational types used across all other crates:
//! - Audio chunks and WAV framing
//! - The engine-wide error taxonomy
//! - The event bus and event kinds
//! - Call identity and dialog fragments

pub mod audio;
pub mod call;
pub mod error;
pub mod events;
pub mod fragment;

pub use audio::AudioChunk;
pub use call::CallId;
pub use error::{Error, Result};
pub use events::{EventBus, TtsEvent, TtsEventKind};
pub use fragment::Fragment;
