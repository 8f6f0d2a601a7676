//! Telephony carrier integration
//!
//! Audio buffering, the carrier HTTP client, and per-call streaming
//! sessions with their uploader workers.

pub mod buffer;
pub mod client;
pub mod manager;
pub mod session;

pub use buffer::{AudioBuffer, BufferLevel, BufferStats, BufferThresholds};
pub use client::{AudioDescriptor, AudioFormat, CarrierApi, HttpCarrierClient, MediaUpload};
pub use manager::{ManagerStats, StreamingManager};
pub use session::{SessionState, SessionStats, StreamingSession};
