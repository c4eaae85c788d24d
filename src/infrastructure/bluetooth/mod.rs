//! Bluetooth Module
//!
//! Keeps a link to the gesture remote alive and turns its notification
//! stream into packets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      LinkService                         │
//! │  (tokio tasks + one Mutex - public API for the app)      │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                 ConnectionSupervisor                     │
//! │  retry policy, watchdog, epochs, FramePipeline           │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ one ConnectionSession per attempt
//!                       ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │ Transport │  │  Session   │  │ Protocol │
//! │           │  │            │  │          │
//! │ - WinRT   │  │ - Pairing  │  │ - UUIDs  │
//! │ - Replay  │  │ - GATT     │  │ - CCCD   │
//! └───────────┘  └────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Service UUIDs and descriptor values
//! - [`transport`] - Callback-driven boundary to the BLE stack
//! - [`session`] - One connection attempt, step by step
//! - [`supervisor`] - Retry, watchdog and framing across attempts
//! - [`service`] - Runtime wiring around the supervisor
//! - [`replay`] - Transport that plays back a recorded stream
//! - `scanner` / `connection` - Windows Runtime transport (Windows only)

#[cfg(windows)]
pub mod connection;
pub mod protocol;
pub mod replay;
#[cfg(windows)]
pub mod scanner;
pub mod service;
pub mod session;
pub mod supervisor;
pub mod transport;
