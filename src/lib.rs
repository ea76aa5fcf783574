//! Motion-control middleware for MDrive-family drives.
//!
//! A long-running daemon owns one or more RS-232/RS-485 serial buses,
//! speaks the drives' line-oriented ASCII protocol, and exposes a
//! request/response and event API so multiple clients can share the
//! devices safely.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     daemon (this crate)                      │
//! │                                                              │
//! │  Scheduler ──▶ Worker (per bus group) ──▶ request handlers   │
//! │                                               │              │
//! │  ─────────────── driver trait boundary ───────┼──────────    │
//! │                                               ▼              │
//! │  MdriveClass ──▶ Device ──▶ communicate ──▶ Bus ──▶ TTY      │
//! │                    ▲                         │               │
//! │   CallbackTimer ───┘     reader thread ──────┘               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The serial boundary is a pair of traits
//! ([`SerialIo`](mdrive::port::SerialIo) /
//! [`SerialBackend`](mdrive::port::SerialBackend)); production code plugs
//! in real TTYs, the test suite plugs in simulated units.

#![deny(unused_must_use)]

pub mod config;
pub mod daemon;
pub mod driver;
pub mod error;
pub mod events;
pub mod mdrive;
pub mod timer;
