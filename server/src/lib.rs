//! # Relay Server Library
//!
//! This library implements a TCP relay server for a multiplayer space-program
//! game. Unlike an authoritative simulation server, the relay holds no world
//! model: clients exchange opaque world-state payloads, chat, screenshots,
//! and craft files, and the server's job is admission, attribution, fan-out,
//! and abuse control.
//!
//! ## Core Responsibilities
//!
//! ### Session Lifecycle
//! Each connection is admitted into a fixed slot whose index doubles as the
//! client id on the wire. A session moves through connect, handshake, and an
//! activity ladder (inactive, in-game, in-flight) before being reclaimed on
//! disconnect or timeout.
//!
//! ### Relay Fan-Out
//! World-state updates are relayed to every other engaged session; secondary
//! updates go to in-flight sessions only. Chat, craft files, and screenshots
//! ride the same framing with their own audiences.
//!
//! ### Adaptive Pacing
//! The interval clients should wait between updates scales with a weighted
//! count of engaged players, so aggregate inbound traffic stays near the
//! configured target regardless of how many people are flying.
//!
//! ### Abuse Control
//! Per-category flood counters throttle chat and screenshot spam, and the
//! throttle state survives a reconnect from the same address. Oversized chat
//! payloads ban the sender's address outright.
//!
//! ## Module Organization
//!
//! - [`config`]: tunables loaded from JSON with per-field defaults
//! - [`session`]: the per-slot session state machine and the slot table
//! - [`activity`]: activity levels and the adaptive update interval
//! - [`throttle`]: flood counters and the cross-reconnect throttle cache
//! - [`state`]: server-wide shared state and fan-out helpers
//! - [`dispatch`]: per-message protocol handlers
//! - [`network`]: sockets, the receive tasks, and the supervisor loop
//! - [`storage`]: the ban list file and saved screenshots

pub mod activity;
pub mod config;
pub mod dispatch;
pub mod network;
pub mod session;
pub mod state;
pub mod storage;
pub mod throttle;
