//! Arcade cabinet serial-link bridge.
//!
//! Emulates the serial interconnect hardware used to link multiple arcade
//! cabinets, carrying its fixed-size word-block transfers over a pair of
//! directional TCP connections so that link-capable titles can be played
//! across independently running emulator instances. Hosts drive the core
//! through the [`device`] facade; the network plumbing lives in
//! [`transport`].

/// Register file, shared RAM window and the per-tick protocol engine.
pub mod device;

/// Lock-free SPSC byte ring used between the tick and network threads.
pub mod ring;

/// TCP transport: role state machines and the background I/O thread.
pub mod transport;
