//! # courier-transport
//!
//! Courier's pure protocol logic: the wire codec, XOR FEC, the send and
//! receive reliability engines, and the custody state machine. Nothing
//! in this crate touches a socket — `courier-node` owns the datagram
//! I/O and feeds datagrams in, taking datagrams back out.
//!
//! ## Crate structure
//!
//! - [`wire`] — message encode/decode, SACK watermark/bitmap construction
//! - [`fec`] — XOR parity generation and single-loss reconstruction
//! - [`sender`] — send engine: windowed ARQ, RFC 6298 RTO estimation
//! - [`receiver`] — receive engine: FEC-aware reassembly, SACK emission
//! - [`custody`] — custody transfer state machine

pub mod custody;
pub mod fec;
pub mod receiver;
pub mod sender;
pub mod wire;
