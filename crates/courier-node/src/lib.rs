//! Courier node: configuration, datagram I/O, the dispatcher that
//! wires the reliability engines to the network, and the CLI.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod net;
