//! Device console protocol.
//!
//! - [`command`]: command line construction
//! - [`response`]: typed result decoding
//! - [`link`]: echo-verified transmission and response framing
//! - [`checksum`]: additive transfer checksum

pub mod checksum;
pub mod command;
pub mod link;
pub mod response;
