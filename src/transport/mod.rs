//! # Transport
//!
//! Byte-stream plumbing beneath the frame codec. Only plain TCP is
//! supported; transport encryption is out of scope.

pub mod tcp;
