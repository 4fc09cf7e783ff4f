//! fpmm-decode crate
//!
//! Turns normalized receipts into typed FPMM trade records: the event
//! signature registry, auxiliary log matching and per-event decoders.

pub mod decoder;
pub mod matcher;
pub mod signatures;

pub use decoder::{addresses, DecodeError, DecodedTransaction, DecoderConfig, LogProcessingError, TradeDecoder};
pub use signatures::{EventKind, SignatureRegistry};
