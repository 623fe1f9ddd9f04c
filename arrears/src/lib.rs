//! The Arrears report-processing API.
//!
//! This crate contains the wire types and helpers shared by the
//! server and the command-line client:
//!
//! - `api`: Request and response bodies of the HTTP API
//! - `hash`: Typed content hashes used for chunk integrity checks
//! - `report`: The closed set of report kinds the server can produce

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]

pub mod api;
pub mod error;
pub mod hash;
pub mod report;
