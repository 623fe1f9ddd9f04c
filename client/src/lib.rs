//! The Arrears client.
//!
//! Uploads portfolio exports in resumable chunks, follows the processing
//! of the resulting reports and pages through their results.

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]

pub mod api;
pub mod chunked_upload;
pub mod size_parser;
pub mod version;
