//! `chbackup` is the common library of the ClickHouse backup tool.
//!
//! It contains the pieces shared between the engine and the CLI: the
//! common error type, checksums, validated backup names, and the stream
//! utilities used by the transfer pipelines.

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]

pub mod checksum;
pub mod error;
pub mod name;
pub mod stream;
pub mod util;

pub use error::{ChBackupError, ChBackupResult};
