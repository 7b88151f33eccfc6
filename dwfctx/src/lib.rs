//! A library for converting minidump stackwalker reports into binary crash
//! context files, and reading those files back.
//!
//! The [`report`](report/index.html) module turns the text a stackwalker
//! prints into the in-memory [`ContextFile`] model, and the
//! [`context`](context/index.html) module reads and writes the on-disk
//! format. The raw structure definitions live in the `dwfctx-common` crate.

pub mod context;
pub mod report;

pub use crate::context::{
    ContextFile, ContextFrame, ContextModule, ContextThread, Error,
};
pub use crate::report::{parse_report, parse_report_strict, ReportError, BAD_REGISTER};
pub use dwfctx_common::format::ContextArch;
