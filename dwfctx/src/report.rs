// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Parsing the human-readable report a minidump stackwalker prints.
//!
//! The interesting part of a report looks like this (preamble and the
//! trailing module list elided):
//!
//! ```text
//! Thread 0 (crashed)
//!  0  libc.so!memcpy + 0x1c
//!     rax = 0x0000000000000010   rdx = 0x0000000000000020
//!     rip = 0x00007f699171a75c
//!     Found by: given as instruction pointer in context
//!     Stack contents:
//!      00007ffe9628dd10 30 78 37 66 30 62 65 34 64 34 37 39 30 30 00 00  0x7f0be4d47900..
//!      00007ffe9628dd20 01 00 00 00 00 00 00 00 10 dd 28 96 fe 7f 00 00  ..........(.....
//!  1  app!main + 0x2c
//!     Found by: stack scanning
//! Thread 1
//!  0  libpthread.so!pthread_cond_wait
//!     Found by: given as instruction pointer in context
//! ```
//!
//! Reports are scraped out of logs and crash pipelines, so the parser is a
//! forgiving line-at-a-time state machine: anything it cannot make sense of
//! degrades to a sentinel value or is skipped, and [`parse_report`] never
//! fails. [`parse_report_strict`] runs the same machine but reports the
//! first fragment lenient parsing would have papered over.

use tracing::debug;

use crate::context::{ContextFile, ContextFrame, ContextThread};

/// The value recorded for a register whose hex token failed to parse: -1 as
/// an unsigned 64-bit value.
///
/// Registers are kept positional, so a bad token must still occupy its slot;
/// stack bytes have no such requirement and bad tokens there are dropped
/// instead.
pub const BAD_REGISTER: u64 = u64::MAX;

/// The most tokens of a stack dump row worth looking at: the address column
/// plus sixteen byte columns. Anything past that is the printable-ASCII
/// gutter, which can happen to parse as hex.
const STACK_ROW_TOKENS: usize = 17;

/// Errors produced by [`parse_report_strict`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ReportError {
    /// A static description of the offending fragment and the 1-based line
    /// number it was found on.
    #[error("{0} on line {1}")]
    ParseError(&'static str, u64),
}

/// Parse a stackwalker report into a [`ContextFile`].
///
/// This never fails: unparsable register values become [`BAD_REGISTER`],
/// unparsable stack bytes are dropped, and lines that fit no known shape are
/// skipped. An input with nothing recognizable in it simply produces a
/// context with no threads.
pub fn parse_report(text: &str) -> ContextFile {
    parse_inner(text, false).unwrap_or_default()
}

/// Parse a stackwalker report, failing on the first fragment that lenient
/// parsing would have degraded or dropped.
///
/// The successful result is identical to [`parse_report`]'s.
pub fn parse_report_strict(text: &str) -> Result<ContextFile, ReportError> {
    parse_inner(text, true)
}

fn parse_inner(text: &str, strict: bool) -> Result<ContextFile, ReportError> {
    let mut parser = ReportParser::new(strict);
    for (i, line) in text.lines().enumerate() {
        parser.process_line(line, i as u64 + 1)?;
    }
    Ok(parser.finish())
}

/// What the parser expects the next line to be.
#[derive(Clone, Copy, Debug)]
enum Mode {
    /// The preamble before the first thread header. Everything is ignored.
    Info,
    /// Inside a thread block, looking for frame headers or a stack dump.
    Thread,
    /// Directly after a frame header, collecting register lines.
    Register,
    /// Inside a `Stack contents:` dump, collecting memory rows.
    Stack,
}

/// The line-at-a-time state machine behind [`parse_report`].
///
/// New frames, register values, and stack bytes always land on the thread
/// and frame named here, never on "whatever happens to be last".
struct ReportParser {
    mode: Mode,
    strict: bool,
    threads: Vec<ContextThread>,
    /// Index into `threads` of the thread being filled in.
    cur_thread: Option<usize>,
    /// Index into the current thread's frames of the frame being filled in.
    cur_frame: Option<usize>,
}

impl ReportParser {
    fn new(strict: bool) -> ReportParser {
        ReportParser {
            mode: Mode::Info,
            strict,
            threads: Vec::new(),
            cur_thread: None,
            cur_frame: None,
        }
    }

    fn finish(self) -> ContextFile {
        ContextFile {
            threads: self.threads,
            // TODO: parse the `Loaded modules:` section once the context
            // file format grows a module table to put it in.
            modules: Vec::new(),
            ..ContextFile::default()
        }
    }

    /// In strict mode fail with `what`, otherwise log it and carry on.
    fn tolerate(&self, what: &'static str, line: u64) -> Result<(), ReportError> {
        if self.strict {
            Err(ReportError::ParseError(what, line))
        } else {
            debug!("ignoring {} on line {}", what, line);
            Ok(())
        }
    }

    fn process_line(&mut self, line: &str, lineno: u64) -> Result<(), ReportError> {
        // A thread header starts a new thread no matter what the parser was
        // in the middle of; stackwalkers print them unindented, so nothing
        // else can collide with the prefix.
        if line.starts_with("Thread") {
            return self.process_thread_header(line, lineno);
        }
        match self.mode {
            Mode::Info => Ok(()),
            Mode::Thread => self.process_thread_line(line, lineno),
            Mode::Register => self.process_register_line(line, lineno),
            Mode::Stack => self.process_stack_row(line, lineno),
        }
    }

    fn process_thread_header(&mut self, line: &str, lineno: u64) -> Result<(), ReportError> {
        let thread_id = line
            .split_ascii_whitespace()
            .nth(1)
            .and_then(|token| token.parse::<u32>().ok());
        let thread_id = match thread_id {
            Some(thread_id) => thread_id,
            None => return self.tolerate("thread header with unparsable id", lineno),
        };

        self.threads
            .push(ContextThread::new(thread_id, line.contains("(crashed)")));
        self.cur_thread = Some(self.threads.len() - 1);
        self.cur_frame = None;
        self.mode = Mode::Thread;
        Ok(())
    }

    fn process_thread_line(&mut self, line: &str, lineno: u64) -> Result<(), ReportError> {
        if let Some((digits, func)) = split_frame_header(line) {
            match digits.parse::<u32>() {
                Ok(frame_num) => {
                    self.push_frame(frame_num, func);
                    self.mode = Mode::Register;
                }
                Err(_) => self.tolerate("frame header with unparsable number", lineno)?,
            }
        } else if line.trim().starts_with("Stack contents:") {
            self.mode = Mode::Stack;
        }
        Ok(())
    }

    fn process_register_line(&mut self, line: &str, lineno: u64) -> Result<(), ReportError> {
        if !line.contains('=') {
            // The register block is over. This line is spent: it is usually
            // `Found by: ...`, which carries nothing worth keeping.
            self.mode = Mode::Thread;
            return Ok(());
        }

        // Register lines pair names with values, `rax = 0x10   rdx = 0x20`.
        // After throwing away the `=` tokens the values sit at the odd
        // positions. A value that fails to parse still occupies its slot.
        let mut values = Vec::new();
        let tokens = line.split_ascii_whitespace().filter(|token| *token != "=");
        for (i, token) in tokens.enumerate() {
            if i % 2 != 0 {
                match parse_hex_u64(token) {
                    Some(value) => values.push(value),
                    None => {
                        self.tolerate("register with unparsable value", lineno)?;
                        values.push(BAD_REGISTER);
                    }
                }
            }
        }

        if let Some(frame) = self.current_frame_mut() {
            frame.regs.extend(values);
        }
        Ok(())
    }

    fn process_stack_row(&mut self, line: &str, lineno: u64) -> Result<(), ReportError> {
        let mut tokens = line.split_ascii_whitespace().take(STACK_ROW_TOKENS);
        let addr = match tokens.next() {
            Some(token) => match parse_hex_u64(token) {
                Some(addr) => addr,
                None => {
                    self.tolerate("stack row with unparsable address", lineno)?;
                    0
                }
            },
            None => 0,
        };
        if addr == 0 {
            // A blank separator line or an explicit null address ends the
            // stack dump.
            self.mode = Mode::Thread;
            return Ok(());
        }

        let mut bytes = Vec::new();
        for token in tokens {
            match parse_hex_u8(token) {
                Some(byte) => bytes.push(byte),
                None => self.tolerate("stack row with unparsable byte", lineno)?,
            }
        }

        if self.cur_frame.is_none() {
            // A stack dump can only show up after a frame header, but the
            // input is not obligated to make sense.
            return self.tolerate("stack data with no frame to attach to", lineno);
        }
        if let Some(frame) = self.current_frame_mut() {
            if frame.stack_base_addr == 0 {
                frame.stack_base_addr = addr;
            }
            frame.stack.extend(bytes);
        }
        Ok(())
    }

    fn push_frame(&mut self, frame_num: u32, func: &str) {
        let thread_idx = match self.cur_thread {
            Some(thread_idx) => thread_idx,
            None => return,
        };
        if let Some(thread) = self.threads.get_mut(thread_idx) {
            thread.frames.push(ContextFrame::new(frame_num, func));
            self.cur_frame = Some(thread.frames.len() - 1);
        }
    }

    fn current_frame_mut(&mut self) -> Option<&mut ContextFrame> {
        let thread_idx = self.cur_thread?;
        let frame_idx = self.cur_frame?;
        self.threads.get_mut(thread_idx)?.frames.get_mut(frame_idx)
    }
}

/// Split a frame header line into its digits and the verbatim description.
///
/// A frame header is at most one leading space, a run of digits, exactly two
/// spaces, then the description, which may be empty and keeps any further
/// spaces: ` 0  libc.so!memcpy + 0x1c`.
fn split_frame_header(line: &str) -> Option<(&str, &str)> {
    let line = line.strip_prefix(' ').unwrap_or(line);
    let digits_end = line
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| line.len());
    if digits_end == 0 {
        return None;
    }
    let func = line[digits_end..].strip_prefix("  ")?;
    Some((&line[..digits_end], func))
}

fn strip_hex_prefix(token: &str) -> &str {
    token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token)
}

fn parse_hex_u64(token: &str) -> Option<u64> {
    u64::from_str_radix(strip_hex_prefix(token), 16).ok()
}

fn parse_hex_u8(token: &str) -> Option<u8> {
    u8::from_str_radix(strip_hex_prefix(token), 16).ok()
}
