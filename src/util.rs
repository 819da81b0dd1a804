//! Utility functions
use crate::error::{text::*, Error, Result};
use std::fmt;

/// Technically Linux requires sysfs to be at `/sys`, calling it a system
/// configuration error otherwise.
///
/// But theres an upcoming distro planning to experiment with filesystem layout
/// changes, including of `/sys`, so do this to allow easily changing it.
pub const SYSFS_PATH: &str = "/sys";

/// Default page size, the most an attribute read can return.
pub const PAGE_SIZE: usize = 4096;

/// Strip leading ASCII whitespace
fn trim_start(input: &[u8]) -> &[u8] {
    let start = input
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(input.len());
    &input[start..]
}

/// The first whitespace delimited token of `input`, like `sscanf("%s")`.
pub fn first_token(input: &[u8]) -> &[u8] {
    let input = trim_start(input);
    let end = input
        .iter()
        .position(|b| b.is_ascii_whitespace())
        .unwrap_or(input.len());
    &input[..end]
}

/// Parse the leading decimal number of `input`, like `strtoul(buf, NULL, 10)`.
///
/// Leading whitespace and anything after the digits is ignored.
///
/// # Errors
///
/// - If there are no digits
/// - If the number does not fit in a [`u64`]
pub fn parse_leading_u64(input: &[u8]) -> Result<u64> {
    let input = trim_start(input);
    let input = input.strip_prefix(b"+").unwrap_or(input);
    let digits = input.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return Err(Error::invalid(NOT_A_NUMBER));
    }
    input[..digits].iter().try_fold(0u64, |acc, b| {
        acc.checked_mul(10)
            .and_then(|acc| acc.checked_add(u64::from(b - b'0')))
            .ok_or_else(|| Error::invalid(format!("{} overflows", show(&input[..digits]))))
    })
}

/// [`parse_leading_u64`], narrowed to a [`u32`]
pub fn parse_leading_u32(input: &[u8]) -> Result<u32> {
    let v = parse_leading_u64(input)?;
    u32::try_from(v).map_err(|_| Error::invalid(format!("{v} out of range")))
}

/// Parse a leading signed decimal, like `atoi`.
pub fn parse_leading_i64(input: &[u8]) -> Result<i64> {
    let input = trim_start(input);
    match input.strip_prefix(b"-") {
        Some(rest) => {
            let v = parse_leading_u64(rest)?;
            0i64.checked_sub_unsigned(v)
                .ok_or_else(|| Error::invalid(format!("-{v} out of range")))
        }
        None => {
            let v = parse_leading_u64(input)?;
            i64::try_from(v).map_err(|_| Error::invalid(format!("{v} out of range")))
        }
    }
}

/// Parse a strict on/off value, `0` or `1`.
pub fn parse_onoff(input: &[u8]) -> Result<bool> {
    match parse_leading_u64(input)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::invalid(NOT_BOOL)),
    }
}

/// Lossy text of `input`, for error messages and logs.
pub fn show(input: &[u8]) -> String {
    String::from_utf8_lossy(input).into_owned()
}

/// A page sized output buffer.
///
/// Writes past the end are dropped silently, the same as `scnprintf` into a
/// sysfs page. Truncation never splits a UTF-8 character.
#[derive(Debug)]
pub struct Page {
    buf: String,
    cap: usize,
}

impl Page {
    /// New page that holds at most `cap` bytes
    pub fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap,
        }
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn into_string(self) -> String {
        self.buf
    }

    /// Format into the page.
    ///
    /// Overflow truncates instead of failing, so there is nothing to report.
    pub fn emit(&mut self, args: fmt::Arguments<'_>) {
        let _ = fmt::Write::write_fmt(self, args);
    }
}

impl fmt::Write for Page {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.cap.saturating_sub(self.buf.len());
        if s.len() <= room {
            self.buf.push_str(s);
            return Ok(());
        }
        let mut end = room;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.push_str(&s[..end]);
        Ok(())
    }
}
