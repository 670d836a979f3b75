//! Text scanning with the `Scanner` type.

use std::fmt;

/// The position of the scanner in the input, one based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// Current line.
    pub line: usize,
    /// Current column.
    pub col: usize,
}

impl Default for Position {
    fn default() -> Self {
        Self { line: 1, col: 1 }
    }
}

/// Kind of the errors raised by the [`Scanner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// End of input reached.
    Eof,
    /// A byte other than the expected one was found.
    Char {
        /// The expected byte.
        expected: u8,
        /// The byte found.
        found: u8,
    },
    /// The input does not start with the expected sequence.
    Tag,
    /// A number could not be read.
    Num,
}

/// An error raised by the [`Scanner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    /// What went wrong.
    pub kind: ErrorKind,
    /// Byte offset where the error was detected.
    pub offset: usize,
    /// Line where the error was detected.
    pub line: usize,
    /// Column where the error was detected.
    pub col: usize,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scan error at line:{} column:{} (offset {}) kind:{:?}",
            self.line, self.col, self.offset, self.kind
        )
    }
}

impl std::error::Error for Error {}

/// Result type of the scanner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A cursor over a byte slice that keeps track of offset, line and column.
#[derive(Debug, Clone)]
pub struct Scanner<'buf> {
    src: &'buf [u8],
    offset: usize,
    pos: Position,
}

impl<'buf> Scanner<'buf> {
    /// Creates a new `Scanner` over `src`.
    pub fn new(src: &'buf [u8]) -> Self {
        Self {
            src,
            offset: 0,
            pos: Position::default(),
        }
    }

    /// Current byte offset from the start of the input.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Current line and column.
    #[inline]
    pub fn position(&self) -> &Position {
        &self.pos
    }

    /// Returns `true` when all input was consumed.
    #[inline]
    pub fn is_eof(&self) -> bool {
        self.offset >= self.src.len()
    }

    /// The bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> &'buf [u8] {
        &self.src[self.offset..]
    }

    /// Returns the next byte without consuming it.
    #[inline]
    pub fn peek_byte(&self) -> Option<u8> {
        self.src.get(self.offset).copied()
    }

    /// Returns the next `n` bytes without consuming them.
    #[inline]
    pub fn peek_bytes(&self, n: usize) -> Option<&'buf [u8]> {
        self.src.get(self.offset..self.offset + n)
    }

    /// Consumes and returns the next byte.
    pub fn next_byte(&mut self) -> Option<u8> {
        let byte = self.peek_byte()?;
        self.bump(byte);
        Some(byte)
    }

    /// Consumes up to `n` bytes.
    pub fn advance_by(&mut self, n: usize) {
        for _ in 0..n {
            if self.next_byte().is_none() {
                break;
            }
        }
    }

    /// Consumes the next byte if it is equal to `byte`.
    pub fn advance_if_eq(&mut self, byte: u8) -> bool {
        if self.peek_byte() == Some(byte) {
            self.bump(byte);
            true
        } else {
            false
        }
    }

    /// Returns the bytes while `func` holds, without consuming them.
    pub fn peek_while(&self, func: impl Fn(u8) -> bool) -> &'buf [u8] {
        let rem = self.remaining();
        let end = rem.iter().position(|&b| !func(b)).unwrap_or(rem.len());

        &rem[..end]
    }

    /// Consumes the bytes while `func` holds.
    pub fn read_while(&mut self, func: impl Fn(u8) -> bool) -> &'buf [u8] {
        let start = self.offset;
        while let Some(byte) = self.peek_byte() {
            if !func(byte) {
                break;
            }
            self.bump(byte);
        }

        &self.src[start..self.offset]
    }

    /// Consumes the bytes until `byte` is found. The `byte` itself is not consumed.
    pub fn read_until(&mut self, byte: u8) -> &'buf [u8] {
        self.read_while(|b| b != byte)
    }

    /// Consumes `byte` or fails.
    pub fn must_read(&mut self, expected: u8) -> Result<()> {
        match self.peek_byte() {
            Some(found) if found == expected => {
                self.bump(found);
                Ok(())
            }
            Some(found) => Err(self.error(ErrorKind::Char { expected, found })),
            None => Err(self.error(ErrorKind::Eof)),
        }
    }

    /// Consumes `bytes` or fails without consuming anything.
    pub fn must_read_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        match self.peek_bytes(bytes.len()) {
            Some(found) if found == bytes => {
                self.advance_by(bytes.len());
                Ok(())
            }
            Some(_) => Err(self.error(ErrorKind::Tag)),
            None => Err(self.error(ErrorKind::Eof)),
        }
    }

    /// Reads an unsigned decimal number.
    pub fn read_u32(&mut self) -> Result<u32> {
        let digits = self.peek_while(|b| b.is_ascii_digit());
        if digits.is_empty() {
            return Err(self.error(ErrorKind::Num));
        }
        let mut n: u32 = 0;
        for &d in digits {
            n = n
                .checked_mul(10)
                .and_then(|n| n.checked_add(u32::from(d - b'0')))
                .ok_or_else(|| self.error(ErrorKind::Num))?;
        }
        self.advance_by(digits.len());

        Ok(n)
    }

    /// Builds an [`Error`] at the current position.
    pub fn error(&self, kind: ErrorKind) -> Error {
        Error {
            kind,
            offset: self.offset,
            line: self.pos.line,
            col: self.pos.col,
        }
    }

    #[inline]
    fn bump(&mut self, byte: u8) {
        self.offset += 1;
        if byte == b'\n' {
            self.pos.line += 1;
            self.pos.col = 1;
        } else {
            self.pos.col += 1;
        }
    }
}
