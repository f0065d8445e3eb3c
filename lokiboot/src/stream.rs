// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Seek, SeekFrom, Write};

use memchr::memmem::Finder;

/// This is only needed because `dyn Read + Seek` is not a valid construct in
/// Rust yet.
pub trait ReadSeek: Read + Seek {
    // https://github.com/rust-lang/rust/issues/145752
    fn issue_145752(&self) {}
}

impl<R: Read + Seek> ReadSeek for R {}

/// Common function for writing a structure to a writer.
pub trait ToWriter<W: Write>: Sized {
    type Error;

    fn to_writer(&self, writer: W) -> Result<(), Self::Error>;
}

/// Extensions for readers to fill a buffer while tolerating a short read at
/// EOF.
pub trait ReadFullyExt {
    /// Read until `buf` is full or EOF is reached. Returns the number of bytes
    /// read, which is only less than `buf.len()` at EOF.
    fn read_fully(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<R: Read + ?Sized> ReadFullyExt for R {
    fn read_fully(&mut self, mut buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;

        while !buf.is_empty() {
            match self.read(buf) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    buf = &mut buf[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(total)
    }
}

/// What [`Search::run`] should do after a match was reported to the visitor.
/// A visitor fails the search by returning an error instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchAction {
    Continue,
    Stop,
}

/// Streaming search for a fixed byte pattern in a seekable file.
///
/// Matches are reported in ascending order. Only a fixed-size window of the
/// file is held in memory at a time. The visitor receives the file itself and
/// may move the file position freely because the search seeks explicitly
/// before every read.
#[derive(Clone, Debug)]
pub struct Search<'a> {
    pattern: &'a [u8],
    /// Offset to start searching from.
    pub start: u64,
    /// Matches must end at or before this offset. [`None`] searches to EOF.
    pub end: Option<u64>,
    /// Only offsets that are multiples of this value are reported. Values of
    /// 0 and 1 report every match.
    pub align: u64,
    /// Stop after this many matches have been reported.
    pub max_matches: Option<u64>,
    /// Size of the in-memory window. It is enlarged if needed to hold at
    /// least two copies of the pattern.
    pub buf_size: usize,
}

impl<'a> Search<'a> {
    pub const DEFAULT_BUF_SIZE: usize = 64 * 1024;

    pub fn new(pattern: &'a [u8]) -> Self {
        Self {
            pattern,
            start: 0,
            end: None,
            align: 1,
            max_matches: None,
            buf_size: Self::DEFAULT_BUF_SIZE,
        }
    }

    pub fn pattern(&self) -> &[u8] {
        self.pattern
    }

    fn is_aligned(&self, offset: u64) -> bool {
        self.align <= 1 || offset % self.align == 0
    }

    /// Run the search, calling `visitor` with the absolute offset of every
    /// match. Errors from the file or from the visitor abort the search.
    pub fn run<R, F>(&self, reader: &mut R, mut visitor: F) -> io::Result<()>
    where
        R: Read + Seek + ?Sized,
        F: FnMut(&mut R, u64) -> io::Result<SearchAction>,
    {
        if self.pattern.is_empty() || self.max_matches == Some(0) {
            return Ok(());
        }

        let keep = self.pattern.len() - 1;
        let buf_size = self.buf_size.max(self.pattern.len() * 2);
        let mut buf = vec![0u8; buf_size];
        let finder = Finder::new(self.pattern);

        // File offset of buf[0] and number of valid bytes in buf.
        let mut buf_offset = self.start;
        let mut valid = 0usize;
        let mut matches = 0u64;

        loop {
            let read_offset = buf_offset + valid as u64;
            let mut to_read = buf_size - valid;

            if let Some(end) = self.end {
                if read_offset >= end {
                    break;
                }
                to_read = to_read.min(usize::try_from(end - read_offset).unwrap_or(usize::MAX));
            }

            reader.seek(SeekFrom::Start(read_offset))?;
            let n = reader.read_fully(&mut buf[valid..valid + to_read])?;
            if n == 0 {
                break;
            }
            valid += n;

            let mut pos = 0;
            while let Some(rel) = finder.find(&buf[pos..valid]) {
                let offset = buf_offset + (pos + rel) as u64;
                pos += rel + 1;

                if !self.is_aligned(offset) {
                    continue;
                }

                matches += 1;

                if visitor(reader, offset)? == SearchAction::Stop
                    || self.max_matches.is_some_and(|m| matches >= m)
                {
                    return Ok(());
                }
            }

            // Keep a tail that could hold the start of a match spanning the
            // window boundary. A full match never fits in the tail, so nothing
            // is reported twice.
            let tail = valid.min(keep);
            buf.copy_within(valid - tail..valid, 0);
            buf_offset += (valid - tail) as u64;
            valid = tail;
        }

        Ok(())
    }
}
