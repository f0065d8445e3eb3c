// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Multi-format boot image reader.
//!
//! Every enabled format is asked to bid on the file. A bid is the number of
//! bits of the file that conform to the format (eg. magic strings), so the
//! format that recognizes the most of the file wins. A format that can't
//! possibly beat the current best bid bows out without touching the file.
//!
//! Once a format is selected, the header is read, which produces a generic
//! [`Header`] and a table of segments. The segments can then be iterated and
//! their data streamed from the file.

use std::{fmt, io, str::Utf8Error};

use bstr::ByteSlice;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    format::{
        android::AndroidFormat,
        header::{Header, HeaderFields},
        loki::LokiFormat,
        segment::{Entry, EntryType, Segment, SegmentTable},
    },
    stream::ReadSeek,
};

/// How bad an error is. Variants are ordered from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// The file does not look like the expected format.
    Warn,
    /// An operation failed, but the file handle is still usable.
    Failed,
    /// The file handle can no longer be trusted.
    Fatal,
    /// The file was parsed, but the values can't be represented by [`Header`].
    Unsupported,
}

#[derive(Debug, Error)]
pub enum Error {
    // Format mismatches.
    #[error("No enabled format recognized the file")]
    UnknownFormat,
    #[error("Too small to be {0} image")]
    TooSmall(&'static str),
    #[error("Loki magic not found")]
    LokiMagicUnreachable(#[source] io::Error),
    #[error("Invalid Loki magic: {data:?}", data = .0.as_bstr())]
    InvalidLokiMagic([u8; 4]),
    #[error("Android magic not found in first {0} bytes")]
    AndroidMagicNotFound(usize),
    #[error("Page size cannot be 0")]
    PageSizeZero,
    #[error("Loki shellcode not found")]
    ShellcodeNotFound,
    #[error("Invalid kernel address: {0:#x}")]
    InvalidKernelAddress(u32),
    #[error("No gzip headers found")]
    GzipNotFound,
    #[error("Unexpected EOF when reading {0}")]
    UnexpectedEof(&'static str),
    // Internal errors.
    #[error("Ramdisk offset {ramdisk_offset:#x} greater than aboot offset {aboot_offset:#x}")]
    RamdiskPastAboot {
        ramdisk_offset: u64,
        aboot_offset: u64,
    },
    #[error("Too many entries (max: {0})")]
    TooManyEntries(usize),
    #[error("{entry_type} offset {offset:#x} overlaps previous entry ending at {prev_end:#x}")]
    SegmentOutOfOrder {
        entry_type: EntryType,
        offset: u64,
        prev_end: u64,
    },
    #[error("{entry_type} ({offset:#x} + {size:#x}) exceeds file size {file_size:#x}")]
    SegmentOutOfBounds {
        entry_type: EntryType,
        offset: u64,
        size: u64,
        file_size: u64,
    },
    // Reader usage errors.
    #[error("{operation} cannot be called in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ReaderState,
    },
    #[error("Reader is in a fatal state")]
    ReaderFatal,
    // Values that don't fit in the generic header.
    #[error("{0:?} field is not supported by this format")]
    UnsupportedField(HeaderFields),
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .2.as_bstr())]
    StringNotUtf8(&'static str, #[source] Utf8Error, Vec<u8>),
    // I/O errors.
    #[error("Failed to read boot image data: {0}")]
    DataRead(&'static str, #[source] io::Error),
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Self::UnknownFormat
            | Self::TooSmall(_)
            | Self::LokiMagicUnreachable(_)
            | Self::InvalidLokiMagic(_)
            | Self::AndroidMagicNotFound(_)
            | Self::PageSizeZero
            | Self::ShellcodeNotFound
            | Self::InvalidKernelAddress(_)
            | Self::GzipNotFound
            | Self::UnexpectedEof(_) => Severity::Warn,
            Self::RamdiskPastAboot { .. }
            | Self::TooManyEntries(_)
            | Self::SegmentOutOfOrder { .. }
            | Self::SegmentOutOfBounds { .. }
            | Self::InvalidState { .. } => Severity::Failed,
            Self::ReaderFatal => Severity::Fatal,
            Self::UnsupportedField(_) | Self::StringNotUtf8(..) => Severity::Unsupported,
            Self::DataRead(_, e) => io_severity(e),
        }
    }

    /// Whether the error means that the file is not in the expected format.
    pub fn is_format_mismatch(&self) -> bool {
        self.severity() == Severity::Warn
    }

    /// Whether the error is caused by values computed from the file being
    /// inconsistent with each other, as opposed to the file not matching.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::RamdiskPastAboot { .. }
                | Self::TooManyEntries(_)
                | Self::SegmentOutOfOrder { .. }
                | Self::SegmentOutOfBounds { .. }
        )
    }
}

/// Errors that are specific to the request or may go away when retried leave
/// the file handle usable. Anything else invalidates it.
pub(crate) fn io_severity(e: &io::Error) -> Severity {
    match e.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::InvalidInput => Severity::Failed,
        _ => Severity::Fatal,
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// During bidding, a format mismatch is not an error. It just means that the
/// format bids nothing.
pub(crate) fn bid_probe<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_format_mismatch() => {
            trace!("Probe did not match: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FormatKind {
    Android,
    Loki,
}

impl FormatKind {
    pub const ALL: [Self; 2] = [Self::Android, Self::Loki];

    pub fn name(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Loki => "loki",
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bid {
    /// Number of bits that conform to the format. 0 means no match.
    Score(u32),
    /// The format cannot beat the current best bid, so the file was not read.
    CannotWin,
}

/// Per-file state for one supported format.
#[derive(Debug)]
pub enum Format {
    Android(AndroidFormat),
    Loki(LokiFormat),
}

impl Format {
    pub fn new(kind: FormatKind) -> Self {
        match kind {
            FormatKind::Android => Self::Android(AndroidFormat::default()),
            FormatKind::Loki => Self::Loki(LokiFormat::default()),
        }
    }

    pub fn kind(&self) -> FormatKind {
        match self {
            Self::Android(_) => FormatKind::Android,
            Self::Loki(_) => FormatKind::Loki,
        }
    }

    pub fn bid(&mut self, reader: &mut dyn ReadSeek, best_bid: u32) -> Result<Bid> {
        match self {
            Self::Android(f) => f.bid(reader, best_bid),
            Self::Loki(f) => f.bid(reader, best_bid),
        }
    }

    pub fn read_header(&mut self, reader: &mut dyn ReadSeek) -> Result<Header> {
        match self {
            Self::Android(f) => f.read_header(reader),
            Self::Loki(f) => f.read_header(reader),
        }
    }

    fn segments(&self) -> &SegmentTable {
        match self {
            Self::Android(f) => f.segments(),
            Self::Loki(f) => f.segments(),
        }
    }

    fn segments_mut(&mut self) -> &mut SegmentTable {
        match self {
            Self::Android(f) => f.segments_mut(),
            Self::Loki(f) => f.segments_mut(),
        }
    }

    pub fn read_entry(&mut self) -> Option<Entry> {
        self.segments_mut().read_entry()
    }

    pub fn go_to_entry(&mut self, entry_type: Option<EntryType>) -> Option<Entry> {
        self.segments_mut().go_to_entry(entry_type)
    }

    pub fn read_data(&mut self, reader: &mut dyn ReadSeek, buf: &mut [u8]) -> Result<usize> {
        self.segments_mut().read_data(reader, buf)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderState {
    /// The header has not been read yet.
    New,
    /// Ready to move to an entry.
    Entry,
    /// Positioned at an entry whose data can be read.
    Data,
    /// A fatal error occurred. The file can no longer be used.
    Fatal,
}

/// Boot image reader that picks the right format for a file.
pub struct Reader<F> {
    file: F,
    formats: Vec<Format>,
    selected: Option<usize>,
    state: ReaderState,
}

impl<F: ReadSeek> Reader<F> {
    /// Create a reader with no formats enabled.
    pub fn new(file: F) -> Self {
        Self {
            file,
            formats: vec![],
            selected: None,
            state: ReaderState::New,
        }
    }

    /// Create a reader with every supported format enabled.
    pub fn with_all_formats(file: F) -> Self {
        let mut reader = Self::new(file);
        reader.enable_all_formats();
        reader
    }

    /// Enable a format for bidding. Returns false if it was already enabled.
    pub fn enable_format(&mut self, kind: FormatKind) -> bool {
        if self.formats.iter().any(|f| f.kind() == kind) {
            return false;
        }

        self.formats.push(Format::new(kind));
        true
    }

    pub fn enable_all_formats(&mut self) {
        for kind in FormatKind::ALL {
            self.enable_format(kind);
        }
    }

    /// Force a specific format. Bidding will be skipped when the header is
    /// read.
    pub fn set_format(&mut self, kind: FormatKind) -> Result<()> {
        self.check_state("set_format", &[ReaderState::New])?;

        self.enable_format(kind);
        self.selected = self.formats.iter().position(|f| f.kind() == kind);

        Ok(())
    }

    /// The selected format. This is only known after the header is read or if
    /// the format was forced.
    pub fn format(&self) -> Option<FormatKind> {
        self.selected.map(|i| self.formats[i].kind())
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Segments found when the header was read.
    pub fn segments(&self) -> &[Segment] {
        match self.selected {
            Some(i) => self.formats[i].segments().segments(),
            None => &[],
        }
    }

    pub fn into_inner(self) -> F {
        self.file
    }

    fn check_state(&self, operation: &'static str, allowed: &[ReaderState]) -> Result<()> {
        if self.state == ReaderState::Fatal {
            Err(Error::ReaderFatal)
        } else if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.severity() == Severity::Fatal {
                self.state = ReaderState::Fatal;
            }
        }

        result
    }

    /// Ask every enabled format to bid and select the highest bidder. Ties are
    /// won by the format that was enabled first.
    fn run_bidding(&mut self) -> Result<usize> {
        let mut best_bid = 0;
        let mut best = None;

        for (i, format) in self.formats.iter_mut().enumerate() {
            match format.bid(&mut self.file, best_bid)? {
                Bid::Score(bid) => {
                    debug!("Format {} bid {bid}", format.kind());

                    if bid > best_bid {
                        best_bid = bid;
                        best = Some(i);
                    }
                }
                Bid::CannotWin => {
                    trace!("Format {} cannot beat bid {best_bid}", format.kind());
                }
            }
        }

        best.ok_or(Error::UnknownFormat)
    }

    fn read_header_inner(&mut self) -> Result<Header> {
        let index = match self.selected {
            Some(i) => i,
            None => {
                let i = self.run_bidding()?;
                self.selected = Some(i);
                i
            }
        };

        debug!("Reading header as {}", self.formats[index].kind());

        self.formats[index].read_header(&mut self.file)
    }

    /// Determine the format, if needed, and read the header.
    pub fn read_header(&mut self) -> Result<Header> {
        self.check_state("read_header", &[ReaderState::New])?;

        let result = self.read_header_inner();
        let header = self.track(result)?;
        self.state = ReaderState::Entry;

        Ok(header)
    }

    fn selected_mut(&mut self, operation: &'static str) -> Result<&mut Format> {
        match self.selected {
            Some(i) => Ok(&mut self.formats[i]),
            None => Err(Error::InvalidState {
                operation,
                state: self.state,
            }),
        }
    }

    /// Move to the next entry. Returns [`None`] after the last entry.
    pub fn read_entry(&mut self) -> Result<Option<Entry>> {
        self.check_state("read_entry", &[ReaderState::Entry, ReaderState::Data])?;

        let entry = self.selected_mut("read_entry")?.read_entry();
        self.state = if entry.is_some() {
            ReaderState::Data
        } else {
            ReaderState::Entry
        };

        Ok(entry)
    }

    /// Move to the first entry of a specific type, or to the first entry if no
    /// type is given. Returns [`None`] if there is no such entry.
    pub fn go_to_entry(&mut self, entry_type: Option<EntryType>) -> Result<Option<Entry>> {
        self.check_state("go_to_entry", &[ReaderState::Entry, ReaderState::Data])?;

        let entry = self.selected_mut("go_to_entry")?.go_to_entry(entry_type);
        if entry.is_some() {
            self.state = ReaderState::Data;
        }

        Ok(entry)
    }

    /// Read data from the current entry. Returns 0 at the end of the entry.
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_state("read_data", &[ReaderState::Data])?;

        let Some(index) = self.selected else {
            return Err(Error::InvalidState {
                operation: "read_data",
                state: self.state,
            });
        };
        let result = self.formats[index].read_data(&mut self.file, buf);

        self.track(result)
    }

    /// Read the remaining data of the current entry.
    pub fn read_data_to_end(&mut self) -> Result<Vec<u8>> {
        let mut data = vec![];
        let mut buf = [0u8; 16384];

        loop {
            let n = self.read_data(&mut buf)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }

        Ok(data)
    }
}

impl<F> fmt::Debug for Reader<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("formats", &self.formats)
            .field("selected", &self.selected)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
