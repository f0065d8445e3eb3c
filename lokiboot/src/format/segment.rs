// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{Read, Seek, SeekFrom},
};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    format::reader::{Error, Result},
    stream::ReadFullyExt,
    util::NumBytes,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum EntryType {
    Kernel,
    Ramdisk,
    SecondBoot,
    DeviceTree,
}

impl EntryType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Kernel => "kernel",
            Self::Ramdisk => "ramdisk",
            Self::SecondBoot => "second",
            Self::DeviceTree => "device tree",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An entry as seen by the consumer of a reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    pub entry_type: EntryType,
    pub size: u64,
}

/// Location of an entry's data within the boot image file.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub entry_type: EntryType,
    pub offset: u64,
    pub size: u64,
}

impl Segment {
    fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("entry_type", &self.entry_type)
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("size", &NumBytes(self.size))
            .finish()
    }
}

/// Ordered table of segments in a boot image. Entries are iterated in
/// insertion order and their data is streamed directly from the file.
///
/// The file position is never assumed to be stable between calls. Every read
/// seeks to the exact offset first.
#[derive(Debug, Default)]
pub struct SegmentTable {
    segments: Vec<Segment>,
    file_size: u64,
    current: Option<usize>,
    read_pos: u64,
}

impl SegmentTable {
    pub const MAX_ENTRIES: usize = 16;

    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all entries. Entries added afterwards must fit within the first
    /// `file_size` bytes of the file.
    pub fn clear(&mut self, file_size: u64) {
        self.segments.clear();
        self.file_size = file_size;
        self.current = None;
        self.read_pos = 0;
    }

    /// Append a segment. Segments must be added in ascending offset order and
    /// must not overlap.
    pub fn add(&mut self, entry_type: EntryType, offset: u64, size: u64) -> Result<()> {
        if self.segments.len() >= Self::MAX_ENTRIES {
            return Err(Error::TooManyEntries(Self::MAX_ENTRIES));
        }

        let segment = Segment {
            entry_type,
            offset,
            size,
        };

        if let Some(prev) = self.segments.last() {
            // The previous end was validated when it was added.
            let prev_end = prev.offset + prev.size;

            if offset <= prev.offset || offset < prev_end {
                return Err(Error::SegmentOutOfOrder {
                    entry_type,
                    offset,
                    prev_end,
                });
            }
        }

        match segment.end() {
            Some(end) if end <= self.file_size => {}
            _ => {
                return Err(Error::SegmentOutOfBounds {
                    entry_type,
                    offset,
                    size,
                    file_size: self.file_size,
                });
            }
        }

        trace!("Adding segment: {segment:?}");
        self.segments.push(segment);

        Ok(())
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn select(&mut self, index: usize) -> Entry {
        let segment = &self.segments[index];

        self.current = Some(index);
        self.read_pos = 0;

        Entry {
            entry_type: segment.entry_type,
            size: segment.size,
        }
    }

    /// Advance to the next entry. Returns [`None`] once all entries have been
    /// visited.
    pub fn read_entry(&mut self) -> Option<Entry> {
        let next = self.current.map_or(0, |i| i + 1);

        if next < self.segments.len() {
            Some(self.select(next))
        } else {
            self.current = Some(self.segments.len());
            None
        }
    }

    /// Jump to the first entry of the specified type, or to the first entry if
    /// no type is specified.
    pub fn go_to_entry(&mut self, entry_type: Option<EntryType>) -> Option<Entry> {
        let index = self
            .segments
            .iter()
            .position(|s| entry_type.is_none_or(|t| s.entry_type == t))?;

        Some(self.select(index))
    }

    /// Read data from the current entry. Returns 0 once the entry has been
    /// fully read or if there is no current entry.
    pub fn read_data<R: Read + Seek + ?Sized>(
        &mut self,
        reader: &mut R,
        buf: &mut [u8],
    ) -> Result<usize> {
        let Some(segment) = self.current.and_then(|i| self.segments.get(i)).copied() else {
            return Ok(0);
        };

        let remaining = segment.size - self.read_pos;
        let to_read = remaining.min(buf.len() as u64) as usize;
        if to_read == 0 {
            return Ok(0);
        }

        reader
            .seek(SeekFrom::Start(segment.offset + self.read_pos))
            .map_err(|e| Error::DataRead("Segment::seek", e))?;

        let n = reader
            .read_fully(&mut buf[..to_read])
            .map_err(|e| Error::DataRead("Segment::data", e))?;
        if n != to_read {
            return Err(Error::UnexpectedEof(segment.entry_type.name()));
        }

        self.read_pos += n as u64;

        Ok(n)
    }
}
