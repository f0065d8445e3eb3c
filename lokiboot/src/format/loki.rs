// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Reader for Loki-patched boot images.
//!
//! Loki images are Android boot images that were modified to bypass the
//! bootloader's signature check on some LG and Samsung devices. Patching
//! overwrites fields in the Android header and inserts a small shellcode that
//! restores the original values at boot time. Reading such an image means
//! recovering the original layout and header values.
//!
//! There are two generations of the Loki tool:
//!
//! * New-style images store the original kernel size, ramdisk size and
//!   ramdisk address in the Loki header. The original ramdisk address is also
//!   embedded in the shellcode.
//! * Old-style images store none of that. The kernel size is taken from the
//!   Linux kernel image itself and the ramdisk is located by searching for a
//!   gzip header. The ramdisk is assumed to extend up to the aboot copy at the
//!   end of the file.

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    mem,
};

use bstr::ByteSlice;
use tracing::{debug, trace};
use zerocopy::{FromBytes, IntoBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{
        android::{
            self, AndroidHeader, DEFAULT_KERNEL_OFFSET, DEFAULT_TAGS_OFFSET, find_android_header,
            is_lg_ramdisk_address,
        },
        header::{Header, HeaderFields},
        padding::{self, ZeroPadding},
        reader::{self, Bid, Error, Result, Severity},
        segment::{EntryType, Segment, SegmentTable},
    },
    stream::{ReadFullyExt, ReadSeek, Search, SearchAction, ToWriter},
};

pub const LOKI_MAGIC: [u8; 4] = *b"LOKI";
pub const LOKI_MAGIC_OFFSET: u64 = 0x400;

/// Maximum offset of the Android header when bidding on a Loki image.
pub const LOKI_MAX_HEADER_OFFSET: usize = 32;

/// Shellcode inserted by the Loki tool. The last 9 bytes are two 32-bit
/// placeholders and a NUL terminator. The patch tool overwrites the
/// placeholders, and the second one receives the original ramdisk address.
pub const LOKI_SHELLCODE: [u8; 65] = [
    0xfe, 0xb5, 0x0d, 0x4d, 0xd5, 0xf8, 0x88, 0x04, 0xab, 0x68, 0x98, 0x42, 0x12, 0xd0, 0xd5, 0xf8,
    0x90, 0x64, 0x0a, 0x4c, 0xd5, 0xf8, 0x8c, 0x74, 0x07, 0xf5, 0x80, 0x57, 0x0f, 0xce, 0x0f, 0xc4,
    0x10, 0x3f, 0xfb, 0xdc, 0xd5, 0xf8, 0x88, 0x04, 0x04, 0x49, 0xd5, 0xf8, 0x8c, 0x24, 0xa8, 0x60,
    0x69, 0x61, 0x2a, 0x61, 0x00, 0x20, 0xfe, 0xbd, 0xff, 0xff, 0xff, 0xff, 0xee, 0xee, 0xee, 0xee,
    0x00,
];

/// Size of the portion of the shellcode that is the same in every patched
/// image.
pub const LOKI_SHELLCODE_SEARCH_SIZE: usize = LOKI_SHELLCODE.len() - 9;

/// Offset of the ramdisk address relative to the start of the shellcode.
pub const LOKI_SHELLCODE_RAMDISK_ADDR_OFFSET: u64 = (LOKI_SHELLCODE.len() - 5) as u64;

/// Fallback ramdisk address for old-style images, relative to the kernel
/// address. This matches the jflte layout.
const OLD_RAMDISK_ADDR_DELTA: u32 = 0x01ff_8000;

/// Offset of the `_edata - _start` field in an ARM zImage.
const LINUX_KERNEL_SIZE_OFFSET: u64 = 0x2c;

/// Gzip magic bytes plus the deflate compression method.
const GZIP_DEFLATE_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];

/// Size of the aboot copy at the end of the file for non-LG devices.
const DEFAULT_ABOOT_SIZE: u32 = 0x200;

pub const OLD_SUPPORTED_FIELDS: HeaderFields = HeaderFields::BOARD_NAME
    .union(HeaderFields::KERNEL_CMDLINE)
    .union(HeaderFields::PAGE_SIZE)
    .union(HeaderFields::KERNEL_ADDRESS)
    .union(HeaderFields::RAMDISK_ADDRESS)
    .union(HeaderFields::SECONDBOOT_ADDRESS)
    .union(HeaderFields::KERNEL_TAGS_ADDRESS);

pub const NEW_SUPPORTED_FIELDS: HeaderFields = OLD_SUPPORTED_FIELDS;

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawLokiHeader {
    magic: [u8; 4],
    recovery: little_endian::U32,
    build: [u8; 128],
    orig_kernel_size: little_endian::U32,
    orig_ramdisk_size: little_endian::U32,
    ramdisk_addr: little_endian::U32,
}

pub const LOKI_HEADER_SIZE: usize = mem::size_of::<RawLokiHeader>();

/// Loki header in native byte order.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LokiHeader {
    pub magic: [u8; 4],
    /// Nonzero if the image is a recovery image.
    pub recovery: u32,
    pub build: [u8; 128],
    pub orig_kernel_size: u32,
    pub orig_ramdisk_size: u32,
    pub ramdisk_addr: u32,
}

impl fmt::Debug for LokiHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LokiHeader")
            .field("magic", &self.magic.as_bstr())
            .field("recovery", &self.recovery)
            .field("build", &self.build.until_nul().as_bstr())
            .field("orig_kernel_size", &self.orig_kernel_size)
            .field("orig_ramdisk_size", &self.orig_ramdisk_size)
            .field("ramdisk_addr", &format_args!("{:#010x}", self.ramdisk_addr))
            .finish()
    }
}

impl LokiHeader {
    fn from_raw(raw: &RawLokiHeader) -> Self {
        Self {
            magic: raw.magic,
            recovery: raw.recovery.get(),
            build: raw.build,
            orig_kernel_size: raw.orig_kernel_size.get(),
            orig_ramdisk_size: raw.orig_ramdisk_size.get(),
            ramdisk_addr: raw.ramdisk_addr.get(),
        }
    }

    /// New-style images record all of the original values that patching
    /// overwrote.
    pub fn is_new_style(&self) -> bool {
        self.orig_kernel_size != 0 && self.orig_ramdisk_size != 0 && self.ramdisk_addr != 0
    }
}

impl<W: Write> ToWriter<W> for LokiHeader {
    type Error = io::Error;

    fn to_writer(&self, mut writer: W) -> io::Result<()> {
        let raw = RawLokiHeader {
            magic: self.magic,
            recovery: self.recovery.into(),
            build: self.build,
            orig_kernel_size: self.orig_kernel_size.into(),
            orig_ramdisk_size: self.orig_ramdisk_size.into(),
            ramdisk_addr: self.ramdisk_addr.into(),
        };

        raw.write_to_io(&mut writer)
    }
}

/// Read a little-endian u32 at an absolute offset.
fn read_le32<R: Read + Seek + ?Sized>(
    reader: &mut R,
    offset: u64,
    what: &'static str,
) -> Result<u32> {
    reader
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::DataRead(what, e))?;

    match little_endian::U32::read_from_io(&mut *reader) {
        Ok(value) => Ok(value.get()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::UnexpectedEof(what)),
        Err(e) => Err(Error::DataRead(what, e)),
    }
}

/// Read the Loki header at its fixed offset. Returns the header and its
/// offset.
pub fn find_loki_header<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<(LokiHeader, u64)> {
    // An unreachable magic offset is only fatal if the file is unusable.
    reader
        .seek(SeekFrom::Start(LOKI_MAGIC_OFFSET))
        .map_err(|e| match reader::io_severity(&e) {
            Severity::Fatal => Error::DataRead("Loki::seek", e),
            _ => Error::LokiMagicUnreachable(e),
        })?;

    let mut buf = [0u8; LOKI_HEADER_SIZE];
    let n = reader
        .read_fully(&mut buf)
        .map_err(|e| Error::DataRead("Loki::header", e))?;
    if n != buf.len() {
        return Err(Error::TooSmall("Loki"));
    }

    let raw = RawLokiHeader::read_from_bytes(&buf).map_err(|_| Error::TooSmall("Loki"))?;
    if raw.magic != LOKI_MAGIC {
        return Err(Error::InvalidLokiMagic(raw.magic));
    }

    Ok((LokiHeader::from_raw(&raw), LOKI_MAGIC_OFFSET))
}

/// Find the original ramdisk address. For new-style images, this is stored in
/// the shellcode. Otherwise, the jflte default relative to the kernel address
/// is used.
pub fn find_ramdisk_address<R: Read + Seek + ?Sized>(
    reader: &mut R,
    hdr: &AndroidHeader,
    loki_hdr: &LokiHeader,
) -> Result<u32> {
    if loki_hdr.ramdisk_addr == 0 {
        return hdr
            .kernel_addr
            .checked_add(OLD_RAMDISK_ADDR_DELTA)
            .ok_or(Error::InvalidKernelAddress(hdr.kernel_addr));
    }

    let mut search = Search::new(&LOKI_SHELLCODE[..LOKI_SHELLCODE_SEARCH_SIZE]);
    search.max_matches = Some(1);

    let mut shellcode_offset = None;

    search
        .run(reader, |_, offset| {
            shellcode_offset = Some(offset);
            Ok(SearchAction::Stop)
        })
        .map_err(|e| Error::DataRead("Loki::shellcode", e))?;

    let offset = shellcode_offset.ok_or(Error::ShellcodeNotFound)?;
    trace!("Found Loki shellcode at {offset:#x}");

    read_le32(
        reader,
        offset + LOKI_SHELLCODE_RAMDISK_ADDR_OFFSET,
        "ramdisk address",
    )
}

/// Find the gzip-compressed ramdisk in an old-style image, starting the search
/// at `start`. Headers with the original filename flag (`0x08`) are preferred
/// over headers with no flags because ramdisks are usually compressed with the
/// gzip command line tool.
pub fn find_gzip_offset<R: Read + Seek + ?Sized>(reader: &mut R, start: u64) -> Result<u64> {
    let mut flag0_offset = None;
    let mut flag8_offset = None;

    let mut search = Search::new(&GZIP_DEFLATE_MAGIC);
    search.start = start;

    search
        .run(reader, |r, offset| {
            let orig_pos = r.stream_position()?;

            r.seek(SeekFrom::Start(offset + 3))?;
            let mut flags = [0u8; 1];
            if r.read_fully(&mut flags)? != flags.len() {
                return Ok(SearchAction::Stop);
            }

            match flags[0] {
                0x00 if flag0_offset.is_none() => flag0_offset = Some(offset),
                0x08 if flag8_offset.is_none() => flag8_offset = Some(offset),
                _ => {}
            }

            r.seek(SeekFrom::Start(orig_pos))?;

            if flag0_offset.is_some() && flag8_offset.is_some() {
                Ok(SearchAction::Stop)
            } else {
                Ok(SearchAction::Continue)
            }
        })
        .map_err(|e| Error::DataRead("Loki::gzip", e))?;

    trace!("Gzip candidates: flags 0x00: {flag0_offset:?}, flags 0x08: {flag8_offset:?}");

    flag8_offset.or(flag0_offset).ok_or(Error::GzipNotFound)
}

/// Compute the ramdisk size of an old-style image. The ramdisk is assumed to
/// extend up to the aboot copy at the end of the file, so the result may
/// include trailing padding.
pub fn find_ramdisk_size<R: Read + Seek + ?Sized>(
    reader: &mut R,
    hdr: &AndroidHeader,
    ramdisk_offset: u64,
) -> Result<u64> {
    let aboot_size = if is_lg_ramdisk_address(hdr.ramdisk_addr) {
        hdr.page_size
    } else {
        DEFAULT_ABOOT_SIZE
    };

    let file_size = reader
        .seek(SeekFrom::End(0))
        .map_err(|e| Error::DataRead("Loki::file_size", e))?;
    let aboot_offset = file_size
        .checked_sub(u64::from(aboot_size))
        .ok_or(Error::TooSmall("Loki"))?;

    if ramdisk_offset > aboot_offset {
        return Err(Error::RamdiskPastAboot {
            ramdisk_offset,
            aboot_offset,
        });
    }

    Ok(aboot_offset - ramdisk_offset)
}

/// Read the kernel size from the Linux kernel image header.
pub fn find_linux_kernel_size<R: Read + Seek + ?Sized>(
    reader: &mut R,
    kernel_offset: u64,
) -> Result<u32> {
    read_le32(
        reader,
        kernel_offset + LINUX_KERNEL_SIZE_OFFSET,
        "kernel size",
    )
}

/// Location of the entries of a Loki image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LokiLayout {
    pub kernel: Segment,
    pub ramdisk: Segment,
    pub device_tree: Option<Segment>,
}

/// Read the header and layout of an old-style image.
pub fn read_old_header<R: Read + Seek + ?Sized>(
    reader: &mut R,
    hdr: &AndroidHeader,
    loki_hdr: &LokiHeader,
) -> Result<(Header, LokiLayout)> {
    if hdr.page_size == 0 {
        return Err(Error::PageSizeZero);
    }

    let page_size = u64::from(hdr.page_size);
    let tags_addr = hdr
        .kernel_addr
        .wrapping_sub(DEFAULT_KERNEL_OFFSET)
        .wrapping_add(DEFAULT_TAGS_OFFSET);

    let kernel_size = u64::from(find_linux_kernel_size(reader, page_size)?);

    let gzip_start = page_size + kernel_size + padding::calc(kernel_size, page_size);
    let ramdisk_offset = find_gzip_offset(reader, gzip_start)?;
    let ramdisk_size = find_ramdisk_size(reader, hdr, ramdisk_offset)?;

    let ramdisk_addr = find_ramdisk_address(reader, hdr, loki_hdr)?;

    debug!(
        "Old-style Loki image: kernel size: {kernel_size:#x}, \
        ramdisk offset: {ramdisk_offset:#x}, ramdisk size: {ramdisk_size:#x}"
    );

    let header = hdr.to_header(OLD_SUPPORTED_FIELDS, ramdisk_addr, tags_addr)?;

    let layout = LokiLayout {
        kernel: Segment {
            entry_type: EntryType::Kernel,
            offset: page_size,
            size: kernel_size,
        },
        ramdisk: Segment {
            entry_type: EntryType::Ramdisk,
            offset: ramdisk_offset,
            size: ramdisk_size,
        },
        device_tree: None,
    };

    Ok((header, layout))
}

/// Read the header and layout of a new-style image.
pub fn read_new_header<R: Read + Seek + ?Sized>(
    reader: &mut R,
    hdr: &AndroidHeader,
    loki_hdr: &LokiHeader,
) -> Result<(Header, LokiLayout)> {
    if hdr.page_size == 0 {
        return Err(Error::PageSizeZero);
    }

    let page_size = u64::from(hdr.page_size);
    let fake_size = if is_lg_ramdisk_address(hdr.ramdisk_addr) {
        page_size
    } else {
        u64::from(DEFAULT_ABOOT_SIZE)
    };

    let ramdisk_addr = find_ramdisk_address(reader, hdr, loki_hdr)?;

    let header = hdr.to_header(NEW_SUPPORTED_FIELDS, ramdisk_addr, hdr.tags_addr)?;

    // Values are at most u32::MAX, so a few additions can't overflow.
    let mut pos = page_size;

    let kernel = Segment {
        entry_type: EntryType::Kernel,
        offset: pos,
        size: u64::from(loki_hdr.orig_kernel_size),
    };
    pos += kernel.size;
    pos += padding::calc(pos, page_size);

    let ramdisk = Segment {
        entry_type: EntryType::Ramdisk,
        offset: pos,
        size: u64::from(loki_hdr.orig_ramdisk_size),
    };
    pos += ramdisk.size;
    pos += padding::calc(pos, page_size);

    // The aboot copy sits between the ramdisk and the device tree.
    let device_tree = (hdr.dt_size != 0).then(|| Segment {
        entry_type: EntryType::DeviceTree,
        offset: pos + fake_size,
        size: u64::from(hdr.dt_size),
    });

    Ok((
        header,
        LokiLayout {
            kernel,
            ramdisk,
            device_tree,
        },
    ))
}

/// Context for Loki images.
#[derive(Debug, Default)]
pub struct LokiFormat {
    loki_header: Option<(LokiHeader, u64)>,
    android_header: Option<(AndroidHeader, u64)>,
    segments: SegmentTable,
}

impl LokiFormat {
    const MAX_BID: u32 = ((android::BOOT_MAGIC.len() + LOKI_MAGIC.len()) * 8) as u32;

    /// Both the Loki magic and the Android magic must be found for a nonzero
    /// bid.
    pub fn bid(&mut self, reader: &mut dyn ReadSeek, best_bid: u32) -> Result<Bid> {
        if best_bid >= Self::MAX_BID {
            return Ok(Bid::CannotWin);
        }

        let Some(loki_header) = reader::bid_probe(find_loki_header(reader))? else {
            return Ok(Bid::Score(0));
        };
        self.loki_header = Some(loki_header);

        let Some(android_header) =
            reader::bid_probe(find_android_header(reader, LOKI_MAX_HEADER_OFFSET))?
        else {
            return Ok(Bid::Score(0));
        };
        self.android_header = Some(android_header);

        Ok(Bid::Score(Self::MAX_BID))
    }

    /// Read the header. If no bid was performed because the format was forced,
    /// the headers are located here instead.
    pub fn read_header(&mut self, reader: &mut dyn ReadSeek) -> Result<Header> {
        let loki_hdr = match self.loki_header {
            Some((h, _)) => h,
            None => {
                let found = find_loki_header(reader)?;
                self.loki_header = Some(found);
                found.0
            }
        };

        let hdr = match &self.android_header {
            Some((h, _)) => h.clone(),
            None => {
                let found = find_android_header(reader, android::MAX_HEADER_OFFSET)?;
                let hdr = found.0.clone();
                self.android_header = Some(found);
                hdr
            }
        };

        trace!("Loki header: {loki_hdr:?}");

        let (header, layout) = if loki_hdr.is_new_style() {
            debug!("Reading new-style Loki header");
            read_new_header(reader, &hdr, &loki_hdr)?
        } else {
            debug!("Reading old-style Loki header");
            read_old_header(reader, &hdr, &loki_hdr)?
        };

        let file_size = reader
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::DataRead("Loki::file_size", e))?;
        self.segments.clear(file_size);

        for segment in [Some(layout.kernel), Some(layout.ramdisk), layout.device_tree]
            .into_iter()
            .flatten()
        {
            self.segments
                .add(segment.entry_type, segment.offset, segment.size)?;
        }

        Ok(header)
    }

    pub fn segments(&self) -> &SegmentTable {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut SegmentTable {
        &mut self.segments
    }
}
