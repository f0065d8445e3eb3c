// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
    mem,
};

use bstr::ByteSlice;
use memchr::memmem;
use tracing::{debug, trace};
use zerocopy::{FromBytes, IntoBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{
        header::{Header, HeaderFields, fixed_str},
        padding::{self, ZeroPadding},
        reader::{self, Bid, Error, Result},
        segment::{EntryType, SegmentTable},
    },
    stream::{ReadFullyExt, ReadSeek, ToWriter},
};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;

/// Maximum offset of the Android header for plain Android images.
pub const MAX_HEADER_OFFSET: usize = 512;

pub const DEFAULT_KERNEL_OFFSET: u32 = 0x0000_8000;
pub const DEFAULT_TAGS_OFFSET: u32 = 0x0000_0100;

pub const SUPPORTED_FIELDS: HeaderFields = HeaderFields::all();

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawAndroidHeader {
    magic: [u8; 8],
    kernel_size: little_endian::U32,
    kernel_addr: little_endian::U32,
    ramdisk_size: little_endian::U32,
    ramdisk_addr: little_endian::U32,
    second_size: little_endian::U32,
    second_addr: little_endian::U32,
    tags_addr: little_endian::U32,
    page_size: little_endian::U32,
    dt_size: little_endian::U32,
    unused: little_endian::U32,
    name: [u8; BOOT_NAME_SIZE],
    cmdline: [u8; BOOT_ARGS_SIZE],
    id: [little_endian::U32; 8],
}

pub const HEADER_SIZE: usize = mem::size_of::<RawAndroidHeader>();

/// Legacy Android boot image header in native byte order. Text fields are
/// kept as raw NUL-padded bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct AndroidHeader {
    pub kernel_size: u32,
    pub kernel_addr: u32,
    pub ramdisk_size: u32,
    pub ramdisk_addr: u32,
    pub second_size: u32,
    pub second_addr: u32,
    pub tags_addr: u32,
    pub page_size: u32,
    pub dt_size: u32,
    pub unused: u32,
    pub name: [u8; BOOT_NAME_SIZE],
    pub cmdline: [u8; BOOT_ARGS_SIZE],
    pub id: [u32; 8],
}

impl fmt::Debug for AndroidHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AndroidHeader")
            .field("kernel_size", &self.kernel_size)
            .field("kernel_addr", &format_args!("{:#010x}", self.kernel_addr))
            .field("ramdisk_size", &self.ramdisk_size)
            .field("ramdisk_addr", &format_args!("{:#010x}", self.ramdisk_addr))
            .field("second_size", &self.second_size)
            .field("second_addr", &format_args!("{:#010x}", self.second_addr))
            .field("tags_addr", &format_args!("{:#010x}", self.tags_addr))
            .field("page_size", &self.page_size)
            .field("dt_size", &self.dt_size)
            .field("unused", &self.unused)
            .field("name", &self.name.until_nul().as_bstr())
            .field("cmdline", &self.cmdline.until_nul().as_bstr())
            .field("id", &self.id)
            .finish()
    }
}

impl AndroidHeader {
    fn from_raw(raw: &RawAndroidHeader) -> Self {
        Self {
            kernel_size: raw.kernel_size.get(),
            kernel_addr: raw.kernel_addr.get(),
            ramdisk_size: raw.ramdisk_size.get(),
            ramdisk_addr: raw.ramdisk_addr.get(),
            second_size: raw.second_size.get(),
            second_addr: raw.second_addr.get(),
            tags_addr: raw.tags_addr.get(),
            page_size: raw.page_size.get(),
            dt_size: raw.dt_size.get(),
            unused: raw.unused.get(),
            name: raw.name,
            cmdline: raw.cmdline,
            id: raw.id.map(|v| v.get()),
        }
    }

    /// Parse a header from the beginning of `data`, which must start with the
    /// boot magic.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (raw, _) =
            RawAndroidHeader::read_from_prefix(data).map_err(|_| Error::TooSmall("Android"))?;
        if raw.magic != BOOT_MAGIC {
            return Err(Error::AndroidMagicNotFound(0));
        }

        Ok(Self::from_raw(&raw))
    }

    pub fn board_name(&self) -> Result<String> {
        fixed_str("Android::name", &self.name)
    }

    pub fn kernel_cmdline(&self) -> Result<String> {
        fixed_str("Android::cmdline", &self.cmdline)
    }

    /// Fill in the generic header fields from this header. `ramdisk_addr` and
    /// `tags_addr` are passed in because some formats store the real values
    /// elsewhere.
    pub fn to_header(
        &self,
        supported_fields: HeaderFields,
        ramdisk_addr: u32,
        tags_addr: u32,
    ) -> Result<Header> {
        let mut header = Header::new(supported_fields);
        header.set_board_name(self.board_name()?)?;
        header.set_kernel_cmdline(self.kernel_cmdline()?)?;
        header.set_page_size(self.page_size)?;
        header.set_kernel_address(self.kernel_addr)?;
        header.set_ramdisk_address(ramdisk_addr)?;
        header.set_secondboot_address(self.second_addr)?;
        header.set_kernel_tags_address(tags_addr)?;

        Ok(header)
    }
}

impl<W: Write> ToWriter<W> for AndroidHeader {
    type Error = io::Error;

    fn to_writer(&self, mut writer: W) -> io::Result<()> {
        let raw = RawAndroidHeader {
            magic: BOOT_MAGIC,
            kernel_size: self.kernel_size.into(),
            kernel_addr: self.kernel_addr.into(),
            ramdisk_size: self.ramdisk_size.into(),
            ramdisk_addr: self.ramdisk_addr.into(),
            second_size: self.second_size.into(),
            second_addr: self.second_addr.into(),
            tags_addr: self.tags_addr.into(),
            page_size: self.page_size.into(),
            dt_size: self.dt_size.into(),
            unused: self.unused.into(),
            name: self.name,
            cmdline: self.cmdline,
            id: self.id.map(little_endian::U32::new),
        };

        raw.write_to_io(&mut writer)
    }
}

/// Whether the ramdisk address belongs to an LG device. These devices use a
/// whole page for aboot instead of 0x200 bytes.
pub fn is_lg_ramdisk_address(address: u32) -> bool {
    address > 0x88f0_0000 || address < 0x0fa0_0000
}

/// Search for the Android header within the first `max_header_offset` bytes
/// of the file. Returns the header and its offset.
pub fn find_android_header<R: Read + Seek + ?Sized>(
    reader: &mut R,
    max_header_offset: usize,
) -> Result<(AndroidHeader, u64)> {
    reader
        .seek(SeekFrom::Start(0))
        .map_err(|e| Error::DataRead("Android::seek", e))?;

    let mut buf = vec![0u8; max_header_offset + HEADER_SIZE];
    let n = reader
        .read_fully(&mut buf)
        .map_err(|e| Error::DataRead("Android::header", e))?;
    let data = &buf[..n];

    let search_size = data.len().min(max_header_offset + BOOT_MAGIC.len());
    let offset = memmem::find(&data[..search_size], &BOOT_MAGIC)
        .ok_or(Error::AndroidMagicNotFound(max_header_offset))?;

    trace!("Found Android magic at {offset:#x}");

    if data.len() - offset < HEADER_SIZE {
        return Err(Error::TooSmall("Android"));
    }

    let header = AndroidHeader::from_bytes(&data[offset..])?;

    Ok((header, offset as u64))
}

/// Context for plain Android boot images.
#[derive(Debug, Default)]
pub struct AndroidFormat {
    header: Option<(AndroidHeader, u64)>,
    segments: SegmentTable,
}

impl AndroidFormat {
    const MAX_BID: u32 = (BOOT_MAGIC.len() * 8) as u32;

    pub fn bid(&mut self, reader: &mut dyn ReadSeek, best_bid: u32) -> Result<Bid> {
        if best_bid >= Self::MAX_BID {
            return Ok(Bid::CannotWin);
        }

        match reader::bid_probe(find_android_header(reader, MAX_HEADER_OFFSET))? {
            Some(header) => {
                self.header = Some(header);
                Ok(Bid::Score(Self::MAX_BID))
            }
            None => Ok(Bid::Score(0)),
        }
    }

    pub fn read_header(&mut self, reader: &mut dyn ReadSeek) -> Result<Header> {
        let (hdr, header_offset) = match &self.header {
            Some(h) => h.clone(),
            None => {
                let h = find_android_header(reader, MAX_HEADER_OFFSET)?;
                self.header = Some(h.clone());
                h
            }
        };

        if hdr.page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        let header = hdr.to_header(SUPPORTED_FIELDS, hdr.ramdisk_addr, hdr.tags_addr)?;

        let file_size = reader
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::DataRead("Android::file_size", e))?;
        self.segments.clear(file_size);

        let page_size = u64::from(hdr.page_size);
        let mut pos = header_offset + HEADER_SIZE as u64;
        pos += padding::calc(pos, page_size);

        let sections = [
            (EntryType::Kernel, hdr.kernel_size),
            (EntryType::Ramdisk, hdr.ramdisk_size),
            (EntryType::SecondBoot, hdr.second_size),
            (EntryType::DeviceTree, hdr.dt_size),
        ];

        for (entry_type, size) in sections {
            let size = u64::from(size);

            // Empty sections would share their offset with the next one.
            if size == 0 {
                continue;
            }

            self.segments.add(entry_type, pos, size)?;

            pos += size;
            pos += padding::calc(pos, page_size);
        }

        debug!("Android header: {hdr:?}");

        Ok(header)
    }

    pub fn segments(&self) -> &SegmentTable {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut SegmentTable {
        &mut self.segments
    }
}
