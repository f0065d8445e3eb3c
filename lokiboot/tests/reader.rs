// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::Cell,
    io::{self, Cursor, Read, Seek, SeekFrom},
    rc::Rc,
};

use assert_matches::assert_matches;
use lokiboot::{
    format::{
        android::AndroidHeader,
        header::HeaderFields,
        loki::{LOKI_MAGIC, LOKI_SHELLCODE, LokiHeader, NEW_SUPPORTED_FIELDS, OLD_SUPPORTED_FIELDS},
        padding::ZeroPadding,
        reader::{Bid, Error, Format, FormatKind, Reader, ReaderState, Severity},
        segment::{Entry, EntryType},
    },
    stream::ToWriter,
};

const PAGE_SIZE: u32 = 2048;

fn place(data: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
    let end = offset + bytes.len();
    if data.len() < end {
        data.resize(end, 0);
    }
    data[offset..end].copy_from_slice(bytes);
}

fn android_header() -> AndroidHeader {
    AndroidHeader {
        kernel_size: 0,
        kernel_addr: 0x8020_8000,
        ramdisk_size: 0,
        ramdisk_addr: 0x8200_0000,
        second_size: 0,
        second_addr: 0x8110_0000,
        tags_addr: 0x8020_0100,
        page_size: PAGE_SIZE,
        dt_size: 0,
        unused: 0,
        name: b"loki-board".to_padded_array().unwrap(),
        cmdline: b"console=ttyHSL0".to_padded_array().unwrap(),
        id: [0; 8],
    }
}

fn loki_header() -> LokiHeader {
    LokiHeader {
        magic: LOKI_MAGIC,
        recovery: 0,
        build: b"JDQ39.I337UCUAMDB".to_padded_array().unwrap(),
        orig_kernel_size: 0,
        orig_ramdisk_size: 0,
        ramdisk_addr: 0,
    }
}

fn place_android(data: &mut Vec<u8>, offset: usize, header: &AndroidHeader) {
    let mut buf = vec![];
    header.to_writer(&mut buf).unwrap();
    place(data, offset, &buf);
}

fn place_loki(data: &mut Vec<u8>, header: &LokiHeader) {
    let mut buf = vec![];
    header.to_writer(&mut buf).unwrap();
    place(data, 0x400, &buf);
}

/// New-style image with a 0x1001-byte kernel, 0x20-byte ramdisk, and
/// 0x100-byte device tree. Returns the image and the device tree offset.
fn new_style_image(patched_ramdisk_addr: u32) -> (Vec<u8>, usize) {
    let mut hdr = android_header();
    hdr.kernel_size = 0x1001;
    hdr.ramdisk_size = 0x20;
    hdr.ramdisk_addr = patched_ramdisk_addr;
    hdr.dt_size = 0x100;

    let mut loki = loki_header();
    loki.orig_kernel_size = 0x1001;
    loki.orig_ramdisk_size = 0x20;
    loki.ramdisk_addr = 0x8200_0000;

    let aboot_size = if patched_ramdisk_addr < 0x0fa0_0000 {
        PAGE_SIZE as usize
    } else {
        0x200
    };
    let dt_offset = 0x2800 + aboot_size;
    let shellcode_offset = dt_offset + 0x200;

    let mut data = vec![];
    place_android(&mut data, 0, &hdr);
    place_loki(&mut data, &loki);
    place(&mut data, 0x800, &[0xaa; 0x1001]);
    place(&mut data, 0x2000, &[0xbb; 0x20]);
    place(&mut data, dt_offset, &[0xcc; 0x100]);
    place(&mut data, shellcode_offset, &LOKI_SHELLCODE);
    place(&mut data, shellcode_offset + 60, &0x8300_0000u32.to_le_bytes());
    data.resize(shellcode_offset + 0x200, 0);

    (data, dt_offset)
}

/// Old-style image with a 0x1000-byte kernel. A gzip header without flags is
/// placed right after the kernel and one with the filename flag at
/// `gzip_offset`.
fn old_style_image(patched_ramdisk_addr: u32, gzip_offset: usize, file_size: usize) -> Vec<u8> {
    let mut hdr = android_header();
    hdr.ramdisk_addr = patched_ramdisk_addr;

    let mut data = vec![];
    place_android(&mut data, 0, &hdr);
    place_loki(&mut data, &loki_header());
    place(&mut data, 0x800, &[0xaa; 0x1000]);
    place(&mut data, 0x82c, &0x1000u32.to_le_bytes());
    place(&mut data, 0x1800, &[0x1f, 0x8b, 0x08, 0x00]);
    place(&mut data, gzip_offset, &[0x1f, 0x8b, 0x08, 0x08]);
    data.resize(file_size, 0);

    data
}

fn android_image() -> Vec<u8> {
    let mut hdr = android_header();
    hdr.kernel_size = 0x900;
    hdr.ramdisk_size = 0x100;
    hdr.second_size = 0x10;

    let mut data = vec![];
    place_android(&mut data, 0, &hdr);
    place(&mut data, 0x800, &[0xaa; 0x900]);
    place(&mut data, 0x1800, &[0xbb; 0x100]);
    place(&mut data, 0x2000, &[0xdd; 0x10]);
    data.resize(0x2800, 0);

    data
}

fn entries<F: Read + Seek>(reader: &mut Reader<F>) -> Vec<(Entry, Vec<u8>)> {
    let mut result = vec![];

    while let Some(entry) = reader.read_entry().unwrap() {
        let data = reader.read_data_to_end().unwrap();
        result.push((entry, data));
    }

    result
}

fn entry(entry_type: EntryType, size: u64) -> Entry {
    Entry { entry_type, size }
}

struct PanicReader;

impl Read for PanicReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        panic!("Unexpected read");
    }
}

impl Seek for PanicReader {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        panic!("Unexpected seek");
    }
}

/// Reader whose reads fail with the configured error kind.
struct FlakyReader {
    inner: Cursor<Vec<u8>>,
    fail: Rc<Cell<Option<io::ErrorKind>>>,
}

impl Read for FlakyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.fail.get() {
            Some(kind) => Err(kind.into()),
            None => self.inner.read(buf),
        }
    }
}

impl Seek for FlakyReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

#[test]
fn new_style_image_detected_and_read() {
    let (data, dt_offset) = new_style_image(0x8200_0000);
    let mut reader = Reader::with_all_formats(Cursor::new(data));

    let header = reader.read_header().unwrap();
    assert_eq!(reader.format(), Some(FormatKind::Loki));
    assert_eq!(reader.state(), ReaderState::Entry);

    assert_eq!(header.supported_fields(), NEW_SUPPORTED_FIELDS);
    assert_eq!(header.board_name(), Some("loki-board"));
    assert_eq!(header.kernel_cmdline(), Some("console=ttyHSL0"));
    assert_eq!(header.page_size(), Some(PAGE_SIZE));
    assert_eq!(header.kernel_address(), Some(0x8020_8000));
    assert_eq!(header.ramdisk_address(), Some(0x8300_0000));
    assert_eq!(header.secondboot_address(), Some(0x8110_0000));
    assert_eq!(header.kernel_tags_address(), Some(0x8020_0100));

    let offsets = reader
        .segments()
        .iter()
        .map(|s| s.offset)
        .collect::<Vec<_>>();
    assert_eq!(offsets, [0x800, 0x2000, dt_offset as u64]);

    assert_eq!(
        entries(&mut reader),
        [
            (entry(EntryType::Kernel, 0x1001), vec![0xaa; 0x1001]),
            (entry(EntryType::Ramdisk, 0x20), vec![0xbb; 0x20]),
            (entry(EntryType::DeviceTree, 0x100), vec![0xcc; 0x100]),
        ]
    );
}

#[test]
fn new_style_without_device_tree() {
    let (mut data, _) = new_style_image(0x8200_0000);
    // dt_size in the Android header.
    place(&mut data, 40, &0u32.to_le_bytes());

    let mut reader = Reader::with_all_formats(Cursor::new(data));
    reader.read_header().unwrap();
    assert_eq!(reader.format(), Some(FormatKind::Loki));

    let layout = reader
        .segments()
        .iter()
        .map(|s| (s.entry_type, s.offset, s.size))
        .collect::<Vec<_>>();
    assert_eq!(
        layout,
        [
            (EntryType::Kernel, 0x800, 0x1001),
            (EntryType::Ramdisk, 0x2000, 0x20),
        ]
    );

    assert_eq!(reader.go_to_entry(Some(EntryType::DeviceTree)).unwrap(), None);
}

#[test]
fn new_style_lg_device_tree_offset() {
    let (data, dt_offset) = new_style_image(0x0100_0000);
    assert_eq!(dt_offset, 0x2800 + PAGE_SIZE as usize);

    let mut reader = Reader::with_all_formats(Cursor::new(data));
    reader.read_header().unwrap();

    let dt = reader.go_to_entry(Some(EntryType::DeviceTree)).unwrap();
    assert_eq!(dt, Some(entry(EntryType::DeviceTree, 0x100)));
    assert_eq!(reader.read_data_to_end().unwrap(), vec![0xcc; 0x100]);
}

#[test]
fn old_style_image_detected_and_read() {
    let data = old_style_image(0x8200_0000, 0x2000, 0x3200);
    let mut reader = Reader::with_all_formats(Cursor::new(data));

    let header = reader.read_header().unwrap();
    assert_eq!(reader.format(), Some(FormatKind::Loki));

    assert_eq!(header.supported_fields(), OLD_SUPPORTED_FIELDS);
    assert_eq!(header.ramdisk_address(), Some(0x8220_0000));
    assert_eq!(header.kernel_tags_address(), Some(0x8020_0100));

    let entries = entries(&mut reader);
    assert_eq!(entries.len(), 2);

    assert_eq!(entries[0].0, entry(EntryType::Kernel, 0x1000));
    assert_eq!(&entries[0].1[..0x2c], &[0xaa; 0x2c]);
    assert_eq!(&entries[0].1[0x2c..0x30], &0x1000u32.to_le_bytes());

    // The gzip header with the filename flag wins and the ramdisk extends to
    // the aboot copy.
    assert_eq!(entries[1].0, entry(EntryType::Ramdisk, 0x1000));
    assert_eq!(&entries[1].1[..4], &[0x1f, 0x8b, 0x08, 0x08]);
}

#[test]
fn old_style_lg_ramdisk_ends_at_aboot_page() {
    let data = old_style_image(0x0100_0000, 0x2000, 0x3000);
    let mut reader = Reader::with_all_formats(Cursor::new(data));

    reader.read_header().unwrap();
    assert_eq!(reader.format(), Some(FormatKind::Loki));

    let layout = reader
        .segments()
        .iter()
        .map(|s| (s.entry_type, s.offset, s.size))
        .collect::<Vec<_>>();
    assert_eq!(
        layout,
        [
            (EntryType::Kernel, 0x800, 0x1000),
            (EntryType::Ramdisk, 0x2000, 0x3000 - u64::from(PAGE_SIZE) - 0x2000),
        ]
    );
}

#[test]
fn old_style_zero_kernel_size() {
    let mut data = old_style_image(0x8200_0000, 0x2000, 0x3200);
    place(&mut data, 0x82c, &0u32.to_le_bytes());
    place(&mut data, 0x800, &[0x1f, 0x8b, 0x08, 0x08]);

    let mut reader = Reader::with_all_formats(Cursor::new(data));

    // The ramdisk would start where the empty kernel does.
    let err = reader.read_header().unwrap_err();
    assert_matches!(
        err,
        Error::SegmentOutOfOrder {
            entry_type: EntryType::Ramdisk,
            offset: 0x800,
            prev_end: 0x800,
        }
    );
    assert!(err.is_internal());
}

#[test]
fn old_style_ramdisk_past_aboot() {
    let data = old_style_image(0x8200_0000, 0x2000, 0x2100);
    let mut reader = Reader::with_all_formats(Cursor::new(data));

    let err = reader.read_header().unwrap_err();
    assert_matches!(
        err,
        Error::RamdiskPastAboot {
            ramdisk_offset: 0x2000,
            aboot_offset: 0x1f00,
        }
    );
    assert_eq!(err.severity(), Severity::Failed);
    assert!(err.is_internal());
    assert_eq!(reader.state(), ReaderState::New);
}

#[test]
fn new_style_sizes_past_end_of_file() {
    let mut data = old_style_image(0x8200_0000, 0x2000, 0x3200);

    let mut loki = loki_header();
    loki.orig_kernel_size = 0x1000;
    loki.orig_ramdisk_size = 0x10_0000;
    loki.ramdisk_addr = 0x8200_0000;
    place_loki(&mut data, &loki);
    place(&mut data, 0x2800, &LOKI_SHELLCODE);

    let mut reader = Reader::with_all_formats(Cursor::new(data));

    let err = reader.read_header().unwrap_err();
    assert_matches!(
        err,
        Error::SegmentOutOfBounds {
            entry_type: EntryType::Ramdisk,
            file_size: 0x3200,
            ..
        }
    );
    assert!(err.is_internal());
}

#[test]
fn plain_android_image() {
    let mut reader = Reader::with_all_formats(Cursor::new(android_image()));

    let header = reader.read_header().unwrap();
    assert_eq!(reader.format(), Some(FormatKind::Android));
    assert_eq!(header.ramdisk_address(), Some(0x8200_0000));
    assert_eq!(header.supported_fields(), HeaderFields::all());

    assert_eq!(
        entries(&mut reader),
        [
            (entry(EntryType::Kernel, 0x900), vec![0xaa; 0x900]),
            (entry(EntryType::Ramdisk, 0x100), vec![0xbb; 0x100]),
            (entry(EntryType::SecondBoot, 0x10), vec![0xdd; 0x10]),
        ]
    );
}

#[test]
fn loki_wins_regardless_of_registration_order() {
    let (data, _) = new_style_image(0x8200_0000);

    for order in [
        [FormatKind::Android, FormatKind::Loki],
        [FormatKind::Loki, FormatKind::Android],
    ] {
        let mut reader = Reader::new(Cursor::new(data.clone()));
        for kind in order {
            assert!(reader.enable_format(kind));
        }
        assert!(!reader.enable_format(FormatKind::Loki));

        reader.read_header().unwrap();
        assert_eq!(reader.format(), Some(FormatKind::Loki));
    }
}

#[test]
fn hopeless_bids_do_not_touch_file() {
    let mut android = Format::new(FormatKind::Android);
    assert_eq!(android.bid(&mut PanicReader, 64).unwrap(), Bid::CannotWin);

    let mut loki = Format::new(FormatKind::Loki);
    assert_eq!(loki.bid(&mut PanicReader, 96).unwrap(), Bid::CannotWin);
    assert_eq!(loki.bid(&mut PanicReader, 200).unwrap(), Bid::CannotWin);
}

#[test]
fn loki_bid_requires_both_magics() {
    let mut loki = Format::new(FormatKind::Loki);

    let (data, _) = new_style_image(0x8200_0000);
    assert_eq!(
        loki.bid(&mut Cursor::new(&data), 0).unwrap(),
        Bid::Score(96)
    );

    // Loki magic without an Android header near the start of the file.
    let mut shifted = data.clone();
    shifted[..8].copy_from_slice(&[0; 8]);
    assert_eq!(loki.bid(&mut Cursor::new(&shifted), 0).unwrap(), Bid::Score(0));

    let mut android = Format::new(FormatKind::Android);
    assert_eq!(
        android.bid(&mut Cursor::new(&android_image()), 0).unwrap(),
        Bid::Score(64)
    );
    assert_eq!(
        loki.bid(&mut Cursor::new(&android_image()), 0).unwrap(),
        Bid::Score(0)
    );
}

#[test]
fn unknown_format() {
    let mut reader = Reader::with_all_formats(Cursor::new(vec![0u8; 0x1000]));

    let err = reader.read_header().unwrap_err();
    assert_matches!(err, Error::UnknownFormat);
    assert_eq!(err.severity(), Severity::Warn);
    assert_eq!(reader.format(), None);

    let mut reader = Reader::new(Cursor::new(vec![]));
    assert_matches!(reader.read_header(), Err(Error::UnknownFormat));
}

#[test]
fn forced_format_skips_bidding() {
    // Android header too far from the start for Loki to bid on it.
    let (orig, dt_offset) = new_style_image(0x8200_0000);
    let mut data = vec![0u8; 100];
    data.extend_from_slice(&orig[..0x260]);
    data.resize(0x400, 0);
    data.extend_from_slice(&orig[0x400..]);

    let mut reader = Reader::with_all_formats(Cursor::new(data.clone()));
    reader.read_header().unwrap();
    assert_eq!(reader.format(), Some(FormatKind::Android));

    let mut reader = Reader::new(Cursor::new(data));
    reader.set_format(FormatKind::Loki).unwrap();
    assert_eq!(reader.format(), Some(FormatKind::Loki));

    let header = reader.read_header().unwrap();
    assert_eq!(header.ramdisk_address(), Some(0x8300_0000));
    assert_eq!(
        reader.segments().last().map(|s| s.offset),
        Some(dt_offset as u64)
    );
}

#[test]
fn forced_format_mismatch() {
    let mut reader = Reader::new(Cursor::new(android_image()));
    reader.set_format(FormatKind::Loki).unwrap();

    let err = reader.read_header().unwrap_err();
    assert_matches!(err, Error::InvalidLokiMagic(_));
    assert!(err.is_format_mismatch());
}

#[test]
fn invalid_utf8_board_name() {
    let mut data = android_image();
    data[48] = 0xff;

    let mut reader = Reader::with_all_formats(Cursor::new(data));

    let err = reader.read_header().unwrap_err();
    assert_matches!(err, Error::StringNotUtf8(..));
    assert_eq!(err.severity(), Severity::Unsupported);
}

#[test]
fn state_machine() {
    let (data, _) = new_style_image(0x8200_0000);
    let mut reader = Reader::with_all_formats(Cursor::new(data));
    let mut buf = [0u8; 16];

    assert_matches!(
        reader.read_entry(),
        Err(Error::InvalidState {
            operation: "read_entry",
            state: ReaderState::New,
        })
    );
    assert_matches!(reader.read_data(&mut buf), Err(Error::InvalidState { .. }));

    reader.read_header().unwrap();
    assert_matches!(reader.read_header(), Err(Error::InvalidState { .. }));
    assert_matches!(reader.set_format(FormatKind::Android), Err(Error::InvalidState { .. }));
    assert_matches!(reader.read_data(&mut buf), Err(Error::InvalidState { .. }));

    // Partial read, then jump elsewhere and back.
    reader.go_to_entry(Some(EntryType::Ramdisk)).unwrap();
    assert_eq!(reader.read_data(&mut buf).unwrap(), 16);
    assert_eq!(reader.go_to_entry(None).unwrap(), Some(entry(EntryType::Kernel, 0x1001)));
    assert_eq!(reader.read_data(&mut buf).unwrap(), 16);
    assert_eq!(buf, [0xaa; 16]);

    assert_eq!(reader.go_to_entry(Some(EntryType::SecondBoot)).unwrap(), None);
    assert_eq!(reader.state(), ReaderState::Data);

    let remaining = reader.read_data_to_end().unwrap();
    assert_eq!(remaining.len(), 0x1001 - 16);

    assert_eq!(reader.read_entry().unwrap().map(|e| e.entry_type), Some(EntryType::Ramdisk));
    assert_eq!(reader.read_entry().unwrap().map(|e| e.entry_type), Some(EntryType::DeviceTree));
    assert_eq!(reader.read_entry().unwrap(), None);
    assert_eq!(reader.state(), ReaderState::Entry);
    assert_eq!(reader.read_entry().unwrap(), None);
}

#[test]
fn fatal_error_poisons_reader() {
    let (data, _) = new_style_image(0x8200_0000);
    let fail = Rc::new(Cell::new(None));
    let mut reader = Reader::with_all_formats(FlakyReader {
        inner: Cursor::new(data),
        fail: fail.clone(),
    });
    let mut buf = [0u8; 16];

    reader.read_header().unwrap();
    reader.read_entry().unwrap();

    // Transient errors leave the reader usable.
    fail.set(Some(io::ErrorKind::TimedOut));
    let err = reader.read_data(&mut buf).unwrap_err();
    assert_eq!(err.severity(), Severity::Failed);
    assert_eq!(reader.state(), ReaderState::Data);

    fail.set(None);
    assert_eq!(reader.read_data(&mut buf).unwrap(), 16);

    fail.set(Some(io::ErrorKind::PermissionDenied));
    let err = reader.read_data(&mut buf).unwrap_err();
    assert_matches!(err, Error::DataRead(_, _));
    assert_eq!(err.severity(), Severity::Fatal);
    assert_eq!(reader.state(), ReaderState::Fatal);

    fail.set(None);
    assert_matches!(reader.read_entry(), Err(Error::ReaderFatal));
    assert_matches!(reader.read_data(&mut buf), Err(Error::ReaderFatal));
}

#[test]
fn fatal_error_during_bidding() {
    let (data, _) = new_style_image(0x8200_0000);
    let mut reader = Reader::with_all_formats(FlakyReader {
        inner: Cursor::new(data),
        fail: Rc::new(Cell::new(Some(io::ErrorKind::BrokenPipe))),
    });

    let err = reader.read_header().unwrap_err();
    assert_eq!(err.severity(), Severity::Fatal);
    assert_eq!(reader.state(), ReaderState::Fatal);
    assert_eq!(reader.format(), None);
}
