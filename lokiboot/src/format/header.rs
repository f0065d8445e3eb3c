// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, str};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::format::{
    padding::ZeroPadding,
    reader::{Error, Result},
};

bitflags! {
    /// Header fields that a boot image format is able to store.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
    pub struct HeaderFields: u32 {
        const BOARD_NAME = 1 << 0;
        const KERNEL_CMDLINE = 1 << 1;
        const PAGE_SIZE = 1 << 2;
        const KERNEL_ADDRESS = 1 << 3;
        const RAMDISK_ADDRESS = 1 << 4;
        const SECONDBOOT_ADDRESS = 1 << 5;
        const KERNEL_TAGS_ADDRESS = 1 << 6;
    }
}

/// Format-independent view of a boot image header. Fields that the format
/// does not store are [`None`].
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Header {
    supported_fields: HeaderFields,
    board_name: Option<String>,
    kernel_cmdline: Option<String>,
    page_size: Option<u32>,
    kernel_address: Option<u32>,
    ramdisk_address: Option<u32>,
    secondboot_address: Option<u32>,
    kernel_tags_address: Option<u32>,
}

/// Convert a fixed-size, NUL-terminated text field into an owned string.
pub fn fixed_str(field: &'static str, data: &[u8]) -> Result<String> {
    let data = data.until_nul();

    str::from_utf8(data)
        .map(|s| s.to_owned())
        .map_err(|e| Error::StringNotUtf8(field, e, data.to_vec()))
}

macro_rules! header_field {
    ($name:ident, $set:ident, $flag:ident, String) => {
        pub fn $name(&self) -> Option<&str> {
            self.$name.as_deref()
        }

        header_field!(@set $name, $set, $flag, String);
    };
    ($name:ident, $set:ident, $flag:ident, u32) => {
        pub fn $name(&self) -> Option<u32> {
            self.$name
        }

        header_field!(@set $name, $set, $flag, u32);
    };
    (@set $name:ident, $set:ident, $flag:ident, $type:ty) => {
        /// Set the field. This fails if the format does not support it.
        pub fn $set(&mut self, value: $type) -> Result<()> {
            self.check_supported(HeaderFields::$flag)?;
            self.$name = Some(value);
            Ok(())
        }
    };
}

impl Header {
    pub fn new(supported_fields: HeaderFields) -> Self {
        Self {
            supported_fields,
            ..Default::default()
        }
    }

    pub fn supported_fields(&self) -> HeaderFields {
        self.supported_fields
    }

    /// Change the supported fields. Values of fields that are no longer
    /// supported are cleared.
    pub fn set_supported_fields(&mut self, fields: HeaderFields) {
        self.supported_fields = fields;

        if !fields.contains(HeaderFields::BOARD_NAME) {
            self.board_name = None;
        }
        if !fields.contains(HeaderFields::KERNEL_CMDLINE) {
            self.kernel_cmdline = None;
        }
        if !fields.contains(HeaderFields::PAGE_SIZE) {
            self.page_size = None;
        }
        if !fields.contains(HeaderFields::KERNEL_ADDRESS) {
            self.kernel_address = None;
        }
        if !fields.contains(HeaderFields::RAMDISK_ADDRESS) {
            self.ramdisk_address = None;
        }
        if !fields.contains(HeaderFields::SECONDBOOT_ADDRESS) {
            self.secondboot_address = None;
        }
        if !fields.contains(HeaderFields::KERNEL_TAGS_ADDRESS) {
            self.kernel_tags_address = None;
        }
    }

    fn check_supported(&self, field: HeaderFields) -> Result<()> {
        if self.supported_fields.contains(field) {
            Ok(())
        } else {
            Err(Error::UnsupportedField(field))
        }
    }

    header_field!(board_name, set_board_name, BOARD_NAME, String);
    header_field!(kernel_cmdline, set_kernel_cmdline, KERNEL_CMDLINE, String);
    header_field!(page_size, set_page_size, PAGE_SIZE, u32);
    header_field!(kernel_address, set_kernel_address, KERNEL_ADDRESS, u32);
    header_field!(ramdisk_address, set_ramdisk_address, RAMDISK_ADDRESS, u32);
    header_field!(secondboot_address, set_secondboot_address, SECONDBOOT_ADDRESS, u32);
    header_field!(kernel_tags_address, set_kernel_tags_address, KERNEL_TAGS_ADDRESS, u32);
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("supported_fields", &self.supported_fields)
            .field("board_name", &self.board_name)
            .field("kernel_cmdline", &self.kernel_cmdline)
            .field("page_size", &self.page_size)
            .field("kernel_address", &self.kernel_address.map(Hex))
            .field("ramdisk_address", &self.ramdisk_address.map(Hex))
            .field("secondboot_address", &self.secondboot_address.map(Hex))
            .field("kernel_tags_address", &self.kernel_tags_address.map(Hex))
            .finish()
    }
}

struct Hex(u32);

impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn text(value: Option<&str>) -> String {
            value.map_or_else(|| "(unset)".to_owned(), |v| format!("{v:?}"))
        }

        fn addr(value: Option<u32>) -> String {
            value.map_or_else(|| "(unset)".to_owned(), |v| format!("{v:#x}"))
        }

        let page_size = self
            .page_size
            .map_or_else(|| "(unset)".to_owned(), |v| v.to_string());

        writeln!(f, "Header:")?;
        writeln!(f, "- Board name:          {}", text(self.board_name()))?;
        writeln!(f, "- Kernel cmdline:      {}", text(self.kernel_cmdline()))?;
        writeln!(f, "- Page size:           {page_size}")?;
        writeln!(f, "- Kernel address:      {}", addr(self.kernel_address))?;
        writeln!(f, "- Ramdisk address:     {}", addr(self.ramdisk_address))?;
        writeln!(f, "- Second address:      {}", addr(self.secondboot_address))?;
        write!(f, "- Kernel tags address: {}", addr(self.kernel_tags_address))
    }
}
