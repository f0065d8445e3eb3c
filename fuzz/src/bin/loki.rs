// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use std::io::Cursor;

    use honggfuzz::fuzz;
    use lokiboot::format::reader::{FormatKind, Reader};

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let mut reader = Reader::new(Cursor::new(data));
                if reader.set_format(FormatKind::Loki).is_err() || reader.read_header().is_err() {
                    return;
                }

                while let Ok(Some(_)) = reader.read_entry() {
                    let _ = reader.read_data_to_end();
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
