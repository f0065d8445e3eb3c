/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod android;
pub mod header;
pub mod loki;
pub mod padding;
pub mod reader;
pub mod segment;
