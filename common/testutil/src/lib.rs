// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Test-only helpers for building synthetic binary packages.
//!
//! Production binary packages come out of the recipe manager; tests need
//! small, hermetically generated ones with known metadata instead.

use std::path::Path;

use anyhow::Result;
use bzip2::write::BzEncoder;

/// Builds a `.tbz2` binary package: a bzip2-compressed tar payload followed
/// by an XPAK metadata trailer.
pub struct BinaryPackageBuilder {
    xpak: Vec<(String, Vec<u8>)>,
    files: Vec<(String, Vec<u8>)>,
}

impl BinaryPackageBuilder {
    pub fn new() -> Self {
        Self {
            xpak: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Adds an XPAK entry. Entries are written in insertion order.
    pub fn xpak_entry(mut self, name: &str, value: impl AsRef<[u8]>) -> Self {
        self.xpak.push((name.to_owned(), value.as_ref().to_vec()));
        self
    }

    /// Adds a regular file to the tar payload.
    pub fn file(mut self, path: &str, content: impl AsRef<[u8]>) -> Self {
        self.files.push((path.to_owned(), content.as_ref().to_vec()));
        self
    }

    /// Serializes the package to bytes.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        let mut encoder = BzEncoder::new(&mut out, bzip2::Compression::fast());
        {
            let mut tar = tar::Builder::new(&mut encoder);
            for (path, content) in &self.files {
                let mut header = tar::Header::new_gnu();
                header.set_mode(0o644);
                header.set_size(content.len() as u64);
                header.set_cksum();
                tar.append_data(&mut header, path, content.as_slice())?;
            }
            tar.finish()?;
        }
        encoder.try_finish()?;
        drop(encoder);

        out.extend_from_slice(&xpak_block(&self.xpak));
        Ok(out)
    }

    /// Serializes the package to a file.
    pub fn write_to(self, path: &Path) -> Result<()> {
        let bytes = self.build()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

impl Default for BinaryPackageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes the XPAK block plus the 8-byte footer.
fn xpak_block(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut index = Vec::new();
    let mut data = Vec::new();
    for (name, value) in entries {
        index.extend_from_slice(&(name.len() as u32).to_be_bytes());
        index.extend_from_slice(name.as_bytes());
        index.extend_from_slice(&(data.len() as u32).to_be_bytes());
        index.extend_from_slice(&(value.len() as u32).to_be_bytes());
        data.extend_from_slice(value);
    }

    let mut block = Vec::new();
    block.extend_from_slice(b"XPAKPACK");
    block.extend_from_slice(&(index.len() as u32).to_be_bytes());
    block.extend_from_slice(&(data.len() as u32).to_be_bytes());
    block.extend_from_slice(&index);
    block.extend_from_slice(&data);
    block.extend_from_slice(b"XPAKSTOP");

    // The footer offset counts from "XPAKPACK" to the footer itself.
    let mut out = block;
    let offset = out.len() as u32;
    out.extend_from_slice(&offset.to_be_bytes());
    out.extend_from_slice(b"STOP");
    out
}

/// Writes a minimal package whose metadata mimics what Portage records
/// (values carry the trailing newline Portage writes).
pub fn write_fake_package(
    path: &Path,
    category: &str,
    pf: &str,
    runtime_deps: &[&str],
) -> Result<()> {
    let mut builder = BinaryPackageBuilder::new()
        .xpak_entry("CATEGORY", format!("{category}\n"))
        .xpak_entry("PF", format!("{pf}\n"))
        .xpak_entry("SLOT", "0\n")
        .file("usr/share/doc/placeholder", "hello\n");
    if !runtime_deps.is_empty() {
        builder = builder.xpak_entry("RDEPEND", format!("{}\n", runtime_deps.join(" ")));
    }
    builder.write_to(path)
}
