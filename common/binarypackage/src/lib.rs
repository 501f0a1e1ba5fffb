// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, ensure, Context, Result};
use bytes::Buf;
use std::{
    collections::HashMap,
    fs::File,
    io::SeekFrom::Start,
    io::{Read, Seek},
    path::Path,
};

/// Works with Portage binary package files (.tbz2).
///
/// A binary package is a bzip2-compressed tar payload with an XPAK metadata
/// trailer appended. See https://www.mankier.com/5/xpak for the trailer
/// format. Only the trailer is parsed on open; the payload is exposed as a
/// reader so callers never pay for decompression they don't need.
#[derive(Debug)]
pub struct BinaryPackage {
    file: File,
    payload_len: u64,
    xpak: HashMap<String, Vec<u8>>,
    category: String,
    pf: String,
}

const CORRUPTED: &str = "Corrupted .tbz2 file";

impl BinaryPackage {
    /// Opens a Portage binary package file and parses its XPAK trailer.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let size = file.metadata()?.len();

        if size < 24 {
            bail!("{CORRUPTED}: size is too small");
        }

        expect_magic(&mut file, size - 4, b"STOP").context(CORRUPTED)?;
        expect_magic(&mut file, size - 16, b"XPAKSTOP").context(CORRUPTED)?;

        let xpak_offset = u64::from(read_u32(&mut file, size - 8).context(CORRUPTED)?);
        let xpak_start = (size - 8)
            .checked_sub(xpak_offset)
            .with_context(|| format!("{CORRUPTED}: XPAK offset {xpak_offset} out of bounds"))?;

        expect_magic(&mut file, xpak_start, b"XPAKPACK").context(CORRUPTED)?;

        let xpak = parse_xpak(&mut file, xpak_start, size)?;

        let category = xpak_string(&xpak, "CATEGORY")?;
        let pf = xpak_string(&xpak, "PF")?;

        Ok(Self {
            file,
            payload_len: xpak_start,
            xpak,
            category,
            pf,
        })
    }

    /// Returns the XPAK key-value map, values byte-exact.
    pub fn xpak(&self) -> &HashMap<String, Vec<u8>> {
        &self.xpak
    }

    /// The package category, e.g. "sys-libs".
    pub fn category(&self) -> &str {
        &self.category
    }

    /// The package full name including version/revision, e.g.
    /// "ncurses-6.3_p20220423-r1". This equals the file name stem of a
    /// well-formed package file.
    pub fn pf(&self) -> &str {
        &self.pf
    }

    /// The string combining CATEGORY and PF, e.g. "sys-apps/attr-2.5.1".
    pub fn category_pf(&self) -> String {
        format!("{}/{}", self.category, self.pf)
    }

    /// The exact-version atom naming this package, e.g. "=sys-apps/attr-2.5.1".
    pub fn atom(&self) -> String {
        format!("={}/{}", self.category, self.pf)
    }

    /// The package slot (main component only), defaulting to "0".
    pub fn slot(&self) -> String {
        match self.xpak.get("SLOT") {
            Some(raw) => {
                let full = String::from_utf8_lossy(raw);
                let full = full.trim();
                let main = full.split('/').next().unwrap_or_default();
                if main.is_empty() {
                    "0".to_owned()
                } else {
                    main.to_owned()
                }
            }
            None => "0".to_owned(),
        }
    }

    /// The direct-runtime-dependency fingerprint of this package: the
    /// exactly-pinned (`=CATEGORY/PF`) atoms of the XPAK RDEPEND value.
    ///
    /// Tokens in any other dependency syntax (ranges, any-of groups, USE
    /// conditionals) reference packages outside the modeled install set and
    /// are not part of the fingerprint.
    pub fn exact_runtime_atoms(&self) -> Vec<String> {
        let Some(raw) = self.xpak.get("RDEPEND") else {
            return Vec::new();
        };
        String::from_utf8_lossy(raw)
            .split_ascii_whitespace()
            .filter(|token| {
                token.len() > 1 && token.starts_with('=') && token[1..].contains('/')
            })
            .map(|token| token.to_owned())
            .collect()
    }

    /// Returns a reader over the compressed tar payload preceding the XPAK.
    pub fn new_tarball_reader(&mut self) -> Result<impl Sized + Read + '_> {
        self.file.rewind()?;
        Ok((&mut self.file).take(self.payload_len))
    }

    /// Extracts the payload file tree to the specified directory.
    pub fn extract_image(&mut self, output_dir: &Path) -> Result<()> {
        let tarball = self.new_tarball_reader()?;
        let decoder = bzip2::read::BzDecoder::new(tarball);
        let mut archive = tar::Archive::new(decoder);
        archive.set_preserve_permissions(true);
        archive
            .unpack(output_dir)
            .with_context(|| format!("Failed to extract image to {}", output_dir.display()))?;
        Ok(())
    }
}

fn xpak_string(xpak: &HashMap<String, Vec<u8>>, key: &str) -> Result<String> {
    let value = xpak
        .get(key)
        .with_context(|| format!("Binary package is missing XPAK key {key}"))?;
    Ok(std::str::from_utf8(value)
        .with_context(|| format!("XPAK value for {key} is not UTF-8"))?
        .trim()
        .to_owned())
}

fn read_u32(f: &mut File, offset: u64) -> Result<u32> {
    f.seek(Start(offset))?;
    let mut buffer = [0_u8; std::mem::size_of::<u32>()];
    f.read_exact(&mut buffer)?;
    Ok(u32::from_be_bytes(buffer))
}

fn expect_magic(f: &mut File, offset: u64, want: &[u8]) -> Result<()> {
    f.seek(Start(offset))?;
    let mut got = vec![0_u8; want.len()];
    f.read_exact(&mut got)?;
    if got != want {
        bail!(
            "Bad magic: got {:?}, want {:?}",
            String::from_utf8_lossy(&got),
            String::from_utf8_lossy(want)
        );
    }
    Ok(())
}

fn parse_xpak(file: &mut File, xpak_start: u64, size: u64) -> Result<HashMap<String, Vec<u8>>> {
    let index_len = u64::from(read_u32(file, xpak_start + 8)?);
    let data_len = u64::from(read_u32(file, xpak_start + 12)?);
    let index_start = xpak_start + 16;
    if index_start + index_len + data_len != size - 16 {
        bail!("{CORRUPTED}: length inconsistency in the XPAK block");
    }

    file.seek(Start(index_start))?;
    let mut index = vec![0_u8; index_len.try_into()?];
    file.read_exact(&mut index).context(CORRUPTED)?;
    let mut data = vec![0_u8; data_len.try_into()?];
    file.read_exact(&mut data).context(CORRUPTED)?;

    let mut xpak: HashMap<String, Vec<u8>> = HashMap::new();
    let mut index = &index[..];
    while !index.is_empty() {
        ensure!(index.len() >= 4, "{CORRUPTED}: truncated index entry");
        let name_len = index.get_u32() as usize;
        ensure!(
            index.len() >= name_len + 8,
            "{CORRUPTED}: truncated index entry"
        );
        let name = std::str::from_utf8(&index[..name_len])
            .context("XPAK entry name is not UTF-8")?
            .to_owned();
        index.advance(name_len);
        let entry_offset = index.get_u32() as usize;
        let entry_len = index.get_u32() as usize;

        let entry_end = entry_offset
            .checked_add(entry_len)
            .filter(|end| *end <= data.len())
            .with_context(|| {
                format!("{CORRUPTED}: entry {name} references data outside the data segment")
            })?;

        xpak.insert(name, data[entry_offset..entry_end].to_vec());
    }
    Ok(xpak)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileutil::SafeTempDir;
    use std::path::PathBuf;
    use testutil::BinaryPackageBuilder;

    fn write_test_package(dir: &Path) -> Result<PathBuf> {
        let path = dir.join("ncurses-6.3_p20220423-r1.tbz2");
        BinaryPackageBuilder::new()
            .xpak_entry("CATEGORY", "sys-libs\n")
            .xpak_entry("PF", "ncurses-6.3_p20220423-r1\n")
            .xpak_entry("SLOT", "0/6\n")
            .xpak_entry("RDEPEND", ">=sys-libs/gpm-1.20.1 =dev-libs/foo-1.2.3\n")
            .xpak_entry("repository", "portage-stable\n")
            .file("usr/bin/hello", "hello\n")
            .write_to(&path)?;
        Ok(path)
    }

    #[test]
    fn reads_xpak_entries() -> Result<()> {
        let temp_dir = SafeTempDir::new()?;
        let bp = BinaryPackage::open(&write_test_package(temp_dir.path())?)?;

        let as_str =
            |key: &str| -> Option<&str> { bp.xpak().get(key).map(|x| std::str::from_utf8(x).unwrap()) };
        assert_eq!(as_str("CATEGORY"), Some("sys-libs\n"));
        assert_eq!(as_str("PF"), Some("ncurses-6.3_p20220423-r1\n"));
        assert_eq!(as_str("repository"), Some("portage-stable\n"));
        Ok(())
    }

    #[test]
    fn derives_names_and_atom() -> Result<()> {
        let temp_dir = SafeTempDir::new()?;
        let path = write_test_package(temp_dir.path())?;
        let bp = BinaryPackage::open(&path)?;

        assert_eq!(bp.category(), "sys-libs");
        assert_eq!(bp.pf(), "ncurses-6.3_p20220423-r1");
        assert_eq!(bp.category_pf(), "sys-libs/ncurses-6.3_p20220423-r1");
        assert_eq!(bp.atom(), "=sys-libs/ncurses-6.3_p20220423-r1");
        assert_eq!(bp.slot(), "0");
        // PF matches the file name stem.
        assert_eq!(
            path.file_stem().unwrap().to_str().unwrap(),
            bp.pf()
        );
        Ok(())
    }

    #[test]
    fn extracts_exact_runtime_atoms() -> Result<()> {
        let temp_dir = SafeTempDir::new()?;
        let bp = BinaryPackage::open(&write_test_package(temp_dir.path())?)?;
        assert_eq!(bp.exact_runtime_atoms(), vec!["=dev-libs/foo-1.2.3"]);
        Ok(())
    }

    #[test]
    fn rejects_truncated_file() -> Result<()> {
        let temp_dir = SafeTempDir::new()?;
        let path = write_test_package(temp_dir.path())?;

        let mut bytes = std::fs::read(&path)?;
        bytes.truncate(bytes.len() - 1);
        let truncated = temp_dir.path().join("truncated.tbz2");
        std::fs::write(&truncated, bytes)?;

        assert!(BinaryPackage::open(&truncated).is_err());
        Ok(())
    }

    #[test]
    fn rejects_tiny_file() -> Result<()> {
        let temp_dir = SafeTempDir::new()?;
        let path = temp_dir.path().join("tiny.tbz2");
        std::fs::write(&path, b"too small")?;
        assert!(BinaryPackage::open(&path).is_err());
        Ok(())
    }

    #[test]
    fn rejects_corrupt_magic() -> Result<()> {
        let temp_dir = SafeTempDir::new()?;
        let path = write_test_package(temp_dir.path())?;

        let mut bytes = std::fs::read(&path)?;
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(b"SToP");
        let corrupt = temp_dir.path().join("corrupt.tbz2");
        std::fs::write(&corrupt, bytes)?;

        assert!(BinaryPackage::open(&corrupt).is_err());
        Ok(())
    }

    #[test]
    fn rejects_entry_out_of_bounds() -> Result<()> {
        // Hand-craft an XPAK whose single entry points past the data segment.
        let mut block: Vec<u8> = Vec::new();
        block.extend_from_slice(b"XPAKPACK");
        let name = b"KEY";
        let mut index: Vec<u8> = Vec::new();
        index.extend_from_slice(&(name.len() as u32).to_be_bytes());
        index.extend_from_slice(name);
        index.extend_from_slice(&0_u32.to_be_bytes()); // data_off
        index.extend_from_slice(&8_u32.to_be_bytes()); // data_len, beyond segment
        block.extend_from_slice(&(index.len() as u32).to_be_bytes());
        block.extend_from_slice(&4_u32.to_be_bytes()); // data segment is 4 bytes
        block.extend_from_slice(&index);
        block.extend_from_slice(b"data");
        block.extend_from_slice(b"XPAKSTOP");
        let offset = block.len() as u32;
        block.extend_from_slice(&offset.to_be_bytes());
        block.extend_from_slice(b"STOP");

        let temp_dir = SafeTempDir::new()?;
        let path = temp_dir.path().join("bad-entry.tbz2");
        std::fs::write(&path, block)?;

        let err = BinaryPackage::open(&path).unwrap_err();
        assert!(format!("{err:?}").contains("outside the data segment"), "{err:?}");
        Ok(())
    }

    #[test]
    fn payload_round_trips() -> Result<()> {
        let temp_dir = SafeTempDir::new()?;
        let mut bp = BinaryPackage::open(&write_test_package(temp_dir.path())?)?;

        // The payload reader starts at the bzip2 magic.
        let mut head = [0_u8; 3];
        bp.new_tarball_reader()?.read_exact(&mut head)?;
        assert_eq!(&head, b"BZh");

        let extract_dir = temp_dir.path().join("image");
        std::fs::create_dir(&extract_dir)?;
        bp.extract_image(&extract_dir)?;
        assert_eq!(
            std::fs::read_to_string(extract_dir.join("usr/bin/hello"))?,
            "hello\n"
        );
        Ok(())
    }
}
