// Copyright 2022 initramgen contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! newc CPIO serialization of the image.
//!
//! Three ways to produce the archive: driving `find | cpio` over a built
//! directory, feeding a file list to `gen_init_cpio`, or writing the newc
//! stream in process straight from the item store.  The in-process writer
//! follows the `gen_init_cpio` layout, including its hard-link encoding
//! (shared inode, data on the last link only).  Output can be wrapped in
//! gzip, xz or zstd, the kernel-accepted initramfs compressions.

use anyhow::{anyhow, bail, Context, Result};
use cpio::NewcBuilder;
use flate2::write::GzEncoder;
use log::debug;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::str::FromStr;
use xz2::stream::{Check, Stream};
use xz2::write::XzEncoder;
use zstd::stream::write::Encoder as ZstdEncoder;

use crate::initramfs::Initramfs;
use crate::item::{Item, NodeType};

// gen_init_cpio numbers inodes from 721 and stamps every entry with
// device 3:1; the kernel matches hard links on (ino, dev).
const FIRST_INO: u32 = 721;
const DEV_MAJOR: u32 = 3;
const DEV_MINOR: u32 = 1;

/// Create a CPIO archive from a built initramfs directory, using
/// `find | cpio` exactly as a shell pipeline would, but with explicit
/// argument vectors.
pub fn cpio_from_dir(src: &Path, dest: &mut dyn Write) -> Result<()> {
    debug!("Creating CPIO archive from {}", src.display());

    let mut find = Command::new("find")
        .args([".", "-print0"])
        .current_dir(src)
        .stdout(Stdio::piped())
        .spawn()
        .context("spawning find")?;
    let find_stdout = find.stdout.take().expect("find stdout requested");

    let mut cpio = Command::new("cpio")
        .args(["--quiet", "--null", "--create", "--format=newc"])
        .current_dir(src)
        .stdin(find_stdout)
        .stdout(Stdio::piped())
        .spawn()
        .context("spawning cpio")?;
    let mut cpio_stdout = cpio.stdout.take().expect("cpio stdout requested");
    io::copy(&mut cpio_stdout, dest).context("copying cpio output")?;

    let status = cpio.wait().context("waiting for cpio")?;
    if !status.success() {
        bail!("cpio failed with {status}");
    }
    let status = find.wait().context("waiting for find")?;
    if !status.success() {
        bail!("find failed with {status}");
    }
    Ok(())
}

/// Create a CPIO archive from a `gen_init_cpio` file list.
pub fn cpio_from_list(list: &Path, dest: &mut dyn Write) -> Result<()> {
    debug!("Creating CPIO archive from list {}", list.display());

    let mut gen = Command::new("gen_init_cpio")
        .arg(list)
        .stdout(Stdio::piped())
        .spawn()
        .context("spawning gen_init_cpio")?;
    let mut gen_stdout = gen.stdout.take().expect("gen_init_cpio stdout requested");
    io::copy(&mut gen_stdout, dest).context("copying gen_init_cpio output")?;

    let status = gen.wait().context("waiting for gen_init_cpio")?;
    if !status.success() {
        bail!("gen_init_cpio failed with {status}");
    }
    Ok(())
}

/// Write the image as a newc CPIO stream, in process, in insertion order.
/// Byte layout matches what `gen_init_cpio` would produce from
/// [`Initramfs::build_to_cpio_list`] output.
pub fn write_archive<W: Write>(initramfs: &Initramfs, out: W) -> Result<W> {
    let mut out = out;
    let mut ino = FIRST_INO;
    for item in initramfs.items() {
        out = write_item(item, &mut ino, out)
            .with_context(|| format!("archiving {item}"))?;
    }
    cpio::newc::trailer(out).context("writing CPIO trailer")
}

fn builder(name: &str, ino: u32, mode: u32, uid: u32, gid: u32, nlink: u32) -> NewcBuilder {
    NewcBuilder::new(name)
        .ino(ino)
        .mode(mode)
        .uid(uid)
        .gid(gid)
        .nlink(nlink)
        .dev_major(DEV_MAJOR)
        .dev_minor(DEV_MINOR)
}

fn write_item<W: Write>(item: &Item, ino: &mut u32, mut out: W) -> Result<W> {
    match item {
        Item::File(file) => {
            let mut dests: Vec<&String> = file.dests().iter().collect();
            dests.sort();
            let data = fs::read(&file.src)
                .with_context(|| format!("reading {}", file.src.display()))?;
            let nlink = dests.len() as u32;
            let mode = libc::S_IFREG | (file.mode & 0o7777);
            // Hard links share the inode; only the last entry carries data
            for (index, dest) in dests.iter().enumerate() {
                let last = index == dests.len() - 1;
                let size = if last { data.len() as u32 } else { 0 };
                let mut writer =
                    builder(dest.as_str(), *ino, mode, file.uid, file.gid, nlink).write(out, size);
                if last {
                    writer.write_all(&data).context("writing file data")?;
                }
                out = writer.finish().context("finishing CPIO entry")?;
            }
            *ino += 1;
        }
        Item::Directory(dir) => {
            let mode = libc::S_IFDIR | (dir.mode & 0o7777);
            out = builder(&dir.dest, *ino, mode, dir.uid, dir.gid, 2)
                .write(out, 0)
                .finish()
                .context("finishing CPIO entry")?;
            *ino += 1;
        }
        Item::Node(node) => {
            let kind = match node.nodetype {
                NodeType::Block => libc::S_IFBLK,
                NodeType::Character => libc::S_IFCHR,
            };
            let mode = kind | (node.mode & 0o7777);
            out = builder(&node.dest, *ino, mode, node.uid, node.gid, 1)
                .rdev_major(node.major as u32)
                .rdev_minor(node.minor as u32)
                .write(out, 0)
                .finish()
                .context("finishing CPIO entry")?;
            *ino += 1;
        }
        Item::Symlink(link) => {
            let mode = libc::S_IFLNK | (link.mode & 0o7777);
            let mut body = link.target.clone().into_bytes();
            body.push(0);
            let mut writer = builder(&link.dest, *ino, mode, link.uid, link.gid, 1)
                .write(out, body.len() as u32);
            writer.write_all(&body).context("writing symlink target")?;
            out = writer.finish().context("finishing CPIO entry")?;
            *ino += 1;
        }
        Item::Pipe(pipe) => {
            let mode = libc::S_IFIFO | (pipe.mode & 0o7777);
            out = builder(&pipe.dest, *ino, mode, pipe.uid, pipe.gid, 1)
                .write(out, 0)
                .finish()
                .context("finishing CPIO entry")?;
            *ino += 1;
        }
        Item::Socket(sock) => {
            let mode = libc::S_IFSOCK | (sock.mode & 0o7777);
            out = builder(&sock.dest, *ino, mode, sock.uid, sock.gid, 1)
                .write(out, 0)
                .finish()
                .context("finishing CPIO entry")?;
            *ino += 1;
        }
    }
    Ok(out)
}

/// Output compression of the archive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl FromStr for Compression {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "xz" => Ok(Compression::Xz),
            "zstd" => Ok(Compression::Zstd),
            other => Err(anyhow!("unknown compression format: {other}")),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
        })
    }
}

/// Write-side compression wrapper.  Call [`CompressWriter::finish`] to
/// flush the trailer and recover the inner writer.
pub enum CompressWriter<W: Write> {
    Uncompressed(W),
    Gzip(GzEncoder<W>),
    Xz(XzEncoder<W>),
    Zstd(ZstdEncoder<'static, W>),
}

impl<W: Write> CompressWriter<W> {
    pub fn new(dest: W, compression: Compression) -> Result<Self> {
        use CompressWriter::*;
        Ok(match compression {
            Compression::None => Uncompressed(dest),
            Compression::Gzip => Gzip(GzEncoder::new(dest, flate2::Compression::default())),
            Compression::Xz => {
                // kernel requires CRC32: https://www.kernel.org/doc/Documentation/xz.txt
                let stream =
                    Stream::new_easy_encoder(9, Check::Crc32).context("creating XZ encoder")?;
                Xz(XzEncoder::new_stream(dest, stream))
            }
            Compression::Zstd => {
                Zstd(ZstdEncoder::new(dest, 0).context("creating zstd encoder")?)
            }
        })
    }

    pub fn finish(self) -> Result<W> {
        use CompressWriter::*;
        match self {
            Uncompressed(dest) => Ok(dest),
            Gzip(encoder) => encoder.finish().context("closing gzip compressor"),
            Xz(encoder) => encoder.finish().context("closing XZ compressor"),
            Zstd(encoder) => encoder.finish().context("closing zstd compressor"),
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use CompressWriter::*;
        match self {
            Uncompressed(dest) => dest.write(buf),
            Gzip(encoder) => encoder.write(buf),
            Xz(encoder) => encoder.write(buf),
            Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        use CompressWriter::*;
        match self {
            Uncompressed(dest) => dest.flush(),
            Gzip(encoder) => encoder.flush(),
            Xz(encoder) => encoder.flush(),
            Zstd(encoder) => encoder.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpio::NewcReader;
    use std::collections::HashMap;
    use std::io::{Cursor, Read};
    use std::io::Write as IoWrite;
    use std::path::PathBuf;

    fn sample_image() -> (tempfile::TempDir, Initramfs) {
        let binroot = tempfile::tempdir().unwrap();
        let mut initramfs = Initramfs::new(0, 0, binroot.path(), Some(Vec::new())).unwrap();
        let src = binroot.path().join("payload");
        fs::File::create(&src)
            .unwrap()
            .write_all(b"payload bytes")
            .unwrap();
        initramfs
            .add_file(&src, Some("/bin/one"), Some(0o755))
            .unwrap();
        initramfs
            .add_file(&src, Some("/bin/two"), Some(0o755))
            .unwrap();
        (binroot, initramfs)
    }

    fn read_entries(archive: &[u8]) -> HashMap<String, (u32, Vec<u8>)> {
        let mut entries = HashMap::new();
        let mut cursor = Cursor::new(archive.to_vec());
        loop {
            let mut reader = NewcReader::new(cursor).unwrap();
            if reader.entry().is_trailer() {
                break;
            }
            let name = reader.entry().name().to_string();
            let mode = reader.entry().mode();
            let mut data = Vec::new();
            reader.read_to_end(&mut data).unwrap();
            entries.insert(name, (mode, data));
            cursor = reader.finish().unwrap();
        }
        entries
    }

    #[test]
    fn archive_contains_items_and_hardlinks() {
        let (_binroot, initramfs) = sample_image();
        let archive = write_archive(&initramfs, Vec::new()).unwrap();
        let entries = read_entries(&archive);

        let (mode, data) = &entries["/bin"];
        assert_eq!(mode & 0o170_000, libc::S_IFDIR);
        assert!(data.is_empty());

        let (mode, _) = &entries["/dev/console"];
        assert_eq!(mode & 0o170_000, libc::S_IFCHR);

        // Hard links: data only on the last (sorted) destination
        let (mode, data) = &entries["/bin/one"];
        assert_eq!(mode & 0o170_000, libc::S_IFREG);
        assert!(data.is_empty());
        let (_, data) = &entries["/bin/two"];
        assert_eq!(data.as_slice(), b"payload bytes");
    }

    #[test]
    fn compression_roundtrip() {
        let payload = b"initramfs archive bytes".repeat(64);

        let mut gz = CompressWriter::new(Vec::new(), Compression::Gzip).unwrap();
        gz.write_all(&payload).unwrap();
        let compressed = gz.finish().unwrap();
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&compressed[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);

        let mut xz = CompressWriter::new(Vec::new(), Compression::Xz).unwrap();
        xz.write_all(&payload).unwrap();
        let compressed = xz.finish().unwrap();
        let mut decoded = Vec::new();
        xz2::read::XzDecoder::new(&compressed[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);

        let mut zst = CompressWriter::new(Vec::new(), Compression::Zstd).unwrap();
        zst.write_all(&payload).unwrap();
        let compressed = zst.finish().unwrap();
        assert_eq!(zstd::stream::decode_all(&compressed[..]).unwrap(), payload);
    }

    #[test]
    fn compression_from_str() {
        assert_eq!(Compression::from_str("gzip").unwrap(), Compression::Gzip);
        assert!(Compression::from_str("lzma").is_err());
    }

    #[test]
    fn cpio_from_missing_tool_fails() {
        let mut out = Vec::new();
        assert!(cpio_from_list(&PathBuf::from("/nonexistent/list"), &mut out).is_err());
    }
}
