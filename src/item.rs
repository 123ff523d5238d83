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

//! Typed members of the initramfs image tree.
//!
//! Each filesystem object type has its own variant.  Items know how to
//! render themselves as a `gen_init_cpio` record and how to materialize
//! themselves into a real directory.

use log::warn;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chown, fchownat, mkfifo, FchownatFlags, Gid, Uid};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::errors::{Error, PathContext, Result};

/// Type of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Block,
    Character,
}

impl NodeType {
    pub fn as_char(&self) -> char {
        match self {
            NodeType::Block => 'b',
            NodeType::Character => 'c',
        }
    }
}

/// Regular file, copied from `src` on the host.  `dests` is the hard-link
/// set: every destination path shares the same content, mode and owner.
#[derive(Debug, Clone, PartialEq)]
pub struct FileItem {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    dests: Vec<String>,
    pub src: PathBuf,
    pub hash: [u8; 64],
}

impl FileItem {
    pub fn new(mode: u32, uid: u32, gid: u32, dest: String, src: PathBuf, hash: [u8; 64]) -> Self {
        FileItem {
            mode,
            uid,
            gid,
            dests: vec![dest],
            src,
            hash,
        }
    }

    pub fn dests(&self) -> &[String] {
        &self.dests
    }

    /// Destinations in the order they appear in the CPIO list.
    fn sorted_dests(&self) -> Vec<&String> {
        let mut dests: Vec<&String> = self.dests.iter().collect();
        dests.sort();
        dests
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryItem {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub dest: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeItem {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub dest: String,
    pub nodetype: NodeType,
    pub major: u64,
    pub minor: u64,
}

/// Symlink permissions are fixed at 0o777 on Linux; `mode` is kept for the
/// CPIO record only.
#[derive(Debug, Clone, PartialEq)]
pub struct SymlinkItem {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub dest: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipeItem {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub dest: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SocketItem {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub dest: String,
}

/// An object within the initramfs.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    File(FileItem),
    Directory(DirectoryItem),
    Node(NodeItem),
    Symlink(SymlinkItem),
    Pipe(PipeItem),
    Socket(SocketItem),
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::File(item) => write!(f, "file from {}", item.src.display()),
            Item::Directory(item) => write!(f, "directory {}", item.dest),
            Item::Node(item) => match item.nodetype {
                NodeType::Character => {
                    write!(f, "character device {} {} {}", item.major, item.minor, item.dest)
                }
                NodeType::Block => {
                    write!(f, "block device {} {} {}", item.major, item.minor, item.dest)
                }
            },
            Item::Symlink(item) => write!(f, "symlink {} to {}", item.dest, item.target),
            Item::Pipe(item) => write!(f, "named pipe {}", item.dest),
            Item::Socket(item) => write!(f, "named socket {}", item.dest),
        }
    }
}

impl Item {
    /// Destination paths of this item within the initramfs.
    pub fn dests(&self) -> &[String] {
        match self {
            Item::File(item) => item.dests(),
            Item::Directory(item) => std::slice::from_ref(&item.dest),
            Item::Node(item) => std::slice::from_ref(&item.dest),
            Item::Symlink(item) => std::slice::from_ref(&item.dest),
            Item::Pipe(item) => std::slice::from_ref(&item.dest),
            Item::Socket(item) => std::slice::from_ref(&item.dest),
        }
    }

    /// Check if this item claims the given destination path.
    pub fn contains(&self, path: &str) -> bool {
        self.dests().iter().any(|d| d == path)
    }

    /// Two files merge when everything but the destination set matches;
    /// every other variant only merges with an identical item.
    pub fn is_mergeable(&self, other: &Item) -> bool {
        match (self, other) {
            (Item::File(a), Item::File(b)) => {
                a.hash == b.hash && a.mode == b.mode && a.uid == b.uid && a.gid == b.gid
            }
            _ => self == other,
        }
    }

    /// Merge `other` into `self`.  For files this only grows the hard-link
    /// set; for everything else it is a no-op on an identical item.
    pub fn merge(&mut self, other: Item) -> Result<()> {
        if !self.is_mergeable(&other) {
            return Err(Error::ItemConflict {
                item: other.to_string(),
                other: self.to_string(),
            });
        }
        if let (Item::File(existing), Item::File(new)) = (&mut *self, other) {
            for dest in new.dests {
                if !existing.dests.contains(&dest) {
                    existing.dests.push(dest);
                }
            }
        }
        Ok(())
    }

    /// One record in the `gen_init_cpio` list grammar.
    pub fn to_cpio_list(&self) -> String {
        match self {
            Item::File(item) => {
                let dests = item.sorted_dests();
                let mut line = format!(
                    "file {} {} {:03o} {} {}",
                    dests[0],
                    item.src.display(),
                    item.mode,
                    item.uid,
                    item.gid
                );
                for dest in &dests[1..] {
                    line.push(' ');
                    line.push_str(dest);
                }
                line
            }
            Item::Directory(item) => {
                format!("dir {} {:03o} {} {}", item.dest, item.mode, item.uid, item.gid)
            }
            Item::Node(item) => format!(
                "nod {} {:03o} {} {} {} {} {}",
                item.dest,
                item.mode,
                item.uid,
                item.gid,
                item.nodetype.as_char(),
                item.major,
                item.minor
            ),
            Item::Symlink(item) => format!(
                "slink {} {} {:03o} {} {}",
                item.dest, item.target, item.mode, item.uid, item.gid
            ),
            Item::Pipe(item) => {
                format!("pipe {} {:03o} {} {}", item.dest, item.mode, item.uid, item.gid)
            }
            Item::Socket(item) => {
                format!("sock {} {:03o} {} {}", item.dest, item.mode, item.uid, item.gid)
            }
        }
    }

    /// Create this item on a real filesystem under `base_dir`.
    pub fn build_to_directory(&self, base_dir: &Path) -> Result<()> {
        match self {
            Item::File(item) => {
                let dests = item.sorted_dests();
                let first = in_dir(base_dir, dests[0]);
                fs::copy(&item.src, &first).path_ctx(&first)?;
                set_perms(&first, item.mode)?;
                chown_path(&first, item.uid, item.gid)?;
                for dest in &dests[1..] {
                    let link = in_dir(base_dir, dest);
                    fs::hard_link(&first, &link).path_ctx(&link)?;
                }
            }
            Item::Directory(item) => {
                let dest = in_dir(base_dir, &item.dest);
                fs::create_dir(&dest).path_ctx(&dest)?;
                set_perms(&dest, item.mode)?;
                chown_path(&dest, item.uid, item.gid)?;
            }
            Item::Node(item) => {
                let dest = in_dir(base_dir, &item.dest);
                let kind = match item.nodetype {
                    NodeType::Block => SFlag::S_IFBLK,
                    NodeType::Character => SFlag::S_IFCHR,
                };
                mknod(
                    &dest,
                    kind,
                    Mode::from_bits_truncate(item.mode),
                    makedev(item.major, item.minor),
                )
                .map_err(|err| Error::Io {
                    path: dest.clone(),
                    source: err.into(),
                })?;
                set_perms(&dest, item.mode)?;
                chown_path(&dest, item.uid, item.gid)?;
            }
            Item::Symlink(item) => {
                if item.mode != 0o777 {
                    warn!("Cannot set mode for {}", self);
                }
                let dest = in_dir(base_dir, &item.dest);
                std::os::unix::fs::symlink(&item.target, &dest).path_ctx(&dest)?;
                fchownat(
                    None,
                    &dest,
                    Some(Uid::from_raw(item.uid)),
                    Some(Gid::from_raw(item.gid)),
                    FchownatFlags::NoFollowSymlink,
                )
                .map_err(|err| Error::Io {
                    path: dest.clone(),
                    source: err.into(),
                })?;
            }
            Item::Pipe(item) => {
                let dest = in_dir(base_dir, &item.dest);
                mkfifo(&dest, Mode::from_bits_truncate(item.mode)).map_err(|err| Error::Io {
                    path: dest.clone(),
                    source: err.into(),
                })?;
                set_perms(&dest, item.mode)?;
                chown_path(&dest, item.uid, item.gid)?;
            }
            Item::Socket(item) => {
                let dest = in_dir(base_dir, &item.dest);
                bind_socket(&dest)?;
                set_perms(&dest, item.mode)?;
                chown_path(&dest, item.uid, item.gid)?;
            }
        }
        Ok(())
    }
}

/// Join an absolute initramfs destination onto a base directory.
fn in_dir(base_dir: &Path, dest: &str) -> PathBuf {
    base_dir.join(dest.trim_start_matches('/'))
}

fn set_perms(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).path_ctx(path)
}

fn chown_path(path: &Path, uid: u32, gid: u32) -> Result<()> {
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|err| Error::Io {
        path: path.to_path_buf(),
        source: err.into(),
    })
}

fn bind_socket(path: &Path) -> Result<()> {
    use nix::sys::socket::{bind, socket, AddressFamily, SockFlag, SockType, UnixAddr};
    let io_err = |err: nix::Error| Error::Io {
        path: path.to_path_buf(),
        source: err.into(),
    };
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(io_err)?;
    let addr = UnixAddr::new(path).map_err(io_err)?;
    let result = bind(fd, &addr).map_err(io_err);
    let _ = nix::unistd::close(fd);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_item(dest: &str, hash_byte: u8) -> Item {
        Item::File(FileItem::new(
            0o644,
            0,
            0,
            dest.to_string(),
            PathBuf::from("/src/data"),
            [hash_byte; 64],
        ))
    }

    #[test]
    fn cpio_list_lines() {
        assert_eq!(
            Item::Directory(DirectoryItem {
                mode: 0o755,
                uid: 0,
                gid: 0,
                dest: "/bin".into()
            })
            .to_cpio_list(),
            "dir /bin 755 0 0"
        );
        assert_eq!(
            Item::Node(NodeItem {
                mode: 0o600,
                uid: 0,
                gid: 0,
                dest: "/dev/console".into(),
                nodetype: NodeType::Character,
                major: 5,
                minor: 1
            })
            .to_cpio_list(),
            "nod /dev/console 600 0 0 c 5 1"
        );
        assert_eq!(
            Item::Symlink(SymlinkItem {
                mode: 0o777,
                uid: 0,
                gid: 0,
                dest: "/lib64".into(),
                target: "lib".into()
            })
            .to_cpio_list(),
            "slink /lib64 lib 777 0 0"
        );
        assert_eq!(
            Item::Pipe(PipeItem {
                mode: 0o600,
                uid: 0,
                gid: 0,
                dest: "/run/fifo".into()
            })
            .to_cpio_list(),
            "pipe /run/fifo 600 0 0"
        );
        assert_eq!(
            Item::Socket(SocketItem {
                mode: 0o600,
                uid: 0,
                gid: 0,
                dest: "/run/sock".into()
            })
            .to_cpio_list(),
            "sock /run/sock 600 0 0"
        );
    }

    #[test]
    fn file_merge_adds_hardlinks() {
        let mut item = file_item("/bin/busybox", 7);
        item.merge(file_item("/bin/sh", 7)).unwrap();
        // Identical destination merges without duplicating
        item.merge(file_item("/bin/sh", 7)).unwrap();
        assert_eq!(item.dests(), &["/bin/busybox".to_string(), "/bin/sh".to_string()]);
        // Hard links are listed on a single record, extra dests last, sorted
        assert_eq!(
            item.to_cpio_list(),
            "file /bin/busybox /src/data 644 0 0 /bin/sh"
        );
    }

    #[test]
    fn file_merge_refuses_different_content() {
        let mut item = file_item("/bin/a", 1);
        assert!(matches!(
            item.merge(file_item("/bin/b", 2)),
            Err(Error::ItemConflict { .. })
        ));
    }

    #[test]
    fn build_file_and_symlink_to_directory() {
        use std::io::Write;
        use std::os::linux::fs::MetadataExt;

        let root = tempfile::tempdir().unwrap();
        let mut src = tempfile::NamedTempFile::new().unwrap();
        src.write_all(b"content").unwrap();

        let uid = nix::unistd::geteuid().as_raw();
        let gid = nix::unistd::getegid().as_raw();
        let mut item = Item::File(FileItem::new(
            0o640,
            uid,
            gid,
            "/data".into(),
            src.path().to_path_buf(),
            [0; 64],
        ));
        item.merge(Item::File(FileItem::new(
            0o640,
            uid,
            gid,
            "/data2".into(),
            src.path().to_path_buf(),
            [0; 64],
        )))
        .unwrap();
        item.build_to_directory(root.path()).unwrap();

        let first = fs::metadata(root.path().join("data")).unwrap();
        let second = fs::metadata(root.path().join("data2")).unwrap();
        assert_eq!(first.st_ino(), second.st_ino());
        assert_eq!(first.st_mode() & 0o7777, 0o640);

        Item::Symlink(SymlinkItem {
            mode: 0o777,
            uid,
            gid,
            dest: "/link".into(),
            target: "data".into(),
        })
        .build_to_directory(root.path())
        .unwrap();
        assert_eq!(
            fs::read_link(root.path().join("link")).unwrap(),
            PathBuf::from("data")
        );
    }
}
