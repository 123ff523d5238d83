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

use anyhow::{bail, Context, Result};
use openssl::sha::Sha512;
use std::borrow::Cow;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::Path;
use std::process::Command;

/// Runs the provided command, captures its stdout, and swallows its stderr except on failure.
/// The first macro argument is the executable, and following arguments are passed to the command.
/// Returns a Result<String> describing whether the command failed, and if not, its standard
/// output. Output is assumed to be UTF-8. Errors are adequately prefixed with the full command.
#[macro_export]
macro_rules! runcmd_output {
    ($cmd:expr) => (runcmd_output!($cmd,));
    ($cmd:expr, $($args:expr),*) => {{
        let mut cmd = Command::new($cmd);
        $( cmd.arg($args); )*
        // NB: cmd_output already prefixes with cmd in all error paths
        cmd_output(&mut cmd)
    }}
}

/// Runs the provided Command object, captures its stdout, and swallows its stderr except on
/// failure. Returns a Result<String> describing whether the command failed, and if not, its
/// standard output. Output is assumed to be UTF-8. Errors are adequately prefixed with the full
/// command.
pub fn cmd_output(cmd: &mut Command) -> Result<String> {
    let result = cmd
        .output()
        .with_context(|| format!("running {:#?}", cmd))?;
    if !result.status.success() {
        eprint!("{}", String::from_utf8_lossy(&result.stderr));
        bail!("{:#?} failed with {}", cmd, result.status);
    }
    String::from_utf8(result.stdout)
        .with_context(|| format!("decoding as UTF-8 output of `{:#?}`", cmd))
}

/// Like `cmd_output`, but returns the raw stdout bytes.  Needed for helpers with NUL-separated
/// output such as `modinfo -0`.
pub fn cmd_output_raw(cmd: &mut Command) -> Result<Vec<u8>> {
    let result = cmd
        .output()
        .with_context(|| format!("running {:#?}", cmd))?;
    if !result.status.success() {
        eprint!("{}", String::from_utf8_lossy(&result.stderr));
        bail!("{:#?} failed with {}", cmd, result.status);
    }
    Ok(result.stdout)
}

/// Quote a word for a POSIX shell.  Strings made only of characters the
/// shell never interprets are returned unchanged; anything else is wrapped
/// in single quotes, with embedded single quotes escaped.
pub fn quote(s: &str) -> Cow<'_, str> {
    fn shell_safe(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '%' | '+' | '=' | ':' | ',' | '.' | '/' | '-')
    }
    if !s.is_empty() && s.chars().all(shell_safe) {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("'{}'", s.replace('\'', "'\"'\"'")))
    }
}

/// Lexically normalize a path: collapse repeated slashes, resolve `.` and
/// `..` components.  Purely textual; never touches the filesystem.
pub fn normpath(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => (),
            ".." => match parts.last() {
                Some(&"..") | None => {
                    if !absolute {
                        parts.push("..");
                    }
                }
                Some(_) => {
                    parts.pop();
                }
            },
            other => parts.push(other),
        }
    }
    if absolute {
        format!("/{}", parts.join("/"))
    } else if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Remove a prefix from a string, returning the string unchanged if the
/// prefix does not match.
pub fn strip_prefix_str<'a>(s: &'a str, prefix: &str) -> &'a str {
    s.strip_prefix(prefix).unwrap_or(s)
}

/// Parent directory of a normalized path, as a string.  The parent of `/` is `/`.
pub fn parent_dir(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(pos) => path[..pos].to_string(),
        None => String::new(),
    }
}

/// Calculate the SHA-512 of a file.
pub fn hash_file(path: &Path) -> io::Result<[u8; 64]> {
    let mut src = File::open(path)?;
    let mut hasher = Sha512::new();
    let mut buf = [0u8; 65536];
    loop {
        let count = src.read(&mut buf)?;
        if count == 0 {
            break;
        }
        hasher.update(&buf[..count]);
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_quote() {
        assert_eq!(quote("/dev/sda1"), "/dev/sda1");
        assert_eq!(quote("vg0/root"), "vg0/root");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("with space"), "'with space'");
        assert_eq!(quote("it's"), "'it'\"'\"'s'");
        assert_eq!(quote("a;b"), "'a;b'");
        assert_eq!(quote("UUID=abcd-1234"), "UUID=abcd-1234");
    }

    #[test]
    fn test_normpath() {
        assert_eq!(normpath("//usr//lib/"), "/usr/lib");
        assert_eq!(normpath("/a/./b/../c"), "/a/c");
        assert_eq!(normpath("/.."), "/");
        assert_eq!(normpath("a//b"), "a/b");
        assert_eq!(normpath("../x"), "../x");
        assert_eq!(normpath(""), ".");
        assert_eq!(normpath("/"), "/");
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/mnt/data"), "/mnt");
        assert_eq!(parent_dir("/bin"), "/");
        assert_eq!(parent_dir("/"), "/");
    }

    #[test]
    fn test_hash_file() {
        let mut first = tempfile::NamedTempFile::new().unwrap();
        let mut second = tempfile::NamedTempFile::new().unwrap();
        first.write_all(b"same bytes").unwrap();
        second.write_all(b"same bytes").unwrap();
        assert_eq!(
            hash_file(first.path()).unwrap(),
            hash_file(second.path()).unwrap()
        );
        let mut third = tempfile::NamedTempFile::new().unwrap();
        third.write_all(b"other bytes").unwrap();
        assert_ne!(
            hash_file(first.path()).unwrap(),
            hash_file(third.path()).unwrap()
        );
    }
}
