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

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the generator core.  Each failure mode a caller may
/// want to distinguish gets its own variant; everything carries enough
/// context (path, source name, attempted operation) to be actionable.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad user configuration: graph cycle, unknown source reference,
    /// missing field, malformed value.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Two different items claim the same destination path.
    #[error("{item} conflicts with {other}")]
    ItemConflict { item: String, other: String },

    /// An item destination whose parent directory is not in the store.
    #[error("cannot add {item}: missing parent directories {parents:?}")]
    ItemMissingParent { item: String, parents: Vec<String> },

    /// Executable not found in any search directory.
    #[error("executable not found: {0}")]
    BinaryMissing(String),

    /// Library not found, or no compatible candidate.
    #[error("library not found: {0}")]
    LibraryMissing(String),

    /// A DT_NEEDED entry (or PT_INTERP) could not be resolved.
    #[error("unresolved ELF dependency {dep} of {}", .elf.display())]
    ElfDependencyMissing { elf: PathBuf, dep: String },

    /// Kernel module not found for the target kernel.
    #[error("kernel module not found for {kernel}: {module}")]
    KmodMissing { module: String, kernel: String },

    /// Unload of a non-loaded, final, or still-referenced node.  This is a
    /// bug in the caller, not a user error.
    #[error("dependency graph invariant broken: {0}")]
    GraphInvariantBroken(String),

    /// Non-zero exit or spawn failure of a required child process.
    #[error("external tool failed: {0}")]
    ExternalTool(String),

    /// Host filesystem failure, with the path that caused it.
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failure writing to an output stream.
    #[error("writing output")]
    Output(#[from] io::Error),
}

/// Attach a path to a bare `io::Result`.
pub(crate) trait PathContext<T> {
    fn path_ctx<P: Into<PathBuf>>(self, path: P) -> Result<T>;
}

impl<T> PathContext<T> for io::Result<T> {
    fn path_ctx<P: Into<PathBuf>>(self, path: P) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
