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

//! Customizable initramfs generator.
//!
//! From a declarative description of what the booting system needs
//! (encrypted volumes, RAID arrays, logical volumes, mounts...), this
//! library produces a `/init` script that brings everything up in order
//! and switches root, and an initramfs image containing the script and
//! every binary, library, kernel module and device node it relies on.

pub mod archive;
pub mod cmdline;
pub mod config;
pub mod data;
pub mod elf;
pub mod errors;
pub mod init;
pub mod initramfs;
pub mod item;
pub mod keymap;
pub mod kmod;
pub mod util;
