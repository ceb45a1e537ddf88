//! Multi-Architecture Image Filtering
//!
//! Apple firmware images may be shipped as "fat" containers wrapping one PE image per architecture. This module
//! recognizes the two container layouts found in the wild and selects the slice that matches the running platform:
//!
//! - EFI fat binaries: little-endian header with magic `0x0ef1fab9`.
//! - Mach-O universal binaries: big-endian header with magic `0xcafebabe`.
//!
//! Both use the same 20 byte architecture record (`cpu_type`, `cpu_subtype`, `offset`, `size`, `align`).
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::ops::Range;

use crate::error::{ImageError, Result};

pub const EFI_FAT_BINARY_MAGIC: u32 = 0x0ef1_fab9;
pub const MACH_FAT_BINARY_MAGIC: u32 = 0xcafe_babe;

const CPU_ARCH_ABI64: u32 = 0x0100_0000;
pub const CPU_TYPE_X86: u32 = 7;
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM64: u32 = 12 | CPU_ARCH_ABI64;

/// CPU type of the slice selected on this platform.
#[cfg(target_arch = "x86_64")]
pub const PLATFORM_CPU_TYPE: u32 = CPU_TYPE_X86_64;
#[cfg(target_arch = "x86")]
pub const PLATFORM_CPU_TYPE: u32 = CPU_TYPE_X86;
#[cfg(target_arch = "aarch64")]
pub const PLATFORM_CPU_TYPE: u32 = CPU_TYPE_ARM64;

const FAT_HEADER_SIZE: usize = 8;
const FAT_ARCH_SIZE: usize = 20;

#[derive(Clone, Copy)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn read_u32(self, bytes: &[u8], offset: usize) -> Option<u32> {
        let raw: [u8; 4] = bytes.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
        Some(match self {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        })
    }
}

fn container_endian(image: &[u8]) -> Option<Endian> {
    let raw: [u8; 4] = image.get(..4)?.try_into().ok()?;
    if u32::from_le_bytes(raw) == EFI_FAT_BINARY_MAGIC {
        Some(Endian::Little)
    } else if u32::from_be_bytes(raw) == MACH_FAT_BINARY_MAGIC {
        Some(Endian::Big)
    } else {
        None
    }
}

/// Returns `true` if `image` starts with a recognized multi-architecture header.
pub fn is_fat_binary(image: &[u8]) -> bool {
    container_endian(image).is_some()
}

/// Selects the slice of `image` for the running platform.
///
/// Returns the byte range of the platform slice, or the full range if `image` is not a multi-architecture
/// container.
pub fn filter(image: &[u8]) -> Result<Range<usize>> {
    filter_architecture(image, PLATFORM_CPU_TYPE)
}

/// Selects the slice of `image` whose CPU type is `cpu_type`.
///
/// Fails with [`ImageError::NotFound`] if the container carries no such slice and with
/// [`ImageError::Unsupported`] if the container is malformed.
pub fn filter_architecture(image: &[u8], cpu_type: u32) -> Result<Range<usize>> {
    let Some(endian) = container_endian(image) else {
        return Ok(0..image.len());
    };

    let arch_count = endian.read_u32(image, 4).ok_or(ImageError::Unsupported)? as usize;
    let table_end = arch_count
        .checked_mul(FAT_ARCH_SIZE)
        .and_then(|size| size.checked_add(FAT_HEADER_SIZE))
        .ok_or(ImageError::Unsupported)?;

    if arch_count == 0 || table_end > image.len() {
        log::error!("fat binary declares {arch_count} architectures in {:#x} bytes", image.len());
        return Err(ImageError::Unsupported);
    }

    for index in 0..arch_count {
        let record = FAT_HEADER_SIZE + index * FAT_ARCH_SIZE;
        let slice_cpu = endian.read_u32(image, record).ok_or(ImageError::Unsupported)?;
        if slice_cpu != cpu_type {
            continue;
        }

        let offset = endian.read_u32(image, record + 8).ok_or(ImageError::Unsupported)? as usize;
        let size = endian.read_u32(image, record + 12).ok_or(ImageError::Unsupported)? as usize;
        let end = offset.checked_add(size).ok_or(ImageError::Unsupported)?;

        if size == 0 || offset < table_end || end > image.len() {
            log::error!("fat binary slice {offset:#x}+{size:#x} for cpu {cpu_type:#x} is out of bounds");
            return Err(ImageError::Unsupported);
        }

        log::debug!("selected fat binary slice {offset:#x}+{size:#x} for cpu {cpu_type:#x}");
        return Ok(offset..end);
    }

    log::info!("fat binary has no slice for cpu {cpu_type:#x}");
    Err(ImageError::NotFound)
}
