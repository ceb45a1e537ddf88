//! PE/COFF Image Context
//!
//! Parses the headers of a PE32/PE32+ image with goblin and provides the two operations the direct loader needs
//! from a container library: copying the image into its in-memory layout and applying base relocations for the
//! address it was actually loaded at.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::vec::Vec;
use core::ops::Range;

use goblin::pe::PE;

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
pub const IMAGE_FILE_MACHINE_X64: u16 = 0x8664;
pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xaa64;

/// Machine type accepted by the direct loader on this platform.
#[cfg(target_arch = "x86_64")]
pub const PLATFORM_MACHINE: u16 = IMAGE_FILE_MACHINE_X64;
#[cfg(target_arch = "x86")]
pub const PLATFORM_MACHINE: u16 = IMAGE_FILE_MACHINE_I386;
#[cfg(target_arch = "aarch64")]
pub const PLATFORM_MACHINE: u16 = IMAGE_FILE_MACHINE_ARM64;

pub const EFI_IMAGE_SUBSYSTEM_EFI_APPLICATION: u16 = 10;
pub const EFI_IMAGE_SUBSYSTEM_EFI_BOOT_SERVICE_DRIVER: u16 = 11;
pub const EFI_IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER: u16 = 12;

const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
const IMAGE_REL_BASED_DIR64: u16 = 10;

const RELOCATION_BLOCK_HEADER_SIZE: usize = 8;

/// Failures reported by the PE/COFF routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// goblin rejected the headers.
    Parse,
    /// The image has no optional header, so it cannot be an EFI image.
    MissingOptionalHeader,
    /// A header field or section lies outside the image or the destination buffer.
    OutOfBounds,
    /// The destination buffer is smaller than `size_of_image`.
    BufferTooSmall,
    /// A relocation block is malformed.
    InvalidRelocationBlock,
    /// A relocation type other than ABSOLUTE, HIGHLOW or DIR64 was found.
    UnsupportedRelocation(u16),
    /// The image must be moved but carries no relocation data.
    RelocationsStripped,
}

/// Section placement information extracted from the section table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub virtual_address: usize,
    pub virtual_size: usize,
    pub pointer_to_raw_data: usize,
    pub size_of_raw_data: usize,
}

/// Header information of a parsed image, the context object passed to [`ImageContext::load_into`] and
/// [`ImageContext::relocate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageContext {
    pub machine: u16,
    pub subsystem: u16,
    pub image_base: u64,
    pub size_of_image: usize,
    pub size_of_headers: usize,
    pub section_alignment: usize,
    pub entry_point_offset: usize,
    pub sections: Vec<Section>,
    relocation_directory: Option<(usize, usize)>,
}

impl ImageContext {
    /// Parses and validates the headers of `image`.
    pub fn parse(image: &[u8]) -> Result<Self, Error> {
        let pe = PE::parse(image).map_err(|err| {
            log::error!("pecoff: failed to parse image headers: {err:?}");
            Error::Parse
        })?;

        let optional_header = pe.header.optional_header.ok_or(Error::MissingOptionalHeader)?;
        let windows = &optional_header.windows_fields;

        let relocation_directory = optional_header
            .data_directories
            .get_base_relocation_table()
            .as_ref()
            .map(|dir| (dir.virtual_address as usize, dir.size as usize))
            .filter(|(_, size)| *size != 0);

        let sections = pe
            .sections
            .iter()
            .map(|section| Section {
                virtual_address: section.virtual_address as usize,
                virtual_size: section.virtual_size as usize,
                pointer_to_raw_data: section.pointer_to_raw_data as usize,
                size_of_raw_data: section.size_of_raw_data as usize,
            })
            .collect();

        let context = ImageContext {
            machine: pe.header.coff_header.machine,
            subsystem: windows.subsystem,
            image_base: windows.image_base as u64,
            size_of_image: windows.size_of_image as usize,
            size_of_headers: windows.size_of_headers as usize,
            section_alignment: windows.section_alignment as usize,
            entry_point_offset: optional_header.standard_fields.address_of_entry_point as usize,
            sections,
            relocation_directory,
        };

        context.validate(image.len())?;
        Ok(context)
    }

    fn validate(&self, image_len: usize) -> Result<(), Error> {
        if self.size_of_image == 0 || self.size_of_headers > self.size_of_image || self.size_of_headers > image_len {
            return Err(Error::OutOfBounds);
        }

        if self.entry_point_offset >= self.size_of_image {
            return Err(Error::OutOfBounds);
        }

        for section in &self.sections {
            let raw_end = section.pointer_to_raw_data.checked_add(section.size_of_raw_data).ok_or(Error::OutOfBounds)?;
            let virtual_end = section.virtual_address.checked_add(section.loaded_size()).ok_or(Error::OutOfBounds)?;
            if raw_end > image_len || virtual_end > self.size_of_image {
                return Err(Error::OutOfBounds);
            }
        }

        if let Some((rva, size)) = self.relocation_directory {
            let end = rva.checked_add(size).ok_or(Error::OutOfBounds)?;
            if end > self.size_of_image {
                return Err(Error::OutOfBounds);
            }
        }

        Ok(())
    }

    /// Copies the headers and sections of `image` into `destination` at their virtual addresses. Bytes not backed
    /// by file data are zeroed.
    pub fn load_into(&self, image: &[u8], destination: &mut [u8]) -> Result<(), Error> {
        if destination.len() < self.size_of_image {
            return Err(Error::BufferTooSmall);
        }

        destination.fill(0);
        destination[..self.size_of_headers].copy_from_slice(&image[..self.size_of_headers]);

        for section in &self.sections {
            let count = section.size_of_raw_data.min(section.loaded_size());
            let source = image.get(span(section.pointer_to_raw_data, count)?).ok_or(Error::OutOfBounds)?;
            let target = destination.get_mut(span(section.virtual_address, count)?).ok_or(Error::OutOfBounds)?;
            target.copy_from_slice(source);
        }

        Ok(())
    }

    /// Applies base relocations to a loaded image so that it runs at `base`.
    pub fn relocate(&self, loaded: &mut [u8], base: u64) -> Result<(), Error> {
        let delta = base.wrapping_sub(self.image_base);

        let Some((rva, size)) = self.relocation_directory else {
            return if delta == 0 { Ok(()) } else { Err(Error::RelocationsStripped) };
        };

        let mut block = rva;
        let directory_end = rva.checked_add(size).ok_or(Error::InvalidRelocationBlock)?;
        while block.checked_add(RELOCATION_BLOCK_HEADER_SIZE).ok_or(Error::InvalidRelocationBlock)? <= directory_end {
            let page_rva = read_u32(loaded, block)? as usize;
            let block_size = read_u32(loaded, block + 4)? as usize;
            let block_end = block.checked_add(block_size).ok_or(Error::InvalidRelocationBlock)?;
            if block_size < RELOCATION_BLOCK_HEADER_SIZE || block_end > directory_end {
                return Err(Error::InvalidRelocationBlock);
            }

            let entries = (block_size - RELOCATION_BLOCK_HEADER_SIZE) / 2;
            for index in 0..entries {
                let entry = read_u16(loaded, block + RELOCATION_BLOCK_HEADER_SIZE + index * 2)?;
                let fixup = page_rva.checked_add((entry & 0x0fff) as usize).ok_or(Error::OutOfBounds)?;
                match entry >> 12 {
                    IMAGE_REL_BASED_ABSOLUTE => {}
                    IMAGE_REL_BASED_HIGHLOW => {
                        let value = read_u32(loaded, fixup)?.wrapping_add(delta as u32);
                        write_bytes(loaded, fixup, &value.to_le_bytes())?;
                    }
                    IMAGE_REL_BASED_DIR64 => {
                        let value = read_u64(loaded, fixup)?.wrapping_add(delta);
                        write_bytes(loaded, fixup, &value.to_le_bytes())?;
                    }
                    other => return Err(Error::UnsupportedRelocation(other)),
                }
            }

            block = block_end;
        }

        Ok(())
    }
}

impl Section {
    fn loaded_size(&self) -> usize {
        if self.virtual_size == 0 { self.size_of_raw_data } else { self.virtual_size }
    }
}

fn span(offset: usize, len: usize) -> Result<Range<usize>, Error> {
    Ok(offset..offset.checked_add(len).ok_or(Error::OutOfBounds)?)
}

fn read_u16(bytes: &[u8], offset: usize) -> Result<u16, Error> {
    let raw = bytes.get(span(offset, 2)?).ok_or(Error::OutOfBounds)?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, Error> {
    let raw = bytes.get(span(offset, 4)?).ok_or(Error::OutOfBounds)?;
    Ok(u32::from_le_bytes(raw.try_into().map_err(|_| Error::OutOfBounds)?))
}

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64, Error> {
    let raw = bytes.get(span(offset, 8)?).ok_or(Error::OutOfBounds)?;
    Ok(u64::from_le_bytes(raw.try_into().map_err(|_| Error::OutOfBounds)?))
}

fn write_bytes(bytes: &mut [u8], offset: usize, value: &[u8]) -> Result<(), Error> {
    bytes.get_mut(span(offset, value.len())?).ok_or(Error::OutOfBounds)?.copy_from_slice(value);
    Ok(())
}
