//! Image Source Acquisition
//!
//! Produces the bytes of an image for the load pipeline. A caller-supplied buffer is borrowed as-is; otherwise the
//! image is read from the file its device path names. The ownership of the resulting [`SourceBuffer`] is fixed when
//! it is created, so dropping it always does the right thing.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{boxed::Box, vec::Vec};
use core::ops::Range;

use r_efi::efi;

use crate::error::{ImageError, Result};

/// Read access to files named by device paths.
pub trait ImageFileSystem {
    /// Opens the file at `device_path` read-only.
    fn open(
        &self,
        device_path: *mut efi::protocols::device_path::Protocol,
    ) -> core::result::Result<Box<dyn ImageFile>, efi::Status>;
}

/// An open, readable file. Dropping it closes the file.
pub trait ImageFile {
    /// Returns the size of the file in bytes.
    fn size(&mut self) -> core::result::Result<u64, efi::Status>;

    /// Reads from the start of the file into `buffer`, returning the number of bytes read.
    fn read(&mut self, buffer: &mut [u8]) -> core::result::Result<usize, efi::Status>;
}

/// Bytes that are either owned by the loader or borrowed from the caller.
#[derive(Debug)]
enum Buffer<'a> {
    /// Read from storage by the loader and released when dropped.
    Owned(Vec<u8>),
    /// Supplied by the caller, who keeps ownership.
    Borrowed(&'a [u8]),
}

/// Image bytes handed through the load pipeline.
///
/// Filtering narrows the visible range without copying.
#[derive(Debug)]
pub struct SourceBuffer<'a> {
    buffer: Buffer<'a>,
    range: Range<usize>,
}

impl<'a> SourceBuffer<'a> {
    pub fn borrowed(bytes: &'a [u8]) -> Self {
        Self { range: 0..bytes.len(), buffer: Buffer::Borrowed(bytes) }
    }

    pub fn owned(bytes: Vec<u8>) -> Self {
        Self { range: 0..bytes.len(), buffer: Buffer::Owned(bytes) }
    }

    /// Returns `true` if this buffer was allocated by the loader.
    pub fn is_owned(&self) -> bool {
        matches!(self.buffer, Buffer::Owned(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        let bytes = match &self.buffer {
            Buffer::Owned(bytes) => bytes.as_slice(),
            Buffer::Borrowed(bytes) => bytes,
        };
        &bytes[self.range.clone()]
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Restricts the buffer to `range`, relative to the currently visible bytes.
    pub fn narrow(&mut self, range: Range<usize>) -> Result<()> {
        if range.start > range.end || range.end > self.len() {
            return Err(ImageError::InvalidParameter);
        }
        self.range = self.range.start + range.start..self.range.start + range.end;
        Ok(())
    }
}

/// Reads the whole file named by `device_path`.
pub fn acquire_from_path(
    file_system: &dyn ImageFileSystem,
    device_path: *mut efi::protocols::device_path::Protocol,
) -> Result<Vec<u8>> {
    let mut file = file_system.open(device_path).map_err(|status| {
        log::debug!("failed to open image file: {status:?}");
        ImageError::NotFound
    })?;

    let size = match file.size() {
        Ok(size) if size != 0 => usize::try_from(size).map_err(|_| ImageError::Unsupported)?,
        Ok(_) => {
            log::debug!("image file is empty");
            return Err(ImageError::Unsupported);
        }
        Err(status) => {
            log::debug!("failed to get image file size: {status:?}");
            return Err(ImageError::Unsupported);
        }
    };

    let mut bytes = Vec::new();
    bytes.try_reserve_exact(size).map_err(|_| ImageError::OutOfResources)?;
    bytes.resize(size, 0);

    match file.read(&mut bytes) {
        Ok(read) if read == size => Ok(bytes),
        Ok(read) => {
            log::error!("short read of image file: {read:#x} of {size:#x} bytes");
            Err(ImageError::DeviceError)
        }
        Err(status) => {
            log::error!("failed to read image file: {status:?}");
            Err(ImageError::DeviceError)
        }
    }
}

/// Reads an image through the `EFI_LOAD_FILE` / `EFI_LOAD_FILE2` protocols. Not supported.
pub fn acquire_from_load_protocol(
    _device_path: *mut efi::protocols::device_path::Protocol,
    _boot_policy: bool,
) -> Result<Vec<u8>> {
    Err(ImageError::Unsupported)
}

/// Produces the source buffer for a load request.
///
/// An explicit buffer is always borrowed. Without one, the file at `device_path` is read into an owned buffer.
pub fn acquire<'a>(
    file_system: &dyn ImageFileSystem,
    device_path: *mut efi::protocols::device_path::Protocol,
    boot_policy: bool,
    explicit: Option<&'a [u8]>,
) -> Result<SourceBuffer<'a>> {
    if let Some(bytes) = explicit {
        return Ok(SourceBuffer::borrowed(bytes));
    }

    if device_path.is_null() {
        return Err(ImageError::NotFound);
    }

    acquire_from_path(file_system, device_path)
        .or_else(|_| acquire_from_load_protocol(device_path, boot_policy))
        .map(SourceBuffer::owned)
}
