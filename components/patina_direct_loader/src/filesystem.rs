//! Simple File System Access
//!
//! [`ImageFileSystem`] implementation that resolves a device path to a volume exposing
//! `EFI_SIMPLE_FILE_SYSTEM_PROTOCOL` and opens the file named by the remaining media file path nodes.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{boxed::Box, vec, vec::Vec};
use core::{ffi::c_void, ptr::NonNull};

use patina::boot_services::BootServices;
use patina_internal_device_path::DevicePathWalker;
use r_efi::efi;

use crate::source::{ImageFile, ImageFileSystem};

/// Offset of `file_size` within `EFI_FILE_INFO`.
const FILE_INFO_FILE_SIZE_OFFSET: usize = 8;

/// File access over `EFI_SIMPLE_FILE_SYSTEM_PROTOCOL`.
pub struct SimpleFileSystem<'a, B: BootServices> {
    boot_services: &'a B,
}

impl<'a, B: BootServices> SimpleFileSystem<'a, B> {
    pub fn new(boot_services: &'a B) -> Self {
        Self { boot_services }
    }
}

impl<B: BootServices> ImageFileSystem for SimpleFileSystem<'_, B> {
    fn open(
        &self,
        device_path: *mut efi::protocols::device_path::Protocol,
    ) -> Result<Box<dyn ImageFile>, efi::Status> {
        let mut remaining = device_path;
        let handle = self
            .boot_services
            .locate_device_path(&efi::protocols::simple_file_system::PROTOCOL_GUID, &mut remaining as *mut _)?;
        // SAFETY: the interface installed under the SFS GUID is a simple file system protocol instance.
        let volume = unsafe {
            self.boot_services.handle_protocol_unchecked(handle, &efi::protocols::simple_file_system::PROTOCOL_GUID)?
        } as *mut efi::protocols::simple_file_system::Protocol;
        if volume.is_null() {
            return Err(efi::Status::NOT_FOUND);
        }

        let mut root: *mut efi::protocols::file::Protocol = core::ptr::null_mut();
        // SAFETY: `volume` is the SFS instance installed on `handle`.
        let status = unsafe { ((*volume).open_volume)(volume, &mut root) };
        if status.is_error() {
            return Err(status);
        }
        let mut file = SimpleFile::new(root).ok_or(efi::Status::DEVICE_ERROR)?;

        // SAFETY: `remaining` is the unmatched tail of the caller's device path.
        for node in unsafe { DevicePathWalker::new(remaining) } {
            match node.header().r#type {
                efi::protocols::device_path::TYPE_MEDIA
                    if node.header().sub_type == efi::protocols::device_path::Media::SUBTYPE_FILE_PATH => {}
                efi::protocols::device_path::TYPE_END => break,
                node_type => {
                    log::debug!("unexpected device path node {node_type:#x}/{:#x}", node.header().sub_type);
                    return Err(efi::Status::UNSUPPORTED);
                }
            }
            let mut name = file_name(node.data())?;
            file = file.open(&mut name)?;
        }

        Ok(Box::new(file))
    }
}

/// Decodes the UCS-2 name carried by a media file path node, NUL-terminating it if needed.
fn file_name(data: &[u8]) -> Result<Vec<u16>, efi::Status> {
    if data.len() % 2 != 0 {
        return Err(efi::Status::INVALID_PARAMETER);
    }
    let mut name: Vec<u16> = data.chunks_exact(2).map(|pair| u16::from_le_bytes([pair[0], pair[1]])).collect();
    if name.last() != Some(&0) {
        name.push(0);
    }
    Ok(name)
}

/// An open `EFI_FILE_PROTOCOL` instance. Closed on drop.
pub struct SimpleFile {
    protocol: NonNull<efi::protocols::file::Protocol>,
}

impl SimpleFile {
    fn new(protocol: *mut efi::protocols::file::Protocol) -> Option<Self> {
        NonNull::new(protocol).map(|protocol| Self { protocol })
    }

    fn open(&self, name: &mut [u16]) -> Result<SimpleFile, efi::Status> {
        let this = self.protocol.as_ptr();
        let mut child: *mut efi::protocols::file::Protocol = core::ptr::null_mut();
        // SAFETY: `this` is an open file protocol and `name` is a NUL-terminated UCS-2 string.
        let status =
            unsafe { ((*this).open)(this, &mut child, name.as_mut_ptr(), efi::protocols::file::MODE_READ, 0) };
        if status.is_error() {
            return Err(status);
        }
        SimpleFile::new(child).ok_or(efi::Status::DEVICE_ERROR)
    }
}

impl ImageFile for SimpleFile {
    fn size(&mut self) -> Result<u64, efi::Status> {
        let this = self.protocol.as_ptr();
        let mut info_id = efi::protocols::file::INFO_ID;
        let mut info_size = 0usize;

        // SAFETY: probing with a zero sized buffer only writes the required size.
        let status = unsafe { ((*this).get_info)(this, &mut info_id, &mut info_size, core::ptr::null_mut()) };
        if status != efi::Status::BUFFER_TOO_SMALL {
            return Err(if status.is_error() { status } else { efi::Status::DEVICE_ERROR });
        }
        if info_size < FILE_INFO_FILE_SIZE_OFFSET + 8 {
            return Err(efi::Status::DEVICE_ERROR);
        }

        let mut info = vec![0u8; info_size];
        // SAFETY: `info` holds `info_size` bytes.
        let status =
            unsafe { ((*this).get_info)(this, &mut info_id, &mut info_size, info.as_mut_ptr() as *mut c_void) };
        if status.is_error() {
            return Err(status);
        }

        let file_size = &info[FILE_INFO_FILE_SIZE_OFFSET..FILE_INFO_FILE_SIZE_OFFSET + 8];
        Ok(u64::from_le_bytes(file_size.try_into().map_err(|_| efi::Status::DEVICE_ERROR)?))
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, efi::Status> {
        let this = self.protocol.as_ptr();
        // SAFETY: `this` is an open file protocol.
        let status = unsafe { ((*this).set_position)(this, 0) };
        if status.is_error() {
            return Err(status);
        }

        let mut read = buffer.len();
        // SAFETY: `buffer` is valid for `read` bytes.
        let status = unsafe { ((*this).read)(this, &mut read, buffer.as_mut_ptr() as *mut c_void) };
        if status.is_error() {
            return Err(status);
        }
        Ok(read)
    }
}

impl Drop for SimpleFile {
    fn drop(&mut self) {
        let this = self.protocol.as_ptr();
        // SAFETY: `this` is an open file protocol that is not used after this point.
        let status = unsafe { ((*this).close)(this) };
        if status.is_error() {
            log::warn!("failed to close file: {status:?}");
        }
    }
}
