//! Image Service Routing
//!
//! [`ImageRuntime`] implements the four intercepted image services. Loads run through the secure boot gate, the
//! fat binary filter and then either the direct loader or the platform's own loader. Start, unload and exit are
//! routed by the kind of the handle they are called on.
//!
//! Until direct loading is activated every service is a transparent pass-through to the platform implementation.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::boxed::Box;
use core::ffi::c_void;

use patina::boot_services::BootServices;
use patina_internal_device_path::copy_device_path_to_boxed_slice;
use r_efi::efi;

use crate::{
    direct::DirectLoader,
    error::{ImageError, Result},
    fat,
    registry::{ImageKind, image_kind},
    secure_boot::{SecureBootVerifier, Verification, evaluate},
    source::{self, ImageFileSystem, SourceBuffer},
};

/// `EFI_BOOT_SERVICES.LoadImage()` as stored in the boot services table.
pub type LoadImageFn = extern "efiapi" fn(
    boot_policy: efi::Boolean,
    parent_image_handle: efi::Handle,
    device_path: *mut efi::protocols::device_path::Protocol,
    source_buffer: *mut c_void,
    source_size: usize,
    image_handle: *mut efi::Handle,
) -> efi::Status;

/// `EFI_BOOT_SERVICES.StartImage()` as stored in the boot services table.
pub type StartImageFn = extern "efiapi" fn(
    image_handle: efi::Handle,
    exit_data_size: *mut usize,
    exit_data: *mut *mut efi::Char16,
) -> efi::Status;

/// `EFI_BOOT_SERVICES.UnloadImage()` as stored in the boot services table.
pub type UnloadImageFn = extern "efiapi" fn(image_handle: efi::Handle) -> efi::Status;

/// `EFI_BOOT_SERVICES.Exit()` as stored in the boot services table.
pub type ExitFn = extern "efiapi" fn(
    image_handle: efi::Handle,
    exit_status: efi::Status,
    exit_data_size: usize,
    exit_data: *mut efi::Char16,
) -> efi::Status;

/// The platform's image services, with the raw boot services signatures.
pub trait ImageServices {
    fn load_image(
        &self,
        boot_policy: efi::Boolean,
        parent_image_handle: efi::Handle,
        device_path: *mut efi::protocols::device_path::Protocol,
        source_buffer: *mut c_void,
        source_size: usize,
        image_handle: *mut efi::Handle,
    ) -> efi::Status;

    fn start_image(
        &self,
        image_handle: efi::Handle,
        exit_data_size: *mut usize,
        exit_data: *mut *mut efi::Char16,
    ) -> efi::Status;

    fn unload_image(&self, image_handle: efi::Handle) -> efi::Status;

    fn exit(
        &self,
        image_handle: efi::Handle,
        exit_status: efi::Status,
        exit_data_size: usize,
        exit_data: *mut efi::Char16,
    ) -> efi::Status;
}

/// Image service entry points captured from a boot services table before it was patched.
#[derive(Clone, Copy)]
pub struct OriginalImageServices {
    pub load_image: LoadImageFn,
    pub start_image: StartImageFn,
    pub unload_image: UnloadImageFn,
    pub exit: ExitFn,
}

impl OriginalImageServices {
    /// Captures the current image services of `boot_services`.
    ///
    /// ## Safety
    ///
    /// `boot_services` must point to a valid boot services table.
    pub unsafe fn capture(boot_services: *const efi::BootServices) -> Self {
        // SAFETY: forwarded from the caller.
        unsafe {
            Self {
                load_image: (*boot_services).load_image,
                start_image: (*boot_services).start_image,
                unload_image: (*boot_services).unload_image,
                exit: (*boot_services).exit,
            }
        }
    }
}

impl ImageServices for OriginalImageServices {
    fn load_image(
        &self,
        boot_policy: efi::Boolean,
        parent_image_handle: efi::Handle,
        device_path: *mut efi::protocols::device_path::Protocol,
        source_buffer: *mut c_void,
        source_size: usize,
        image_handle: *mut efi::Handle,
    ) -> efi::Status {
        (self.load_image)(boot_policy, parent_image_handle, device_path, source_buffer, source_size, image_handle)
    }

    fn start_image(
        &self,
        image_handle: efi::Handle,
        exit_data_size: *mut usize,
        exit_data: *mut *mut efi::Char16,
    ) -> efi::Status {
        (self.start_image)(image_handle, exit_data_size, exit_data)
    }

    fn unload_image(&self, image_handle: efi::Handle) -> efi::Status {
        (self.unload_image)(image_handle)
    }

    fn exit(
        &self,
        image_handle: efi::Handle,
        exit_status: efi::Status,
        exit_data_size: usize,
        exit_data: *mut efi::Char16,
    ) -> efi::Status {
        (self.exit)(image_handle, exit_status, exit_data_size, exit_data)
    }
}

/// Everything a single image service call needs.
pub struct ImageRuntime<'a, B: BootServices> {
    boot_services: &'a B,
    file_system: &'a dyn ImageFileSystem,
    verifier: &'a dyn SecureBootVerifier,
    native: &'a dyn ImageServices,
    system_table: *mut efi::SystemTable,
    active: bool,
}

impl<'a, B: BootServices> ImageRuntime<'a, B> {
    /// Creates the runtime for one service call.
    ///
    /// `native` receives everything the direct loader does not handle. While `active` is `false` every service is
    /// forwarded to it unchanged.
    pub fn new(
        boot_services: &'a B,
        file_system: &'a dyn ImageFileSystem,
        verifier: &'a dyn SecureBootVerifier,
        native: &'a dyn ImageServices,
        system_table: *mut efi::SystemTable,
        active: bool,
    ) -> Self {
        Self { boot_services, file_system, verifier, native, system_table, active }
    }

    fn direct_loader(&self) -> DirectLoader<'a, B> {
        DirectLoader::new(self.boot_services, self.system_table)
    }

    /// `EFI_BOOT_SERVICES.LoadImage()`.
    pub fn load_image(
        &self,
        boot_policy: efi::Boolean,
        parent_image_handle: efi::Handle,
        device_path: *mut efi::protocols::device_path::Protocol,
        source_buffer: *mut c_void,
        source_size: usize,
        image_handle: *mut efi::Handle,
    ) -> efi::Status {
        if !self.active {
            return self.native.load_image(
                boot_policy,
                parent_image_handle,
                device_path,
                source_buffer,
                source_size,
                image_handle,
            );
        }

        if parent_image_handle.is_null() || image_handle.is_null() {
            return efi::Status::INVALID_PARAMETER;
        }
        if source_buffer.is_null() && device_path.is_null() {
            return efi::Status::NOT_FOUND;
        }

        let explicit = if source_buffer.is_null() {
            None
        } else {
            if source_size == 0 {
                return efi::Status::UNSUPPORTED;
            }
            // SAFETY: the caller provides `source_size` readable bytes at `source_buffer`.
            Some(unsafe { core::slice::from_raw_parts(source_buffer as *const u8, source_size) })
        };

        match self.load(boot_policy, parent_image_handle, device_path, explicit, image_handle) {
            Ok(status) => status,
            Err(err) => err.into(),
        }
    }

    fn load(
        &self,
        boot_policy: efi::Boolean,
        parent_image_handle: efi::Handle,
        device_path: *mut efi::protocols::device_path::Protocol,
        explicit: Option<&[u8]>,
        image_handle: *mut efi::Handle,
    ) -> Result<efi::Status> {
        let source = match source::acquire(self.file_system, device_path, boot_policy.into(), explicit) {
            Ok(source) => Some(source),
            Err(err) => {
                log::debug!("image could not be read ({err:?}), deferring to the platform loader");
                None
            }
        };

        let verification =
            evaluate(self.verifier, device_path, source.as_ref().map(|source| source.as_slice()), self.active);
        if verification == Verification::Violation {
            log::warn!("secure boot prohibits this image, enforcing");
            return Err(ImageError::SecurityViolation);
        }

        let source = source.and_then(filter_source);
        let has_buffer = source.is_some();

        let result = match verification {
            Verification::Trusted => {
                let Some(buffer) = source.as_ref() else {
                    log::error!("verified image has no loadable slice");
                    return Err(ImageError::Unsupported);
                };
                let handle = self.direct_loader().load(parent_image_handle, buffer.as_slice())?;
                // SAFETY: `image_handle` was null-checked by the caller.
                unsafe { image_handle.write_unaligned(handle) };
                Ok(efi::Status::SUCCESS)
            }
            _ => {
                let (buffer, size) = source
                    .as_ref()
                    .map(|buffer| (buffer.as_slice().as_ptr() as *mut c_void, buffer.len()))
                    .unwrap_or((core::ptr::null_mut(), 0));
                log::trace!("forwarding load of {size:#x} byte buffer to the platform loader");
                // Warnings reach the caller unchanged.
                let status =
                    self.native.load_image(boot_policy, parent_image_handle, device_path, buffer, size, image_handle);
                ImageError::status_to_result(status).map(|()| status)
            }
        };
        drop(source);

        if result.is_ok() && has_buffer && !device_path.is_null() {
            // SAFETY: `image_handle` was null-checked by the caller and written by the loader.
            let handle = unsafe { image_handle.read_unaligned() };
            if let Err(err) = self.update_loaded_image(handle, device_path) {
                log::debug!("loaded image device fix-up skipped: {err:?}");
            }
        }

        result
    }

    /// Points the loaded image descriptor of `handle` at the file system device `device_path` resolves to.
    pub fn update_loaded_image(
        &self,
        handle: efi::Handle,
        device_path: *mut efi::protocols::device_path::Protocol,
    ) -> Result<()> {
        // SAFETY: the interface installed under the loaded image GUID is a loaded image protocol instance.
        let loaded_image = unsafe {
            self.boot_services.handle_protocol_unchecked(handle, &efi::protocols::loaded_image::PROTOCOL_GUID)?
        } as *mut efi::protocols::loaded_image::Protocol;
        if loaded_image.is_null() {
            return Err(ImageError::NotFound);
        }

        let mut remaining = device_path;
        let device_handle = self
            .boot_services
            .locate_device_path(&efi::protocols::simple_file_system::PROTOCOL_GUID, &mut remaining as *mut _)?;

        // SAFETY: `loaded_image` is the descriptor installed on `handle`.
        unsafe {
            if (*loaded_image).device_handle != device_handle {
                let file_path = copy_device_path_to_boxed_slice(remaining)?;
                (*loaded_image).device_handle = device_handle;
                // Owned by the descriptor for the rest of boot.
                (*loaded_image).file_path = Box::into_raw(file_path) as *mut efi::protocols::device_path::Protocol;
            }
        }
        Ok(())
    }

    /// `EFI_BOOT_SERVICES.StartImage()`.
    pub fn start_image(
        &self,
        image_handle: efi::Handle,
        exit_data_size: *mut usize,
        exit_data: *mut *mut efi::Char16,
    ) -> efi::Status {
        if !self.active {
            return self.native.start_image(image_handle, exit_data_size, exit_data);
        }
        match image_kind(self.boot_services, image_handle) {
            ImageKind::Direct(record) => self.direct_loader().start(image_handle, record, exit_data_size, exit_data),
            ImageKind::Native => self.native.start_image(image_handle, exit_data_size, exit_data),
        }
    }

    /// `EFI_BOOT_SERVICES.UnloadImage()`.
    pub fn unload_image(&self, image_handle: efi::Handle) -> efi::Status {
        if !self.active {
            return self.native.unload_image(image_handle);
        }
        match image_kind(self.boot_services, image_handle) {
            ImageKind::Direct(_) => match self.direct_loader().unload(image_handle) {
                Ok(()) => efi::Status::SUCCESS,
                Err(err) => err.into(),
            },
            ImageKind::Native => self.native.unload_image(image_handle),
        }
    }

    /// `EFI_BOOT_SERVICES.Exit()`.
    pub fn exit(
        &self,
        image_handle: efi::Handle,
        exit_status: efi::Status,
        exit_data_size: usize,
        exit_data: *mut efi::Char16,
    ) -> efi::Status {
        if !self.active {
            return self.native.exit(image_handle, exit_status, exit_data_size, exit_data);
        }
        match image_kind(self.boot_services, image_handle) {
            ImageKind::Direct(_) => match self.direct_loader().exit(image_handle, exit_status) {
                Ok(()) => efi::Status::SUCCESS,
                Err(err) => err.into(),
            },
            ImageKind::Native => self.native.exit(image_handle, exit_status, exit_data_size, exit_data),
        }
    }
}

// Owned buffers that fail filtering are dropped so the platform loader resolves the device path itself; borrowed
// buffers are passed on unfiltered.
fn filter_source(mut source: SourceBuffer<'_>) -> Option<SourceBuffer<'_>> {
    let filtered = fat::filter(source.as_slice()).and_then(|range| source.narrow(range));
    match filtered {
        Ok(()) => Some(source),
        Err(err) if source.is_owned() => {
            log::warn!("discarding image buffer that failed architecture filtering: {err:?}");
            None
        }
        Err(err) => {
            log::warn!("using unfiltered image buffer after architecture filtering failed: {err:?}");
            Some(source)
        }
    }
}
