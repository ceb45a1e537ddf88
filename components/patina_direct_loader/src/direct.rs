//! Direct Image Loader
//!
//! Loads a verified PE/COFF image into freshly allocated boot services pages without involving the platform's own
//! image loader, then publishes it on a new handle with a loaded image descriptor and a private tag that marks the
//! handle as directly loaded.
//!
//! Directly loaded images cannot be unloaded and cannot exit with data; their pages stay allocated for the rest of
//! boot services.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::boxed::Box;
use core::ffi::c_void;

use patina::{
    base::UEFI_PAGE_SIZE,
    boot_services::{
        BootServices,
        allocation::{AllocType, MemoryType},
    },
    uefi_size_to_pages,
};
use r_efi::efi;

use crate::{
    error::{ImageError, Result},
    pecoff::{self, EFI_IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER, ImageContext, PLATFORM_MACHINE},
};

/// Tags handles created by the direct loader. The interface is the handle's [`LoadedImageRecord`].
pub const DIRECT_IMAGE_PROTOCOL_GUID: efi::Guid =
    efi::Guid::from_fields(0x7b3a0f52, 0x6c1e, 0x4d8a, 0x9f, 0x35, &[0x2e, 0x81, 0xc4, 0xd6, 0xa0, 0xb7]);

/// A page-granular range of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: usize,
    pub page_count: usize,
}

impl MemoryRegion {
    pub fn size(&self) -> usize {
        self.page_count * UEFI_PAGE_SIZE
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address - self.base < self.size()
    }
}

/// Private data attached to a directly loaded image handle.
#[repr(C)]
pub struct LoadedImageRecord {
    pub entry_point: efi::ImageEntryPoint,
    pub region: MemoryRegion,
    pub loaded_image: efi::protocols::loaded_image::Protocol,
}

/// Boot services pages that are released on drop unless handed off with [`PageAllocation::into_region`].
struct PageAllocation<'a, B: BootServices> {
    boot_services: &'a B,
    region: MemoryRegion,
}

impl<'a, B: BootServices> PageAllocation<'a, B> {
    fn new(boot_services: &'a B, page_count: usize) -> Result<Self> {
        let base = boot_services
            .allocate_pages(AllocType::AnyPage, MemoryType::BOOT_SERVICES_CODE, page_count)
            .map_err(|status| {
                log::error!("failed to allocate {page_count:#x} pages for image: {status:?}");
                ImageError::OutOfResources
            })?;
        Ok(Self { boot_services, region: MemoryRegion { base, page_count } })
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the region was just allocated for exclusive use by this guard.
        unsafe { core::slice::from_raw_parts_mut(self.region.base as *mut u8, self.region.size()) }
    }

    fn into_region(self) -> MemoryRegion {
        let region = self.region;
        core::mem::forget(self);
        region
    }
}

impl<B: BootServices> Drop for PageAllocation<'_, B> {
    fn drop(&mut self) {
        if let Err(status) = self.boot_services.free_pages(self.region.base, self.region.page_count) {
            log::error!("failed to free image pages at {:#x}: {status:?}", self.region.base);
        }
    }
}

/// Why publishing a loaded image failed.
enum InstallError {
    /// Nothing is left installed; the record and its pages may be released.
    Unpublished(ImageError),
    /// The loaded image descriptor could not be removed again and still points into the record.
    Stranded(ImageError),
}

/// Loads, starts, and rejects unload/exit requests for directly loaded images.
pub struct DirectLoader<'a, B: BootServices> {
    boot_services: &'a B,
    system_table: *mut efi::SystemTable,
}

impl<'a, B: BootServices> DirectLoader<'a, B> {
    pub fn new(boot_services: &'a B, system_table: *mut efi::SystemTable) -> Self {
        Self { boot_services, system_table }
    }

    /// Loads `image` and returns the handle it was installed on.
    pub fn load(&self, parent: efi::Handle, image: &[u8]) -> Result<efi::Handle> {
        let context = ImageContext::parse(image).map_err(|err| {
            log::error!("direct load failed: ImageContext::parse returned {err:?}");
            ImageError::Unsupported
        })?;

        if context.machine != PLATFORM_MACHINE {
            log::error!("direct load failed: machine type {:#x} is not {PLATFORM_MACHINE:#x}", context.machine);
            return Err(ImageError::Unsupported);
        }
        if context.subsystem == EFI_IMAGE_SUBSYSTEM_EFI_RUNTIME_DRIVER {
            log::error!("direct load failed: runtime drivers are not supported");
            return Err(ImageError::Unsupported);
        }

        let mut allocation = PageAllocation::new(self.boot_services, uefi_size_to_pages!(context.size_of_image))?;
        let region = allocation.region;

        let destination = allocation.as_mut_slice();
        load_and_relocate(&context, image, destination, region.base).map_err(|err| {
            log::error!("direct load failed: {err:?}");
            ImageError::Unsupported
        })?;

        let entry = region.base + context.entry_point_offset;
        if !region.contains(entry) {
            log::error!("direct load failed: entry point {entry:#x} outside of image");
            return Err(ImageError::Unsupported);
        }
        // SAFETY: the entry point lies inside the loaded and relocated image.
        let entry_point = unsafe { core::mem::transmute::<usize, efi::ImageEntryPoint>(entry) };

        let record = Box::into_raw(Box::new(LoadedImageRecord {
            entry_point,
            region,
            loaded_image: efi::protocols::loaded_image::Protocol {
                revision: efi::protocols::loaded_image::REVISION,
                parent_handle: parent,
                system_table: self.system_table,
                device_handle: core::ptr::null_mut(),
                file_path: core::ptr::null_mut(),
                reserved: core::ptr::null_mut(),
                load_options_size: 0,
                load_options: core::ptr::null_mut(),
                image_base: region.base as *mut c_void,
                image_size: region.size() as u64,
                image_code_type: efi::BOOT_SERVICES_CODE,
                image_data_type: efi::BOOT_SERVICES_DATA,
                unload: None,
            },
        }));

        match self.install(record) {
            Ok(handle) => {
                allocation.into_region();
                log::info!(
                    "directly loaded image at {:#x} ({:#x} bytes), entry point {entry:#x}",
                    region.base,
                    region.size()
                );
                Ok(handle)
            }
            Err(InstallError::Unpublished(err)) => {
                // SAFETY: `record` came from `Box::into_raw` above and was not published.
                drop(unsafe { Box::from_raw(record) });
                Err(err)
            }
            Err(InstallError::Stranded(err)) => {
                // The installed descriptor still references the record and the image pages.
                let region = allocation.into_region();
                log::error!("leaking image record and {:#x} pages at {:#x}", region.page_count, region.base);
                Err(err)
            }
        }
    }

    fn install(&self, record: *mut LoadedImageRecord) -> core::result::Result<efi::Handle, InstallError> {
        // SAFETY: `record` is a live allocation owned by the caller.
        let loaded_image = unsafe { core::ptr::addr_of_mut!((*record).loaded_image) } as *mut c_void;

        // SAFETY: `loaded_image` points to a loaded image protocol that lives as long as the record.
        let handle = unsafe {
            self.boot_services.install_protocol_interface_unchecked(
                None,
                &efi::protocols::loaded_image::PROTOCOL_GUID,
                loaded_image,
            )
        }
        .map_err(|status| {
            log::error!("failed to install loaded image protocol: {status:?}");
            InstallError::Unpublished(status.into())
        })?;

        // SAFETY: the record is the interface for the direct image tag.
        let tagged = unsafe {
            self.boot_services.install_protocol_interface_unchecked(
                Some(handle),
                &DIRECT_IMAGE_PROTOCOL_GUID,
                record as *mut c_void,
            )
        };
        if let Err(status) = tagged {
            log::error!("failed to tag directly loaded image: {status:?}");
            // SAFETY: `loaded_image` was installed on `handle` above.
            let removed = unsafe {
                self.boot_services.uninstall_protocol_interface_unchecked(
                    handle,
                    &efi::protocols::loaded_image::PROTOCOL_GUID,
                    loaded_image,
                )
            };
            return match removed {
                Ok(()) => Err(InstallError::Unpublished(status.into())),
                Err(uninstall_status) => {
                    log::error!("failed to remove untagged loaded image protocol: {uninstall_status:?}");
                    Err(InstallError::Stranded(status.into()))
                }
            };
        }

        Ok(handle)
    }

    /// Runs the entry point of a directly loaded image.
    ///
    /// Always returns `SUCCESS`; the entry point's own status is only logged. Exit data is reported empty.
    pub fn start(
        &self,
        handle: efi::Handle,
        record: &LoadedImageRecord,
        exit_data_size: *mut usize,
        exit_data: *mut *mut efi::Char16,
    ) -> efi::Status {
        log::debug!("starting directly loaded image at {:#x}", record.region.base);
        let status = (record.entry_point)(handle, self.system_table);
        log::info!("directly loaded image at {:#x} returned {status:?}", record.region.base);

        if !exit_data_size.is_null() {
            // SAFETY: caller supplied a writable out-parameter.
            unsafe { exit_data_size.write(0) };
        }
        if !exit_data.is_null() {
            // SAFETY: caller supplied a writable out-parameter.
            unsafe { exit_data.write(core::ptr::null_mut()) };
        }
        efi::Status::SUCCESS
    }

    /// Directly loaded images cannot be unloaded.
    pub fn unload(&self, _handle: efi::Handle) -> Result<()> {
        Err(ImageError::InvalidParameter)
    }

    /// Directly loaded images cannot exit through boot services.
    pub fn exit(&self, _handle: efi::Handle, _exit_status: efi::Status) -> Result<()> {
        Err(ImageError::InvalidParameter)
    }
}

fn load_and_relocate(
    context: &ImageContext,
    image: &[u8],
    destination: &mut [u8],
    base: usize,
) -> core::result::Result<(), pecoff::Error> {
    context.load_into(image, destination)?;
    context.relocate(destination, base as u64)
}
