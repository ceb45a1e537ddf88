//! Boot Services Hooks
//!
//! Installs the loader over `LoadImage()`, `StartImage()`, `UnloadImage()` and `Exit()` in the firmware's boot
//! services table. The original entry points are captured first so that everything the loader does not handle
//! itself is forwarded to them unchanged.
//!
//! Installation happens once. Direct loading stays off, and every hooked service is a pure pass-through, until
//! [`activate`] is called.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::boxed::Box;
use core::{
    ffi::c_void,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use patina::boot_services::StandardBootServices;
use r_efi::efi;
use spin::Once;

use crate::{
    error::{ImageError, Result},
    filesystem::SimpleFileSystem,
    runtime::{ImageRuntime, OriginalImageServices},
    secure_boot::SecureBootVerifier,
};

struct HookState {
    system_table: *mut efi::SystemTable,
    boot_services: StandardBootServices,
    original: OriginalImageServices,
    verifier: Box<dyn SecureBootVerifier>,
    active: AtomicBool,
}

// SAFETY: boot services run on a single processor; the captured pointers stay valid until ExitBootServices.
unsafe impl Send for HookState {}
// SAFETY: see above.
unsafe impl Sync for HookState {}

static HOOK_STATE: Once<HookState> = Once::new();

/// Hooks the image services of the boot services table referenced by `system_table`.
///
/// Returns an error, and leaves the table untouched, if the hooks are already installed or the system table has
/// no boot services.
///
/// ## Safety
///
/// `system_table` must point to the firmware's system table, and its boot services table must remain valid and
/// writable for as long as boot services are available.
pub unsafe fn install(system_table: NonNull<efi::SystemTable>, verifier: Box<dyn SecureBootVerifier>) -> Result<()> {
    // SAFETY: the caller guarantees a valid system table.
    let Some(table) = NonNull::new(unsafe { (*system_table.as_ptr()).boot_services }) else {
        log::error!("cannot install image hooks: system table has no boot services");
        debug_assert!(false, "system table has no boot services");
        return Err(ImageError::InvalidParameter);
    };

    if HOOK_STATE.is_completed() {
        log::error!("image hooks are already installed");
        debug_assert!(false, "image hooks are already installed");
        return Err(ImageError::Platform(efi::Status::ALREADY_STARTED));
    }

    HOOK_STATE.call_once(|| HookState {
        system_table: system_table.as_ptr(),
        // SAFETY: the caller guarantees the table stays valid for as long as boot services are available.
        boot_services: StandardBootServices::new(unsafe { &*table.as_ptr() }),
        // SAFETY: the table has not been patched yet.
        original: unsafe { OriginalImageServices::capture(table.as_ptr()) },
        verifier,
        active: AtomicBool::new(false),
    });

    let table = table.as_ptr();
    // SAFETY: the caller guarantees the table is writable. Fields are written through the raw pointer.
    unsafe {
        (*table).load_image = load_image;
        (*table).start_image = start_image;
        (*table).unload_image = unload_image;
        (*table).exit = exit;

        (*table).hdr.crc32 = 0;
        let status = ((*table).calculate_crc32)(
            table as *mut c_void,
            (*table).hdr.header_size as usize,
            core::ptr::addr_of_mut!((*table).hdr.crc32),
        );
        if status.is_error() {
            log::error!("failed to update boot services table CRC32: {status:?}");
        }
    }

    log::info!("image hooks installed");
    Ok(())
}

/// Enables direct loading. Has no effect before [`install`].
pub fn activate() {
    match HOOK_STATE.get() {
        Some(state) => {
            if !state.active.swap(true, Ordering::AcqRel) {
                log::info!("direct image loading activated");
            }
        }
        None => log::error!("cannot activate direct image loading before the hooks are installed"),
    }
}

/// Returns `true` once [`install`] has patched the boot services table.
pub fn is_installed() -> bool {
    HOOK_STATE.is_completed()
}

/// Returns `true` once [`activate`] has enabled direct loading after a successful [`install`].
pub fn is_active() -> bool {
    HOOK_STATE.get().is_some_and(|state| state.active.load(Ordering::Acquire))
}

// State is looked up on every call; an image started through these hooks may call back into them.
fn with_runtime(f: impl FnOnce(&ImageRuntime<'_, StandardBootServices>) -> efi::Status) -> efi::Status {
    let Some(state) = HOOK_STATE.get() else {
        return efi::Status::NOT_READY;
    };
    let file_system = SimpleFileSystem::new(&state.boot_services);
    let runtime = ImageRuntime::new(
        &state.boot_services,
        &file_system,
        state.verifier.as_ref(),
        &state.original,
        state.system_table,
        state.active.load(Ordering::Acquire),
    );
    f(&runtime)
}

extern "efiapi" fn load_image(
    boot_policy: efi::Boolean,
    parent_image_handle: efi::Handle,
    device_path: *mut efi::protocols::device_path::Protocol,
    source_buffer: *mut c_void,
    source_size: usize,
    image_handle: *mut efi::Handle,
) -> efi::Status {
    with_runtime(|runtime| {
        runtime.load_image(boot_policy, parent_image_handle, device_path, source_buffer, source_size, image_handle)
    })
}

extern "efiapi" fn start_image(
    image_handle: efi::Handle,
    exit_data_size: *mut usize,
    exit_data: *mut *mut efi::Char16,
) -> efi::Status {
    with_runtime(|runtime| runtime.start_image(image_handle, exit_data_size, exit_data))
}

extern "efiapi" fn unload_image(image_handle: efi::Handle) -> efi::Status {
    with_runtime(|runtime| runtime.unload_image(image_handle))
}

extern "efiapi" fn exit(
    image_handle: efi::Handle,
    exit_status: efi::Status,
    exit_data_size: usize,
    exit_data: *mut efi::Char16,
) -> efi::Status {
    with_runtime(|runtime| runtime.exit(image_handle, exit_status, exit_data_size, exit_data))
}
