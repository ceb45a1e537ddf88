//! Image Handle Classification
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use patina::boot_services::BootServices;
use r_efi::efi;

use crate::direct::{DIRECT_IMAGE_PROTOCOL_GUID, LoadedImageRecord};

/// Which loader owns an image handle.
#[derive(Clone, Copy)]
pub enum ImageKind<'a> {
    /// Loaded by the platform's own image services.
    Native,
    /// Loaded by the direct loader.
    Direct(&'a LoadedImageRecord),
}

/// Classifies `handle` by looking for the direct image tag on it.
///
/// A returned record is borrowed for as long as `boot_services`, which outlives every handle it manages.
pub fn image_kind<'a, B: BootServices>(boot_services: &'a B, handle: efi::Handle) -> ImageKind<'a> {
    // SAFETY: the GUID identifies a private tag whose interface is only read back as a `LoadedImageRecord`.
    match unsafe { boot_services.handle_protocol_unchecked(handle, &DIRECT_IMAGE_PROTOCOL_GUID) } {
        // SAFETY: only the direct loader installs this GUID, and its interface is a record that is never freed.
        Ok(record) if !record.is_null() => ImageKind::Direct(unsafe { &*(record as *const LoadedImageRecord) }),
        _ => ImageKind::Native,
    }
}
