//! Secure Boot Gate
//!
//! Decides whether an image may be loaded directly, must be rejected, or should be left to the platform loader.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::ffi::c_void;

use patina::{
    boot_services::{BootServices, StandardBootServices},
    pi::protocols::security2,
};
use r_efi::efi;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

/// Outcome of a secure boot decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The image was verified and may be loaded directly.
    Trusted,
    /// The image failed verification and must not be loaded at all.
    Violation,
    /// No decision could be made; the platform loader is responsible for the image.
    NotApplicable,
}

impl From<efi::Status> for Verification {
    fn from(status: efi::Status) -> Self {
        match status {
            efi::Status::SUCCESS => Verification::Trusted,
            efi::Status::SECURITY_VIOLATION => Verification::Violation,
            _ => Verification::NotApplicable,
        }
    }
}

/// Verifies an image buffer loaded from `device_path`.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait SecureBootVerifier {
    /// Returns `SUCCESS` for a verified image, `SECURITY_VIOLATION` for a rejected one, and any other status when
    /// verification is inconclusive.
    fn verify(&self, device_path: *mut efi::protocols::device_path::Protocol, image: &[u8]) -> efi::Status;
}

/// Consults `verifier` about `image`.
///
/// The verifier is only called when direct loading is `active` and both a device path and an image buffer are
/// available. `image` must be the unfiltered buffer.
pub fn evaluate(
    verifier: &dyn SecureBootVerifier,
    device_path: *mut efi::protocols::device_path::Protocol,
    image: Option<&[u8]>,
    active: bool,
) -> Verification {
    let Some(image) = image else {
        return Verification::NotApplicable;
    };
    if !active || device_path.is_null() {
        return Verification::NotApplicable;
    }

    let status = verifier.verify(device_path, image);
    let verification = Verification::from(status);
    match verification {
        Verification::Trusted => log::debug!("image verified"),
        Verification::Violation => log::warn!("image rejected by secure boot"),
        Verification::NotApplicable => log::debug!("secure boot verification inconclusive: {status:?}"),
    }
    verification
}

/// [`SecureBootVerifier`] backed by the PI Security2 architectural protocol.
///
/// Security2 authorizes every image while secure boot is off, so the verifier only consults it when secure boot is
/// enforced and reports `UNSUPPORTED` otherwise.
pub struct Security2Verifier<B: BootServices + 'static = StandardBootServices> {
    boot_services: B,
    enforced: bool,
}

impl<B: BootServices + 'static> Security2Verifier<B> {
    /// Creates a verifier. `enforced` is the state of the `SecureBoot` global variable.
    pub fn new(boot_services: B, enforced: bool) -> Self {
        Self { boot_services, enforced }
    }
}

impl<B: BootServices + 'static> SecureBootVerifier for Security2Verifier<B> {
    fn verify(&self, device_path: *mut efi::protocols::device_path::Protocol, image: &[u8]) -> efi::Status {
        if !self.enforced {
            return efi::Status::UNSUPPORTED;
        }

        // SAFETY: the interface installed under the Security2 GUID is a Security2 protocol instance.
        let protocol = match unsafe {
            self.boot_services.locate_protocol_unchecked(&security2::PROTOCOL_GUID, core::ptr::null_mut())
        } {
            Ok(protocol) if !protocol.is_null() => protocol as *mut security2::Protocol,
            _ => return efi::Status::NOT_FOUND,
        };

        // SAFETY: `protocol` is non-null and points to the located Security2 instance.
        let status = unsafe {
            ((*protocol).file_authentication)(
                protocol,
                device_path,
                image.as_ptr() as *const _ as *mut c_void,
                image.len(),
                false,
            )
        };
        match status {
            efi::Status::ACCESS_DENIED => efi::Status::SECURITY_VIOLATION,
            status => status,
        }
    }
}
