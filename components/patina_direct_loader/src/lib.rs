//! Direct Image Loader
//!
//! Replaces the image services of a UEFI boot services table (`LoadImage()`, `StartImage()`, `UnloadImage()` and
//! `Exit()`) with a pipeline that
//!
//! 1. gates loading behind a secure boot verification decision,
//! 2. reduces multi-architecture ("fat") binaries to the slice for the running platform, and
//! 3. loads and relocates verified PE/COFF images directly into memory, without the platform's own loader.
//!
//! Images the verifier has no opinion on, and every handle the platform created, are forwarded to the original
//! services unchanged.
//!
//! ## Examples
//!
//! ```rust,no_run
//! # use core::ptr::NonNull;
//! # use r_efi::efi;
//! use patina::boot_services::StandardBootServices;
//! use patina_direct_loader::{Security2Verifier, hooks};
//!
//! fn enable_direct_loading(
//!     system_table: NonNull<efi::SystemTable>,
//!     secure_boot_enabled: bool,
//! ) -> patina_direct_loader::Result<()> {
//!     // SAFETY: the firmware's system table and boot services table live until ExitBootServices.
//!     unsafe {
//!         let boot_services = StandardBootServices::new(&*(*system_table.as_ptr()).boot_services);
//!         let verifier = Security2Verifier::new(boot_services, secure_boot_enabled);
//!         hooks::install(system_table, Box::new(verifier))?;
//!     }
//!
//!     // later, once the boot manager decides direct loading should be used:
//!     hooks::activate();
//!     Ok(())
//! }
//! ```
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod direct;
pub mod error;
pub mod fat;
pub mod filesystem;
pub mod hooks;
pub mod pecoff;
pub mod registry;
pub mod runtime;
pub mod secure_boot;
pub mod source;

#[cfg(test)]
pub mod test_support;

pub use error::{ImageError, Result};
pub use secure_boot::{SecureBootVerifier, Security2Verifier, Verification};

#[cfg(any(test, feature = "mockall"))]
pub use secure_boot::MockSecureBootVerifier;
