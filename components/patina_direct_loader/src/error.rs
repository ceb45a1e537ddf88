//! Error types for the direct image loader
//!
//! Every fallible operation in this crate returns [`ImageError`]. Raw [`efi::Status`] values only appear at the
//! FFI boundary, where [`From`] conversions in both directions translate between the two.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use r_efi::efi;

/// Direct image loader errors.
///
/// The six named variants are the stable outcomes of the load pipeline. Any other status produced by a platform
/// service is carried unchanged in [`ImageError::Platform`] so that it reaches the caller exactly as the firmware
/// reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// No image source is available (no buffer, no device path, or the file could not be opened).
    NotFound,
    /// The image is malformed, targets another machine or subsystem, is empty, or failed to relocate.
    Unsupported,
    /// A memory allocation failed.
    OutOfResources,
    /// Reading the image from its source failed or returned fewer bytes than expected.
    DeviceError,
    /// Secure boot prohibits this image. Never retried and never downgraded.
    SecurityViolation,
    /// Bad arguments, or an operation that is not implemented for directly loaded images.
    InvalidParameter,
    /// Any other status reported by a platform service.
    Platform(efi::Status),
}

/// Result type used throughout the crate.
pub type Result<T> = core::result::Result<T, ImageError>;

impl ImageError {
    /// Converts a raw status into a result. Warnings and `SUCCESS` are treated as success.
    pub fn status_to_result(status: efi::Status) -> Result<()> {
        if status.is_error() { Err(status.into()) } else { Ok(()) }
    }
}

impl From<efi::Status> for ImageError {
    fn from(status: efi::Status) -> Self {
        match status {
            efi::Status::NOT_FOUND => ImageError::NotFound,
            efi::Status::UNSUPPORTED => ImageError::Unsupported,
            efi::Status::OUT_OF_RESOURCES => ImageError::OutOfResources,
            efi::Status::DEVICE_ERROR => ImageError::DeviceError,
            efi::Status::SECURITY_VIOLATION => ImageError::SecurityViolation,
            efi::Status::INVALID_PARAMETER => ImageError::InvalidParameter,
            other => ImageError::Platform(other),
        }
    }
}

impl From<ImageError> for efi::Status {
    fn from(error: ImageError) -> Self {
        match error {
            ImageError::NotFound => efi::Status::NOT_FOUND,
            ImageError::Unsupported => efi::Status::UNSUPPORTED,
            ImageError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            ImageError::DeviceError => efi::Status::DEVICE_ERROR,
            ImageError::SecurityViolation => efi::Status::SECURITY_VIOLATION,
            ImageError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            ImageError::Platform(status) => status,
        }
    }
}
