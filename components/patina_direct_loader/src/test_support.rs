//! Direct Loader Test Support
//!
//! Fakes for the platform seams and builders for the binary inputs used by the unit tests.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
extern crate std;

use core::{
    cell::{Cell, RefCell},
    ffi::c_void,
};
use patina::{base::UEFI_PAGE_SIZE, boot_services::MockBootServices};
use r_efi::efi;
use std::{any::Any, boxed::Box, collections::BTreeMap, rc::Rc, vec, vec::Vec};

use crate::{
    fat::{EFI_FAT_BINARY_MAGIC, MACH_FAT_BINARY_MAGIC},
    runtime::ImageServices,
    source::{ImageFile, ImageFileSystem},
};

/// A global mutex that can be used for tests to synchronize on access to global state.
/// Tests that install the boot services hooks or share static mock state hold it for their whole duration.
static GLOBAL_STATE_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

pub(crate) fn with_global_lock<F: Fn() + std::panic::RefUnwindSafe>(f: F) -> Result<(), Box<dyn Any + Send>> {
    let _guard = GLOBAL_STATE_TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::panic::catch_unwind(|| {
        f();
    })
}

/// Handle database and page allocator state shared by the mocks built from a [`FakeHandleDatabase`].
struct DatabaseState {
    interfaces: RefCell<BTreeMap<(usize, [u8; 16]), usize>>,
    next_handle: Cell<usize>,
    allocations: RefCell<BTreeMap<usize, usize>>,
    allocation_count: Cell<usize>,
    freed: RefCell<Vec<(usize, usize)>>,
    fail_allocations: Cell<bool>,
    fail_install: Cell<Option<efi::Guid>>,
    fail_uninstall: Cell<Option<efi::Status>>,
    device_paths: RefCell<BTreeMap<usize, (usize, usize)>>,
}

impl DatabaseState {
    fn layout(pages: usize) -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(pages * UEFI_PAGE_SIZE, UEFI_PAGE_SIZE).unwrap()
    }

    fn allocate_pages(&self, pages: usize) -> Result<usize, efi::Status> {
        if self.fail_allocations.get() || pages == 0 {
            return Err(efi::Status::OUT_OF_RESOURCES);
        }
        // SAFETY: test code, non-zero sized page aligned layout.
        let address = unsafe { std::alloc::alloc_zeroed(Self::layout(pages)) };
        if address.is_null() {
            return Err(efi::Status::OUT_OF_RESOURCES);
        }
        self.allocations.borrow_mut().insert(address as usize, pages);
        self.allocation_count.set(self.allocation_count.get() + 1);
        Ok(address as usize)
    }

    fn free_pages(&self, address: usize, pages: usize) -> Result<(), efi::Status> {
        match self.allocations.borrow_mut().remove(&address) {
            Some(allocated) if allocated == pages => {
                // SAFETY: test code, allocated above with the same layout.
                unsafe { std::alloc::dealloc(address as *mut u8, Self::layout(pages)) };
                self.freed.borrow_mut().push((address, pages));
                Ok(())
            }
            _ => Err(efi::Status::NOT_FOUND),
        }
    }

    fn install(
        &self,
        handle: Option<efi::Handle>,
        protocol: &efi::Guid,
        interface: *mut c_void,
    ) -> Result<efi::Handle, efi::Status> {
        if self.fail_install.get().as_ref() == Some(protocol) {
            return Err(efi::Status::OUT_OF_RESOURCES);
        }

        let handle = match handle {
            Some(handle) => handle as usize,
            None => {
                let handle = self.next_handle.get();
                self.next_handle.set(handle + 0x10);
                handle
            }
        };

        let mut interfaces = self.interfaces.borrow_mut();
        let key = (handle, *protocol.as_bytes());
        if interfaces.contains_key(&key) {
            return Err(efi::Status::INVALID_PARAMETER);
        }
        interfaces.insert(key, interface as usize);
        Ok(handle as efi::Handle)
    }

    fn uninstall(&self, handle: efi::Handle, protocol: &efi::Guid, interface: *mut c_void) -> Result<(), efi::Status> {
        if let Some(status) = self.fail_uninstall.get() {
            return Err(status);
        }
        let mut interfaces = self.interfaces.borrow_mut();
        let key = (handle as usize, *protocol.as_bytes());
        match interfaces.get(&key) {
            Some(installed) if *installed == interface as usize => {
                interfaces.remove(&key);
                Ok(())
            }
            _ => Err(efi::Status::NOT_FOUND),
        }
    }

    fn interface(&self, handle: efi::Handle, protocol: &efi::Guid) -> Option<*mut c_void> {
        let interfaces = self.interfaces.borrow();
        interfaces.get(&(handle as usize, *protocol.as_bytes())).map(|interface| *interface as *mut c_void)
    }

    fn locate(&self, protocol: &efi::Guid) -> Result<*mut c_void, efi::Status> {
        self.interfaces
            .borrow()
            .iter()
            .find(|((_, guid), _)| guid == protocol.as_bytes())
            .map(|(_, interface)| *interface as *mut c_void)
            .ok_or(efi::Status::NOT_FOUND)
    }

    fn locate_device_path(
        &self,
        device_path: *mut *mut efi::protocols::device_path::Protocol,
    ) -> Result<efi::Handle, efi::Status> {
        // SAFETY: test code, the caller passes a readable and writable device path slot.
        let path = unsafe { device_path.read() } as usize;
        let (handle, remaining) = *self.device_paths.borrow().get(&path).ok_or(efi::Status::NOT_FOUND)?;
        // SAFETY: see above.
        unsafe { device_path.write(remaining as *mut efi::protocols::device_path::Protocol) };
        Ok(handle as efi::Handle)
    }
}

impl Drop for DatabaseState {
    fn drop(&mut self) {
        for (address, pages) in self.allocations.borrow().iter() {
            // SAFETY: test code, every entry was allocated with this layout and not freed.
            unsafe { std::alloc::dealloc(*address as *mut u8, Self::layout(*pages)) };
        }
    }
}

/// In-memory handle database and host backed page allocator.
///
/// [`FakeHandleDatabase::boot_services`] builds a [`MockBootServices`] whose handle, protocol and page services are
/// served from this database, so several mocks and the test itself observe the same state.
#[derive(Clone)]
pub struct FakeHandleDatabase {
    state: Rc<DatabaseState>,
}

impl FakeHandleDatabase {
    pub fn new() -> Self {
        Self {
            state: Rc::new(DatabaseState {
                interfaces: RefCell::new(BTreeMap::new()),
                next_handle: Cell::new(0x10_0000),
                allocations: RefCell::new(BTreeMap::new()),
                allocation_count: Cell::new(0),
                freed: RefCell::new(Vec::new()),
                fail_allocations: Cell::new(false),
                fail_install: Cell::new(None),
                fail_uninstall: Cell::new(None),
                device_paths: RefCell::new(BTreeMap::new()),
            }),
        }
    }

    /// Returns a mock whose handle, protocol and page services are backed by this database.
    pub fn boot_services(&self) -> MockBootServices {
        let mut boot_services = MockBootServices::new();

        let state = self.state.clone();
        boot_services.expect_allocate_pages().returning_st(move |_, _, pages| state.allocate_pages(pages));

        let state = self.state.clone();
        boot_services.expect_free_pages().returning_st(move |address, pages| state.free_pages(address, pages));

        let state = self.state.clone();
        boot_services
            .expect_install_protocol_interface_unchecked()
            .returning_st(move |handle, protocol, interface| state.install(handle, protocol, interface));

        let state = self.state.clone();
        boot_services
            .expect_uninstall_protocol_interface_unchecked()
            .returning_st(move |handle, protocol, interface| state.uninstall(handle, protocol, interface));

        let state = self.state.clone();
        boot_services
            .expect_handle_protocol_unchecked()
            .returning_st(move |handle, protocol| state.interface(handle, protocol).ok_or(efi::Status::UNSUPPORTED));

        let state = self.state.clone();
        boot_services.expect_locate_protocol_unchecked().returning_st(move |protocol, _| state.locate(protocol));

        let state = self.state.clone();
        boot_services
            .expect_locate_device_path()
            .returning_st(move |_, device_path| state.locate_device_path(device_path));

        boot_services
    }

    pub fn fail_allocations(&self) {
        self.state.fail_allocations.set(true);
    }

    /// Makes installing `protocol` fail with `OUT_OF_RESOURCES`.
    pub fn fail_install_of(&self, protocol: efi::Guid) {
        self.state.fail_install.set(Some(protocol));
    }

    /// Makes every uninstall fail with `status`.
    pub fn fail_uninstall_with(&self, status: efi::Status) {
        self.state.fail_uninstall.set(Some(status));
    }

    /// Makes `locate_device_path` resolve `device_path` to `handle`, leaving `remaining` unmatched.
    pub fn route_device_path(
        &self,
        device_path: *mut efi::protocols::device_path::Protocol,
        handle: efi::Handle,
        remaining: *mut efi::protocols::device_path::Protocol,
    ) {
        self.state.device_paths.borrow_mut().insert(device_path as usize, (handle as usize, remaining as usize));
    }

    /// Installs `interface` directly, bypassing any configured failure.
    pub fn install(&self, protocol: &efi::Guid, interface: *mut c_void) -> efi::Handle {
        let fail_install = self.state.fail_install.take();
        let handle = self.state.install(None, protocol, interface).unwrap();
        self.state.fail_install.set(fail_install);
        handle
    }

    /// Returns the interface installed for `protocol` on `handle`.
    pub fn interface(&self, handle: efi::Handle, protocol: &efi::Guid) -> Option<*mut c_void> {
        self.state.interface(handle, protocol)
    }

    /// Number of successful page allocations.
    pub fn allocation_count(&self) -> usize {
        self.state.allocation_count.get()
    }

    pub fn freed_pages(&self) -> Vec<(usize, usize)> {
        self.state.freed.borrow().clone()
    }

    pub fn interface_count(&self, protocol: &efi::Guid) -> usize {
        self.state.interfaces.borrow().keys().filter(|(_, guid)| guid == protocol.as_bytes()).count()
    }
}

impl Default for FakeHandleDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// A file served by [`FakeFileSystem`].
#[derive(Clone, Default)]
pub struct FakeFile {
    contents: Vec<u8>,
    fail_size: bool,
    fail_read: bool,
    short_read: Option<usize>,
}

impl FakeFile {
    pub fn new(contents: Vec<u8>) -> Self {
        Self { contents, ..Default::default() }
    }

    pub fn fail_size(mut self) -> Self {
        self.fail_size = true;
        self
    }

    pub fn fail_read(mut self) -> Self {
        self.fail_read = true;
        self
    }

    /// Makes reads return at most `bytes` bytes.
    pub fn short_read(mut self, bytes: usize) -> Self {
        self.short_read = Some(bytes);
        self
    }
}

impl ImageFile for FakeFile {
    fn size(&mut self) -> Result<u64, efi::Status> {
        if self.fail_size { Err(efi::Status::DEVICE_ERROR) } else { Ok(self.contents.len() as u64) }
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, efi::Status> {
        if self.fail_read {
            return Err(efi::Status::DEVICE_ERROR);
        }
        let count = buffer.len().min(self.contents.len()).min(self.short_read.unwrap_or(usize::MAX));
        buffer[..count].copy_from_slice(&self.contents[..count]);
        Ok(count)
    }
}

/// Serves [`FakeFile`]s keyed by device path pointer.
#[derive(Default)]
pub struct FakeFileSystem {
    files: RefCell<BTreeMap<usize, FakeFile>>,
    open_count: Cell<usize>,
}

impl FakeFileSystem {
    pub fn add_file(&self, device_path: *mut efi::protocols::device_path::Protocol, file: FakeFile) {
        self.files.borrow_mut().insert(device_path as usize, file);
    }

    pub fn open_count(&self) -> usize {
        self.open_count.get()
    }
}

impl ImageFileSystem for FakeFileSystem {
    fn open(&self, device_path: *mut efi::protocols::device_path::Protocol) -> Result<Box<dyn ImageFile>, efi::Status> {
        self.open_count.set(self.open_count.get() + 1);
        match self.files.borrow().get(&(device_path as usize)) {
            Some(file) => Ok(Box::new(file.clone())),
            None => Err(efi::Status::NOT_FOUND),
        }
    }
}

/// A call observed by [`RecordingImageServices`]. Pointers are recorded as addresses.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeCall {
    Load { boot_policy: bool, parent: usize, device_path: usize, buffer: Option<Vec<u8>> },
    Start(usize),
    Unload(usize),
    Exit { handle: usize, status: efi::Status },
}

/// Stands in for the platform's image services.
pub struct RecordingImageServices {
    calls: RefCell<Vec<NativeCall>>,
    load_status: Cell<efi::Status>,
    loaded_handle: Cell<usize>,
}

impl RecordingImageServices {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            load_status: Cell::new(efi::Status::SUCCESS),
            loaded_handle: Cell::new(0),
        }
    }

    pub fn set_load_status(&self, status: efi::Status) {
        self.load_status.set(status);
    }

    /// Handle written to the output slot of successful loads.
    pub fn set_loaded_handle(&self, handle: efi::Handle) {
        self.loaded_handle.set(handle as usize);
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.calls.borrow().clone()
    }
}

impl Default for RecordingImageServices {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageServices for RecordingImageServices {
    fn load_image(
        &self,
        boot_policy: efi::Boolean,
        parent_image_handle: efi::Handle,
        device_path: *mut efi::protocols::device_path::Protocol,
        source_buffer: *mut c_void,
        source_size: usize,
        image_handle: *mut efi::Handle,
    ) -> efi::Status {
        let buffer = if source_buffer.is_null() {
            None
        } else {
            // SAFETY: test code, the caller passes `source_size` readable bytes.
            Some(unsafe { core::slice::from_raw_parts(source_buffer as *const u8, source_size) }.to_vec())
        };
        self.calls.borrow_mut().push(NativeCall::Load {
            boot_policy: boot_policy.into(),
            parent: parent_image_handle as usize,
            device_path: device_path as usize,
            buffer,
        });

        let status = self.load_status.get();
        if !status.is_error() && !image_handle.is_null() {
            // SAFETY: test code, non-null output slot.
            unsafe { image_handle.write(self.loaded_handle.get() as efi::Handle) };
        }
        status
    }

    fn start_image(
        &self,
        image_handle: efi::Handle,
        _exit_data_size: *mut usize,
        _exit_data: *mut *mut efi::Char16,
    ) -> efi::Status {
        self.calls.borrow_mut().push(NativeCall::Start(image_handle as usize));
        efi::Status::SUCCESS
    }

    fn unload_image(&self, image_handle: efi::Handle) -> efi::Status {
        self.calls.borrow_mut().push(NativeCall::Unload(image_handle as usize));
        efi::Status::SUCCESS
    }

    fn exit(
        &self,
        image_handle: efi::Handle,
        exit_status: efi::Status,
        _exit_data_size: usize,
        _exit_data: *mut efi::Char16,
    ) -> efi::Status {
        self.calls.borrow_mut().push(NativeCall::Exit { handle: image_handle as usize, status: exit_status });
        efi::Status::SUCCESS
    }
}

/// Views a device path built by [`build_file_device_path`] as a raw device path pointer.
pub fn device_path_of(path: &mut [u8]) -> *mut efi::protocols::device_path::Protocol {
    path.as_mut_ptr() as *mut efi::protocols::device_path::Protocol
}

/// Builds a device path of media file path nodes, one per name, terminated by an end-of-entire-path node.
pub fn build_file_device_path(names: &[&str]) -> Vec<u8> {
    let mut path = Vec::new();
    for name in names {
        let mut data: Vec<u8> = name.encode_utf16().chain([0]).flat_map(u16::to_le_bytes).collect();
        let length = (4 + data.len()) as u16;
        path.extend_from_slice(&[
            efi::protocols::device_path::TYPE_MEDIA,
            efi::protocols::device_path::Media::SUBTYPE_FILE_PATH,
        ]);
        path.extend_from_slice(&length.to_le_bytes());
        path.append(&mut data);
    }
    path.extend_from_slice(&[
        efi::protocols::device_path::TYPE_END,
        efi::protocols::device_path::End::SUBTYPE_ENTIRE,
        0x4,
        0x0,
    ]);
    path
}

#[derive(Debug, Clone, Copy)]
pub enum FatLayout {
    /// Little-endian EFI fat binary.
    Efi,
    /// Big-endian Mach-O universal binary.
    Mach,
}

/// Builds a multi-architecture container holding `slices` in order.
pub fn build_fat_binary(layout: FatLayout, slices: &[(u32, &[u8])]) -> Vec<u8> {
    let encode = |value: u32| match layout {
        FatLayout::Efi => value.to_le_bytes(),
        FatLayout::Mach => value.to_be_bytes(),
    };
    let magic = match layout {
        FatLayout::Efi => EFI_FAT_BINARY_MAGIC,
        FatLayout::Mach => MACH_FAT_BINARY_MAGIC,
    };

    let mut image = Vec::new();
    image.extend_from_slice(&encode(magic));
    image.extend_from_slice(&encode(slices.len() as u32));

    let mut offset = 8 + slices.len() * 20;
    for (cpu_type, slice) in slices {
        image.extend_from_slice(&encode(*cpu_type));
        image.extend_from_slice(&encode(3));
        image.extend_from_slice(&encode(offset as u32));
        image.extend_from_slice(&encode(slice.len() as u32));
        image.extend_from_slice(&encode(0));
        offset += slice.len();
    }
    for (_, slice) in slices {
        image.extend_from_slice(slice);
    }
    image
}

/// Preferred base of images built by [`TestImage`].
pub const TEST_IMAGE_BASE: u64 = 0x1000_0000;
/// Offset, in the loaded image, of a pointer to `TEST_IMAGE_BASE + 0x1000` covered by a base relocation.
pub const TEST_POINTER_OFFSET: usize = 0x1010;

const IMAGE_REL_BASED_DIR64: u16 = 10;

/// Builds a minimal PE32+ image: headers, a `.text` section at 0x1000 and a `.reloc` section at 0x2000.
pub struct TestImage {
    machine: u16,
    subsystem: u16,
    entry_point: u32,
    relocation_type: u16,
}

impl TestImage {
    pub fn new(machine: u16, subsystem: u16) -> Self {
        Self { machine, subsystem, entry_point: 0x1000, relocation_type: IMAGE_REL_BASED_DIR64 }
    }

    pub fn entry_point(mut self, entry_point: u32) -> Self {
        self.entry_point = entry_point;
        self
    }

    pub fn relocation_type(mut self, relocation_type: u16) -> Self {
        self.relocation_type = relocation_type;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; 0x600];
        let mut put = |offset: usize, bytes: &[u8]| image[offset..offset + bytes.len()].copy_from_slice(bytes);

        // DOS header.
        put(0x00, b"MZ");
        put(0x3c, &0x80u32.to_le_bytes());

        // PE signature and COFF file header.
        put(0x80, b"PE\0\0");
        put(0x84, &self.machine.to_le_bytes());
        put(0x86, &2u16.to_le_bytes());
        put(0x94, &0xf0u16.to_le_bytes());
        put(0x96, &0x22u16.to_le_bytes());

        // PE32+ optional header.
        let optional = 0x98;
        put(optional, &0x20bu16.to_le_bytes());
        put(optional + 4, &0x200u32.to_le_bytes());
        put(optional + 16, &self.entry_point.to_le_bytes());
        put(optional + 20, &0x1000u32.to_le_bytes());
        put(optional + 24, &TEST_IMAGE_BASE.to_le_bytes());
        put(optional + 32, &0x1000u32.to_le_bytes());
        put(optional + 36, &0x200u32.to_le_bytes());
        put(optional + 56, &0x3000u32.to_le_bytes());
        put(optional + 60, &0x200u32.to_le_bytes());
        put(optional + 68, &self.subsystem.to_le_bytes());
        put(optional + 108, &16u32.to_le_bytes());
        // base relocation directory.
        put(optional + 112 + 5 * 8, &0x2000u32.to_le_bytes());
        put(optional + 112 + 5 * 8 + 4, &12u32.to_le_bytes());

        // section table.
        let sections: [(&[u8; 8], u32, u32); 2] = [(b".text\0\0\0", 0x1000, 0x200), (b".reloc\0\0", 0x2000, 0x400)];
        for (index, (name, virtual_address, raw_offset)) in sections.iter().enumerate() {
            let header = 0x188 + index * 40;
            put(header, &name[..]);
            put(header + 8, &0x1000u32.to_le_bytes());
            put(header + 12, &virtual_address.to_le_bytes());
            put(header + 16, &0x200u32.to_le_bytes());
            put(header + 20, &raw_offset.to_le_bytes());
            put(header + 36, &0x4000_0040u32.to_le_bytes());
        }

        // .text: one absolute pointer to the start of .text.
        put(0x200 + (TEST_POINTER_OFFSET - 0x1000), &(TEST_IMAGE_BASE + 0x1000).to_le_bytes());

        // .reloc: a single block covering the pointer.
        let entry = (self.relocation_type << 12) | (TEST_POINTER_OFFSET - 0x1000) as u16;
        put(0x400, &0x1000u32.to_le_bytes());
        put(0x404, &12u32.to_le_bytes());
        put(0x408, &entry.to_le_bytes());

        image
    }
}
