//! Kernel file on the loader's own boot volume.

use uefi::proto::loaded_image::LoadedImage;
use uefi::proto::media::file::{File, FileAttribute, FileMode, RegularFile};
use uefi::proto::media::fs::SimpleFileSystem;
use uefi::table::boot::BootServices;
use uefi::{CStr16, Handle};

use crate::error::{BootResult, FirmwareStatus, IoError};
use crate::source::ImageSource;

fn io(status: uefi::Status) -> IoError {
    IoError::Firmware(FirmwareStatus(status.0))
}

/// Read-only handle to the kernel image. Closed on drop.
pub struct KernelFile {
    file: RegularFile,
    position: u64,
}

impl KernelFile {
    /// Open `path` on the volume `image` was loaded from.
    pub fn open(boot: &BootServices, image: Handle, path: &str) -> BootResult<Self> {
        let device = boot
            .open_protocol_exclusive::<LoadedImage>(image)
            .map_err(|e| io(e.status()))?
            .device();
        let mut fs = boot
            .open_protocol_exclusive::<SimpleFileSystem>(device)
            .map_err(|e| io(e.status()))?;
        let mut root = fs.open_volume().map_err(|e| io(e.status()))?;

        let mut name_buf = [0u16; 64];
        let name = CStr16::from_str_with_buf(path, &mut name_buf)
            .map_err(|_| IoError::Firmware(FirmwareStatus::INVALID_PARAMETER))?;

        let handle = root
            .open(name, FileMode::Read, FileAttribute::empty())
            .map_err(|e| io(e.status()))?;
        let file = handle
            .into_regular_file()
            .ok_or(IoError::Firmware(FirmwareStatus::UNSUPPORTED))?;

        log::debug!("opened {}", path);
        Ok(Self { file, position: 0 })
    }

    pub fn close(self) {
        drop(self);
    }
}

impl ImageSource for KernelFile {
    fn set_position(&mut self, offset: u64) -> BootResult<()> {
        self.file.set_position(offset).map_err(|e| io(e.status()))?;
        self.position = offset;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn read(&mut self, buf: &mut [u8]) -> BootResult<usize> {
        let n = self.file.read(buf).map_err(|e| io(e.status()))?;
        self.position += n as u64;
        Ok(n)
    }
}
