//! Controllers on the PCI bus, reached through sysfs.
//!
//! The device is unbound from its kernel driver, bus mastering is enabled and
//! BAR0 is mapped into the process. Requires root and a hugetlbfs memory pool
//! so that buffer addresses are real bus addresses.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::ptr;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::transport::Transport;

// write to the command register (offset 4) in the PCIe config space
const COMMAND_REGISTER_OFFSET: u64 = 4;
// bit 2 is "bus master enable", see PCIe 3.0 specification section 7.5.1.1
const BUS_MASTER_ENABLE_BIT: u64 = 2;
// mass storage device, nvme subclass
const NVME_CLASS_ID: u32 = 0x0108;

/// Unbinds the driver from the device at `pci_addr`.
pub fn unbind_driver(pci_addr: &str) -> Result<()> {
    let path = format!("/sys/bus/pci/devices/{}/driver/unbind", pci_addr);

    match fs::OpenOptions::new().write(true).open(path) {
        Ok(mut f) => {
            write!(f, "{}", pci_addr)?;
            Ok(())
        }
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Enables direct memory access for the device at `pci_addr`.
pub fn enable_dma(pci_addr: &str) -> Result<()> {
    let mut file = pci_open_resource(pci_addr, "config")?;

    let mut dma = read_io16(&mut file, COMMAND_REGISTER_OFFSET)?;
    dma |= 1 << BUS_MASTER_ENABLE_BIT;
    write_io16(&mut file, dma, COMMAND_REGISTER_OFFSET)?;

    Ok(())
}

/// Mmaps BAR0 of the device at `pci_addr`.
pub fn pci_map_resource(pci_addr: &str) -> Result<(*mut u8, usize)> {
    let path = format!("/sys/bus/pci/devices/{}/resource0", pci_addr);

    unbind_driver(pci_addr)?;
    enable_dma(pci_addr)?;

    let file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
    let len = fs::metadata(&path)?.len() as usize;

    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };

    if ptr == libc::MAP_FAILED || len == 0 {
        Err(Error::ControllerInit(format!(
            "pci mapping of {} failed",
            pci_addr
        )))
    } else {
        Ok((ptr as *mut u8, len))
    }
}

/// Opens a pci resource file at the given address.
pub fn pci_open_resource(pci_addr: &str, resource: &str) -> Result<File> {
    let path = format!("/sys/bus/pci/devices/{}/{}", pci_addr, resource);
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

/// Opens a pci resource file at the given address in read-only mode.
pub fn pci_open_resource_ro(pci_addr: &str, resource: &str) -> Result<File> {
    let path = format!("/sys/bus/pci/devices/{}/{}", pci_addr, resource);
    Ok(OpenOptions::new().read(true).write(false).open(path)?)
}

/// Reads and returns an u32 at `offset` in `file`.
pub fn read_io32(file: &mut File, offset: u64) -> io::Result<u32> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_u32::<NativeEndian>()
}

/// Reads and returns an u16 at `offset` in `file`.
pub fn read_io16(file: &mut File, offset: u64) -> io::Result<u16> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_u16::<NativeEndian>()
}

/// Writes an u16 at `offset` in `file`.
pub fn write_io16(file: &mut File, value: u16, offset: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_u16::<NativeEndian>(value)
}

/// Reads a hex string from `file` and returns it as `u64`.
pub fn read_hex(file: &mut File) -> Result<u64> {
    let mut buffer = String::new();
    file.read_to_string(&mut buffer)?;
    parse_hex(&buffer)
}

fn parse_hex(value: &str) -> Result<u64> {
    u64::from_str_radix(value.trim().trim_start_matches("0x"), 16)
        .map_err(|e| Error::ControllerInit(format!("invalid hex value {:?}: {}", value.trim(), e)))
}

/// Register window of a PCIe NVMe controller.
pub struct PciTransport {
    address: String,
    base: *mut u8,
    len: usize,
}

// the mapping is plain MMIO and is only touched through volatile accesses
unsafe impl Send for PciTransport {}
unsafe impl Sync for PciTransport {}

impl PciTransport {
    /// Check that `pci_addr` is an NVMe controller and map its registers.
    pub fn open(pci_addr: &str) -> Result<Self> {
        let mut vendor_file = pci_open_resource_ro(pci_addr, "vendor")?;
        let mut device_file = pci_open_resource_ro(pci_addr, "device")?;
        let mut config_file = pci_open_resource_ro(pci_addr, "config")?;

        let vendor_id = read_hex(&mut vendor_file)?;
        let device_id = read_hex(&mut device_file)?;
        let class_id = read_io32(&mut config_file, 8)? >> 16;

        if class_id != NVME_CLASS_ID {
            return Err(Error::ControllerInit(format!(
                "device {} is not a block device",
                pci_addr
            )));
        }

        let (base, len) = pci_map_resource(pci_addr)?;
        tracing::info!(
            address = pci_addr,
            vendor = vendor_id,
            device = device_id,
            bar_len = len,
            "mapped pci controller"
        );
        Ok(Self {
            address: pci_addr.to_string(),
            base,
            len,
        })
    }

    fn check(&self, offset: usize, width: usize) -> bool {
        offset + width <= self.len
    }
}

impl Transport for PciTransport {
    fn name(&self) -> &str {
        &self.address
    }

    fn base_address(&self) -> usize {
        self.base as usize
    }

    fn read32(&self, offset: usize) -> u32 {
        debug_assert!(self.check(offset, 4), "register read out of bounds");
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        debug_assert!(self.check(offset, 4), "register write out of bounds");
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u32, value) }
    }

    fn read64(&self, offset: usize) -> u64 {
        debug_assert!(self.check(offset, 8), "register read out of bounds");
        unsafe { ptr::read_volatile(self.base.add(offset) as *const u64) }
    }

    fn write64(&self, offset: usize, value: u64) {
        debug_assert!(self.check(offset, 8), "register write out of bounds");
        unsafe { ptr::write_volatile(self.base.add(offset) as *mut u64, value) }
    }
}

impl Drop for PciTransport {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
    }
}

impl std::fmt::Debug for PciTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PciTransport")
            .field("address", &self.address)
            .field("bar_len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sysfs_hex() {
        assert_eq!(parse_hex("0x8086\n").unwrap(), 0x8086);
        assert_eq!(parse_hex("1b36").unwrap(), 0x1b36);
        assert!(matches!(parse_hex("0xzz"), Err(Error::ControllerInit(_))));
    }

    #[test]
    fn missing_device_fails_to_open() {
        assert!(PciTransport::open("ffff:ff:1f.7").is_err());
    }
}
