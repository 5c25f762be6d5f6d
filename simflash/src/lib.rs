//! Simulated storage devices
//!
//! The bootloader talks to two very different devices.  The external block
//! device (a serial DataFlash or similar) is byte addressable and can be
//! overwritten in place.  The internal NOR flash the application runs from
//! cannot: a sector has to be erased before any page in it is programmed, and
//! the sectors are not necessarily all the same size.  Some parts, the
//! STM32F4 for instance, have a few small sectors at the bottom of flash
//! followed by much larger ones.
//!
//! These simulators hold their contents in memory, enforce the geometry rules
//! of the real parts, and keep a log of the operations performed so that tests
//! can check the order and number of erases and programs.

use anyhow::{anyhow, Result};
use storage::{BlockDevice, Error, Flash, ReadStorage};

pub mod gen;
pub mod styles;

/// The value of an erased byte.
pub const ERASED: u8 = 0xff;

/// A single operation performed on a simulated internal flash.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlashOp {
    Erase { address: usize, length: usize },
    Program { address: usize, length: usize },
}

/// Simulated internal flash with a possibly non-uniform sector map.
pub struct SimFlash {
    base: usize,
    page_size: usize,
    /// (start, size) of each sector, absolute addresses, in order.
    sectors: Vec<(usize, usize)>,
    data: Vec<u8>,
    ops: Vec<FlashOp>,
    initialized: bool,
    /// Number of programs that will succeed before the device starts failing.
    program_budget: Option<usize>,
}

impl SimFlash {
    pub fn new(base: usize, page_size: usize, sector_sizes: &[usize]) -> Result<SimFlash> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(anyhow!("Page size {} is not a power of two", page_size));
        }
        let mut sectors = Vec::with_capacity(sector_sizes.len());
        let mut pos = base;
        for &size in sector_sizes {
            if size == 0 || size % page_size != 0 {
                return Err(anyhow!(
                    "Sector size {} is not a multiple of the page size {}",
                    size,
                    page_size
                ));
            }
            sectors.push((pos, size));
            pos = pos
                .checked_add(size)
                .ok_or_else(|| anyhow!("Sector map overflows the address space"))?;
        }
        let capacity = pos - base;
        Ok(SimFlash {
            base,
            page_size,
            sectors,
            data: vec![ERASED; capacity],
            ops: Vec::new(),
            initialized: false,
            program_budget: None,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Place data directly into flash, bypassing the geometry rules and the
    /// operation log.  This represents whatever was installed before the test
    /// starts.
    pub fn install(&mut self, address: usize, data: &[u8]) -> Result<()> {
        let pos = self.index(address, data.len())?;
        self.data[pos..pos + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// View `length` bytes of the flash starting at absolute `address`.
    pub fn slice(&self, address: usize, length: usize) -> &[u8] {
        let pos = address - self.base;
        &self.data[pos..pos + length]
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// The erase operations performed, in order.
    pub fn erases(&self) -> Vec<(usize, usize)> {
        self.ops
            .iter()
            .filter_map(|op| match *op {
                FlashOp::Erase { address, length } => Some((address, length)),
                FlashOp::Program { .. } => None,
            })
            .collect()
    }

    /// The program operations performed, in order.
    pub fn programs(&self) -> Vec<(usize, usize)> {
        self.ops
            .iter()
            .filter_map(|op| match *op {
                FlashOp::Program { address, length } => Some((address, length)),
                FlashOp::Erase { .. } => None,
            })
            .collect()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Allow `count` more programs, then fail every following one.
    pub fn fail_programs_after(&mut self, count: usize) {
        self.program_budget = Some(count);
    }

    /// The sector containing `address`, as (start, size).
    pub fn sector_at(&self, address: usize) -> Option<(usize, usize)> {
        self.sectors
            .iter()
            .copied()
            .find(|&(start, size)| (start..start + size).contains(&address))
    }

    fn index(&self, address: usize, length: usize) -> storage::Result<usize> {
        let pos = address.checked_sub(self.base).ok_or(Error::OutOfBounds)?;
        storage::check_bounds(self.data.len(), pos, length)?;
        Ok(pos)
    }
}

impl ReadStorage for SimFlash {
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        let pos = self.index(offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[pos..pos + bytes.len()]);
        Ok(())
    }
}

impl Flash for SimFlash {
    fn init(&mut self) -> storage::Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) -> storage::Result<()> {
        self.initialized = false;
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn sector_size(&self, address: usize) -> usize {
        self.sector_at(address).map_or(0, |(_, size)| size)
    }

    fn erase(&mut self, address: usize, length: usize) -> storage::Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        let pos = self.index(address, length)?;

        // Erases must cover whole sectors, starting at a sector boundary.
        let first = self
            .sectors
            .iter()
            .position(|&(start, _)| start == address)
            .ok_or(Error::NotAligned)?;
        let mut covered = 0;
        for &(_, size) in &self.sectors[first..] {
            if covered >= length {
                break;
            }
            covered += size;
        }
        if length == 0 || covered != length {
            return Err(Error::NotAligned);
        }

        self.data[pos..pos + length].fill(ERASED);
        self.ops.push(FlashOp::Erase { address, length });
        Ok(())
    }

    fn program(&mut self, address: usize, bytes: &[u8]) -> storage::Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        let pos = self.index(address, bytes.len())?;
        storage::check_slice(self.data.len(), self.page_size, pos, bytes.len())?;

        if let Some(budget) = self.program_budget.as_mut() {
            if *budget == 0 {
                return Err(Error::Device(-1));
            }
            *budget -= 1;
        }

        let target = &mut self.data[pos..pos + bytes.len()];
        if target.iter().any(|&b| b != ERASED) {
            return Err(Error::NotErased);
        }
        target.copy_from_slice(bytes);
        self.ops.push(FlashOp::Program {
            address,
            length: bytes.len(),
        });
        Ok(())
    }
}

/// Simulated external block device.
pub struct SimBlockDevice {
    read_size: usize,
    data: Vec<u8>,
    initialized: bool,
    init_error: Option<i32>,
    /// Reads touching bytes at or past this offset fail.
    read_limit: Option<usize>,
    programs: Vec<(usize, usize)>,
    reads: usize,
}

impl SimBlockDevice {
    pub fn new(read_size: usize, pages: usize) -> Result<SimBlockDevice> {
        if read_size == 0 {
            return Err(anyhow!("Read size must be non-zero"));
        }
        let capacity = read_size
            .checked_mul(pages)
            .ok_or_else(|| anyhow!("Device capacity overflows"))?;
        Ok(SimBlockDevice {
            read_size,
            data: vec![ERASED; capacity],
            initialized: false,
            init_error: None,
            read_limit: None,
            programs: Vec::new(),
            reads: 0,
        })
    }

    /// Place data directly on the device, outside of the operation log.
    pub fn install(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        storage::check_bounds(self.data.len(), offset, data.len())
            .map_err(|e| anyhow!("Install at 0x{:x}: {}", offset, e))?;
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn slice(&self, offset: usize, length: usize) -> &[u8] {
        &self.data[offset..offset + length]
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Make `init` fail with the given device code.
    pub fn fail_init(&mut self, code: i32) {
        self.init_error = Some(code);
    }

    /// Make reads that reach `offset` or beyond fail.
    pub fn fail_reads_from(&mut self, offset: usize) {
        self.read_limit = Some(offset);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Program operations performed, as (offset, length).
    pub fn programs(&self) -> &[(usize, usize)] {
        &self.programs
    }

    pub fn read_count(&self) -> usize {
        self.reads
    }
}

impl ReadStorage for SimBlockDevice {
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> storage::Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        storage::check_access(self, offset, bytes.len())?;
        if let Some(limit) = self.read_limit {
            if offset + bytes.len() > limit {
                return Err(Error::Device(-5));
            }
        }
        bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
        self.reads += 1;
        Ok(())
    }
}

impl BlockDevice for SimBlockDevice {
    fn init(&mut self) -> storage::Result<()> {
        if let Some(code) = self.init_error {
            return Err(Error::Device(code));
        }
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) -> storage::Result<()> {
        self.initialized = false;
        Ok(())
    }

    fn read_size(&self) -> usize {
        self.read_size
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn program(&mut self, offset: usize, bytes: &[u8]) -> storage::Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        storage::check_access(self, offset, bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.programs.push((offset, bytes.len()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SimFlash {
        SimFlash::new(0x1000, 16, &[64, 64, 128]).unwrap()
    }

    #[test]
    fn geometry() {
        let flash = small();
        assert_eq!(flash.capacity(), 256);
        assert_eq!(flash.sector_size(0x1000), 64);
        assert_eq!(flash.sector_size(0x107f), 64);
        assert_eq!(flash.sector_size(0x1080), 128);
        assert_eq!(flash.sector_size(0x1100), 0);
        assert!(SimFlash::new(0, 16, &[24]).is_err());
    }

    #[test]
    fn program_requires_erase() {
        let mut flash = small();
        assert_eq!(flash.program(0x1000, &[0; 16]), Err(Error::NotInitialized));
        flash.init().unwrap();
        flash.install(0x1000, &[0x12]).unwrap();
        assert_eq!(flash.program(0x1000, &[0; 16]), Err(Error::NotErased));
        flash.erase(0x1000, 64).unwrap();
        flash.program(0x1000, &[0x34; 16]).unwrap();
        assert_eq!(flash.slice(0x1000, 16), &[0x34; 16]);
        assert_eq!(
            flash.ops(),
            &[
                FlashOp::Erase { address: 0x1000, length: 64 },
                FlashOp::Program { address: 0x1000, length: 16 },
            ]
        );
    }

    #[test]
    fn erase_must_cover_sectors() {
        let mut flash = small();
        flash.init().unwrap();
        assert_eq!(flash.erase(0x1010, 64), Err(Error::NotAligned));
        assert_eq!(flash.erase(0x1000, 32), Err(Error::NotAligned));
        assert_eq!(flash.erase(0x1040, 64 + 128), Ok(()));
    }

    #[test]
    fn program_alignment() {
        let mut flash = small();
        flash.init().unwrap();
        flash.erase(0x1000, 64).unwrap();
        assert_eq!(flash.program(0x1004, &[0; 16]), Err(Error::NotAligned));
        assert_eq!(flash.program(0x1000, &[0; 8]), Err(Error::NotAligned));
    }

    #[test]
    fn program_failures() {
        let mut flash = small();
        flash.init().unwrap();
        flash.erase(0x1000, 64).unwrap();
        flash.fail_programs_after(1);
        assert_eq!(flash.program(0x1000, &[0; 16]), Ok(()));
        assert_eq!(flash.program(0x1010, &[0; 16]), Err(Error::Device(-1)));
    }

    #[test]
    fn block_device() {
        let mut bd = SimBlockDevice::new(512, 4).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(bd.read(0, &mut buf), Err(Error::NotInitialized));
        bd.init().unwrap();
        bd.program(510, &[1, 2, 3, 4]).unwrap();
        bd.read(510, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(bd.read(2046, &mut buf), Err(Error::OutOfBounds));
        bd.fail_reads_from(1024);
        assert_eq!(bd.read(1022, &mut buf), Err(Error::Device(-5)));

        let mut broken = SimBlockDevice::new(512, 4).unwrap();
        broken.fail_init(-4001);
        assert_eq!(broken.init(), Err(Error::Device(-4001)));
    }
}
