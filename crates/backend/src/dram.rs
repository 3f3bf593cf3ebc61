//! Simulated device DRAM with a bump allocator.
//!
//! Storage is a flat byte array shared by every running tile. Bytes are
//! atomics so tiles can load and store concurrently without locks; ordering
//! between tiles comes from the tile-group barrier, not from this type.

use anyhow::{anyhow, bail, ensure, Result};
use manycore_kernels::memory::DeviceMemory;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};

/// Byte pattern fresh DRAM holds. Allocation never zeroes memory.
pub const POISON_BYTE: u8 = 0xcd;

pub const ALLOCATION_ALIGNMENT: u32 = 4;

pub struct DeviceDram {
    base: u32,
    bytes: Box<[AtomicU8]>,
    next: u32,
    allocations: BTreeMap<u32, usize>,
}

impl DeviceDram {
    pub fn new(base: u32, capacity: usize) -> Result<Self> {
        ensure!(base != 0, "device DRAM base must be non-zero");
        ensure!(
            base % ALLOCATION_ALIGNMENT == 0,
            "device DRAM base {base:#x} is not {ALLOCATION_ALIGNMENT}-byte aligned"
        );
        let end = u32::try_from(capacity)
            .ok()
            .and_then(|capacity| base.checked_add(capacity));
        ensure!(
            end.is_some(),
            "{capacity} bytes of DRAM at {base:#x} exceed the 32-bit address space"
        );
        Ok(Self {
            base,
            bytes: (0..capacity).map(|_| AtomicU8::new(POISON_BYTE)).collect(),
            next: base,
            allocations: BTreeMap::new(),
        })
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Bytes handed out so far, including alignment padding.
    pub fn used(&self) -> usize {
        (self.next - self.base) as usize
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Reserves `len` bytes and returns their base address.
    ///
    /// Zero-length requests still receive a distinct, aligned address.
    pub fn allocate(&mut self, len: usize) -> Result<u32> {
        let reserved = len
            .max(1)
            .checked_next_multiple_of(ALLOCATION_ALIGNMENT as usize)
            .and_then(|reserved| u32::try_from(reserved).ok())
            .ok_or_else(|| anyhow!("allocation of {len} bytes overflows the address space"))?;
        let remaining = self.capacity() - self.used();
        if reserved as usize > remaining {
            bail!(
                "allocation of {len} bytes exceeds remaining device memory ({remaining} of {} bytes free)",
                self.capacity()
            );
        }
        let address = self.next;
        self.next += reserved;
        self.allocations.insert(address, len);
        Ok(address)
    }

    pub fn fill(&self, address: u32, value: u8, len: usize) -> Result<()> {
        let offset = self.check_range(address, len)?;
        for byte in &self.bytes[offset..offset + len] {
            byte.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn write(&self, address: u32, src: &[u8]) -> Result<()> {
        let offset = self.check_range(address, src.len())?;
        for (byte, value) in self.bytes[offset..offset + src.len()].iter().zip(src) {
            byte.store(*value, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn read(&self, dst: &mut [u8], address: u32) -> Result<()> {
        let len = dst.len();
        let offset = self.check_range(address, len)?;
        for (value, byte) in dst.iter_mut().zip(&self.bytes[offset..offset + len]) {
            *value = byte.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Releases every allocation and re-poisons memory.
    pub fn reset(&mut self) {
        for byte in self.bytes.iter() {
            byte.store(POISON_BYTE, Ordering::Relaxed);
        }
        self.next = self.base;
        self.allocations.clear();
    }

    /// Offset into storage of `[address, address + len)`, which must lie inside
    /// one live allocation.
    fn check_range(&self, address: u32, len: usize) -> Result<usize> {
        let (start, size) = self
            .allocations
            .range(..=address)
            .next_back()
            .map(|(start, size)| (*start, *size))
            .ok_or_else(|| anyhow!("address {address:#x} is not inside any device allocation"))?;
        let within = (address - start) as usize;
        ensure!(
            within + len <= size,
            "access of {len} bytes at {address:#x} overruns the {size}-byte allocation at {start:#x}"
        );
        Ok((address - self.base) as usize)
    }

    fn word_offset(&self, address: u32) -> Result<usize> {
        ensure!(address % 4 == 0, "unaligned word access at {address:#x}");
        self.check_range(address, 4)
    }
}

impl std::fmt::Debug for DeviceDram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceDram")
            .field("base", &format_args!("{:#x}", self.base))
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("allocations", &self.allocations.len())
            .finish()
    }
}

impl DeviceMemory for DeviceDram {
    fn load_word(&self, address: u32) -> Result<u32> {
        let offset = self.word_offset(address)?;
        let mut word = [0u8; 4];
        for (value, byte) in word.iter_mut().zip(&self.bytes[offset..offset + 4]) {
            *value = byte.load(Ordering::Relaxed);
        }
        Ok(u32::from_le_bytes(word))
    }

    fn store_word(&self, address: u32, value: u32) -> Result<()> {
        let offset = self.word_offset(address)?;
        for (byte, value) in self.bytes[offset..offset + 4].iter().zip(value.to_le_bytes()) {
            byte.store(value, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut dram = DeviceDram::new(0x1000, 256).unwrap();
        let a = dram.allocate(3).unwrap();
        let b = dram.allocate(0).unwrap();
        let c = dram.allocate(16).unwrap();
        assert_eq!(a, 0x1000);
        assert_eq!(b, 0x1004);
        assert_eq!(c, 0x1008);
        assert!([a, b, c].iter().all(|addr| addr % ALLOCATION_ALIGNMENT == 0));
        assert_eq!(dram.used(), 24);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut dram = DeviceDram::new(0x1000, 32).unwrap();
        dram.allocate(32).unwrap();
        let err = dram.allocate(1).unwrap_err();
        assert!(err.to_string().contains("exceeds remaining device memory"));
    }

    #[test]
    fn accesses_outside_allocations_are_rejected() {
        let mut dram = DeviceDram::new(0x1000, 64).unwrap();
        let a = dram.allocate(8).unwrap();
        assert!(dram.write(a, &[1; 8]).is_ok());
        assert!(dram.write(a, &[1; 9]).is_err());
        assert!(dram.load_word(0x0ffc).is_err());
        assert!(dram.load_word(a + 2).is_err());
        assert!(dram.load_word(0x1020).is_err());
    }

    #[test]
    fn words_are_little_endian() {
        let mut dram = DeviceDram::new(0x1000, 16).unwrap();
        let a = dram.allocate(4).unwrap();
        dram.store_word(a, 0x0403_0201).unwrap();
        let mut bytes = [0u8; 4];
        dram.read(&mut bytes, a).unwrap();
        assert_eq!(bytes, [1, 2, 3, 4]);
        dram.store_f32(a, 2.5).unwrap();
        assert_eq!(dram.load_f32(a).unwrap(), 2.5);
    }

    #[test]
    fn reset_releases_and_repoisons() {
        let mut dram = DeviceDram::new(0x1000, 16).unwrap();
        let a = dram.allocate(16).unwrap();
        dram.fill(a, 0, 16).unwrap();
        dram.reset();
        assert_eq!(dram.allocation_count(), 0);
        assert!(dram.read(&mut [0u8; 4], a).is_err());
        let a = dram.allocate(4).unwrap();
        let mut bytes = [0u8; 4];
        dram.read(&mut bytes, a).unwrap();
        assert_eq!(bytes, [POISON_BYTE; 4]);
    }

    #[test]
    fn read_fills_exactly_the_destination() {
        let mut dram = DeviceDram::new(0x1000, 32).unwrap();
        let a = dram.allocate(8).unwrap();
        dram.write(a, &[9, 8, 7, 6, 5, 4, 3, 2]).unwrap();

        let mut prefix = [0u8; 6];
        dram.read(&mut prefix, a).unwrap();
        assert_eq!(prefix, [9, 8, 7, 6, 5, 4]);

        let mut tail = [0u8; 3];
        dram.read(&mut tail, a + 5).unwrap();
        assert_eq!(tail, [4, 3, 2]);
        assert!(dram.read(&mut [0u8; 4], a + 5).is_err());
    }
}
