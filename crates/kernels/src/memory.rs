//! Device-side view of global memory and of the marshaled argument words.

use anyhow::{anyhow, Result};

/// Word-addressable global memory as seen by a running tile.
///
/// Addresses are byte addresses in the device's 32-bit address space and
/// word accesses must be 4-byte aligned. Implementations must tolerate
/// concurrent access from every tile of every running tile group; ordering
/// between tiles is only established by crossing a tile-group barrier.
pub trait DeviceMemory: Send + Sync {
    fn load_word(&self, address: u32) -> Result<u32>;
    fn store_word(&self, address: u32, value: u32) -> Result<()>;

    fn load_f32(&self, address: u32) -> Result<f32> {
        self.load_word(address).map(f32::from_bits)
    }

    fn store_f32(&self, address: u32, value: f32) -> Result<()> {
        self.store_word(address, value.to_bits())
    }
}

/// Address of element `index` of an `f32` array starting at `base`.
pub fn element_address(base: u32, index: usize) -> Result<u32> {
    u32::try_from(index)
        .ok()
        .and_then(|index| index.checked_mul(4))
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| anyhow!("element {index} of array at {base:#x} overflows the address space"))
}

/// Ordered argument words handed to a kernel entry point.
///
/// The words carry no type information: whether a word is a buffer address or
/// a scalar is a convention between the host that marshaled them and the
/// entry point that reads them.
#[derive(Debug, Clone, Copy)]
pub struct KernelArgs<'a> {
    words: &'a [u32],
}

impl<'a> KernelArgs<'a> {
    pub fn new(words: &'a [u32]) -> Self {
        Self { words }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn word(&self, index: usize) -> Result<u32> {
        self.words.get(index).copied().ok_or_else(|| {
            anyhow!(
                "kernel argument {index} requested but only {} were marshaled",
                self.words.len()
            )
        })
    }

    pub fn address(&self, index: usize) -> Result<u32> {
        self.word(index)
    }

    pub fn scalar(&self, index: usize) -> Result<usize> {
        self.word(index).map(|word| word as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_argument_is_reported() {
        let words = [0x1000, 4];
        let args = KernelArgs::new(&words);
        assert_eq!(args.address(0).unwrap(), 0x1000);
        assert_eq!(args.scalar(1).unwrap(), 4);
        let err = args.word(2).unwrap_err();
        assert!(err.to_string().contains("only 2"));
    }

    #[test]
    fn element_address_rejects_overflow() {
        assert_eq!(element_address(0x100, 3).unwrap(), 0x10c);
        assert!(element_address(u32::MAX - 2, 1).is_err());
    }
}
