use super::FaultKind;
use crate::wire::{BytecodeImage, LoadError};

/// Bytes allocated past the masked region so a 2- or 4-byte access that
/// starts at the top of the sandbox stays inside the allocation.
pub const GUARD_BYTES: usize = 4;

/// Largest sandbox the loader will create.
pub const MAX_SANDBOX_BYTES: u64 = 1 << 31;

/// Guest data memory. Every guest address is masked with `mask()` before use,
/// so guest code can never address anything outside this buffer.
#[derive(Clone)]
pub struct SandboxMemory {
    bytes: Vec<u8>,
    mask: u32,
}

impl std::fmt::Debug for SandboxMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxMemory")
            .field("size", &self.size())
            .field("mask", &format_args!("{:#x}", self.mask))
            .finish()
    }
}

impl SandboxMemory {
    /// Allocates a zeroed region of `size` bytes. `size` is rounded up to a
    /// power of two.
    pub fn new(size: u32) -> Self {
        let size = size.max(GUARD_BYTES as u32).next_power_of_two();
        Self {
            bytes: vec![0; size as usize + GUARD_BYTES],
            mask: size - 1,
        }
    }

    /// Sizes the region for `image` plus `stack_size` bytes of stack and
    /// copies the data and lit sections to address 0.
    pub fn for_image(
        image: &BytecodeImage,
        stack_size: u32,
        max_memory: u64,
    ) -> Result<Self, LoadError> {
        let required = image.static_extent() + stack_size as u64;
        let size = required.max(GUARD_BYTES as u64).next_power_of_two();
        if size > MAX_SANDBOX_BYTES.min(max_memory.max(1)) {
            return Err(LoadError::SizeOverflow {
                what: "sandbox memory",
            });
        }
        let mut bytes = vec![0; size as usize + GUARD_BYTES];
        let data = image.data();
        let lit = image.lit();
        bytes[..data.len()].copy_from_slice(data);
        bytes[data.len()..data.len() + lit.len()].copy_from_slice(lit);
        Ok(Self {
            bytes,
            mask: (size - 1) as u32,
        })
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Size of the addressable region, excluding guard bytes.
    pub fn size(&self) -> usize {
        self.mask as usize + 1
    }

    #[inline]
    fn index(&self, addr: u32) -> usize {
        (addr & self.mask) as usize
    }

    #[inline]
    pub fn load_u8(&self, addr: u32) -> u8 {
        self.bytes[self.index(addr)]
    }

    #[inline]
    pub fn load_u16(&self, addr: u32) -> u16 {
        let at = self.index(addr);
        u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]])
    }

    #[inline]
    pub fn load_u32(&self, addr: u32) -> u32 {
        let at = self.index(addr);
        u32::from_le_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ])
    }

    #[inline]
    pub fn store_u8(&mut self, addr: u32, value: u8) {
        let at = self.index(addr);
        self.bytes[at] = value;
    }

    #[inline]
    pub fn store_u16(&mut self, addr: u32, value: u16) {
        let at = self.index(addr);
        self.bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn store_u32(&mut self, addr: u32, value: u32) {
        let at = self.index(addr);
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_i32(&self, addr: u32) -> i32 {
        self.load_u32(addr) as i32
    }

    pub fn write_i32(&mut self, addr: u32, value: i32) {
        self.store_u32(addr, value as u32);
    }

    pub fn read_f32(&self, addr: u32) -> f32 {
        f32::from_bits(self.load_u32(addr))
    }

    pub fn write_f32(&mut self, addr: u32, value: f32) {
        self.store_u32(addr, value.to_bits());
    }

    fn checked_range(&self, addr: u32, len: usize) -> Result<std::ops::Range<usize>, FaultKind> {
        let start = self.index(addr);
        match start.checked_add(len) {
            Some(end) if end <= self.size() => Ok(start..end),
            _ => Err(FaultKind::HostPointerOutOfRange { addr, len }),
        }
    }

    /// Host view of `len` guest bytes starting at the masked `addr`.
    pub fn slice(&self, addr: u32, len: usize) -> Result<&[u8], FaultKind> {
        let range = self.checked_range(addr, len)?;
        Ok(&self.bytes[range])
    }

    pub fn slice_mut(&mut self, addr: u32, len: usize) -> Result<&mut [u8], FaultKind> {
        let range = self.checked_range(addr, len)?;
        Ok(&mut self.bytes[range])
    }

    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), FaultKind> {
        self.slice_mut(addr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Bytes of the NUL-terminated string at `addr`, without the terminator.
    pub fn read_cstr(&self, addr: u32) -> Result<&[u8], FaultKind> {
        let start = self.index(addr);
        let region = &self.bytes[start..self.size()];
        let len = region
            .iter()
            .position(|byte| *byte == 0)
            .ok_or(FaultKind::HostPointerOutOfRange {
                addr,
                len: region.len(),
            })?;
        Ok(&region[..len])
    }

    pub fn read_string(&self, addr: u32) -> Result<String, FaultKind> {
        Ok(String::from_utf8_lossy(self.read_cstr(addr)?).into_owned())
    }

    /// Writes `text` and a NUL terminator at `addr`.
    pub fn write_cstr(&mut self, addr: u32, text: &[u8]) -> Result<(), FaultKind> {
        let out = self.slice_mut(addr, text.len() + 1)?;
        out[..text.len()].copy_from_slice(text);
        out[text.len()] = 0;
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dest` with memmove semantics. Both
    /// addresses must already lie inside the region, unmasked, with their end
    /// below the mask.
    pub fn block_copy(&mut self, dest: u32, src: u32, len: u32) -> Result<(), FaultKind> {
        let mask = self.mask as u64;
        let fits = |addr: u32| addr as u64 <= mask && addr as u64 + len as u64 <= mask;
        if !fits(dest) || !fits(src) {
            return Err(FaultKind::BlockCopyOutOfRange { dest, src, len });
        }
        let src = src as usize;
        self.bytes
            .copy_within(src..src + len as usize, dest as usize);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.size()]
    }

    /// Base of the allocation, including guard bytes, for generated code.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_masked() {
        let mut memory = SandboxMemory::new(0x100);
        assert_eq!(memory.mask(), 0xff);
        memory.store_u32(0x1_0010, 0xdead_beef);
        assert_eq!(memory.load_u32(0x10), 0xdead_beef);
        assert_eq!(memory.load_u8(0xffff_ff10), 0xef);
    }

    #[test]
    fn straddling_word_touches_guard_bytes() {
        let mut memory = SandboxMemory::new(0x100);
        memory.store_u32(0xfe, 0x4433_2211);
        assert_eq!(memory.load_u16(0xfe), 0x2211);
        assert_eq!(memory.load_u32(0xfe), 0x4433_2211);
        // address 0 is untouched
        assert_eq!(memory.load_u32(0), 0);
    }

    #[test]
    fn host_slices_are_bounds_checked() {
        let memory = SandboxMemory::new(0x100);
        assert!(memory.slice(0xf0, 0x10).is_ok());
        assert_eq!(
            memory.slice(0xf0, 0x11),
            Err(FaultKind::HostPointerOutOfRange {
                addr: 0xf0,
                len: 0x11
            })
        );
    }

    #[test]
    fn block_copy_overlaps_like_memmove() {
        let mut memory = SandboxMemory::new(0x40);
        memory.write_bytes(0, b"abcdef").expect("write");
        memory.block_copy(2, 0, 4).expect("copy");
        assert_eq!(memory.slice(0, 6).expect("slice"), b"ababcd");
        assert!(matches!(
            memory.block_copy(0x3e, 0, 4),
            Err(FaultKind::BlockCopyOutOfRange { .. })
        ));
        assert!(matches!(
            memory.block_copy(0, 0x40, 1),
            Err(FaultKind::BlockCopyOutOfRange { .. })
        ));
    }

    #[test]
    fn cstr_requires_terminator_inside_region() {
        let mut memory = SandboxMemory::new(0x20);
        memory.write_cstr(4, b"hello").expect("write");
        assert_eq!(memory.read_string(4).expect("read"), "hello");
        memory.write_bytes(0x1c, b"full").expect("fill");
        assert!(memory.read_cstr(0x1c).is_err());
        assert!(memory.write_cstr(0x1c, b"full").is_err());
    }
}
