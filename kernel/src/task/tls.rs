//! Per-thread copies of a process's thread-local storage image.

use alloc::vec;

use crate::arch::{AddressSpace, AddressSpaces, MemoryFault, UserMemory, PAGE_SIZE};
use crate::task::stack::PendingFree;

/// The PT_TLS segment a loader found in the program image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsTemplate {
    /// User address of the initialised data in the process's space
    pub image: u64,
    /// Bytes to copy from `image`
    pub file_size: u64,
    /// Full block size; the tail past `file_size` is zeroed
    pub mem_size: u64,
}

/// One thread's TLS block, mapped into its process's address space.
///
/// The block ends in a word that points at itself (the x86-64 variant II
/// thread pointer); FS and GS are loaded with that word's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsBlock {
    space: AddressSpace,
    base: u64,
    pages: usize,
    pointer: u64,
}

impl TlsBlock {
    pub fn allocate(
        spaces: &dyn AddressSpaces,
        memory: &dyn UserMemory,
        space: AddressSpace,
        template: &TlsTemplate,
        word: u64,
    ) -> Result<Self, (Self, MemoryFault)> {
        let size = template.mem_size.next_multiple_of(word);
        let pages = (size + word).div_ceil(PAGE_SIZE) as usize;
        let base = spaces.map_user_pages(space, pages);
        let block = Self {
            space,
            base,
            pages,
            pointer: base + size,
        };
        block.fill(memory, template, word).map_err(|fault| (block, fault))?;
        Ok(block)
    }

    fn fill(
        &self,
        memory: &dyn UserMemory,
        template: &TlsTemplate,
        word: u64,
    ) -> Result<(), MemoryFault> {
        let copied = template.file_size.min(template.mem_size);
        let mut data = vec![0u8; (self.pointer - self.base) as usize];
        memory.read(Some(self.space), template.image, &mut data[..copied as usize])?;
        memory.write(Some(self.space), self.base, &data)?;
        match word {
            4 => memory.write(Some(self.space), self.pointer, &(self.pointer as u32).to_le_bytes()),
            _ => memory.write(Some(self.space), self.pointer, &self.pointer.to_le_bytes()),
        }
    }

    /// Value for the thread's FS and GS bases
    #[inline]
    pub fn thread_pointer(&self) -> u64 {
        self.pointer
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn pending_free(&self) -> PendingFree {
        PendingFree::UserPages {
            space: self.space,
            addr: self.base,
            count: self.pages,
        }
    }
}
