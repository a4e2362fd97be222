//! Thread stacks and the deferred frees that reclaim them.

use crate::arch::{AddressSpace, AddressSpaces, FreeError, PageAllocator, Platform, PAGE_SIZE};
use crate::per_cpu::GsBlock;
use crate::task::Tid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    /// Kernel pages from the page allocator
    Kernel,
    /// Pages mapped into a user address space
    User(AddressSpace),
}

/// A thread's stack region.
///
/// Kernel stacks carry `guard_pages` pages below the usable range; the
/// memory manager leaves them unmapped so an overflow faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stack {
    base: u64,
    pages: usize,
    guard_pages: usize,
    kind: StackKind,
}

impl Stack {
    pub fn allocate_kernel(allocator: &dyn PageAllocator, pages: usize, guard_pages: usize) -> Self {
        let base = allocator.allocate_pages(pages + guard_pages);
        Self {
            base,
            pages,
            guard_pages,
            kind: StackKind::Kernel,
        }
    }

    pub fn allocate_user(spaces: &dyn AddressSpaces, space: AddressSpace, pages: usize) -> Self {
        let base = spaces.map_user_pages(space, pages);
        Self {
            base,
            pages,
            guard_pages: 0,
            kind: StackKind::User(space),
        }
    }

    /// One past the highest usable byte
    #[inline]
    pub fn top(&self) -> u64 {
        self.base + (self.guard_pages + self.pages) as u64 * PAGE_SIZE
    }

    /// Lowest usable byte, just above the guard
    #[inline]
    pub fn bottom(&self) -> u64 {
        self.base + self.guard_pages as u64 * PAGE_SIZE
    }

    /// `[start, end)` of the guard region
    pub fn guard(&self) -> (u64, u64) {
        (self.base, self.bottom())
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.bottom() && addr < self.top()
    }

    pub fn kind(&self) -> StackKind {
        self.kind
    }

    pub fn pending_free(&self) -> PendingFree {
        match self.kind {
            StackKind::Kernel => PendingFree::Pages {
                addr: self.base,
                count: self.pages + self.guard_pages,
            },
            StackKind::User(space) => PendingFree::UserPages {
                space,
                addr: self.base,
                count: self.pages,
            },
        }
    }
}

/// Kernel pages backing a user thread's [`GsBlock`] and syscall stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallBlock {
    pub block: u64,
    pub stack_base: u64,
    pub stack_pages: usize,
}

impl SyscallBlock {
    pub fn allocate(allocator: &dyn PageAllocator, tid: Tid, stack_pages: usize) -> (Self, GsBlock) {
        let block = allocator.allocate_pages(1);
        let stack_base = allocator.allocate_pages(stack_pages);
        let gs = GsBlock::new(tid, stack_base, stack_pages as u64, PAGE_SIZE);
        (
            Self {
                block,
                stack_base,
                stack_pages,
            },
            gs,
        )
    }

    pub fn pending_frees(&self) -> [PendingFree; 2] {
        [
            PendingFree::Pages {
                addr: self.block,
                count: 1,
            },
            PendingFree::Pages {
                addr: self.stack_base,
                count: self.stack_pages,
            },
        ]
    }
}

/// A release the cleanup task owes a collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingFree {
    Pages { addr: u64, count: usize },
    UserPages { space: AddressSpace, addr: u64, count: usize },
    AddressSpace(AddressSpace),
}

impl PendingFree {
    pub fn attempt(&self, platform: &Platform) -> Result<(), FreeError> {
        match *self {
            PendingFree::Pages { addr, count } => platform.pages.free_pages(addr, count),
            PendingFree::UserPages { space, addr, count } => platform.spaces.unmap_user_pages(space, addr, count),
            PendingFree::AddressSpace(space) => platform.spaces.destroy(space),
        }
    }

    /// User pages die with their address space; no separate unmap is needed
    pub fn is_covered_by(&self, destroyed: AddressSpace) -> bool {
        matches!(*self, PendingFree::UserPages { space, .. } if space == destroyed)
    }
}
