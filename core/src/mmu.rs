//! ELF loading and the guest's sbrk-style bump allocator.
//!
//! Guest memory is plain host virtual memory, mapped at fixed addresses so
//! that `host = guest + OFFSET`. The MMU is the sole mutator of those
//! mappings; it does not track individual allocation boundaries, only the
//! current high-water mark, so `alloc` with a negative size is only safe
//! to use in LIFO order.

use std::fs;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::path::Path;

use bitflags::bitflags;
use goblin::elf::Elf;
use goblin::elf::program_header::PT_LOAD;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, mmap_anonymous, munmap};
use nix::unistd::{SysconfVar, sysconf};

use crate::address::{GuestAddress, HostAddress, round_down, round_up};
use crate::error::{Error, Result};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct SegmentFlags: u32 {
        const EXEC  = 0x1;
        const WRITE = 0x2;
        const READ  = 0x4;
    }
}

impl SegmentFlags {
    fn to_prot(self) -> ProtFlags {
        let mut prot = ProtFlags::empty();
        if self.contains(Self::READ) {
            prot |= ProtFlags::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= ProtFlags::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= ProtFlags::PROT_EXEC;
        }
        prot
    }
}

fn page_size() -> u64 {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .unwrap_or(4096) as u64
}

fn mmap_err(addr: u64, source: nix::Error) -> Error {
    Error::MmapFailure { addr, source }
}

/// Guest-memory manager: ELF loader, segment mapper and bump allocator.
pub struct Mmu {
    pub entry: GuestAddress,
    pub base: GuestAddress,
    pub guest_alloc: GuestAddress,
    pub host_alloc: HostAddress,
    page_size: u64,
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            entry: GuestAddress::new(0),
            base: GuestAddress::new(0),
            guest_alloc: GuestAddress::new(0),
            host_alloc: HostAddress::new(0),
            page_size: page_size(),
        }
    }

    /// Reads the ELF header and every `PT_LOAD` program header, mapping
    /// each into host memory at its fixed guest-translated address.
    pub fn load_elf(&mut self, path: &Path) -> Result<()> {
        let fd = fs::File::open(path)?;
        let data = fs::read(path)?;

        let elf = Elf::parse(&data)?;

        if !elf.is_64 {
            return Err(Error::InvalidElf("only RISCV64 elf supported".into()));
        }
        if elf.header.e_machine != goblin::elf::header::EM_RISCV {
            return Err(Error::InvalidElf("only RISCV64 elf supported".into()));
        }

        self.entry = GuestAddress::new(elf.entry);

        for phdr in elf.program_headers.iter().filter(|p| p.p_type == PT_LOAD) {
            self.load_segment(phdr, &fd)?;
        }

        Ok(())
    }

    fn load_segment(&mut self, phdr: &goblin::elf::ProgramHeader, fd: &fs::File) -> Result<()> {
        let page = self.page_size;
        let flags = SegmentFlags::from_bits_truncate(phdr.p_flags);
        let prot = flags.to_prot();

        let guest_in_host = GuestAddress::new(phdr.p_vaddr).to_host().as_u64();
        let aligned_vaddr = round_down(guest_in_host, page);
        let slack = guest_in_host - aligned_vaddr;
        let filesz = phdr.p_filesz + slack;
        let memsz = phdr.p_memsz + slack;

        let map_len = NonZeroUsize::new(filesz.max(1) as usize).unwrap();
        let addr = NonZeroUsize::new(aligned_vaddr as usize);
        let file_off = round_down(phdr.p_offset, page) as nix::libc::off_t;

        let mapped = unsafe {
            mmap(
                addr,
                map_len,
                prot,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
                fd.as_fd(),
                file_off,
            )
            .map_err(|e| mmap_err(aligned_vaddr, e))?
        };
        if mapped.as_ptr() as u64 != aligned_vaddr {
            return Err(Error::InvalidElf("segment did not map at requested address".into()));
        }

        let bss_size = round_up(memsz, page) - round_up(filesz, page);
        if bss_size > 0 {
            let bss_addr = aligned_vaddr + round_up(filesz, page);
            let bss_len = NonZeroUsize::new(bss_size as usize).unwrap();
            let bss_mapped = unsafe {
                mmap_anonymous(
                    NonZeroUsize::new(bss_addr as usize),
                    bss_len,
                    prot,
                    MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
                )
                .map_err(|e| mmap_err(bss_addr, e))?
            };
            if bss_mapped.as_ptr() as u64 != bss_addr {
                return Err(Error::InvalidElf("bss did not map at requested address".into()));
            }
        }

        let new_end = aligned_vaddr + round_up(memsz, page);
        self.host_alloc = HostAddress::new(self.host_alloc.as_u64().max(new_end));
        self.base = self.host_alloc.to_guest();
        self.guest_alloc = self.base;

        Ok(())
    }

    /// Bump-allocates (or, for a negative size, reclaims) guest heap space.
    /// Returns the pre-advance guest address; the returned range (for a
    /// positive size) is freshly zero-filled, readable and writable.
    pub fn alloc(&mut self, size: i64) -> Result<GuestAddress> {
        let page = self.page_size;
        let base = self.guest_alloc;
        debug_assert!(base.as_u64() >= self.base.as_u64());

        self.guest_alloc = if size >= 0 {
            self.guest_alloc.add(size as u64)
        } else {
            GuestAddress::new(self.guest_alloc.as_u64().wrapping_sub((-size) as u64))
        };
        debug_assert!(self.guest_alloc.as_u64() >= self.base.as_u64());

        let host_limit = self.host_alloc.to_guest();
        if size > 0 && self.guest_alloc.as_u64() > host_limit.as_u64() {
            let alloc_size = round_up(size as u64, page);
            let len = NonZeroUsize::new(alloc_size as usize).unwrap();
            unsafe {
                mmap_anonymous(
                    NonZeroUsize::new(self.host_alloc.as_u64() as usize),
                    len,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
                )
                .map_err(|e| mmap_err(self.host_alloc.as_u64(), e))?;
            }
            self.host_alloc = self.host_alloc.add(alloc_size);
        } else if size < 0 {
            let rounded = round_up(self.guest_alloc.as_u64(), page);
            if rounded < host_limit.as_u64() {
                let munmap_size = host_limit.as_u64() - rounded;
                let unmap_at = self.host_alloc.as_u64() - munmap_size;
                if let Some(nz) = NonZeroUsize::new(unmap_at as usize) {
                    unsafe {
                        munmap(
                            std::ptr::NonNull::new(nz.get() as *mut std::ffi::c_void).unwrap(),
                            munmap_size as usize,
                        )
                        .map_err(|e| mmap_err(unmap_at, e))?;
                    }
                }
                self.host_alloc = HostAddress::new(self.host_alloc.as_u64() - munmap_size);
            }
        }

        Ok(base)
    }

    /// Current guest-visible heap break, as tracked by the bump allocator.
    pub fn brk(&self) -> GuestAddress {
        self.guest_alloc
    }

    pub fn write(&self, addr: GuestAddress, bytes: &[u8]) {
        let host = addr.to_host();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), host.as_mut_ptr::<u8>(), bytes.len());
        }
    }

    pub fn read(&self, addr: GuestAddress, buf: &mut [u8]) {
        let host = addr.to_host();
        unsafe {
            std::ptr::copy_nonoverlapping(host.as_ptr::<u8>(), buf.as_mut_ptr(), buf.len());
        }
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}
