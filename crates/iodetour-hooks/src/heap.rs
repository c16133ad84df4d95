//! Private heap backing every allocation made by the DLL.
//!
//! The host may replace or instrument its CRT heap; the hooks allocate from
//! a heap of their own so registry growth never calls back into the host.

use std::alloc::{GlobalAlloc, Layout};
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicIsize, Ordering};

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::Memory::{HeapAlloc, HeapCreate, HeapDestroy, HeapFree, HeapReAlloc};

const HEAP_ZERO_MEMORY: u32 = 0x0000_0008;

/// Alignment every `HeapAlloc` block already has.
const HEAP_ALIGN: usize = 2 * std::mem::size_of::<usize>();

static HEAP: AtomicIsize = AtomicIsize::new(0);

fn heap() -> HANDLE {
    let heap = HEAP.load(Ordering::Acquire);
    if heap != 0 {
        return heap;
    }
    // SAFETY: creates a growable heap with default options.
    let created = unsafe { HeapCreate(0, 0, 0) };
    match HEAP.compare_exchange(0, created, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => created,
        Err(existing) => {
            // SAFETY: `created` lost the race and was never handed out.
            unsafe {
                HeapDestroy(created);
            }
            existing
        }
    }
}

pub struct PrivateHeap;

impl PrivateHeap {
    unsafe fn alloc_with(&self, layout: Layout, flags: u32) -> *mut u8 {
        let heap = heap();
        if heap == 0 {
            return ptr::null_mut();
        }
        if layout.align() <= HEAP_ALIGN {
            return HeapAlloc(heap, flags, layout.size()) as *mut u8;
        }

        // Over-allocate and keep the raw block pointer just below the
        // aligned address.
        let total = layout.size() + layout.align();
        let raw = HeapAlloc(heap, flags, total) as *mut u8;
        if raw.is_null() {
            return raw;
        }
        let offset = layout.align() - (raw as usize & (layout.align() - 1));
        let aligned = raw.add(offset);
        (aligned as *mut *mut u8).sub(1).write_unaligned(raw);
        aligned
    }

    unsafe fn raw_block(ptr: *mut u8, layout: Layout) -> *mut u8 {
        if layout.align() <= HEAP_ALIGN {
            ptr
        } else {
            (ptr as *mut *mut u8).sub(1).read_unaligned()
        }
    }
}

unsafe impl GlobalAlloc for PrivateHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc_with(layout, 0)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.alloc_with(layout, HEAP_ZERO_MEMORY)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let block = Self::raw_block(ptr, layout);
        HeapFree(heap(), 0, block as *const c_void);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= HEAP_ALIGN {
            return HeapReAlloc(heap(), 0, ptr as *const c_void, new_size) as *mut u8;
        }
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new = self.alloc(new_layout);
        if !new.is_null() {
            ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        new
    }
}
