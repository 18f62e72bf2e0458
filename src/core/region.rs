use memmap2::MmapMut;

use crate::core::mmap::MmapFile;

/// Raw memory that may be mapped by several processes at once.
///
/// Implementors hand out a base pointer that stays valid, and at the same
/// address, for as long as the region itself is alive.
pub trait SharedRegion {
    fn as_mut_ptr(&mut self) -> *mut u8;

    fn len(&self) -> usize;
}

impl SharedRegion for MmapFile {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.as_mut_slice().as_mut_ptr()
    }

    fn len(&self) -> usize {
        MmapFile::len(self)
    }
}

impl SharedRegion for MmapMut {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        <[u8]>::as_mut_ptr(self)
    }

    fn len(&self) -> usize {
        <[u8]>::len(self)
    }
}

impl<R: SharedRegion + ?Sized> SharedRegion for &mut R {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        (**self).as_mut_ptr()
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}
