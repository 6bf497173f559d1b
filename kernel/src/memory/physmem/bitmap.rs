// Copyright 2025 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides a bitmap-managed pool of physical memory frames.

use bitmap_index::Bitmap;
use memory::constants::PAGE_SIZE;
use memory::{PhysAddr, PhysFrame};

/// A single contiguous chunk of physical memory, which is
/// tracked using a bitmap.
///
pub struct BitmapPool {
    // start_address is the address of the first
    // frame in the pool. start_address is guaranteed
    // to be frame-aligned.
    //
    start_address: PhysAddr,

    // num_frames is the number of frames in this
    // pool.
    //
    num_frames: usize,

    // free_frames is the number of frames in this
    // pool that have not been allocated. There is no
    // guarantee that the free frames are consecutive.
    //
    free_frames: usize,

    // bitmap records, for each frame in the pool,
    // whether the frame is free. For frame n (where
    // the frame starting at self.start_address is
    // frame 0), bit n is 1 if the frame is free and
    // 0 if the frame has been allocated.
    //
    bitmap: Bitmap,
}

impl BitmapPool {
    /// Returns a pool managing the `num_frames` frames starting
    /// at `start`.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the pool has sole control
    /// over the described memory, and that `start` is aligned to
    /// the frame size.
    ///
    /// # Panics
    ///
    /// `new` will panic if `start` is not frame-aligned.
    ///
    pub unsafe fn new(start: PhysAddr, num_frames: usize) -> Self {
        if !start.is_aligned(PAGE_SIZE) {
            panic!(
                "cannot build a frame pool at unaligned address {:#x}",
                start.as_usize()
            );
        }

        BitmapPool {
            start_address: start,
            num_frames,
            free_frames: num_frames,
            bitmap: Bitmap::new_set(num_frames),
        }
    }

    /// Returns the number of frames in the pool.
    ///
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    /// Returns the number of frames in the pool that are
    /// currently free.
    ///
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    // frame_at returns the physical frame at the given
    // index.
    //
    fn frame_at(&self, index: usize) -> PhysFrame {
        PhysFrame::containing_address(self.start_address + index * PAGE_SIZE)
    }

    // index_for returns the index at which the given
    // frame exists, or None.
    //
    fn index_for(&self, frame: PhysFrame) -> Option<usize> {
        let addr = frame.start_address();
        if addr < self.start_address {
            return None;
        }

        let index = (addr - self.start_address) / PAGE_SIZE;
        if index < self.num_frames {
            Some(index)
        } else {
            None
        }
    }

    /// Returns whether the pool includes the given frame.
    ///
    pub fn contains_frame(&self, frame: PhysFrame) -> bool {
        self.index_for(frame).is_some()
    }

    /// Returns the next free frame, or `None`.
    ///
    pub fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.free_frames == 0 {
            return None;
        }

        match self.bitmap.next_set() {
            None => None,
            Some(index) => {
                self.bitmap.unset(index);
                self.free_frames -= 1;
                Some(self.frame_at(index))
            }
        }
    }

    /// Returns whether the given frame is currently marked
    /// as allocated.
    ///
    /// # Panics
    ///
    /// `is_allocated` will panic if `frame` is not in the pool.
    ///
    pub fn is_allocated(&self, frame: PhysFrame) -> bool {
        match self.index_for(frame) {
            None => panic!(
                "frame at {:#x} not tracked",
                frame.start_address().as_usize()
            ),
            Some(i) => !self.bitmap.get(i),
        }
    }

    /// Marks the given frame as free for use.
    ///
    /// # Panics
    ///
    /// `deallocate_frame` will panic if `frame` is not in the
    /// pool, or if it is already free.
    ///
    pub fn deallocate_frame(&mut self, frame: PhysFrame) {
        let addr = frame.start_address();
        match self.index_for(frame) {
            None => panic!(
                "cannot deallocate frame at {:#x}: frame not tracked",
                addr.as_usize()
            ),
            Some(i) => {
                if self.bitmap.get(i) {
                    panic!(
                        "cannot deallocate frame at {:#x}: frame already free",
                        addr.as_usize()
                    );
                }

                self.bitmap.set(i);
                self.free_frames += 1;
            }
        }
    }
}
