//! Thread-local scratch memory released in bulk.
//!
//! A [`ResourceMark`] remembers the top of the current thread's resource area and
//! resets it when the [`with_mark`] scope that opened it ends, so everything
//! allocated through the mark goes away on every exit path, unwinding included.

use std::{
    cell::RefCell,
    marker::PhantomData,
    mem::{align_of, size_of},
};

use crate::globals::RESOURCE_CHUNK_WORDS;

thread_local! {
    static AREA: RefCell<ResourceArea> = RefCell::new(ResourceArea::new());
}

struct ResourceArea {
    /// The last chunk is the one being bumped.
    chunks: Vec<Box<[usize]>>,
    top: usize,
    depth: usize,
}

#[derive(Clone, Copy)]
struct Snapshot {
    chunks: usize,
    top: usize,
    depth: usize,
}

impl ResourceArea {
    const fn new() -> Self {
        Self {
            chunks: Vec::new(),
            top: 0,
            depth: 0,
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            chunks: self.chunks.len(),
            top: self.top,
            depth: self.depth,
        }
    }

    fn rollback(&mut self, snapshot: Snapshot) {
        self.chunks.truncate(snapshot.chunks);
        self.top = snapshot.top;
        self.depth = snapshot.depth;
    }

    fn allocate_words(&mut self, words: usize) -> *mut usize {
        let fits = match self.chunks.last() {
            Some(chunk) => chunk.len() - self.top >= words,
            None => false,
        };
        if !fits {
            let size = words.max(RESOURCE_CHUNK_WORDS);
            self.chunks.push(vec![0usize; size].into_boxed_slice());
            self.top = 0;
        }
        let top = self.top;
        self.top += words;
        match self.chunks.last_mut() {
            Some(chunk) => unsafe { chunk.as_mut_ptr().add(top) },
            None => unreachable!(),
        }
    }

    fn used_bytes(&self) -> usize {
        match self.chunks.split_last() {
            Some((_, full)) => {
                (full.iter().map(|chunk| chunk.len()).sum::<usize>() + self.top) * size_of::<usize>()
            }
            None => 0,
        }
    }
}

/// Scope of resource area allocations, handed out by [`with_mark`].
///
/// Marks only exist inside the closure that opened them, so they are released in the
/// reverse order they were opened and nothing allocated through them outlives the
/// scope. Neither `Send` nor `Sync`: the area belongs to the thread that opened it.
///
/// ```compile_fail
/// use comet_sizing::resource;
///
/// let escaped = resource::with_mark(|rm| rm.allocate_slice::<u64>(8));
/// ```
///
/// ```compile_fail
/// use comet_sizing::resource;
///
/// let mut kept = None;
/// resource::with_mark(|rm| kept = Some(rm));
/// ```
pub struct ResourceMark {
    snapshot: Snapshot,
    _thread_bound: PhantomData<*const ()>,
}

impl ResourceMark {
    fn open() -> Self {
        let snapshot = AREA.with(|area| {
            let mut area = area.borrow_mut();
            let snapshot = area.snapshot();
            area.depth += 1;
            snapshot
        });
        Self {
            snapshot,
            _thread_bound: PhantomData,
        }
    }

    /// Allocates `len` default-initialised values that live until this mark is released.
    ///
    /// Only the innermost open mark may allocate; otherwise releasing an inner mark
    /// would hand the memory out again.
    #[allow(clippy::mut_from_ref)]
    pub fn allocate_slice<T: Copy + Default>(&self, len: usize) -> &mut [T] {
        assert!(align_of::<T>() <= align_of::<usize>());
        let words = (len * size_of::<T>() + size_of::<usize>() - 1) / size_of::<usize>();
        let ptr = AREA.with(|area| {
            let mut area = area.borrow_mut();
            assert_eq!(
                area.depth,
                self.snapshot.depth + 1,
                "allocation through a resource mark that is not the innermost one"
            );
            area.allocate_words(words.max(1)) as *mut T
        });
        // SAFETY: the words were just bumped off a live chunk, are aligned for `T` and
        // are not handed out again before this mark rolls the area back, which cannot
        // happen while the returned borrow of `self` is alive.
        unsafe {
            for i in 0..len {
                ptr.add(i).write(T::default());
            }
            std::slice::from_raw_parts_mut(ptr, len)
        }
    }
}

impl Drop for ResourceMark {
    fn drop(&mut self) {
        AREA.with(|area| area.borrow_mut().rollback(self.snapshot));
    }
}

/// Runs `f` with a fresh resource mark. Everything allocated through the mark is
/// released when `f` returns or unwinds.
pub fn with_mark<R>(f: impl FnOnce(&ResourceMark) -> R) -> R {
    let rm = ResourceMark::open();
    f(&rm)
}

/// Bytes currently allocated in this thread's resource area.
pub fn used_bytes() -> usize {
    AREA.with(|area| area.borrow().used_bytes())
}

/// Number of resource marks currently open on this thread.
pub fn mark_depth() -> usize {
    AREA.with(|area| area.borrow().depth)
}
