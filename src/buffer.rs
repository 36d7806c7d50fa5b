// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference-counted backing memory drawn from a bounded group.
//!
//! A [`BufferGroup`] hands out at most `limit` live [`Buffer`]s at a time.
//! Dropping the last reference to a buffer returns its storage to the group
//! for reuse and fires the group's notify hook, which the scheduler uses to
//! wake a stage that blocked on buffer exhaustion.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

type NotifyFn = Arc<dyn Fn() + Send + Sync>;

struct GroupInner {
    free: Vec<Vec<u8>>,
    live: usize,
}

struct GroupShared {
    limit: usize,
    inner: Mutex<GroupInner>,
    notify: Mutex<Option<NotifyFn>>,
}

impl GroupShared {
    fn recycle(&self, storage: Vec<u8>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.free.push(storage);
            inner.live -= 1;
        }
        if let Some(notify) = self.notify.lock().unwrap().clone() {
            notify();
        }
    }
}

/// A bounded pool of byte buffers.
pub struct BufferGroup {
    shared: Arc<GroupShared>,
}

impl BufferGroup {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            shared: Arc::new(GroupShared {
                limit,
                inner: Mutex::new(GroupInner { free: Vec::new(), live: 0 }),
                notify: Mutex::new(None),
            }),
        }
    }

    /// Registers the hook invoked whenever a buffer returns to the group.
    pub fn set_notify(&self, notify: NotifyFn) {
        *self.shared.notify.lock().unwrap() = Some(notify);
    }

    /// Takes a buffer of at least `size` bytes, reusing returned storage when
    /// possible. Returns `None` when all `limit` buffers are live.
    pub fn alloc(&self, size: usize) -> Option<Buffer> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.live >= self.shared.limit {
            return None;
        }

        let mut storage = inner.free.pop().unwrap_or_default();
        storage.clear();
        storage.resize(size, 0);
        inner.live += 1;

        Some(Buffer {
            core: Arc::new(BufferCore {
                storage: Mutex::new(Some(storage)),
                group: Arc::downgrade(&self.shared),
            }),
        })
    }

    /// Number of buffers that can still be allocated.
    pub fn unused(&self) -> usize {
        let inner = self.shared.inner.lock().unwrap();
        self.shared.limit - inner.live
    }

    /// Drops all recycled storage. Live buffers are unaffected and will
    /// still be accounted against the group until their last user drops them.
    pub fn clear(&self) {
        self.shared.inner.lock().unwrap().free.clear();
    }
}

struct BufferCore {
    storage: Mutex<Option<Vec<u8>>>,
    group: Weak<GroupShared>,
}

impl Drop for BufferCore {
    fn drop(&mut self) {
        let storage = self.storage.lock().unwrap().take();
        if let (Some(storage), Some(group)) = (storage, self.group.upgrade()) {
            group.recycle(storage);
        }
    }
}

/// A shared handle to one group buffer. Clones refer to the same storage.
#[derive(Clone)]
pub struct Buffer {
    core: Arc<BufferCore>,
}

impl Buffer {
    pub fn size(&self) -> usize {
        self.core.storage.lock().unwrap().as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Copies `src` into the start of the buffer.
    pub fn fill(&self, src: &[u8]) {
        let mut guard = self.core.storage.lock().unwrap();
        let storage = guard.as_mut().unwrap();
        let len = src.len().min(storage.len());
        storage[..len].copy_from_slice(&src[..len]);
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.core.storage.lock().unwrap();
        f(guard.as_deref().unwrap_or(&[]))
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.core.storage.lock().unwrap();
        f(guard.as_deref_mut().unwrap_or(&mut []))
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("size", &self.size()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[test]
    fn group_enforces_limit() {
        let group = BufferGroup::with_limit(2);
        let a = group.alloc(16).unwrap();
        let _b = group.alloc(16).unwrap();
        assert_eq!(group.unused(), 0);
        assert!(group.alloc(16).is_none());

        drop(a);
        assert_eq!(group.unused(), 1);
        assert!(group.alloc(32).is_some());
    }

    #[test]
    fn clones_share_storage() {
        let group = BufferGroup::with_limit(1);
        let a = group.alloc(8).unwrap();
        let b = a.clone();
        a.fill(&[1, 2, 3]);
        b.with_data(|data| assert_eq!(&data[..3], &[1, 2, 3]));

        // Both handles count as one live buffer.
        drop(a);
        assert_eq!(group.unused(), 0);
        drop(b);
        assert_eq!(group.unused(), 1);
    }

    #[test]
    fn notify_fires_on_return() {
        let group = BufferGroup::with_limit(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let probe = Arc::clone(&fired);
        group.set_notify(Arc::new(move || {
            probe.fetch_add(1, Ordering::SeqCst);
        }));

        let buf = group.alloc(8).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(buf);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
