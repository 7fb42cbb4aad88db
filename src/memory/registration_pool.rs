//! Per-connection pool of fast-registration descriptors.
//!
//! Descriptors are allocated once at connection setup and recycled for the
//! connection's lifetime. A [`RegistrationLease`] gives one command exclusive
//! use of a descriptor and hands it back on drop, which makes release safe on
//! both the submit path (early failure) and the completion path.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::drivers::rdma::verbs::{MrHandle, MrKind, VerbsDevice};
use crate::error::{IserError, IserResult};

/// Memory-region handles plus the validity bits that say which of them still
/// hold a live registration and must be invalidated before reuse.
#[derive(Debug)]
pub struct RegistrationDescriptor {
    pub data_mr: MrHandle,
    pub prot_mr: Option<MrHandle>,
    pub sig_mr: Option<MrHandle>,
    pub data_valid: bool,
    pub prot_valid: bool,
    pub sig_valid: bool,
    /// Last registration went through the signature region; check its status on completion.
    pub sig_protected: bool,
}

impl RegistrationDescriptor {
    fn handles(&self) -> impl Iterator<Item = &MrHandle> {
        std::iter::once(&self.data_mr)
            .chain(self.prot_mr.iter())
            .chain(self.sig_mr.iter())
    }

    pub fn supports_signature(&self) -> bool {
        self.sig_mr.is_some()
    }
}

/// Pool occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
}

pub struct RegistrationPool {
    device: Arc<dyn VerbsDevice>,
    free: Mutex<VecDeque<RegistrationDescriptor>>,
    capacity: usize,
    in_use: AtomicUsize,
    destroyed: AtomicBool,
}

impl RegistrationPool {
    /// Allocate `size` descriptors of `max_pages` pages each. With `pi_support`
    /// every descriptor also gets protection and signature regions.
    pub fn new(
        device: Arc<dyn VerbsDevice>,
        size: usize,
        max_pages: usize,
        pi_support: bool,
    ) -> IserResult<Arc<Self>> {
        let mut free = VecDeque::with_capacity(size);
        for _ in 0..size {
            match Self::alloc_descriptor(device.as_ref(), max_pages, pi_support) {
                Ok(desc) => free.push_back(desc),
                Err(e) => {
                    warn!("registration pool allocation failed after {} descriptors: {}", free.len(), e);
                    for desc in free.drain(..) {
                        Self::free_descriptor(device.as_ref(), &desc);
                    }
                    return Err(e);
                }
            }
        }
        debug!(size, max_pages, pi_support, "registration pool created");
        Ok(Arc::new(Self {
            device,
            free: Mutex::new(free),
            capacity: size,
            in_use: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        }))
    }

    fn alloc_descriptor(
        device: &dyn VerbsDevice,
        max_pages: usize,
        pi_support: bool,
    ) -> IserResult<RegistrationDescriptor> {
        let data_mr = device.alloc_mr(MrKind::Data, max_pages)?;
        let (prot_mr, sig_mr) = if pi_support {
            let prot = match device.alloc_mr(MrKind::Protection, max_pages) {
                Ok(mr) => mr,
                Err(e) => {
                    let _ = device.dealloc_mr(&data_mr);
                    return Err(e);
                }
            };
            let sig = match device.alloc_mr(MrKind::Signature, 2) {
                Ok(mr) => mr,
                Err(e) => {
                    let _ = device.dealloc_mr(&prot);
                    let _ = device.dealloc_mr(&data_mr);
                    return Err(e);
                }
            };
            (Some(prot), Some(sig))
        } else {
            (None, None)
        };
        Ok(RegistrationDescriptor {
            data_mr,
            prot_mr,
            sig_mr,
            data_valid: false,
            prot_valid: false,
            sig_valid: false,
            sig_protected: false,
        })
    }

    fn free_descriptor(device: &dyn VerbsDevice, desc: &RegistrationDescriptor) {
        for mr in desc.handles() {
            if let Err(e) = device.dealloc_mr(mr) {
                warn!("failed to release mr {}: {}", mr.id, e);
            }
        }
    }

    /// Take a descriptor without blocking.
    pub fn acquire(self: &Arc<Self>) -> IserResult<RegistrationLease> {
        let desc = {
            let mut free = self.free.lock();
            let desc = free
                .pop_front()
                .ok_or(IserError::ResourceExhausted("registration descriptors"))?;
            self.in_use.fetch_add(1, Ordering::Relaxed);
            desc
        };
        Ok(RegistrationLease {
            desc: Some(desc),
            pool: Arc::clone(self),
        })
    }

    /// Return a descriptor. Once the pool is destroyed the regions are freed instead.
    pub fn release(&self, desc: RegistrationDescriptor) {
        let mut free = self.free.lock();
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        // Checked under the free-list lock so a racing destroy cannot miss it.
        if self.destroyed.load(Ordering::Acquire) {
            drop(free);
            Self::free_descriptor(self.device.as_ref(), &desc);
            return;
        }
        free.push_back(desc);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.free.lock();
        PoolStats {
            capacity: self.capacity,
            available: free.len(),
            in_use: self.in_use.load(Ordering::Relaxed),
        }
    }

    /// Free every idle descriptor. Returns the number freed, or `None` if
    /// the pool was already destroyed.
    pub fn destroy(&self) -> Option<usize> {
        let drained: Vec<_> = {
            let mut free = self.free.lock();
            if self.destroyed.swap(true, Ordering::AcqRel) {
                return None;
            }
            free.drain(..).collect()
        };
        for desc in &drained {
            Self::free_descriptor(self.device.as_ref(), desc);
        }
        let outstanding = self.in_use.load(Ordering::Relaxed);
        if outstanding != 0 {
            warn!(outstanding, "registration pool destroyed with descriptors checked out");
        }
        Some(drained.len())
    }
}

/// Exclusive use of one descriptor. Returned to the pool on drop.
pub struct RegistrationLease {
    desc: Option<RegistrationDescriptor>,
    pool: Arc<RegistrationPool>,
}

impl Deref for RegistrationLease {
    type Target = RegistrationDescriptor;

    fn deref(&self) -> &RegistrationDescriptor {
        // Only `drop` takes the descriptor out.
        self.desc.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for RegistrationLease {
    fn deref_mut(&mut self) -> &mut RegistrationDescriptor {
        self.desc.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for RegistrationLease {
    fn drop(&mut self) {
        if let Some(desc) = self.desc.take() {
            self.pool.release(desc);
        }
    }
}

impl std::fmt::Debug for RegistrationLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationLease")
            .field("desc", &self.desc)
            .finish()
    }
}
