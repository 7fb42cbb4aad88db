/// Initiator memory advertised in the iSER header.
///
/// `stag` is the remote key the initiator registered its buffer under and
/// `va` the virtual address the transfer starts at. RDMA operations address
/// consecutive slices of this region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRegion {
    stag: u32,
    va: u64,
    length: u64,
}

impl RemoteRegion {
    pub fn new(stag: u32, va: u64, length: u64) -> Self {
        Self { stag, va, length }
    }

    /// Create an empty region.
    pub fn empty() -> Self {
        Self {
            stag: 0,
            va: 0,
            length: 0,
        }
    }

    pub fn stag(&self) -> u32 {
        self.stag
    }

    pub fn va(&self) -> u64 {
        self.va
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whether `len` bytes starting `offset` bytes in fit inside the region.
    pub fn covers(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .map_or(false, |end| end <= self.length)
    }

    /// Advance the region by `n` bytes, returning true on success.
    ///
    /// Returns false if `n` exceeds the current length.
    pub fn advance(&mut self, n: u64) -> bool {
        if n > self.length {
            return false;
        }
        self.va += n;
        self.length -= n;
        true
    }

    /// Slice of this region. Returns an empty region if out of range.
    pub fn subrange(&self, offset: u64, len: u64) -> RemoteRegion {
        if !self.covers(offset, len) {
            return RemoteRegion::empty();
        }
        RemoteRegion {
            stag: self.stag,
            va: self.va + offset,
            length: len,
        }
    }

    /// Take the first `len` bytes, advancing this region.
    pub fn take_first(&mut self, len: u64) -> RemoteRegion {
        let head = self.subrange(0, len);
        self.advance(len);
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_region_basic() {
        let region = RemoteRegion::new(0xdead_be01, 0x1000, 256);
        assert_eq!(region.va(), 0x1000);
        assert_eq!(region.len(), 256);
        assert_eq!(region.stag(), 0xdead_be01);
        assert!(!region.is_empty());
        assert!(RemoteRegion::empty().is_empty());
    }

    #[test]
    fn test_remote_region_covers() {
        let region = RemoteRegion::new(1, 0x1000, 256);
        assert!(region.covers(0, 256));
        assert!(region.covers(200, 56));
        assert!(!region.covers(200, 57));
        assert!(!region.covers(u64::MAX, 2));
    }

    #[test]
    fn test_remote_region_take_first() {
        let mut region = RemoteRegion::new(7, 0x1000, 256);

        let head = region.take_first(64);
        assert_eq!(head.va(), 0x1000);
        assert_eq!(head.len(), 64);
        assert_eq!(head.stag(), 7);
        assert_eq!(region.va(), 0x1040);
        assert_eq!(region.len(), 192);

        let too_long = region.take_first(500);
        assert!(too_long.is_empty());
        assert_eq!(region.len(), 192);
    }
}
