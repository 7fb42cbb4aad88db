//! Per-command view of a DMA-mapped scatter list.

use crate::error::{IserError, IserResult};

/// One DMA-mapped segment of a host buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterEntry {
    pub dma_addr: u64,
    pub length: u32,
}

impl ScatterEntry {
    pub fn new(dma_addr: u64, length: u32) -> Self {
        Self { dma_addr, length }
    }

    #[inline]
    fn end(&self) -> u64 {
        self.dma_addr + self.length as u64
    }
}

/// Direction of the local DMA mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Local memory is the source. Used by RDMA writes to the initiator.
    ToDevice,
    /// Local memory is the destination. Used by RDMA reads from the initiator.
    FromDevice,
}

/// The slice `[offset, offset + len)` of a command's scatter list.
///
/// `entries` holds the covered segments trimmed to the slice, with physically
/// adjacent segments merged. `nents` counts the source entries touched and
/// `sg_offset` is where the slice starts inside the first of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBuf {
    entries: Vec<ScatterEntry>,
    nents: usize,
    sg_offset: u32,
    offset: u64,
    len: u64,
    dir: DmaDirection,
}

impl DataBuf {
    /// An empty buffer. Commands carrying one complete without touching the wire.
    pub fn empty(dir: DmaDirection) -> Self {
        Self {
            entries: Vec::new(),
            nents: 0,
            sg_offset: 0,
            offset: 0,
            len: 0,
            dir,
        }
    }

    /// Map `len` bytes starting `offset` bytes into `list`.
    pub fn map(list: &[ScatterEntry], offset: u64, len: u64, dir: DmaDirection) -> IserResult<Self> {
        if len == 0 {
            let mut buf = Self::empty(dir);
            buf.offset = offset;
            return Ok(buf);
        }

        let mut skip = offset;
        let mut first = None;
        for (i, entry) in list.iter().enumerate() {
            if skip < entry.length as u64 {
                first = Some(i);
                break;
            }
            skip -= entry.length as u64;
        }
        let first = first.ok_or_else(|| {
            IserError::InvalidInput(format!("offset {} beyond scatter list", offset))
        })?;
        let sg_offset = skip as u32;

        let mut entries: Vec<ScatterEntry> = Vec::new();
        let mut nents = 0;
        let mut remaining = len;
        for (i, entry) in list[first..].iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let start = if i == 0 { sg_offset } else { 0 };
            let take = remaining.min((entry.length - start) as u64) as u32;
            if take == 0 {
                continue;
            }
            let seg = ScatterEntry::new(entry.dma_addr + start as u64, take);
            nents += 1;
            remaining -= take as u64;

            match entries.last_mut() {
                Some(last) if last.end() == seg.dma_addr && last.length.checked_add(take).is_some() => {
                    last.length += take;
                }
                _ => entries.push(seg),
            }
        }
        if remaining != 0 {
            return Err(IserError::InvalidInput(format!(
                "scatter list short by {} bytes for {}+{}",
                remaining, offset, len
            )));
        }

        Ok(Self {
            entries,
            nents,
            sg_offset,
            offset,
            len,
            dir,
        })
    }

    /// DMA segments after trimming and coalescing.
    pub fn entries(&self) -> &[ScatterEntry] {
        &self.entries
    }

    pub fn nents(&self) -> usize {
        self.nents
    }

    pub fn dma_nents(&self) -> usize {
        self.entries.len()
    }

    /// Offset of the slice within the first covered entry.
    pub fn sg_offset(&self) -> u32 {
        self.sg_offset
    }

    /// Offset of the slice within the whole command buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn direction(&self) -> DmaDirection {
        self.dir
    }

    /// First DMA address of the slice, or 0 when empty.
    pub fn base_addr(&self) -> u64 {
        self.entries.first().map_or(0, |e| e.dma_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(n: usize, stride: u64) -> Vec<ScatterEntry> {
        (0..n)
            .map(|i| ScatterEntry::new(0x10_0000 + i as u64 * stride, 4096))
            .collect()
    }

    #[test]
    fn test_map_whole_list() {
        let list = pages(4, 8192);
        let buf = DataBuf::map(&list, 0, 4 * 4096, DmaDirection::ToDevice).unwrap();
        assert_eq!(buf.nents(), 4);
        assert_eq!(buf.dma_nents(), 4);
        assert_eq!(buf.sg_offset(), 0);
        assert_eq!(buf.len(), 16384);
    }

    #[test]
    fn test_map_offset_and_trim() {
        let list = pages(4, 8192);
        let buf = DataBuf::map(&list, 5000, 6000, DmaDirection::FromDevice).unwrap();
        assert_eq!(buf.nents(), 2);
        assert_eq!(buf.sg_offset(), 904);
        assert_eq!(buf.entries()[0], ScatterEntry::new(0x10_0000 + 8192 + 904, 3192));
        assert_eq!(buf.entries()[1], ScatterEntry::new(0x10_0000 + 16384, 2808));
        let total: u64 = buf.entries().iter().map(|e| e.length as u64).sum();
        assert_eq!(total, 6000);
        assert_eq!(buf.offset(), 5000);
    }

    #[test]
    fn test_map_coalesces_adjacent() {
        let list = pages(8, 4096);
        let buf = DataBuf::map(&list, 0, 8 * 4096, DmaDirection::ToDevice).unwrap();
        assert_eq!(buf.nents(), 8);
        assert_eq!(buf.dma_nents(), 1);
        assert_eq!(buf.entries()[0].length, 32768);
    }

    #[test]
    fn test_map_zero_length() {
        let buf = DataBuf::map(&[], 0, 0, DmaDirection::ToDevice).unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.dma_nents(), 0);
        assert_eq!(buf.base_addr(), 0);
    }

    #[test]
    fn test_map_skips_empty_entries() {
        let list = vec![
            ScatterEntry::new(0x1000, 4096),
            ScatterEntry::new(0x9000, 0),
            ScatterEntry::new(0x20_0000, 4096),
            ScatterEntry::new(0x30_0000, 0),
            ScatterEntry::new(0x40_0000, 512),
        ];
        let buf = DataBuf::map(&list, 0, 8192 + 512, DmaDirection::ToDevice).unwrap();
        assert_eq!(buf.nents(), 3);
        assert_eq!(buf.dma_nents(), 3);
        assert!(buf.entries().iter().all(|e| e.length > 0));
        assert_eq!(buf.entries()[2], ScatterEntry::new(0x40_0000, 512));
    }

    #[test]
    fn test_map_short_list() {
        let list = pages(2, 8192);
        assert!(matches!(
            DataBuf::map(&list, 0, 3 * 4096, DmaDirection::ToDevice),
            Err(IserError::InvalidInput(_))
        ));
        assert!(matches!(
            DataBuf::map(&list, 9000, 1, DmaDirection::ToDevice),
            Err(IserError::InvalidInput(_))
        ));
    }
}
