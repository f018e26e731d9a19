//! 字节范围工具：对齐、求交与截断。缓存窗口都按 2 的幂对齐。

/// Range cache window (512 KiB).
pub const RANGE_ALIGN: u64 = 1 << 19;
/// Mapping cache window (16 MiB).
pub const MAP_ALIGN: u64 = 1 << 24;

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// The `align`-sized window containing `self.start`.
    pub fn window(&self, align: u64) -> ByteRange {
        let start = align_down(self.start, align);
        ByteRange::new(start, start + align)
    }

    pub fn intersect(&self, other: &ByteRange) -> Option<ByteRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(ByteRange { start, end })
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.intersect(other).is_some()
    }

    /// Clips the range to an object of `size` bytes.
    pub fn truncate(&self, size: u64) -> ByteRange {
        ByteRange::new(self.start.min(size), self.end.min(size))
    }
}

pub fn align_down(offset: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    offset & !(align - 1)
}

pub fn align_up(offset: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    offset.div_ceil(align) * align
}

/// 将 [start, end) 按 align 边界拆分为若干子范围，首尾可不满一个窗口。
pub fn split_aligned(range: ByteRange, align: u64) -> Vec<ByteRange> {
    let mut out = Vec::new();
    let mut cursor = range.start;
    while cursor < range.end {
        let boundary = align_down(cursor, align) + align;
        let take_end = boundary.min(range.end);
        out.push(ByteRange::new(cursor, take_end));
        cursor = take_end;
    }
    out
}
