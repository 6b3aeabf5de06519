use std::collections::VecDeque;

/// 默认重放缓冲容量。
pub const DEFAULT_SEND_BUFFER_CAPACITY: usize = 64 * 1024;

/// 追加时缓冲区已满。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferFull;

/// 应用已写出字节的重放缓冲。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 传输断开时，已经写入 socket 的字节未必到达对端；换挂后需要从对端确认的偏移
///   逐字节重放，因此写出的字节必须保留一段时间。
///
/// ## 逻辑 (How)
/// - 以流内绝对偏移描述窗口：`start` 为最早保留字节的偏移，`end = start + len`；
/// - `flushed` 之前的字节已写入某条传输，可以在空间不足时淘汰；
///   `flushed` 之后的字节从未离开进程，绝不淘汰。
///
/// ## 契约 (What)
/// - `append`：空间不足且无法淘汰足够的已写出字节时返回 [`BufferFull`]，缓冲区不变；
/// - `replay_from(offset)`：`offset` 位于 `[start, end]` 时返回其后的全部字节。
#[derive(Debug)]
pub struct SendBuffer {
    data: VecDeque<u8>,
    start: u64,
    flushed: u64,
    capacity: usize,
}

impl SendBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            start: 0,
            flushed: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 最早保留字节的流内偏移。
    pub fn start(&self) -> u64 {
        self.start
    }

    /// 已接收字节总数，即下一字节的流内偏移。
    pub fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    /// 已写入传输的偏移上界。
    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    /// 尚未写入任何传输的字节数。
    pub fn unflushed(&self) -> usize {
        (self.end() - self.flushed) as usize
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn append(&mut self, chunk: &[u8]) -> Result<(), BufferFull> {
        let total = self.data.len() + chunk.len();
        if total > self.capacity {
            let evict = total - self.capacity;
            let evictable = (self.flushed - self.start) as usize;
            if evict > evictable {
                return Err(BufferFull);
            }
            self.data.drain(..evict);
            self.start += evict as u64;
        }
        self.data.extend(chunk);
        Ok(())
    }

    pub fn mark_flushed(&mut self, offset: u64) {
        self.flushed = self.flushed.max(offset.min(self.end()));
    }

    pub fn mark_all_flushed(&mut self) {
        self.flushed = self.end();
    }

    pub fn replay_from(&self, offset: u64) -> Option<Vec<u8>> {
        if offset < self.start || offset > self.end() {
            return None;
        }
        let skip = (offset - self.start) as usize;
        Some(self.data.range(skip..).copied().collect())
    }

    /// 丢弃全部内容，偏移保持不变。
    pub fn clear(&mut self) {
        self.start = self.end();
        self.flushed = self.start;
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unflushed_bytes_are_never_evicted() {
        let mut buffer = SendBuffer::new(8);
        buffer.append(b"abcdef").expect("fits");
        assert_eq!(buffer.append(b"ghi"), Err(BufferFull));
        assert_eq!(buffer.len(), 6, "failed append leaves buffer untouched");

        buffer.mark_flushed(4);
        buffer.append(b"ghi").expect("evicts one flushed byte");
        assert_eq!(buffer.start(), 1);
        assert_eq!(buffer.end(), 9);
        assert_eq!(buffer.unflushed(), 5);
    }

    #[test]
    fn replay_window_is_inclusive_of_end() {
        let mut buffer = SendBuffer::new(4);
        buffer.append(b"wxyz").expect("fits");
        buffer.mark_all_flushed();
        buffer.append(b"12").expect("evicts");

        assert_eq!(buffer.replay_from(2).as_deref(), Some(&b"yz12"[..]));
        assert_eq!(buffer.replay_from(6).as_deref(), Some(&b""[..]));
        assert!(buffer.replay_from(1).is_none(), "evicted offset");
        assert!(buffer.replay_from(7).is_none(), "beyond end");
    }

    #[test]
    fn mark_flushed_is_monotonic_and_clamped() {
        let mut buffer = SendBuffer::new(16);
        buffer.append(b"abc").expect("fits");
        buffer.mark_flushed(10);
        assert_eq!(buffer.flushed(), 3);
        buffer.mark_flushed(1);
        assert_eq!(buffer.flushed(), 3);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.start(), 3);
        assert_eq!(buffer.replay_from(3).as_deref(), Some(&b""[..]));
    }
}
