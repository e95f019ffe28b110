use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-sender FIFO of decoded PCM byte chunks.
///
/// The voice ingress callback appends whatever chunk sizes the client layer
/// delivers; the mix tick drains fixed-size frames. The last-write stamp is
/// an atomic so the staleness check on the tick never has to touch the queue
/// itself.
#[derive(Debug)]
pub struct PcmQueue {
    chunks: VecDeque<Vec<u8>>,
    /// Read offset into the front chunk.
    front_pos: usize,
    buffered: usize,
    last_write_ms: AtomicU64,
}

impl PcmQueue {
    pub fn new(now_ms: u64) -> Self {
        Self {
            chunks: VecDeque::new(),
            front_pos: 0,
            buffered: 0,
            last_write_ms: AtomicU64::new(now_ms),
        }
    }

    /// Enqueue a copy of `pcm` and stamp the write time.
    pub fn write(&mut self, pcm: &[u8], now_ms: u64) {
        if !pcm.is_empty() {
            self.buffered += pcm.len();
            self.chunks.push_back(pcm.to_vec());
        }
        self.last_write_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Milliseconds (on the recorder's monotonic epoch) of the last write.
    pub fn last_write(&self) -> u64 {
        self.last_write_ms.load(Ordering::Relaxed)
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    /// Dequeue exactly `dst.len()` bytes, concatenating across chunks and
    /// zero-padding any shortfall. Returns whether any real bytes were copied.
    pub fn read_frame(&mut self, dst: &mut [u8]) -> bool {
        let mut copied = 0usize;
        while copied < dst.len() {
            let Some(front) = self.chunks.front() else {
                break;
            };
            let avail = front.len() - self.front_pos;
            let take = avail.min(dst.len() - copied);
            dst[copied..copied + take]
                .copy_from_slice(&front[self.front_pos..self.front_pos + take]);
            copied += take;
            self.front_pos += take;
            if self.front_pos == front.len() {
                self.chunks.pop_front();
                self.front_pos = 0;
            }
        }
        self.buffered -= copied;
        if copied < dst.len() {
            dst[copied..].fill(0);
        }
        copied > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_concatenates_across_chunks() {
        let mut q = PcmQueue::new(0);
        q.write(&[1, 2, 3], 1);
        q.write(&[4, 5, 6, 7], 2);
        let mut frame = [0u8; 5];
        assert!(q.read_frame(&mut frame));
        assert_eq!(frame, [1, 2, 3, 4, 5]);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn short_read_zero_pads_remainder() {
        let mut q = PcmQueue::new(0);
        q.write(&[9, 9], 1);
        let mut frame = [0xffu8; 6];
        assert!(q.read_frame(&mut frame));
        assert_eq!(frame, [9, 9, 0, 0, 0, 0]);
        assert!(q.is_empty());
    }

    #[test]
    fn empty_read_reports_no_data() {
        let mut q = PcmQueue::new(0);
        let mut frame = [0xffu8; 4];
        assert!(!q.read_frame(&mut frame));
        assert_eq!(frame, [0, 0, 0, 0]);
    }

    #[test]
    fn last_write_tracks_most_recent_stamp() {
        let mut q = PcmQueue::new(10);
        assert_eq!(q.last_write(), 10);
        q.write(&[0], 25);
        assert_eq!(q.last_write(), 25);
        // An empty write still counts as activity.
        q.write(&[], 40);
        assert_eq!(q.last_write(), 40);
    }

    #[test]
    fn draining_partial_chunks_keeps_fifo_order() {
        let mut q = PcmQueue::new(0);
        q.write(&[1, 2, 3, 4], 1);
        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        q.read_frame(&mut a);
        q.read_frame(&mut b);
        assert_eq!(a, [1, 2]);
        assert_eq!(b, [3, 4]);
    }
}
