use std::collections::VecDeque;

/// Returned by [`PeerFifo::push`] when the queue is at capacity. The
/// engines treat this as a protocol violation: their own request
/// bookkeeping should have kept them off a full FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

/// The contract every peer FIFO honors towards the DMA engines. The
/// engines never reach past it into peer internals.
pub trait PeerFifo {
    type Word: Copy;

    fn push(&mut self, word: Self::Word) -> Result<(), Full>;
    fn pop(&mut self) -> Option<Self::Word>;
    fn occupancy(&self) -> usize;
}

/// GIF FIFO depth; the request drops only once the queue is full.
pub const GIF_FIFO_DEPTH: usize = 16;
pub const VIF_FIFO_DEPTH: usize = 16;
pub const IPU_FIFO_DEPTH: usize = 8;
/// SIF bridge FIFOs signal "not ready" above 60 of 64 entries, which
/// leaves exactly one quadword (four words) of headroom for a granted
/// request.
pub const SIF_FIFO_DEPTH: usize = 64;
pub const SIF_FIFO_WATERMARK: usize = 60;
pub const SIO2_FIFO_DEPTH: usize = 64;

/// Fixed-capacity queue with a high watermark. `high_watermark` is the
/// largest occupancy at which the owning channel's request stays set;
/// crossing above it clears the request.
pub struct Fifo<W> {
    queue: VecDeque<W>,
    capacity: usize,
    high_watermark: usize,
}

impl<W: Copy> Fifo<W> {
    pub fn new(capacity: usize, high_watermark: usize) -> Self {
        debug_assert!(high_watermark < capacity);
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            high_watermark,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() == self.capacity
    }

    /// Request-side view of the watermark: true while a producer channel
    /// may keep pushing.
    pub fn request_ready(&self) -> bool {
        self.queue.len() <= self.high_watermark
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl<W: Copy> PeerFifo for Fifo<W> {
    type Word = W;

    fn push(&mut self, word: W) -> Result<(), Full> {
        if self.is_full() {
            return Err(Full);
        }
        self.queue.push_back(word);
        Ok(())
    }

    fn pop(&mut self) -> Option<W> {
        self.queue.pop_front()
    }

    fn occupancy(&self) -> usize {
        self.queue.len()
    }
}

/// Quadword-wide FIFO used by the primary engine's peers.
pub type QwFifo = Fifo<u128>;
/// Word-wide FIFO used by the bridge and the secondary engine's peers.
pub type WordFifo = Fifo<u32>;

impl QwFifo {
    pub fn gif() -> Self {
        Self::new(GIF_FIFO_DEPTH, GIF_FIFO_DEPTH - 1)
    }

    pub fn vif() -> Self {
        Self::new(VIF_FIFO_DEPTH, VIF_FIFO_DEPTH - 1)
    }

    pub fn ipu() -> Self {
        Self::new(IPU_FIFO_DEPTH, IPU_FIFO_DEPTH - 1)
    }
}

impl WordFifo {
    pub fn sif() -> Self {
        Self::new(SIF_FIFO_DEPTH, SIF_FIFO_WATERMARK)
    }

    pub fn sio2() -> Self {
        Self::new(SIO2_FIFO_DEPTH, SIO2_FIFO_DEPTH - 1)
    }
}

/// The inter-processor bridge. Both engines drain and feed these queues,
/// so the host owns them and lends them to whichever engine is stepping.
pub struct Sif {
    pub sif0: WordFifo,
    pub sif1: WordFifo,
    pub sif2: WordFifo,
}

impl Sif {
    pub fn new() -> Self {
        Self {
            sif0: WordFifo::sif(),
            sif1: WordFifo::sif(),
            sif2: WordFifo::sif(),
        }
    }
}

impl Default for Sif {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_fails_at_capacity() {
        let mut fifo = QwFifo::gif();
        for i in 0..GIF_FIFO_DEPTH {
            fifo.push(i as u128).unwrap();
        }
        assert_eq!(fifo.push(0xFF), Err(Full));
        assert_eq!(fifo.occupancy(), GIF_FIFO_DEPTH);
    }

    #[test]
    fn gif_request_drops_only_when_full() {
        let mut fifo = QwFifo::gif();
        for i in 0..GIF_FIFO_DEPTH - 1 {
            assert!(fifo.request_ready());
            fifo.push(i as u128).unwrap();
        }
        assert!(fifo.request_ready());
        fifo.push(0).unwrap();
        assert!(!fifo.request_ready());
    }

    #[test]
    fn sif_request_drops_above_sixty() {
        let mut fifo = WordFifo::sif();
        for i in 0..SIF_FIFO_WATERMARK {
            fifo.push(i as u32).unwrap();
        }
        // At exactly 60 entries the request is still granted...
        assert!(fifo.request_ready());
        fifo.push(0).unwrap();
        // ...and cleared above it.
        assert!(!fifo.request_ready());
        fifo.pop().unwrap();
        assert!(fifo.request_ready());
        // A granted request always leaves a full quadword of headroom.
        for _ in 0..4 {
            fifo.push(0).unwrap();
        }
    }

    #[test]
    fn pop_drains_in_order() {
        let mut fifo = WordFifo::sio2();
        fifo.push(1).unwrap();
        fifo.push(2).unwrap();
        assert_eq!(fifo.pop(), Some(1));
        assert_eq!(fifo.pop(), Some(2));
        assert_eq!(fifo.pop(), None);
    }
}
