//! Groups execution ids into fixed-size chunks.

/// A group of execution ids processed as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based dispatch order.
    pub sequence: usize,
    pub ids: Vec<String>,
    /// Starts at 1; incremented each time a worker re-queues the chunk.
    pub attempt: u32,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The same ids, queued for another attempt.
    pub fn retry(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self
        }
    }
}

/// Accumulates ids and emits a [`Chunk`] every `max_batch_size` of them.
#[derive(Debug)]
pub struct Batcher {
    max_batch_size: usize,
    pending: Vec<String>,
    emitted: usize,
}

impl Batcher {
    pub fn new(max_batch_size: usize) -> Self {
        let max_batch_size = max_batch_size.max(1);
        Self {
            max_batch_size,
            pending: Vec::with_capacity(max_batch_size),
            emitted: 0,
        }
    }

    /// Add one id; returns a full chunk once `max_batch_size` ids are pending.
    pub fn push(&mut self, id: String) -> Option<Chunk> {
        self.pending.push(id);
        if self.pending.len() >= self.max_batch_size {
            Some(self.emit())
        } else {
            None
        }
    }

    /// Flush the trailing partial chunk, if any ids are pending.
    pub fn finish(&mut self) -> Option<Chunk> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.emit())
        }
    }

    /// Number of chunks emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    fn emit(&mut self) -> Chunk {
        self.emitted += 1;
        let ids = std::mem::replace(&mut self.pending, Vec::with_capacity(self.max_batch_size));
        Chunk {
            sequence: self.emitted,
            ids,
            attempt: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_all(n: usize, max: usize) -> Vec<Chunk> {
        let mut batcher = Batcher::new(max);
        let mut chunks: Vec<Chunk> = (0..n)
            .filter_map(|i| batcher.push(format!("id-{i}")))
            .collect();
        chunks.extend(batcher.finish());
        chunks
    }

    #[test]
    fn test_chunk_count_is_ceiling() {
        for n in [0, 1, 49, 50, 51, 99, 100, 101, 250, 1234] {
            let chunks = chunk_all(n, 50);
            assert_eq!(chunks.len(), n.div_ceil(50), "n = {n}");
        }
    }

    #[test]
    fn test_every_id_in_exactly_one_chunk() {
        let chunks = chunk_all(137, 50);
        let ids: Vec<String> = chunks.iter().flat_map(|c| c.ids.clone()).collect();
        let expected: Vec<String> = (0..137).map(|i| format!("id-{i}")).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_only_last_chunk_may_be_short() {
        let chunks = chunk_all(137, 50);
        let sizes: Vec<usize> = chunks.iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![50, 50, 37]);
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn test_partial_only() {
        let chunks = chunk_all(7, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 7);
    }

    #[test]
    fn test_no_ids_no_chunks() {
        let mut batcher = Batcher::new(50);
        assert!(batcher.finish().is_none());
        assert_eq!(batcher.emitted(), 0);
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_chunk() {
        let mut batcher = Batcher::new(2);
        assert!(batcher.push("a".into()).is_none());
        assert!(batcher.push("b".into()).is_some());
        assert!(batcher.finish().is_none());
    }

    #[test]
    fn test_sequence_and_attempt() {
        let chunks = chunk_all(120, 50);
        let sequences: Vec<usize> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(chunks.iter().all(|c| c.attempt == 1));

        let retried = chunks[0].clone().retry();
        assert_eq!(retried.attempt, 2);
        assert_eq!(retried.sequence, 1);
        assert_eq!(retried.ids, chunks[0].ids);
    }
}
