//! The shared work pool of test chunks.
//!
//! Every module's method list is sliced into consecutive chunks of
//! `chunk_size` methods. A chunk never spans two modules, so the last chunk
//! of a module may be smaller. All device sessions pop from the same pool;
//! each chunk is delivered exactly once and is never put back.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::module::{TestMethodRef, TestModule, TestModuleInfo};

/// A slice of one module's methods, run as a single instrumentation call.
#[derive(Debug, Clone)]
pub struct TestChunk {
    /// Position of the chunk in the pool, unique per run.
    pub index: usize,

    /// The module the methods belong to.
    pub module: Arc<TestModuleInfo>,

    /// Methods in instrumentation order.
    pub methods: Vec<TestMethodRef>,

    /// Retries performed so far. Only the retry controller holding the
    /// chunk changes it.
    pub retry_count: u32,
}

impl TestChunk {
    /// Value for `am instrument -e class`: `Class#method` pairs joined by
    /// commas.
    pub fn class_filter(&self) -> String {
        self.methods
            .iter()
            .map(TestMethodRef::test_name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Thread-safe queue of test chunks.
#[derive(Debug)]
pub struct TestPool {
    chunks: Mutex<VecDeque<TestChunk>>,
    total_chunks: usize,
    total_methods: usize,
}

impl TestPool {
    /// Slices `modules` into chunks of `chunk_size` methods.
    ///
    /// A `chunk_size` of zero is treated as one.
    pub fn new(modules: &[TestModule], chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut chunks = VecDeque::new();
        for module in modules {
            for methods in module.methods.chunks(chunk_size) {
                chunks.push_back(TestChunk {
                    index: chunks.len(),
                    module: Arc::clone(&module.info),
                    methods: methods.to_vec(),
                    retry_count: 0,
                });
            }
        }
        let total_methods = chunks.iter().map(|c| c.methods.len()).sum();
        Self {
            total_chunks: chunks.len(),
            total_methods,
            chunks: Mutex::new(chunks),
        }
    }

    /// Pops the next chunk, or `None` once the pool is drained.
    pub fn next_chunk(&self) -> Option<TestChunk> {
        self.lock().pop_front()
    }

    /// Takes every chunk that was never popped.
    pub fn drain(&self) -> Vec<TestChunk> {
        self.lock().drain(..).collect()
    }

    /// Number of chunks not yet popped.
    pub fn remaining(&self) -> usize {
        self.lock().len()
    }

    /// Number of chunks the pool was built with.
    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// Number of test methods across all chunks.
    pub fn total_methods(&self) -> usize {
        self.total_methods
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TestChunk>> {
        // A panicking holder cannot leave the deque half-updated.
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
