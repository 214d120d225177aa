//! Product quantization sized to the serving RAM budget.
//!
//! # The Problem: Memory at Serving Time
//!
//! ```text
//! 1B vectors × 128 dims × 4 bytes = 512 GB
//! 1B vectors × 32 PQ bytes       =  32 GB
//! ```
//!
//! A disk-resident index keeps only compressed codes in RAM; full vectors
//! (or a second, finer PQ) live in the sectors and are read during traversal.
//!
//! # How It Works
//!
//! 1. Center the training sample on its mean.
//! 2. Split dimensions into `num_chunks` contiguous groups. When `dim` is not
//!    a multiple of `num_chunks`, the first `dim % num_chunks` chunks take
//!    one extra dimension.
//! 3. Train 256 centroids per chunk with k-means, keeping the best of
//!    `NUM_KMEANS_REPS` restarts.
//! 4. Encode every vector as one byte per chunk.
//!
//! ```text
//! x - μ = [ 0.2 -0.7 | 0.1 0.9 | ... ]
//!            chunk 0    chunk 1
//!              ↓          ↓
//! code  = [   17     ,   203   , ... ]
//! ```
//!
//! The chunk count is not fixed: [`calculate_num_pq_chunks`] derives it from
//! the serving budget so that `n_points × num_chunks` bytes fit.

mod pq;

pub use pq::{
    calculate_num_pq_chunks, chunk_offsets, generate_pq, generate_pq_data_from_pivots,
    sample_training_set, PqCodebook, PQ_PIVOTS_MAGIC,
};
