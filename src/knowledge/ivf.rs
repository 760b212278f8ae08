//! In-process inverted-file (IVF) index over chunk embeddings.
//!
//! Vectors are L2-normalized on insert and assigned to the nearest of
//! up to `nlist` centroid lists; a query probes the `nprobe` nearest
//! lists and scores candidates by dot product (= cosine similarity for
//! unit vectors). Small indexes are scanned exhaustively, so results
//! stay exact until the store is large enough for the partitioning to
//! pay off. Sized for up to ~1M vectors with the default 100 lists.

use crate::types::ChunkId;

const DEFAULT_NLIST: usize = 100;
const DEFAULT_NPROBE: usize = 8;

struct IndexEntry {
    id: ChunkId,
    vector: Vec<f32>,
}

pub struct IvfIndex {
    dim: usize,
    nlist: usize,
    nprobe: usize,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<IndexEntry>>,
    len: usize,
}

impl IvfIndex {
    pub fn new(dim: usize) -> Self {
        Self::with_partitions(dim, DEFAULT_NLIST, DEFAULT_NPROBE)
    }

    pub fn with_partitions(dim: usize, nlist: usize, nprobe: usize) -> Self {
        Self {
            dim,
            nlist: nlist.max(1),
            nprobe: nprobe.clamp(1, nlist.max(1)),
            centroids: Vec::new(),
            lists: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Insert a vector. The first `nlist` distinct vectors seed the
    /// centroids; later inserts join the nearest list.
    pub fn insert(&mut self, id: ChunkId, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dim);
        let vector = normalize(vector);

        let list_index = if self.centroids.len() < self.nlist {
            self.centroids.push(vector.clone());
            self.lists.push(Vec::new());
            self.centroids.len() - 1
        } else {
            self.nearest_centroids(&vector, 1)[0]
        };

        self.lists[list_index].push(IndexEntry { id, vector });
        self.len += 1;
    }

    /// Top `limit` entries by cosine similarity, descending. Ids are
    /// unique; the caller applies metadata filters and re-fetches rows.
    pub fn search(&self, query: &[f32], limit: usize) -> Vec<(ChunkId, f32)> {
        if self.is_empty() || query.len() != self.dim {
            return Vec::new();
        }
        let query = normalize(query);

        // Exhaustive scan while the index is small keeps results exact.
        let probe_all = self.len <= self.nlist * 8;
        let probed: Vec<usize> = if probe_all {
            (0..self.lists.len()).collect()
        } else {
            self.nearest_centroids(&query, self.nprobe)
        };

        let mut scored: Vec<(ChunkId, f32)> = probed
            .into_iter()
            .flat_map(|li| self.lists[li].iter())
            .map(|entry| (entry.id, dot(&query, &entry.vector)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.to_string().cmp(&b.0.to_string()))
        });
        scored.truncate(limit);
        scored
    }

    fn nearest_centroids(&self, vector: &[f32], count: usize) -> Vec<usize> {
        let mut indexed: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, dot(vector, c)))
            .collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        indexed.truncate(count);
        indexed.into_iter().map(|(i, _)| i).collect()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn normalize(vector: &[f32]) -> Vec<f32> {
    let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        vector.iter().map(|x| x / magnitude).collect()
    } else {
        vector.to_vec()
    }
}
