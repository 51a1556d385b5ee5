//! Vector index contract and embedding provider seam.
//!
//! Vectors are scoped by namespace; the pipeline uses the owning project id
//! as the namespace so tenants never share an index partition.

use std::collections::HashMap;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::ServiceResult;

/// One vector with its identifier and stage-specific metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
}

/// Query result
#[derive(Debug, Clone, Serialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub metadata: serde_json::Value,
}

/// Vector index contract: upsert/query/delete within a namespace.
pub trait VectorIndex: Send + Sync {
    fn upsert<'a>(
        &'a self,
        namespace: &'a str,
        records: Vec<VectorRecord>,
    ) -> BoxFuture<'a, ServiceResult<()>>;

    fn query<'a>(
        &'a self,
        namespace: &'a str,
        vector: &'a [f32],
        top_k: usize,
    ) -> BoxFuture<'a, ServiceResult<Vec<VectorMatch>>>;

    fn delete<'a>(
        &'a self,
        namespace: &'a str,
        ids: &'a [String],
    ) -> BoxFuture<'a, ServiceResult<()>>;
}

/// Embedding provider seam; the pipeline only needs text in, vector out.
pub trait Embedder: Send + Sync {
    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, ServiceResult<Vec<f32>>>;
}

/// Brute-force in-process index. Stands in for an external vector service;
/// adequate for single-node deployments and tests.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    namespaces: DashMap<String, HashMap<String, VectorRecord>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, namespace: &str) -> usize {
        self.namespaces.get(namespace).map(|n| n.len()).unwrap_or(0)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

impl VectorIndex for InMemoryVectorIndex {
    fn upsert<'a>(
        &'a self,
        namespace: &'a str,
        records: Vec<VectorRecord>,
    ) -> BoxFuture<'a, ServiceResult<()>> {
        Box::pin(async move {
            let mut ns = self.namespaces.entry(namespace.to_string()).or_default();
            for record in records {
                ns.insert(record.id.clone(), record);
            }
            Ok(())
        })
    }

    fn query<'a>(
        &'a self,
        namespace: &'a str,
        vector: &'a [f32],
        top_k: usize,
    ) -> BoxFuture<'a, ServiceResult<Vec<VectorMatch>>> {
        Box::pin(async move {
            let Some(ns) = self.namespaces.get(namespace) else {
                return Ok(Vec::new());
            };
            let mut matches: Vec<VectorMatch> = ns
                .values()
                .map(|r| VectorMatch {
                    id: r.id.clone(),
                    score: cosine_similarity(&r.vector, vector),
                    metadata: r.metadata.clone(),
                })
                .collect();
            matches.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            matches.truncate(top_k);
            Ok(matches)
        })
    }

    fn delete<'a>(
        &'a self,
        namespace: &'a str,
        ids: &'a [String],
    ) -> BoxFuture<'a, ServiceResult<()>> {
        Box::pin(async move {
            if let Some(mut ns) = self.namespaces.get_mut(namespace) {
                for id in ids {
                    ns.remove(id);
                }
            }
            Ok(())
        })
    }
}
