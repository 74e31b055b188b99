//! # VectorStore
//!
//! The similarity store behind retrieval mode.
//!
//! Fragments of the crawled files are embedded into dense vectors, kept in a
//! [HNSW](https://arxiv.org/abs/1603.09320) approximate nearest-neighbor index
//! (`hora`) and looked up by Euclidean distance to the embedded query.
//!
//! ## Pieces
//! - [`SimilarityStore`]: what [`crate::context::RetrievalContext`] needs, a
//!   read-only "top K fragments for this text" lookup.
//! - [`Embedder`]: text to vector. [`MiniLmEmbedder`] runs
//!   `sentence-transformers/all-MiniLM-L6-v2` with Candle (pure Rust), weights
//!   fetched from the Hugging Face hub on first use.
//! - [`VectorStore`]: the index plus the fragment table, built by
//!   [`crate::ingest`] and persisted to a directory.
//!
//! ## On-disk layout
//! ```text
//! <dir>/fragments.yaml   dimension + fragment texts (id = position)
//! <dir>/hnsw_index.bin   hora index dump
//! ```

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use hora::core::ann_index::{ANNIndex, SerializableIndex};
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::error::{GreptError, Result};

/// Embedding size of all-MiniLM-L6-v2.
pub const MINILM_DIMENSION: usize = 384;

const MINILM_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";
const FRAGMENTS_FILE: &str = "fragments.yaml";
const INDEX_FILE: &str = "hnsw_index.bin";

/// Read-only nearest-fragment lookup.
pub trait SimilarityStore {
    /// Up to `top_k` fragments, most relevant first.
    fn query(&self, text: &str, top_k: usize) -> Result<Vec<String>>;
}

/// Turns text into a fixed-size vector.
pub trait Embedder {
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

fn embedding_err(err: impl std::fmt::Display) -> GreptError {
    GreptError::Embedding(err.to_string())
}

/// all-MiniLM-L6-v2 sentence embeddings on the CPU.
pub struct MiniLmEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl MiniLmEmbedder {
    /// Fetch (or reuse the cached) model files and load the weights.
    pub fn load() -> Result<Self> {
        let device = Device::Cpu;
        let repo = Repo::with_revision(MINILM_REPO.to_string(), RepoType::Model, "main".to_string());
        let api = Api::new().map_err(embedding_err)?.repo(repo);

        let config_path = api.get("config.json").map_err(embedding_err)?;
        let tokenizer_path = api.get("tokenizer.json").map_err(embedding_err)?;
        let weights_path = api.get("model.safetensors").map_err(embedding_err)?;
        debug!("loading embedding model from {}", weights_path.display());

        let config: Config = serde_json::from_str(&fs::read_to_string(config_path)?)
            .map_err(embedding_err)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(embedding_err)?;

        // SAFETY: the safetensors file is owned by the hub cache and not
        // modified while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DTYPE, &device)
                .map_err(embedding_err)?
        };
        let model = BertModel::load(vb, &config).map_err(embedding_err)?;

        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }

    fn encode(&self, text: &str) -> candle_core::Result<Vec<f32>> {
        let encoding = match self.tokenizer.encode(text, true) {
            Ok(encoding) => encoding,
            Err(err) => candle_core::bail!("tokenization failed: {err}"),
        };

        let ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let type_ids = Tensor::new(encoding.get_type_ids(), &self.device)?.unsqueeze(0)?;
        let hidden = self.model.forward(&ids, &type_ids, None)?;

        // mean pooling over real tokens: [1, seq, hidden] * [1, seq, 1]
        let mask = Tensor::new(encoding.get_attention_mask(), &self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?.clamp(1f32, f32::INFINITY)?;
        let pooled = summed.broadcast_div(&counts)?.squeeze(0)?;

        let norm = pooled.sqr()?.sum_all()?.sqrt()?;
        pooled.broadcast_div(&norm)?.to_vec1::<f32>()
    }
}

impl Embedder for MiniLmEmbedder {
    fn dimension(&self) -> usize {
        MINILM_DIMENSION
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(text).map_err(embedding_err)
    }
}

#[derive(Serialize, Deserialize)]
struct Fragments {
    dimension: usize,
    fragments: Vec<String>,
}

/// HNSW index over embedded fragments.
pub struct VectorStore {
    index: HNSWIndex<f32, usize>,
    embedder: Box<dyn Embedder>,
    fragments: Vec<String>,
}

impl VectorStore {
    /// Empty store sized for `embedder`.
    pub fn new(embedder: Box<dyn Embedder>) -> Self {
        let index = HNSWIndex::new(embedder.dimension(), &HNSWParams::default());
        Self {
            index,
            embedder,
            fragments: Vec::new(),
        }
    }

    /// Embed `fragment` and add it. Call [`VectorStore::build`] once all
    /// fragments are in.
    pub fn add(&mut self, fragment: String) -> Result<usize> {
        let vector = self.embedder.embed(&fragment)?;
        if vector.len() != self.embedder.dimension() {
            return Err(GreptError::Store(format!(
                "embedding has {} dimensions, expected {}",
                vector.len(),
                self.embedder.dimension()
            )));
        }
        let id = self.fragments.len();
        self.index
            .add(&vector, id)
            .map_err(|e| GreptError::Store(e.to_string()))?;
        self.fragments.push(fragment);
        Ok(id)
    }

    /// Finalize the index so searches see every added fragment.
    pub fn build(&mut self) -> Result<()> {
        self.index
            .build(Metric::Euclidean)
            .map_err(|e| GreptError::Store(e.to_string()))
    }

    /// Ids of the `top_k` nearest fragments to `vector`, nearest first.
    pub fn search(&self, vector: &[f32], top_k: usize) -> Result<Vec<usize>> {
        if vector.len() != self.embedder.dimension() {
            return Err(GreptError::Store("dimension mismatch".to_string()));
        }
        Ok(self.index.search(vector, top_k))
    }

    pub fn fragment(&self, id: usize) -> Option<&str> {
        self.fragments.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Write the index and fragment table into `dir`, creating it if needed.
    pub fn save(&mut self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let index_path = path_str(&dir.join(INDEX_FILE))?;
        self.index
            .dump(&index_path)
            .map_err(|e| GreptError::Store(e.to_string()))?;

        let table = Fragments {
            dimension: self.embedder.dimension(),
            fragments: self.fragments.clone(),
        };
        fs::write(dir.join(FRAGMENTS_FILE), serde_yaml::to_string(&table)?)?;
        info!("saved {} fragment(s) to {}", self.fragments.len(), dir.display());
        Ok(())
    }

    /// Load a store previously written by [`VectorStore::save`].
    ///
    /// `embedder` must be the one the store was built with.
    pub fn load(dir: &Path, embedder: Box<dyn Embedder>) -> Result<Self> {
        let table_path = dir.join(FRAGMENTS_FILE);
        let content = fs::read_to_string(&table_path).map_err(|e| {
            GreptError::Store(format!(
                "no index at {} ({e}); build one with --ingest",
                dir.display()
            ))
        })?;
        let table: Fragments = serde_yaml::from_str(&content)?;
        if table.dimension != embedder.dimension() {
            return Err(GreptError::Store(format!(
                "index has {} dimensions, embedder produces {}",
                table.dimension,
                embedder.dimension()
            )));
        }

        let index = HNSWIndex::load(&path_str(&dir.join(INDEX_FILE))?)
            .map_err(|e| GreptError::Store(e.to_string()))?;
        debug!("loaded {} fragment(s) from {}", table.fragments.len(), dir.display());

        Ok(Self {
            index,
            embedder,
            fragments: table.fragments,
        })
    }
}

impl SimilarityStore for VectorStore {
    fn query(&self, text: &str, top_k: usize) -> Result<Vec<String>> {
        let vector = self.embedder.embed(text)?;
        let ids = self.search(&vector, top_k)?;
        Ok(ids
            .into_iter()
            .filter_map(|id| self.fragment(id).map(str::to_string))
            .take(top_k)
            .collect())
    }
}

fn path_str(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| GreptError::Store(format!("non UTF-8 path {}", path.display())))
}

/// Byte histogram embedder, good enough to exercise the index in tests.
#[cfg(test)]
pub(crate) struct HistogramEmbedder;

#[cfg(test)]
impl Embedder for HistogramEmbedder {
    fn dimension(&self) -> usize {
        8
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0f32; 8];
        for b in text.bytes() {
            v[(b % 8) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1.0);
        Ok(v.into_iter().map(|x| x / norm).collect())
    }
}
