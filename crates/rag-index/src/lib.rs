//! rag-index - In-memory reference collaborators
//!
//! Lets the retrieval pipeline run locally over a directory of text files:
//!
//! - [`Corpus`]: loads `.md`/`.txt` files and splits them into paragraph chunks
//! - [`HashedVectorIndex`]: feature-hashed bag-of-words vectors, cosine similarity
//! - [`Bm25Index`]: Okapi BM25 keyword search
//! - [`RuleRewriter`]: keyword rewrites and connective-based decomposition
//! - [`OverlapReranker`]: query term coverage reranking
//! - [`ExtractiveGenerator`]: answers from the best-matching context sentences

mod corpus;
mod generate;
mod keyword;
mod rerank;
mod rewrite;
mod text;
mod vector;

pub use corpus::{split_paragraphs, Chunk, Corpus};
pub use generate::ExtractiveGenerator;
pub use keyword::Bm25Index;
pub use rerank::OverlapReranker;
pub use rewrite::RuleRewriter;
pub use text::{content_terms, tokenize};
pub use vector::{HashedEmbedder, HashedVectorIndex};
