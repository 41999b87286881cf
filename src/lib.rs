#![deny(missing_docs)]
/*!
# Engram

Engram is an embedded, local-first "brain": one entity store unifying

* vector similarity search over fixed-dimension embeddings (a
  type-partitioned HNSW index),
* a typed property graph of entities (nouns) and relations (verbs) with
  metadata filtering,
* a copy-on-write content-addressed object store giving branchable
  history, forks and time-travel reads, with a virtual filesystem layered
  on top.

Storage is backend-agnostic: in-memory, local filesystem, S3-compatible
services and GCS, all through [adapter::StorageAdapter]. Open a store
with [brain::Brain::builder]:

```no_run
# async fn demo() -> engram::error::Result<()> {
use engram::brain::Brain;
use engram::model::NounType;
use engram::store::EntityDraft;

let brain = Brain::builder("/tmp/brain").build().await?;
let id = brain.add(EntityDraft::new(NounType::Concept, "sourdough")).await?;
brain.commit("first memory", "me").await?;
brain.vfs().write_file("/notes/today.md", b"fed the starter").await?;
# Ok(())
# }
```
*/
pub mod adapter;
pub mod blob;
pub mod brain;
pub mod cow;
pub mod error;
pub mod index;
pub mod infer;
pub mod model;
pub mod query;
pub mod store;
pub mod vfs;

pub use brain::{Brain, BrainBuilder};
pub use error::{EngramError, Result};
pub use model::{Entity, NounType, Relation, VerbType};

pub use object_store;
