/*!
Core records of the store: entities (nouns), relations (verbs), and the
copy-on-write objects (commits, trees) with their content addressing.

Everything here serializes to JSON with serde; commit and tree hashes are
SHA-256 over the canonical JSON bytes of the object body.
*/

use std::collections::HashMap;
use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{EngramError, Result};

/// Dimension of entity vectors produced by the default embedding model.
pub const VECTOR_DIM: usize = 384;

/// Tolerance for the L2-norm check on inserted vectors.
pub const NORM_TOLERANCE: f32 = 1e-4;

/// The fixed UUID of the VFS root directory entity.
pub fn vfs_root_id() -> Uuid {
    Uuid::nil()
}

/// The entity taxonomy. Every noun carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NounType {
    /// A human being.
    Person,
    /// A company, team or other institution.
    Organization,
    /// A geographic place.
    Location,
    /// A textual document.
    Document,
    /// A file tracked by the VFS.
    File,
    /// An abstract idea or topic.
    Concept,
    /// Something that happened at a point in time.
    Event,
    /// A product or service.
    Product,
    /// Anything that fits nowhere else.
    Thing,
}

impl NounType {
    /// All taxonomy members, used when a search has no type hint.
    pub const ALL: [NounType; 9] = [
        NounType::Person,
        NounType::Organization,
        NounType::Location,
        NounType::Document,
        NounType::File,
        NounType::Concept,
        NounType::Event,
        NounType::Product,
        NounType::Thing,
    ];

    /// The lowercase name used in serialized records and storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            NounType::Person => "person",
            NounType::Organization => "organization",
            NounType::Location => "location",
            NounType::Document => "document",
            NounType::File => "file",
            NounType::Concept => "concept",
            NounType::Event => "event",
            NounType::Product => "product",
            NounType::Thing => "thing",
        }
    }

    /// Parse a lowercase taxonomy name.
    pub fn parse(name: &str) -> Result<NounType> {
        NounType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == name)
            .ok_or_else(|| EngramError::Message(format!("unknown noun type: {}", name)))
    }
}

impl Display for NounType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The relation taxonomy. Every verb carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VerbType {
    /// Social or professional acquaintance between two nouns.
    Knows,
    /// Untyped association.
    RelatedTo,
    /// Citation or pointer from one noun to another.
    References,
    /// Containment; directories relate to their children with this verb.
    Contains,
    /// Part-whole relationship.
    PartOf,
    /// Ownership.
    Owns,
}

impl VerbType {
    /// The camelCase name used in serialized records.
    pub fn as_str(&self) -> &'static str {
        match self {
            VerbType::Knows => "knows",
            VerbType::RelatedTo => "relatedTo",
            VerbType::References => "references",
            VerbType::Contains => "contains",
            VerbType::PartOf => "partOf",
            VerbType::Owns => "owns",
        }
    }
}

impl Display for VerbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a VFS node is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VfsType {
    /// Regular file; bytes live in a content blob.
    File,
    /// Directory; children hang off `contains` relations.
    Directory,
}

/// An entity (noun). The unit of storage, indexing and search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Canonical lowercase UUID v4.
    pub id: Uuid,
    /// Taxonomy type; also selects the HNSW sub-graph the vector lives in.
    #[serde(rename = "type")]
    pub noun_type: NounType,
    /// Free payload, typically the text the vector was embedded from.
    #[serde(default)]
    pub data: String,
    /// Arbitrary JSON metadata. Nested objects are flattened with dotted
    /// paths at index time.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Embedding vector. Empty on metadata-only loads; length
    /// [VECTOR_DIM] otherwise.
    #[serde(default)]
    pub vector: Vec<f32>,
    /// Creation time.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// True for entities that are VFS nodes; excluded from user queries by
    /// default.
    #[serde(rename = "isVFS", default)]
    pub is_vfs: bool,
    /// File or directory, for VFS nodes.
    #[serde(rename = "vfsType", default, skip_serializing_if = "Option::is_none")]
    pub vfs_type: Option<VfsType>,
    /// Absolute path, for VFS nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Entity {
    /// A copy of this entity with the vector payload stripped, as written
    /// to the metadata sidecar key and returned by metadata-only reads.
    pub fn without_vector(&self) -> Entity {
        Entity {
            vector: Vec::new(),
            ..self.clone()
        }
    }

    /// True when the vector payload is loaded and non-empty.
    pub fn has_vector(&self) -> bool {
        !self.vector.is_empty()
    }
}

/// A relation (verb): a typed, directed edge between two nouns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// UUID v4 of the relation itself.
    pub id: Uuid,
    /// Source entity UUID.
    pub from: Uuid,
    /// Target entity UUID.
    pub to: Uuid,
    /// Verb taxonomy type.
    #[serde(rename = "type")]
    pub verb_type: VerbType,
    /// Optional metadata on the edge.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Creation time.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Lowercase hex SHA-256 content address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// Hash raw bytes.
    pub fn of(bytes: &[u8]) -> ContentHash {
        let mut sha = Sha256::new();
        sha.update(bytes);
        ContentHash(hex::encode(sha.finalize()))
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContentHash {
    fn from(value: &str) -> Self {
        ContentHash(value.to_string())
    }
}

/// The kind of a content-addressed object, which doubles as its key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// Raw content bytes.
    Blob,
    /// Snapshot of the store at a point in history.
    Commit,
    /// Directory of named blob/tree entries.
    Tree,
}

impl ObjectKind {
    /// Key prefix, equal to the serialized name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Commit => "commit",
            ObjectKind::Tree => "tree",
        }
    }

    /// Probe order for auto-detect reads. Commits first: the legacy bug
    /// wrote commits under `blob:`, so a commit hash may hit any prefix.
    pub const PROBE_ORDER: [ObjectKind; 3] =
        [ObjectKind::Commit, ObjectKind::Tree, ObjectKind::Blob];
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a tree entry points at a blob or a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Leaf content.
    Blob,
    /// Nested tree.
    Tree,
}

/// One named entry of a [Tree].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Entity UUID (for entity entries) or path component (for VFS
    /// entries).
    pub name: String,
    /// Leaf or subtree.
    pub kind: EntryKind,
    /// Content address of the entry.
    pub hash: ContentHash,
}

/// A tree object: the snapshot of one directory level at a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    /// Content address over the sorted entry list.
    pub hash: ContentHash,
    /// Entries sorted by name.
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// Build a tree from entries. Entries are sorted by name before
    /// hashing so identical content always yields the identical address.
    pub fn new(mut entries: Vec<TreeEntry>) -> Result<Tree> {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let body = serde_json::to_vec(&entries)?;
        Ok(Tree {
            hash: ContentHash::of(&body),
            entries,
        })
    }

    /// Look up an entry by name.
    pub fn entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// A commit object: an immutable pointer to a tree plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Content address over the canonical serialization of the body.
    pub hash: ContentHash,
    /// Parent commit, or None for the root commit.
    pub parent: Option<ContentHash>,
    /// The snapshot tree.
    pub tree: ContentHash,
    /// Commit message.
    pub message: String,
    /// Author string.
    pub author: String,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
}

/// The stored (and hashed) portion of a commit. The hash is excluded so it
/// can never cover itself: a commit's address is the hash of exactly the
/// bytes written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Parent commit, or None for the root commit.
    pub parent: Option<ContentHash>,
    /// The snapshot tree.
    pub tree: ContentHash,
    /// Commit message.
    pub message: String,
    /// Author string.
    pub author: String,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
}

impl CommitRecord {
    /// The canonical bytes this record is stored and addressed by.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Commit {
    /// Create a commit stamped now, computing its content address.
    pub fn new(
        parent: Option<ContentHash>,
        tree: ContentHash,
        message: &str,
        author: &str,
    ) -> Result<Commit> {
        Commit::from_record(CommitRecord {
            parent,
            tree,
            message: message.to_string(),
            author: author.to_string(),
            timestamp: Utc::now(),
        })
    }

    /// Rebuild a commit from its stored record, recomputing the address.
    pub fn from_record(record: CommitRecord) -> Result<Commit> {
        let hash = ContentHash::of(&record.canonical_bytes()?);
        Ok(Commit {
            hash,
            parent: record.parent,
            tree: record.tree,
            message: record.message,
            author: record.author,
            timestamp: record.timestamp,
        })
    }

    /// The stored portion of this commit.
    pub fn record(&self) -> CommitRecord {
        CommitRecord {
            parent: self.parent.clone(),
            tree: self.tree.clone(),
            message: self.message.clone(),
            author: self.author.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Sidecar metadata stored next to every content-addressed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMeta {
    /// Object kind, equal to the key prefix the object was written under.
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    /// Uncompressed size in bytes.
    pub size: usize,
    /// Whether the stored bytes are deflate-compressed.
    #[serde(default)]
    pub compressed: bool,
}

/// One inferred type candidate for a natural-language query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeGuess {
    /// The candidate taxonomy type.
    #[serde(rename = "type")]
    pub noun_type: NounType,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// The query keywords that voted for this type.
    #[serde(rename = "matchedKeywords")]
    pub matched_keywords: Vec<String>,
}

/// Summary entry returned by history walks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Commit hash.
    pub hash: ContentHash,
    /// Commit message.
    pub message: String,
    /// Author string.
    pub author: String,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
}

/// A named mutable pointer to a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchHandle {
    /// Branch name.
    pub name: String,
    /// The commit the branch pointed at when the handle was created, or
    /// None for a branch with no commits yet.
    pub head: Option<ContentHash>,
}

/// Count entities per noun type; handy for diagnostics and tests.
pub fn count_by_type(entities: &[Entity]) -> HashMap<NounType, usize> {
    let mut counts = HashMap::new();
    for entity in entities {
        *counts.entry(entity.noun_type).or_insert(0) += 1;
    }
    counts
}
