/*!
Collaborator contracts: the embedding model and natural-language type
inference. The core never bundles a real model; it talks to these traits.

Two built-ins keep the crate usable stand-alone: [HashingEmbedder], a
deterministic token-hash embedding (adequate for tests and for callers
that supply precomputed vectors anyway), and [KeywordTypeInference], the
required fast keyword path over the noun taxonomy. A model-backed
implementation of [TypeInference] may add a vector-similarity fallback
behind the same trait.
*/

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{NounType, TypeGuess, VECTOR_DIM};

/// Produces L2-normalized vectors of a fixed dimension from text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text`. The returned vector must be L2-normalized and of
    /// length [Embedder::dimension].
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// The fixed output dimension.
    fn dimension(&self) -> usize {
        VECTOR_DIM
    }
}

/// Guesses candidate entity types for a natural-language query.
pub trait TypeInference: Send + Sync {
    /// Candidate types with confidence, most confident first. An empty
    /// result means "no hint, search everything".
    fn infer_types(&self, query: &str) -> Vec<TypeGuess>;
}

/// Deterministic embedding by hashed token buckets.
///
/// Tokens and consecutive token bigrams hash into buckets with a
/// hash-derived sign, then the vector is L2-normalized. Not a semantic
/// model; identical text always embeds identically, which is exactly what
/// the test suite and vector-supplied callers need.
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    /// An embedder with the default dimension.
    pub fn new() -> HashingEmbedder {
        HashingEmbedder { dim: VECTOR_DIM }
    }

    /// An embedder with a custom dimension.
    pub fn with_dimension(dim: usize) -> HashingEmbedder {
        HashingEmbedder { dim }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        let value = hasher.finish();
        let sign = if value & 1 == 0 { 1.0 } else { -1.0 };
        ((value as usize) % self.dim, sign)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        HashingEmbedder::new()
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tokens: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect();

        let mut vector = vec![0.0f32; self.dim];
        for token in &tokens {
            let (bucket, sign) = self.bucket(token);
            vector[bucket] += sign;
        }
        for pair in tokens.windows(2) {
            let (bucket, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[bucket] += 0.5 * sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            vector[0] = 1.0;
        } else {
            for x in &mut vector {
                *x /= norm;
            }
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

/// The fast keyword path of type inference: a keyword table over the
/// taxonomy, matched against query tokens with naive plural stripping.
pub struct KeywordTypeInference {
    keywords: Vec<(&'static str, NounType)>,
}

impl KeywordTypeInference {
    /// The built-in keyword table.
    pub fn new() -> KeywordTypeInference {
        KeywordTypeInference {
            keywords: vec![
                ("person", NounType::Person),
                ("people", NounType::Person),
                ("who", NounType::Person),
                ("engineer", NounType::Person),
                ("developer", NounType::Person),
                ("author", NounType::Person),
                ("employee", NounType::Person),
                ("scientist", NounType::Person),
                ("friend", NounType::Person),
                ("company", NounType::Organization),
                ("organization", NounType::Organization),
                ("team", NounType::Organization),
                ("startup", NounType::Organization),
                ("vendor", NounType::Organization),
                ("where", NounType::Location),
                ("place", NounType::Location),
                ("city", NounType::Location),
                ("country", NounType::Location),
                ("location", NounType::Location),
                ("document", NounType::Document),
                ("report", NounType::Document),
                ("article", NounType::Document),
                ("paper", NounType::Document),
                ("note", NounType::Document),
                ("file", NounType::File),
                ("folder", NounType::File),
                ("concept", NounType::Concept),
                ("idea", NounType::Concept),
                ("topic", NounType::Concept),
                ("event", NounType::Event),
                ("meeting", NounType::Event),
                ("conference", NounType::Event),
                ("product", NounType::Product),
                ("tool", NounType::Product),
                ("app", NounType::Product),
                ("service", NounType::Product),
            ],
        }
    }
}

impl Default for KeywordTypeInference {
    fn default() -> Self {
        KeywordTypeInference::new()
    }
}

impl TypeInference for KeywordTypeInference {
    fn infer_types(&self, query: &str) -> Vec<TypeGuess> {
        let tokens: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut matched: Vec<(NounType, Vec<String>)> = Vec::new();
        for token in &tokens {
            let singular = token.strip_suffix('s').unwrap_or(token);
            for (keyword, noun_type) in &self.keywords {
                if token.as_str() == *keyword || singular == *keyword {
                    match matched.iter_mut().find(|(t, _)| t == noun_type) {
                        Some((_, hits)) => hits.push(token.clone()),
                        None => matched.push((*noun_type, vec![token.clone()])),
                    }
                }
            }
        }

        let mut guesses: Vec<TypeGuess> = matched
            .into_iter()
            .map(|(noun_type, hits)| TypeGuess {
                noun_type,
                confidence: (hits.len() as f32 / tokens.len() as f32).min(1.0),
                matched_keywords: hits,
            })
            .collect();
        guesses.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        guesses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embedding_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::with_dimension(64);
        let a = embedder.embed("rust is a systems language").await.unwrap();
        let b = embedder.embed("rust is a systems language").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_empty_text_still_embeds() {
        let embedder = HashingEmbedder::with_dimension(8);
        let v = embedder.embed("").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_keyword_inference_finds_people() {
        let inference = KeywordTypeInference::new();
        let guesses = inference.infer_types("find engineers");
        assert_eq!(guesses[0].noun_type, NounType::Person);
        assert!(guesses[0].confidence > 0.0);
        assert_eq!(guesses[0].matched_keywords, vec!["engineers"]);
    }

    #[test]
    fn test_no_keywords_means_no_hint() {
        let inference = KeywordTypeInference::new();
        assert!(inference.infer_types("xyzzy plugh").is_empty());
    }
}
