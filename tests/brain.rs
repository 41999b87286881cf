/*!
End-to-end scenarios over full [Brain] instances, against both the
in-memory and the filesystem backends.
*/

use engram::brain::Brain;
use engram::error::EngramError;
use engram::model::{BlobMeta, NounType, ObjectKind};
use engram::query::{FindOptions, SimilarTarget};
use engram::store::EntityDraft;
use serde_json::{json, Map, Value};

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

#[tokio::test]
async fn cow_commits_store_under_commit_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let brain = Brain::builder(dir.path().to_str().unwrap())
        .build()
        .await
        .unwrap();

    brain.commit("m1", "tester").await.unwrap();

    let keys = brain.adapter().list_keys("_cow/").await.unwrap();
    assert!(keys
        .iter()
        .any(|k| k.starts_with("_cow/commit:") && !k.contains(":-meta:")));

    // No object under the blob prefix may claim to be a commit.
    for key in brain.adapter().list_keys("_cow/blob:-meta:").await.unwrap() {
        let meta: BlobMeta =
            serde_json::from_slice(&brain.adapter().get(&key).await.unwrap()).unwrap();
        assert_ne!(meta.kind, ObjectKind::Commit);
    }
}

#[tokio::test]
async fn historical_reads_resolve_through_commits() {
    let brain = Brain::open_in_memory().await.unwrap();

    // A commit from before the file existed.
    let h0 = brain.commit("empty", "tester").await.unwrap();

    brain.vfs().write_file("/a.txt", b"V1").await.unwrap();
    let h1 = brain.commit("c1", "tester").await.unwrap();

    brain.vfs().write_file("/a.txt", b"V2").await.unwrap();
    brain.commit("c2", "tester").await.unwrap();

    assert_eq!(brain.vfs().read_file("/a.txt", None).await.unwrap(), b"V2");
    assert_eq!(
        brain.vfs().read_file("/a.txt", Some(&h1)).await.unwrap(),
        b"V1"
    );

    let err = brain.vfs().read_file("/a.txt", Some(&h0)).await.unwrap_err();
    assert!(matches!(err, EngramError::NotFoundAtCommit { .. }));

    // exists() folds NotFoundAtCommit into false but propagates a
    // commit hash that never existed.
    assert!(!brain.vfs().exists("/a.txt", Some(&h0)).await.unwrap());
    let bogus = engram::model::ContentHash::of(b"never committed");
    assert!(matches!(
        brain.vfs().exists("/a.txt", Some(&bogus)).await,
        Err(EngramError::InvalidCommit(_))
    ));
}

#[tokio::test]
async fn clear_persists_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().to_str().unwrap().to_string();

    let brain = Brain::builder(&location).build().await.unwrap();
    brain
        .add(EntityDraft::new(NounType::Concept, "x"))
        .await
        .unwrap();
    brain.commit("before clear", "tester").await.unwrap();
    brain.clear().await.unwrap();
    brain.close().await.unwrap();

    let reopened = Brain::builder(&location).build().await.unwrap();
    let found = reopened
        .find(FindOptions {
            noun_type: Some(NounType::Concept),
            limit: Some(usize::MAX),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.entities.len(), 0);

    // No stale COW state and no history writes allowed.
    assert!(reopened.adapter().list_keys("_cow/").await.unwrap().is_empty());
    assert!(matches!(
        reopened.commit("resurrect", "tester").await,
        Err(EngramError::CowDisabled)
    ));

    // Repeated clear is a no-op.
    reopened.clear().await.unwrap();
}

#[tokio::test]
async fn entity_vectors_shard_by_uuid_prefix() {
    let brain = Brain::open_in_memory().await.unwrap();
    for i in 0..10 {
        brain
            .add(EntityDraft::new(NounType::Thing, format!("thing {}", i)))
            .await
            .unwrap();
    }

    let keys = brain
        .adapter()
        .list_keys("entities/nouns/vectors/")
        .await
        .unwrap();
    assert_eq!(keys.len(), 10);

    let shards: std::collections::HashSet<&str> = keys
        .iter()
        .map(|k| {
            k.strip_prefix("entities/nouns/vectors/")
                .unwrap()
                .split('/')
                .next()
                .unwrap()
        })
        .collect();
    assert!(shards.len() >= 2, "only shards {:?}", shards);
    for key in &keys {
        let shard = key.strip_prefix("entities/nouns/vectors/").unwrap();
        let (shard, id) = shard.split_once('/').unwrap();
        assert_eq!(shard, &id[..2]);
    }
}

#[tokio::test]
async fn metadata_reads_never_touch_the_vector_record() {
    let brain = Brain::open_in_memory().await.unwrap();
    let id = brain
        .add(EntityDraft::new(NounType::Concept, "lean"))
        .await
        .unwrap();

    // Remove the full record behind the store's back; the metadata-only
    // path must not notice, proving it reads the smaller record.
    let vector_key = format!(
        "entities/nouns/vectors/{}/{}",
        &id.to_string()[..2],
        id
    );
    brain.adapter().delete(&vector_key).await.unwrap();

    let lean = brain.get(&id, false).await.unwrap().unwrap();
    assert_eq!(lean.vector, Vec::<f32>::new());
    assert_eq!(lean.data, "lean");

    assert!(brain.get(&id, true).await.unwrap().is_none());
}

#[tokio::test]
async fn type_inference_steers_vector_search() {
    let brain = Brain::open_in_memory().await.unwrap();
    brain
        .add(EntityDraft::new(
            NounType::Person,
            "Alice is a software engineer",
        ))
        .await
        .unwrap();
    brain
        .add(EntityDraft::new(
            NounType::Document,
            "Engineering handbook, chapter one",
        ))
        .await
        .unwrap();

    let found = brain
        .find(FindOptions {
            query: Some("find engineers".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!found.entities.is_empty());
    assert_eq!(found.entities[0].noun_type, NounType::Person);
}

#[tokio::test]
async fn add_get_round_trip_preserves_data_and_metadata() {
    let brain = Brain::open_in_memory().await.unwrap();
    let metadata = object(json!({
        "source": "notebook",
        "tags": ["a", "b"],
        "nested": {"depth": 2}
    }));
    let id = brain
        .add(
            EntityDraft::new(NounType::Document, "quarterly numbers")
                .with_metadata(metadata.clone()),
        )
        .await
        .unwrap();

    let lean = brain.get(&id, false).await.unwrap().unwrap();
    assert_eq!(lean.data, "quarterly numbers");
    assert_eq!(lean.metadata, metadata);
    assert!(lean.vector.is_empty());

    let full = brain.get(&id, true).await.unwrap().unwrap();
    assert_eq!(full.metadata, metadata);
    assert_eq!(full.vector.len(), 384);

    // The entity is its own nearest neighbor at full score.
    let store = brain.store();
    let hits = store.vector_search(&full.vector, 1, None, None).unwrap();
    assert_eq!(hits[0].id, id);
    assert!(hits[0].score >= 0.999);
}

#[tokio::test]
async fn history_is_reverse_chronological() {
    let brain = Brain::open_in_memory().await.unwrap();
    let mut hashes = Vec::new();
    for i in 0..4 {
        hashes.push(brain.commit(&format!("c{}", i), "tester").await.unwrap());
    }
    let history = brain.history(None).await.unwrap();
    assert_eq!(history.len(), 4);
    let walked: Vec<_> = history.iter().map(|c| c.hash.clone()).collect();
    hashes.reverse();
    assert_eq!(walked, hashes);

    let limited = brain.history(Some(2)).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].message, "c3");
}

#[tokio::test]
async fn forks_diverge_and_checkout_switches() {
    let brain = Brain::open_in_memory().await.unwrap();
    brain.vfs().write_file("/shared.txt", b"base").await.unwrap();
    let base = brain.commit("base", "tester").await.unwrap();

    brain.fork("experiment").await.unwrap();
    brain.checkout("experiment").await.unwrap();
    brain
        .vfs()
        .write_file("/shared.txt", b"experimental")
        .await
        .unwrap();
    let tip = brain.commit("try things", "tester").await.unwrap();

    brain.checkout("main").await.unwrap();
    assert_eq!(brain.head().await.unwrap(), Some(base.clone()));
    assert_eq!(
        brain.vfs().read_file("/shared.txt", Some(&base)).await.unwrap(),
        b"base"
    );
    assert_eq!(
        brain.vfs().read_file("/shared.txt", Some(&tip)).await.unwrap(),
        b"experimental"
    );
}

#[tokio::test]
async fn entities_survive_reopen_on_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().to_str().unwrap().to_string();

    let brain = Brain::builder(&location).build().await.unwrap();
    let id = brain
        .add(
            EntityDraft::new(NounType::Person, "Grace")
                .with_metadata(object(json!({"field": "compilers"}))),
        )
        .await
        .unwrap();
    brain.close().await.unwrap();

    let reopened = Brain::builder(&location).build().await.unwrap();
    let grace = reopened.get(&id, true).await.unwrap().unwrap();
    assert_eq!(grace.data, "Grace");
    assert_eq!(grace.vector.len(), 384);

    // Flushed index state answers queries after reopen.
    let found = reopened
        .find(FindOptions {
            where_clause: Some(object(json!({"field": "compilers"}))),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.entities.len(), 1);
    let neighbors = reopened.similar(SimilarTarget::Id(id), 3).await.unwrap();
    assert!(neighbors.is_empty() || neighbors.iter().all(|n| n.entity.id != id));
}

#[tokio::test]
async fn vfs_nodes_hidden_from_typed_find() {
    let brain = Brain::open_in_memory().await.unwrap();
    brain.vfs().write_file("/docs/spec.md", b"# spec").await.unwrap();
    brain
        .add(EntityDraft::new(NounType::Document, "visible"))
        .await
        .unwrap();

    let found = brain
        .find(FindOptions {
            noun_type: Some(NounType::Document),
            limit: Some(1000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(found.entities.iter().all(|e| !e.is_vfs));
}
