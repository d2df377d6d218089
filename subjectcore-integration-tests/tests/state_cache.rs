//! The LRU state cache shared by routers over the in-memory store.

use std::sync::Arc;
use subjectcore::cache::{rebuild_fn, CacheKey, LruStateRebuildingCache};
use subjectcore::config::{CacheCapacity, CacheConfig, RouterConfig};
use subjectcore::{
    CacheValue, CommandError, EventId, Metadata, SourcingMode, StateRebuildingCache, Subject,
    UpcasterChain,
};
use subjectcore_integration_tests::{book, book_rebuilder, library_router, AddBook, AddCopy, Book};
use subjectcore_memory::InMemoryEventStore;

async fn add_book(router: &subjectcore::CommandRouter, subject: &Subject) {
    router
        .send(
            AddBook {
                book: subject.clone(),
                title: format!("Book {subject}"),
            },
            &Metadata::new(),
        )
        .await
        .unwrap();
}

fn key(subject: &Subject) -> CacheKey {
    CacheKey::of::<Book>(subject.clone(), SourcingMode::Recursive)
}

#[tokio::test]
async fn nested_rebuild_of_a_newer_state_wins() {
    let store = Arc::new(InMemoryEventStore::new());
    let cache = Arc::new(LruStateRebuildingCache::new(CacheCapacity::default()));
    let router = library_router(store.clone())
        .unwrap()
        .with_cache(cache.clone())
        .build();
    let dune = book("1").unwrap();
    add_book(&router, &dune).await;

    let upcasters = UpcasterChain::new();
    let rebuilder = book_rebuilder();
    let outer_state = rebuilder
        .rebuild(store.as_ref(), &upcasters, &dune, SourcingMode::Recursive)
        .await
        .unwrap();

    // While the outer rebuild is in flight, another writer adds a copy and
    // a nested rebuild installs the newer state.
    let nested_cache = cache.clone();
    let nested_router = router.clone();
    let nested_store = store.clone();
    let nested_subject = dune.clone();
    let outer = rebuild_fn(move |_| async move {
        nested_router
            .send(AddCopy { book: nested_subject.clone() }, &Metadata::new())
            .await?;
        let newer = book_rebuilder()
            .rebuild(
                nested_store.as_ref(),
                &UpcasterChain::new(),
                &nested_subject,
                SourcingMode::Recursive,
            )
            .await?;
        let installed = nested_cache
            .fetch_and_merge(
                &key(&nested_subject),
                rebuild_fn(move |_| async move {
                    Ok::<_, CommandError>(CacheValue::from_rebuilt(newer))
                }),
            )
            .await?;
        assert_eq!(installed.state::<Book>().map(|book| book.copies), Some(1));
        Ok::<_, CommandError>(CacheValue::from_rebuilt(outer_state))
    });

    let merged = cache.fetch_and_merge(&key(&dune), outer).await.unwrap();

    assert_eq!(merged.state::<Book>().map(|book| book.copies), Some(1));
    let cached = cache.peek(&key(&dune)).unwrap();
    assert_eq!(cached.last_event_id(), Some(EventId::new(2)));
}

#[tokio::test]
async fn least_recently_used_book_is_evicted() {
    let store = Arc::new(InMemoryEventStore::new());
    let cache = Arc::new(LruStateRebuildingCache::new(CacheCapacity::try_new(2).unwrap()));
    let router = library_router(store.clone())
        .unwrap()
        .with_cache(cache.clone())
        .build();
    let books: Vec<Subject> = ["1", "2", "3"].iter().map(|isbn| book(isbn).unwrap()).collect();
    for subject in &books {
        add_book(&router, subject).await;
    }

    // Appends invalidate, so only commands that load state fill the cache.
    router.send(AddCopy { book: books[0].clone() }, &Metadata::new()).await.unwrap();
    router.send(AddCopy { book: books[1].clone() }, &Metadata::new()).await.unwrap();
    router
        .send(AddBook { book: books[0].clone(), title: "again".to_string() }, &Metadata::new())
        .await
        .unwrap_err();
    router
        .send(AddBook { book: books[1].clone(), title: "again".to_string() }, &Metadata::new())
        .await
        .unwrap_err();
    assert_eq!(cache.len(), 2);

    router
        .send(AddBook { book: books[2].clone(), title: "again".to_string() }, &Metadata::new())
        .await
        .unwrap_err();

    assert_eq!(cache.len(), 2);
    assert!(!cache.contains(&key(&books[0])));
    assert!(cache.contains(&key(&books[1])));
    assert!(cache.contains(&key(&books[2])));
}

#[tokio::test]
async fn disabled_cache_behaves_like_a_cached_router() {
    let store = Arc::new(InMemoryEventStore::new());
    let uncached = library_router(store.clone())
        .unwrap()
        .with_config(RouterConfig {
            cache: CacheConfig::Disabled,
            ..RouterConfig::default()
        })
        .build();
    let cached = library_router(store.clone()).unwrap().build();
    let dune = book("1").unwrap();

    add_book(&uncached, &dune).await;
    assert_eq!(cached.send(AddCopy { book: dune.clone() }, &Metadata::new()).await.unwrap(), 1);
    assert_eq!(uncached.send(AddCopy { book: dune.clone() }, &Metadata::new()).await.unwrap(), 2);
    assert_eq!(cached.send(AddCopy { book: dune }, &Metadata::new()).await.unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commands_on_different_books_all_succeed() {
    let store = Arc::new(InMemoryEventStore::new());
    let router = library_router(store.clone()).unwrap().build();

    let tasks: Vec<_> = (0..16)
        .map(|isbn| {
            let router = router.clone();
            tokio::spawn(async move {
                let subject = book(&isbn.to_string()).unwrap();
                add_book(&router, &subject).await;
                router.send(AddCopy { book: subject.clone() }, &Metadata::new()).await?;
                router.send(AddCopy { book: subject }, &Metadata::new()).await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 2);
    }
    assert_eq!(store.len(), 48);
}
