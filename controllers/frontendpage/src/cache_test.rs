//! Unit tests for the cache module

use super::*;
use crate::test_utils::frontend_page;
use crds::FrontendPage;
use futures::stream;
use std::sync::Mutex as StdMutex;

#[derive(Default)]
struct Recorder {
    events: StdMutex<Vec<String>>,
}

impl Recorder {
    fn take(&self) -> Vec<String> {
        let mut events = std::mem::take(&mut *self.events.lock().unwrap());
        events.sort();
        events
    }
}

impl EventHandler<FrontendPage> for Recorder {
    fn on_add(&self, obj: &FrontendPage) {
        self.events.lock().unwrap().push(format!("add {}", obj.name_any()));
    }
    fn on_update(&self, _old: &FrontendPage, new: &FrontendPage) {
        self.events.lock().unwrap().push(format!("update {}", new.name_any()));
    }
    fn on_delete(&self, obj: &FrontendPage) {
        self.events.lock().unwrap().push(format!("delete {}", obj.name_any()));
    }
    fn on_resync(&self, obj: &FrontendPage) {
        self.events.lock().unwrap().push(format!("resync {}", obj.name_any()));
    }
}

fn versioned(name: &str, version: &str) -> FrontendPage {
    let mut page = frontend_page(name, 1, "nginx:1.20");
    page.metadata.resource_version = Some(version.to_string());
    page
}

fn cache_with_recorder() -> (ResourceCache<FrontendPage>, Arc<Recorder>) {
    let cache = ResourceCache::new("frontendpages", CacheOptions::default());
    let recorder = Arc::new(Recorder::default());
    cache.add_handler(Arc::clone(&recorder) as Arc<dyn EventHandler<FrontendPage>>);
    (cache, recorder)
}

fn initial_list(cache: &ResourceCache<FrontendPage>, pages: Vec<FrontendPage>) {
    cache.apply(watcher::Event::Init);
    for page in pages {
        cache.apply(watcher::Event::InitApply(page));
    }
    cache.apply(watcher::Event::InitDone);
}

#[test]
fn test_initial_list_syncs_and_notifies_adds() {
    let (cache, recorder) = cache_with_recorder();
    assert!(!cache.has_synced());

    cache.apply(watcher::Event::Init);
    cache.apply(watcher::Event::InitApply(versioned("a", "1")));
    assert!(!cache.has_synced());
    assert!(cache.get(&ObjectKey::new("default", "a")).is_none(), "buffered until InitDone");

    cache.apply(watcher::Event::InitApply(versioned("b", "2")));
    cache.apply(watcher::Event::InitDone);

    assert!(cache.has_synced());
    assert_eq!(CacheStatus::len(&cache), 2);
    assert_eq!(recorder.take(), ["add a", "add b"]);
}

#[test]
fn test_relist_diffs_against_previous_snapshot() {
    let (cache, recorder) = cache_with_recorder();
    initial_list(&cache, vec![versioned("a", "1"), versioned("b", "2"), versioned("c", "3")]);
    recorder.take();

    initial_list(&cache, vec![versioned("a", "1"), versioned("b", "5"), versioned("d", "6")]);

    assert_eq!(recorder.take(), ["add d", "delete c", "update b"]);
    let mut keys: Vec<String> = cache.keys().iter().map(ToString::to_string).collect();
    keys.sort();
    assert_eq!(keys, ["default/a", "default/b", "default/d"]);
}

#[test]
fn test_update_replaces_entry_wholesale() {
    let (cache, recorder) = cache_with_recorder();
    initial_list(&cache, vec![versioned("a", "1")]);
    recorder.take();

    let before = cache.get(&ObjectKey::new("default", "a")).unwrap();
    let mut changed = versioned("a", "2");
    changed.spec.replicas = 4;
    cache.apply(watcher::Event::Apply(changed));

    let after = cache.get(&ObjectKey::new("default", "a")).unwrap();
    assert_eq!(before.spec.replicas, 1, "reader's snapshot is untouched");
    assert_eq!(after.spec.replicas, 4);
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(recorder.take(), ["update a"]);
}

#[test]
fn test_delete_removes_and_notifies() {
    let (cache, recorder) = cache_with_recorder();
    initial_list(&cache, vec![versioned("a", "1")]);
    recorder.take();

    cache.apply(watcher::Event::Delete(versioned("a", "1")));
    assert!(cache.get(&ObjectKey::new("default", "a")).is_none());
    assert_eq!(recorder.take(), ["delete a"]);
}

#[test]
fn test_keys_span_namespaces() {
    let (cache, _) = cache_with_recorder();
    let mut other = versioned("b", "2");
    other.metadata.namespace = Some("other".to_string());
    initial_list(&cache, vec![versioned("a", "1"), other]);

    let mut keys: Vec<String> = cache.keys().iter().map(ToString::to_string).collect();
    keys.sort();
    assert_eq!(keys, ["default/a", "other/b"]);
}

#[tokio::test]
async fn test_reader_refuses_before_sync() {
    let (cache, _) = cache_with_recorder();
    let err = ResourceReader::get(&cache, "default", "a").await.unwrap_err();
    assert!(err.is_transient());

    initial_list(&cache, vec![versioned("a", "1")]);
    let page = ResourceReader::get(&cache, "default", "a").await.unwrap();
    assert_eq!(page.unwrap().name_any(), "a");
    assert!(ResourceReader::get(&cache, "default", "missing").await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_run_reports_unhealthy_after_repeated_failures_and_recovers() {
    let options = CacheOptions { failure_threshold: 2, ..CacheOptions::default() };
    let cache = ResourceCache::<FrontendPage>::new("frontendpages", options);
    let failure = || Err(watcher::Error::NoResourceVersion);
    let events = stream::iter(vec![
        Ok(watcher::Event::Init),
        Ok(watcher::Event::InitDone),
        failure(),
        failure(),
    ])
    .chain(stream::pending());

    let cancel = CancellationToken::new();
    let cache = Arc::new(cache);
    let task = {
        let cache = Arc::clone(&cache);
        let cancel = cancel.clone();
        tokio::spawn(async move { cache.run(events, cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(cache.has_synced());
    assert!(!cache.is_healthy());
    assert_eq!(cache.watch_failures(), 2);

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_run_surfaces_stream_end() {
    let cache = ResourceCache::<FrontendPage>::new("frontendpages", CacheOptions::default());
    let events = stream::iter(vec![Ok(watcher::Event::Init), Ok(watcher::Event::InitDone)]);
    let result = cache.run(events, CancellationToken::new()).await;
    assert!(matches!(result, Err(ControllerError::Watch(_))));
    assert!(!cache.is_healthy());
}

#[tokio::test(start_paused = true)]
async fn test_periodic_resync_redelivers_objects() {
    let options = CacheOptions { resync_period: Duration::from_secs(30), ..CacheOptions::default() };
    let cache = Arc::new(ResourceCache::<FrontendPage>::new("frontendpages", options));
    let recorder = Arc::new(Recorder::default());
    cache.add_handler(Arc::clone(&recorder) as Arc<dyn EventHandler<FrontendPage>>);

    let events = stream::iter(vec![
        Ok(watcher::Event::Init),
        Ok(watcher::Event::InitApply(versioned("a", "1"))),
        Ok(watcher::Event::InitDone),
    ])
    .chain(stream::pending());
    let cancel = CancellationToken::new();
    let task = {
        let cache = Arc::clone(&cache);
        let cancel = cancel.clone();
        tokio::spawn(async move { cache.run(events, cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(recorder.take(), ["add a", "resync a"]);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_wait_for_sync_respects_cancel() {
    let cache = ResourceCache::<FrontendPage>::new("frontendpages", CacheOptions::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(!wait_for_sync(&cache, &cancel).await);

    initial_list(&cache, Vec::new());
    assert!(wait_for_sync(&cache, &CancellationToken::new()).await);
}
