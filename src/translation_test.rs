use super::*;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Notify;

/// Translator double: "ola mundo" style inputs are Portuguese, everything
/// else is English. Translation upper-cases the text.
#[derive(Default)]
struct StubTranslator {
    detects: AtomicU32,
    translates: AtomicU32,
    fail: bool,
    gate: Option<Arc<Notify>>,
}

#[async_trait::async_trait]
impl Translator for StubTranslator {
    async fn detect_language(&self, text: &str) -> Result<String, FunctionError> {
        self.detects.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(FunctionError::Request("connection refused".into()));
        }
        Ok(if text.starts_with("ola") { "pt".into() } else { "en".into() })
    }

    async fn translate(&self, text: &str, _target: &str) -> Result<String, FunctionError> {
        self.translates.fetch_add(1, Ordering::SeqCst);
        Ok(text.to_uppercase())
    }
}

fn cache_with(stub: Arc<StubTranslator>, config: TranslationCacheConfig) -> TranslationCache {
    TranslationCache::new(stub, config)
}

// =============================================================================
// get_translation
// =============================================================================

#[tokio::test]
async fn translates_foreign_text_and_caches() {
    let stub = Arc::new(StubTranslator::default());
    let cache = cache_with(stub.clone(), TranslationCacheConfig::default());

    let state = cache.get_translation("ola mundo", None, "en").await;
    assert_eq!(state.translated_text, "OLA MUNDO");
    assert_eq!(state.detected_language.as_deref(), Some("pt"));
    assert!(state.needs_translation);
    assert!(!state.is_translating);

    let again = cache.get_translation("  ola mundo ", None, "en").await;
    assert_eq!(again, state);
    assert_eq!(stub.detects.load(Ordering::SeqCst), 1);
    assert_eq!(stub.translates.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn same_language_keeps_original_text() {
    let stub = Arc::new(StubTranslator::default());
    let cache = cache_with(stub.clone(), TranslationCacheConfig::default());

    let state = cache.get_translation("hello there", None, "en-US").await;
    assert_eq!(state.translated_text, "hello there");
    assert!(!state.needs_translation);
    assert_eq!(state.detected_language.as_deref(), Some("en"));
    assert_eq!(stub.translates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn declared_source_skips_detection() {
    let stub = Arc::new(StubTranslator::default());
    let cache = cache_with(stub.clone(), TranslationCacheConfig::default());

    let state = cache.get_translation("bonjour", Some("fr"), "en").await;
    assert_eq!(state.translated_text, "BONJOUR");
    assert_eq!(state.detected_language.as_deref(), Some("fr"));
    assert_eq!(stub.detects.load(Ordering::SeqCst), 0);
    assert!(cache.cached("bonjour", Some("fr"), "en").is_some());
    assert!(cache.cached("bonjour", None, "en").is_none());
}

#[tokio::test]
async fn empty_text_makes_no_request() {
    let stub = Arc::new(StubTranslator::default());
    let cache = cache_with(stub.clone(), TranslationCacheConfig::default());

    let state = cache.get_translation("   ", None, "en").await;
    assert_eq!(state, TranslationState::default());
    assert_eq!(stub.detects.load(Ordering::SeqCst), 0);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn same_language_returns_text_exactly_as_given() {
    let stub = Arc::new(StubTranslator::default());
    let cache = cache_with(stub.clone(), TranslationCacheConfig::default());

    let state = cache.get_translation("  hello there  ", None, "en").await;
    assert_eq!(state.translated_text, "  hello there  ");
    assert!(!state.needs_translation);

    // cache hit through a differently padded variant of the same key
    let state = cache.get_translation("hello there\n", None, "en").await;
    assert_eq!(state.translated_text, "hello there\n");
    assert_eq!(stub.detects.load(Ordering::SeqCst), 1);
    assert_eq!(cache.cached(" hello there", None, "en").unwrap().translated_text, " hello there");
}

#[tokio::test]
async fn failure_degrades_to_original_and_is_not_cached() {
    let stub = Arc::new(StubTranslator { fail: true, ..StubTranslator::default() });
    let cache = cache_with(stub.clone(), TranslationCacheConfig::default());

    let state = cache.get_translation("ola mundo", None, "en").await;
    assert_eq!(state.translated_text, "ola mundo");
    assert!(state.needs_translation);
    assert!(!state.is_translating);
    assert!(cache.is_empty());

    cache.get_translation("ola mundo", None, "en").await;
    assert_eq!(stub.detects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_callers_share_one_request() {
    let gate = Arc::new(Notify::new());
    let stub = Arc::new(StubTranslator { gate: Some(gate.clone()), ..StubTranslator::default() });
    let cache = cache_with(stub.clone(), TranslationCacheConfig::default());
    let mut updates = cache.updates();

    let first = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_translation("ola mundo", None, "en").await })
    };
    tokio::task::yield_now().await;
    let key = CacheKey::new("ola mundo", None, "en");
    assert!(cache.is_in_flight(&key));

    let second = cache.get_translation("ola mundo", None, "en").await;
    assert!(second.is_translating);
    assert_eq!(second.translated_text, "ola mundo");

    gate.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first.translated_text, "OLA MUNDO");
    assert_eq!(updates.recv().await.unwrap(), key);
    assert!(!cache.is_in_flight(&key));

    assert_eq!(stub.detects.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get_translation("ola mundo", None, "en").await, first);
}

#[tokio::test]
async fn dropped_request_clears_in_flight_marker() {
    let gate = Arc::new(Notify::new());
    let stub = Arc::new(StubTranslator { gate: Some(gate), ..StubTranslator::default() });
    let cache = cache_with(stub, TranslationCacheConfig::default());

    let handle = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_translation("ola mundo", None, "en").await })
    };
    tokio::task::yield_now().await;
    let key = CacheKey::new("ola mundo", None, "en");
    assert!(cache.is_in_flight(&key));

    handle.abort();
    let _ = handle.await;
    assert!(!cache.is_in_flight(&key));
}

// =============================================================================
// bounds
// =============================================================================

#[tokio::test]
async fn least_recently_used_entry_is_evicted() {
    let stub = Arc::new(StubTranslator::default());
    let config = TranslationCacheConfig { capacity: 2, ..TranslationCacheConfig::default() };
    let cache = cache_with(stub, config);

    cache.get_translation("ola a", None, "en").await;
    cache.get_translation("ola b", None, "en").await;
    // touch "a" so "b" becomes least recent
    assert!(cache.cached("ola a", None, "en").is_some());
    cache.get_translation("ola c", None, "en").await;

    assert_eq!(cache.len(), 2);
    assert!(cache.cached("ola a", None, "en").is_some());
    assert!(cache.cached("ola b", None, "en").is_none());
    assert!(cache.cached("ola c", None, "en").is_some());
}

#[tokio::test(start_paused = true)]
async fn entries_expire_after_ttl() {
    let stub = Arc::new(StubTranslator::default());
    let config = TranslationCacheConfig { ttl: Duration::from_secs(60), ..TranslationCacheConfig::default() };
    let cache = cache_with(stub.clone(), config);

    cache.get_translation("ola mundo", None, "en").await;
    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(cache.cached("ola mundo", None, "en").is_some());

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(cache.cached("ola mundo", None, "en").is_none());

    cache.get_translation("ola mundo", None, "en").await;
    assert_eq!(stub.detects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalidate_forces_refetch() {
    let stub = Arc::new(StubTranslator::default());
    let cache = cache_with(stub.clone(), TranslationCacheConfig::default());

    cache.get_translation("ola mundo", None, "en").await;
    assert!(cache.invalidate(&CacheKey::new("ola mundo", None, "en")));
    assert!(!cache.invalidate(&CacheKey::new("ola mundo", None, "en")));

    cache.get_translation("ola mundo", None, "en").await;
    assert_eq!(stub.translates.load(Ordering::SeqCst), 2);

    cache.clear();
    assert!(cache.is_empty());
}

#[test]
fn primary_subtag_comparison_is_case_insensitive() {
    assert!(same_language("PT-br", "pt"));
    assert!(same_language("en_GB", "en-US"));
    assert!(!same_language("es", "en"));
}
