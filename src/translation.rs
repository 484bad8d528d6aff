//! Translation cache with in-flight dedup.
//!
//! DESIGN
//! ======
//! Memoizes detect-language + translate results per
//! `(trimmed text, source or "auto", target)`. The check for a cached entry,
//! the check for an in-flight request, and marking the key in flight happen
//! under one mutex, so two concurrent callers for the same key issue at most
//! one upstream request. The caller that loses the race gets a pending state
//! back and learns about completion through [`TranslationCache::updates`].
//!
//! The cache is bounded: entries expire after a TTL and the least recently
//! used entry is evicted when full.
//!
//! ERROR HANDLING
//! ==============
//! Upstream failures degrade to the original text with
//! `needs_translation = true`, so a failed lookup is never mistaken for text
//! that was already in the target language. Failures are not cached; the
//! next call retries.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::functions::FunctionError;

/// Source language sentinel when the caller does not know it.
pub const AUTO_LANGUAGE: &str = "auto";

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
const UPDATE_CAPACITY: usize = 256;

// =============================================================================
// TRANSLATOR
// =============================================================================

/// Upstream language services.
#[async_trait::async_trait]
pub trait Translator: Send + Sync {
    /// Detect the language of `text`, returning a tag such as `"pt"`.
    async fn detect_language(&self, text: &str) -> Result<String, FunctionError>;

    async fn translate(&self, text: &str, target: &str) -> Result<String, FunctionError>;
}

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationCacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for TranslationCacheConfig {
    fn default() -> Self {
        Self { capacity: DEFAULT_CACHE_CAPACITY, ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub text: String,
    pub source: String,
    pub target: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(text: &str, source: Option<&str>, target: &str) -> Self {
        Self {
            text: text.trim().to_owned(),
            source: source.unwrap_or(AUTO_LANGUAGE).to_owned(),
            target: target.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationState {
    pub translated_text: String,
    pub is_translating: bool,
    pub detected_language: Option<String>,
    pub needs_translation: bool,
}

impl TranslationState {
    fn pending(text: &str) -> Self {
        Self { translated_text: text.to_owned(), is_translating: true, detected_language: None, needs_translation: false }
    }

    fn untranslated(text: &str, detected: Option<String>) -> Self {
        Self { translated_text: text.to_owned(), is_translating: false, detected_language: detected, needs_translation: true }
    }

    /// Entries are keyed on trimmed text; a same-language result echoes the
    /// caller's text exactly as given.
    fn for_caller(mut self, text: &str) -> Self {
        if !self.needs_translation {
            text.clone_into(&mut self.translated_text);
        }
        self
    }
}

struct CacheEntry {
    state: TranslationState,
    inserted: Instant,
}

#[derive(Default)]
struct CacheInner {
    /// Insertion order doubles as recency order: front is least recent.
    entries: IndexMap<CacheKey, CacheEntry>,
    in_flight: HashSet<CacheKey>,
}

/// Removes the in-flight marker when the request ends, including when the
/// requesting future is dropped.
struct InFlight<'a> {
    inner: &'a Mutex<CacheInner>,
    key: &'a CacheKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .remove(self.key);
    }
}

// =============================================================================
// CACHE
// =============================================================================

/// Process-wide translation cache. Clones share state.
#[derive(Clone)]
pub struct TranslationCache {
    translator: Arc<dyn Translator>,
    config: TranslationCacheConfig,
    inner: Arc<Mutex<CacheInner>>,
    updates: broadcast::Sender<CacheKey>,
}

impl TranslationCache {
    #[must_use]
    pub fn new(translator: Arc<dyn Translator>, config: TranslationCacheConfig) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self { translator, config, inner: Arc::new(Mutex::new(CacheInner::default())), updates }
    }

    /// Translation of `text` into `target`, from cache when possible.
    pub async fn get_translation(&self, text: &str, source: Option<&str>, target: &str) -> TranslationState {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return TranslationState::default();
        }
        let key = CacheKey::new(trimmed, source, target);

        // PHASE: CHECK, THEN MARK
        {
            let mut inner = self.lock();
            if let Some(state) = lookup(&mut inner, &key, self.config.ttl) {
                return state.for_caller(text);
            }
            if inner.in_flight.contains(&key) {
                debug!(target_lang = %key.target, "translation: request already in flight");
                return TranslationState::pending(text);
            }
            inner.in_flight.insert(key.clone());
        }

        // PHASE: ACT
        // EDGE: the result is stored before the marker drops, so no caller
        // can observe "neither cached nor in flight" for a finished request.
        let state = {
            let _marker = InFlight { inner: &self.inner, key: &key };
            match resolve(self.translator.as_ref(), trimmed, source, target).await {
                Ok(state) => {
                    store(&mut self.lock(), key.clone(), state.clone(), self.config);
                    state.for_caller(text)
                }
                Err(e) => {
                    warn!(error = %e, target_lang = %target, "translation failed; showing original text");
                    TranslationState::untranslated(text, source.map(str::to_owned))
                }
            }
        };
        let _ = self.updates.send(key);
        state
    }

    /// Cached state without touching the network.
    #[must_use]
    pub fn cached(&self, text: &str, source: Option<&str>, target: &str) -> Option<TranslationState> {
        let key = CacheKey::new(text, source, target);
        lookup(&mut self.lock(), &key, self.config.ttl).map(|state| state.for_caller(text))
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.lock().in_flight.contains(key)
    }

    /// Keys whose request just finished (successfully or not).
    #[must_use]
    pub fn updates(&self) -> broadcast::Receiver<CacheKey> {
        self.updates.subscribe()
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.lock().entries.shift_remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn resolve(
    translator: &dyn Translator,
    text: &str,
    source: Option<&str>,
    target: &str,
) -> Result<TranslationState, FunctionError> {
    let detected = match source {
        Some(lang) => lang.to_owned(),
        None => translator.detect_language(text).await?,
    };
    if same_language(&detected, target) {
        return Ok(TranslationState {
            translated_text: text.to_owned(),
            is_translating: false,
            detected_language: Some(detected),
            needs_translation: false,
        });
    }
    let translated = translator.translate(text, target).await?;
    Ok(TranslationState {
        translated_text: translated,
        is_translating: false,
        detected_language: Some(detected),
        needs_translation: true,
    })
}

/// Compare primary subtags: `pt-BR` and `pt` are the same language.
fn same_language(a: &str, b: &str) -> bool {
    primary_subtag(a).eq_ignore_ascii_case(primary_subtag(b))
}

fn primary_subtag(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag)
}

/// Hit refreshes recency; an expired entry is dropped and reported as a miss.
fn lookup(inner: &mut CacheInner, key: &CacheKey, ttl: Duration) -> Option<TranslationState> {
    let (_, stored_key, entry) = inner.entries.shift_remove_full(key)?;
    if entry.inserted.elapsed() >= ttl {
        return None;
    }
    let state = entry.state.clone();
    inner.entries.insert(stored_key, entry);
    Some(state)
}

fn store(inner: &mut CacheInner, key: CacheKey, state: TranslationState, config: TranslationCacheConfig) {
    let capacity = config.capacity.max(1);
    inner.entries.shift_remove(&key);
    if inner.entries.len() >= capacity {
        inner
            .entries
            .retain(|_, entry| entry.inserted.elapsed() < config.ttl);
    }
    while inner.entries.len() >= capacity {
        inner.entries.shift_remove_index(0);
    }
    inner.entries.insert(key, CacheEntry { state, inserted: Instant::now() });
}

#[cfg(test)]
#[path = "translation_test.rs"]
mod tests;
