//! Texture registry: one record per GPU texture.
//!
//! Records live in an arena indexed by [`StoreId`]. Several pixel sources
//! may map to one record (sources sharing a [`SourceKey::Named`] key); the
//! record is destroyed when the last of them is released in safe mode.

use std::collections::HashMap;

use crate::types::{ImageSource, SourceKey};

/// Index of a record in the registry arena. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(pub(crate) usize);

/// Per-texture bookkeeping.
#[derive(Debug)]
pub struct TextureRecord<T> {
    /// GPU texture; `None` until first uploaded.
    pub handle: Option<T>,
    /// Arena index of this record.
    pub store_id: StoreId,
    /// Ids of every [`ImageSource`] mapped to this record.
    pub sources: Vec<u64>,
    /// Source whose pixels are uploaded.
    pub image: ImageSource,
    /// Batch slot currently holding the texture.
    pub active_slot: Option<usize>,
    /// Batch that last sampled the texture.
    pub last_batch_id: Option<u64>,
    /// Draw that last sampled the texture.
    pub last_draw_id: u64,
    /// Both dimensions of the uploaded image are powers of two.
    pub is_power_of_two: bool,
    /// Generation each mapped source had when it was last resolved.
    pub seen: HashMap<u64, u64>,
    /// Pixels currently on the GPU.
    pub uploaded: Option<SourceVersion>,
    /// Pixels whose upload failed; not retried until they change.
    pub failed: Option<SourceVersion>,
    /// Uploaded width in pixels.
    pub width: u32,
    /// Uploaded height in pixels.
    pub height: u32,
}

/// A source's pixels at one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceVersion {
    /// [`ImageSource::id`].
    pub source: u64,
    /// [`ImageSource::generation`].
    pub generation: u64,
}

impl SourceVersion {
    /// Current version of `image`.
    pub fn of(image: &ImageSource) -> Self {
        Self {
            source: image.id(),
            generation: image.generation(),
        }
    }
}

impl<T> TextureRecord<T> {
    /// Current version of the upload source.
    pub fn version(&self) -> SourceVersion {
        SourceVersion::of(&self.image)
    }

    /// Whether the GPU copy is missing or differs from the upload source.
    pub fn needs_upload(&self) -> bool {
        let version = Some(self.version());
        self.uploaded != version && self.failed != version
    }

    /// Whether the last upload attempt for the current version failed.
    pub fn upload_failed(&self) -> bool {
        self.failed == Some(self.version())
    }

    /// Whether the texture holds pixels that can be sampled.
    pub fn is_uploaded(&self) -> bool {
        self.uploaded.is_some() && !self.upload_failed()
    }
}

/// Arena of [`TextureRecord`]s plus a lookup by source key.
#[derive(Debug)]
pub struct TextureRegistry<T> {
    records: Vec<Option<TextureRecord<T>>>,
    by_key: HashMap<SourceKey, StoreId>,
}

impl<T> Default for TextureRegistry<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            by_key: HashMap::new(),
        }
    }
}

impl<T> TextureRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.iter().flatten().count()
    }

    /// Whether no record is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the record for `image`, creating it on first sight.
    ///
    /// A sharing source becomes the upload source only when its pixels
    /// changed since it was last resolved, or when the current upload source
    /// has no pixels.
    pub fn resolve(&mut self, image: &ImageSource) -> StoreId {
        let key = image.key();
        if let Some(record) = self
            .by_key
            .get(&key)
            .and_then(|id| self.records.get_mut(id.0))
            .and_then(Option::as_mut)
        {
            if !record.sources.contains(&image.id()) {
                record.sources.push(image.id());
            }
            let generation = image.generation();
            let changed = record
                .seen
                .insert(image.id(), generation)
                .is_some_and(|previous| previous != generation);
            if record.image.id() != image.id()
                && image.is_ready()
                && (changed || !record.image.is_ready())
            {
                record.image = image.clone();
            }
            return record.store_id;
        }

        let id = StoreId(self.records.len());
        self.records.push(Some(TextureRecord {
            handle: None,
            store_id: id,
            sources: vec![image.id()],
            seen: HashMap::from([(image.id(), image.generation())]),
            image: image.clone(),
            active_slot: None,
            last_batch_id: None,
            last_draw_id: 0,
            is_power_of_two: false,
            uploaded: None,
            failed: None,
            width: 0,
            height: 0,
        }));
        self.by_key.insert(key, id);
        id
    }

    /// Record by id.
    pub fn get(&self, id: StoreId) -> Option<&TextureRecord<T>> {
        self.records.get(id.0).and_then(Option::as_ref)
    }

    /// Mutable record by id.
    pub fn get_mut(&mut self, id: StoreId) -> Option<&mut TextureRecord<T>> {
        self.records.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Record a given source id is mapped to.
    pub fn find_source(&self, source_id: u64) -> Option<StoreId> {
        self.iter()
            .find(|r| r.sources.contains(&source_id))
            .map(|r| r.store_id)
    }

    /// Removes a record outright.
    pub fn remove(&mut self, id: StoreId) -> Option<TextureRecord<T>> {
        let record = self.records.get_mut(id.0)?.take()?;
        self.by_key.retain(|_, v| *v != id);
        Some(record)
    }

    /// Releases one source.
    ///
    /// In safe mode only `source_id` is unmapped and the record is removed
    /// once no source remains; otherwise the record goes immediately. Returns
    /// the removed record, whose GPU texture the caller must delete.
    pub fn release_source(&mut self, source_id: u64, safe: bool) -> Option<TextureRecord<T>> {
        let id = self.find_source(source_id)?;
        if safe {
            let record = self.get_mut(id)?;
            record.sources.retain(|&s| s != source_id);
            record.seen.remove(&source_id);
            if !record.sources.is_empty() {
                return None;
            }
        }
        self.remove(id)
    }

    /// Records not sampled during the last `threshold` draws.
    pub fn stale(&self, draw_id: u64, threshold: u64) -> Vec<StoreId> {
        self.iter()
            .filter(|r| r.last_draw_id.saturating_add(threshold) <= draw_id)
            .map(|r| r.store_id)
            .collect()
    }

    /// Clears every record's slot and then applies `occupied`.
    pub fn sync_slots(&mut self, occupied: impl IntoIterator<Item = (usize, StoreId)>) {
        for record in self.records.iter_mut().flatten() {
            record.active_slot = None;
        }
        for (slot, id) in occupied {
            if let Some(record) = self.get_mut(id) {
                record.active_slot = Some(slot);
            }
        }
    }

    /// Iterates over live records.
    pub fn iter(&self) -> impl Iterator<Item = &TextureRecord<T>> {
        self.records.iter().flatten()
    }

    /// Removes and returns every record.
    pub fn drain(&mut self) -> Vec<TextureRecord<T>> {
        self.by_key.clear();
        self.records.iter_mut().filter_map(Option::take).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn image() -> ImageSource {
        ImageSource::from_rgba(1, 1, vec![0; 4])
    }

    #[test]
    fn same_source_resolves_to_same_record() {
        let mut reg = TextureRegistry::<u32>::new();
        let img = image();
        let a = reg.resolve(&img);
        let b = reg.resolve(&img.clone());
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn named_sources_share_a_record() {
        let mut reg = TextureRegistry::<u32>::new();
        let a = image().with_key("hero.png");
        let b = image().with_key("hero.png");
        let id = reg.resolve(&a);
        assert_eq!(reg.resolve(&b), id);
        assert_eq!(reg.get(id).unwrap().sources, vec![a.id(), b.id()]);
    }

    #[test]
    fn store_ids_are_not_reused() {
        let mut reg = TextureRegistry::<u32>::new();
        let first = reg.resolve(&image());
        reg.remove(first).unwrap();
        let second = reg.resolve(&image());
        assert_ne!(first, second);
        assert!(reg.get(first).is_none());
    }

    #[test]
    fn safe_release_waits_for_last_source() {
        let mut reg = TextureRegistry::<u32>::new();
        let a = image().with_key("atlas");
        let b = image().with_key("atlas");
        reg.resolve(&a);
        reg.resolve(&b);

        assert!(reg.release_source(a.id(), true).is_none());
        assert_eq!(reg.len(), 1);
        assert!(reg.release_source(b.id(), true).is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn unsafe_release_removes_immediately() {
        let mut reg = TextureRegistry::<u32>::new();
        let a = image().with_key("atlas");
        let b = image().with_key("atlas");
        reg.resolve(&a);
        reg.resolve(&b);
        assert!(reg.release_source(a.id(), false).is_some());
        assert!(reg.find_source(b.id()).is_none());
    }

    #[test]
    fn stale_uses_inclusive_threshold() {
        let mut reg = TextureRegistry::<u32>::new();
        let old = reg.resolve(&image());
        let fresh = reg.resolve(&image());
        reg.get_mut(old).unwrap().last_draw_id = 2;
        reg.get_mut(fresh).unwrap().last_draw_id = 9;
        assert_eq!(reg.stale(12, 10), vec![old]);
        assert!(reg.stale(11, 10).is_empty());
    }

    #[test]
    fn upload_state_follows_generation() {
        let mut reg = TextureRegistry::<u32>::new();
        let img = image();
        let id = reg.resolve(&img);
        let record = reg.get_mut(id).unwrap();
        assert!(record.needs_upload());
        record.uploaded = Some(SourceVersion::of(&img));
        assert!(!record.needs_upload());
        img.invalidate();
        assert!(reg.get(id).unwrap().needs_upload());
    }

    #[test]
    fn upload_source_switches_only_when_a_sharer_changes() {
        let mut reg = TextureRegistry::<u32>::new();
        let a = image().with_key("atlas");
        let b = image().with_key("atlas");
        a.invalidate();
        let id = reg.resolve(&a);
        reg.get_mut(id).unwrap().uploaded = Some(SourceVersion::of(&a));

        for _ in 0..3 {
            reg.resolve(&b);
            reg.resolve(&a);
            let record = reg.get(id).unwrap();
            assert_eq!(record.image.id(), a.id());
            assert!(!record.needs_upload());
        }

        b.invalidate();
        reg.resolve(&b);
        reg.resolve(&a);
        let record = reg.get(id).unwrap();
        assert_eq!(record.image.id(), b.id());
        assert!(record.needs_upload());
    }

    #[test]
    fn ready_sharer_replaces_pending_upload_source() {
        let mut reg = TextureRegistry::<u32>::new();
        let pending = ImageSource::pending(1, 1).with_key("late");
        let ready = image().with_key("late");
        let id = reg.resolve(&pending);
        reg.resolve(&ready);
        assert_eq!(reg.get(id).unwrap().image.id(), ready.id());
    }
}
