use crossbeam_channel::{Receiver, Sender};
use image::RgbaImage;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::{Catalog, CatalogEntry, EntryId, EntryStatus, SortOrder};
use crate::config::ViewerConfig;
use crate::digits::IndexBuffer;
use crate::error::LoadError;
use crate::events::CoreEvent;
use crate::loader::{Completion, DecodedImage, decode_bytes, fit_within};
use crate::queue::{Priority, WorkItem, WorkQueue};
use crate::thumbs::{Side, ThumbWorker};

pub const HISTORY_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Prefetch window
// ---------------------------------------------------------------------------

/// Indices that should be resident around `current`, nearest first.
///
/// The budget `min(max_window, count)` includes `current` itself. Two
/// thirds of it (rounded down) go forward, the rest backward; both walks
/// wrap around the catalog and alternate one step at a time, and a walk
/// stops as soon as it reaches an index that is already taken.
pub fn prefetch_window(current: Option<usize>, count: usize, max_window: usize) -> Vec<usize> {
    if count == 0 {
        return Vec::new();
    }
    let cur = current.unwrap_or(0).min(count - 1);
    let effective = max_window.min(count);
    if effective == 0 {
        return Vec::new();
    }
    let above = effective * 2 / 3;
    let below = effective - above;

    let mut window = Vec::with_capacity(effective);
    let mut taken = HashSet::with_capacity(effective);
    window.push(cur);
    taken.insert(cur);

    let (mut fwd, mut bwd) = (0, 0);
    let (mut fwd_open, mut bwd_open) = (above > 0, below > 0);
    while window.len() < effective && (fwd_open || bwd_open) {
        if fwd_open {
            fwd += 1;
            let idx = (cur + fwd) % count;
            if taken.insert(idx) {
                window.push(idx);
                fwd_open = fwd < above;
            } else {
                fwd_open = false;
            }
        }
        if window.len() >= effective {
            break;
        }
        if bwd_open {
            bwd += 1;
            let idx = (cur + count - bwd % count) % count;
            if taken.insert(idx) {
                window.push(idx);
                bwd_open = bwd < below;
            } else {
                bwd_open = false;
            }
        }
    }
    window
}

/// Whether `img` already has the size a fit-to-viewport decode would give.
pub fn right_size(img: &DecodedImage, viewport: (u32, u32)) -> bool {
    img.dimensions() == fit_within(img.natural_width, img.natural_height, viewport.0, viewport.1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Empty search text, or too few entries to search.
    NotPerformed,
    NoMatch,
    Found(usize),
}

// ---------------------------------------------------------------------------
// Navigator
// ---------------------------------------------------------------------------

/// Cursor, prefetch window and history over a [`Catalog`].
///
/// Lives on the owner thread. Workers only talk to it through the
/// completion channel; every catalog mutation happens here.
pub struct Navigator {
    config: ViewerConfig,
    catalog: Catalog,
    queue: Arc<WorkQueue>,
    completions: Receiver<Completion>,
    events: Sender<CoreEvent>,

    current: Option<usize>,
    /// Most recent first.
    history: VecDeque<usize>,
    /// Queued or in-flight requests and the index they were issued for.
    loading: HashMap<EntryId, usize>,
    /// In flight but no longer wanted; their results are dropped.
    abandoned: HashSet<EntryId>,
    /// Non-network entries holding a decoded image.
    resident: HashSet<EntryId>,
    window: Vec<usize>,
    first_image: bool,
    /// Set once the user moved the cursor; from then on insertions before
    /// the cursor shift it so it keeps pointing at the same image.
    cursor_pinned: bool,
    marked: HashSet<EntryId>,
    index_buffer: IndexBuffer,
    thumbs: ThumbWorker,
}

impl Navigator {
    pub fn new(
        mut config: ViewerConfig,
        queue: Arc<WorkQueue>,
        completions: Receiver<Completion>,
        events: Sender<CoreEvent>,
    ) -> Self {
        config.max_resident = config.max_resident.max(1);
        Self {
            catalog: Catalog::new(config.sort),
            index_buffer: IndexBuffer::new(config.index_commit_delay, config.index_clear_delay),
            config,
            queue,
            completions,
            events,
            current: None,
            history: VecDeque::new(),
            loading: HashMap::new(),
            abandoned: HashSet::new(),
            resident: HashSet::new(),
            window: Vec::new(),
            first_image: true,
            cursor_pinned: false,
            marked: HashSet::new(),
            thumbs: ThumbWorker::new(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current_entry(&self) -> Option<&CatalogEntry> {
        self.catalog.entry_at(self.current?)
    }

    pub fn history(&self) -> impl Iterator<Item = usize> + '_ {
        self.history.iter().copied()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Target resident set from the last recomputation, nearest first.
    pub fn window(&self) -> &[usize] {
        &self.window
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    pub fn loading_index(&self, id: EntryId) -> Option<usize> {
        self.loading.get(&id).copied()
    }

    pub fn loading_count(&self) -> usize {
        self.loading.len()
    }

    /// Requests still waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    fn emit(&self, event: CoreEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn bound(&self, index: isize) -> Option<usize> {
        let n = self.catalog.len() as isize;
        (n > 0).then(|| index.rem_euclid(n) as usize)
    }

    fn neighbor_id(&self, side: Side) -> Option<EntryId> {
        let idx = self.bound(self.current? as isize + side.offset())?;
        self.catalog.entry_at(idx).map(CatalogEntry::id)
    }

    fn priority_for(&self, index: usize) -> Priority {
        let cur = self.current.unwrap_or(0) as isize;
        if index as isize == cur
            || self.bound(cur - 1) == Some(index)
            || self.bound(cur + 1) == Some(index)
        {
            Priority::High
        } else {
            Priority::Normal
        }
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    pub fn set_max_resident(&mut self, max: usize) {
        self.config.max_resident = max.max(1);
        self.refresh_window();
    }

    pub fn set_autozoom(&mut self, on: bool) {
        self.config.auto_zoom = on;
        self.refresh_window();
    }

    pub fn set_viewport(&mut self, size: (u32, u32)) {
        if self.config.viewport == Some(size) {
            return;
        }
        self.config.viewport = Some(size);
        if self.config.auto_zoom {
            self.refresh_window();
        }
    }

    pub fn set_ignore_failed(&mut self, on: bool) {
        self.config.ignore_failed = on;
    }

    pub fn set_no_smooth_scale(&mut self, on: bool) {
        self.config.no_smooth_scale = on;
    }

    /// Re-sort the whole catalog; the cursor keeps pointing at the same
    /// image and in-flight requests and history follow their entries.
    pub fn set_sort_order(&mut self, order: SortOrder) {
        self.config.sort = order;
        let moved = self.catalog.reorder(order);
        if moved.is_empty() {
            return;
        }
        let old = self.current;
        self.current = self.current.map(|c| moved[c]);
        for index in self.loading.values_mut() {
            *index = moved[*index];
        }
        for index in self.history.iter_mut() {
            *index = moved[*index];
        }
        self.thumbs.reset();
        self.emit(CoreEvent::CatalogReordered);
        self.emit(CoreEvent::CurrentChanged {
            old,
            new: self.current,
        });
        self.refresh_window();
    }

    // -----------------------------------------------------------------------
    // Catalog mutation
    // -----------------------------------------------------------------------

    pub fn insert_path(&mut self, path: impl Into<String>) -> usize {
        let entry = self.catalog.new_entry(path);
        self.insert_entry(entry)
    }

    /// Decode the bytes of a finished fetch the way a loader worker would and
    /// add the result as a network entry (failed if decoding failed).
    pub fn insert_network(&mut self, uri: &str, fetched: Result<Vec<u8>, String>) -> usize {
        let decoded = fetched
            .map_err(|reason| LoadError::NetworkFetch {
                uri: uri.to_string(),
                reason,
            })
            .and_then(|bytes| {
                decode_bytes(
                    uri,
                    &bytes,
                    self.config.target_size(),
                    self.config.no_smooth_scale,
                )
            });

        let mut entry = self.catalog.new_entry(uri);
        entry.status_mut().insert(EntryStatus::NETWORK);
        match decoded {
            Ok(img) => {
                entry.set_image(img);
            }
            Err(e) => {
                log::warn!("Failed to load {}", e);
                entry.status_mut().insert(EntryStatus::FAILED);
            }
        }
        self.insert_entry(entry)
    }

    fn insert_entry(&mut self, entry: CatalogEntry) -> usize {
        let was_len = self.catalog.len();
        let index = self.catalog.insert(entry);

        if index < was_len {
            for v in self.loading.values_mut() {
                if *v >= index {
                    *v += 1;
                }
            }
            for h in self.history.iter_mut() {
                if *h >= index {
                    *h += 1;
                }
            }
            if let Some(cur) = self.current {
                if self.cursor_pinned && cur >= index {
                    self.current = Some(cur + 1);
                }
                if index <= cur + 1 {
                    self.thumbs.reset();
                }
            }
        }
        self.emit(CoreEvent::CatalogChanged { index, delta: 1 });

        if self.catalog.len() == 1 {
            self.set_current_index(0);
        } else {
            self.refresh_window();
        }
        index
    }

    /// Drop the entry at `index` from the catalog. Returns its path.
    pub fn remove_entry(&mut self, index: usize) -> Option<String> {
        let entry = self.catalog.remove_at(index)?;
        let id = entry.id();
        if self.loading.remove(&id).is_some() && !self.queue.cancel(id) {
            self.abandoned.insert(id);
        }
        self.resident.remove(&id);
        self.marked.remove(&id);

        for v in self.loading.values_mut() {
            if *v > index {
                *v -= 1;
            }
        }
        self.history.retain(|&h| h != index);
        for h in self.history.iter_mut() {
            if *h > index {
                *h -= 1;
            }
        }

        let old = self.current;
        self.current = match self.current {
            _ if self.catalog.is_empty() => None,
            Some(c) if c > index => Some(c - 1),
            Some(c) if c == index => Some(c.min(self.catalog.len() - 1)),
            other => other,
        };
        if old.is_some_and(|c| c + 1 >= index) {
            self.thumbs.reset();
        }

        self.emit(CoreEvent::CatalogChanged { index, delta: -1 });
        if old != self.current || old == Some(index) {
            self.emit(CoreEvent::CurrentChanged {
                old,
                new: self.current,
            });
        }
        self.refresh_window();
        Some(entry.path().to_string())
    }

    pub fn remove_id(&mut self, id: EntryId) -> Option<String> {
        let index = self.catalog.index_of(id)?;
        self.remove_entry(index)
    }

    // -----------------------------------------------------------------------
    // Cursor movement
    // -----------------------------------------------------------------------

    pub fn set_current_index(&mut self, index: usize) {
        if self.catalog.is_empty() {
            return;
        }
        let index = index.min(self.catalog.len() - 1);
        if self.current == Some(index) {
            return;
        }
        self.history.push_front(index);
        self.history.truncate(HISTORY_CAPACITY);
        self.go_to(index);
    }

    /// Move the cursor without touching history.
    fn go_to(&mut self, index: usize) {
        if self.catalog.is_empty() || self.current == Some(index) {
            return;
        }
        let index = index.min(self.catalog.len() - 1);
        self.cursor_pinned = self.catalog.len() > 1;
        let old = self.current;
        log::debug!("[nav] move {:?} -> {}", old, index);
        self.current = Some(index);
        self.thumbs.reset();
        self.emit(CoreEvent::CurrentChanged {
            old,
            new: Some(index),
        });
        self.refresh_window();
    }

    pub fn move_by(&mut self, delta: isize) {
        let cur = self.current.unwrap_or(0) as isize;
        if let Some(index) = self.bound(cur + delta) {
            self.set_current_index(index);
        }
    }

    pub fn next_image(&mut self) {
        self.move_by(1);
    }

    pub fn previous_image(&mut self) {
        self.move_by(-1);
    }

    fn page_step(&self) -> isize {
        (self.catalog.len() / 10).max(1) as isize
    }

    pub fn next_page(&mut self) {
        self.move_by(self.page_step());
    }

    pub fn previous_page(&mut self) {
        self.move_by(-self.page_step());
    }

    pub fn home(&mut self) {
        self.set_current_index(0);
    }

    pub fn end(&mut self) {
        if let Some(last) = self.catalog.len().checked_sub(1) {
            self.set_current_index(last);
        }
    }

    /// Jump to an image picked at random.
    pub fn random_image(&mut self) {
        let n = self.catalog.len();
        if n > 1 {
            self.set_current_index(rand::rng().random_range(0..n));
        }
    }

    /// Move to the `count`-th image (searching backward if negative) that
    /// lives outside the current image's directory.
    pub fn next_directory(&mut self, count: isize) {
        if self.catalog.len() < 2 || count == 0 {
            return;
        }
        let parent = |nav: &Self, i: usize| {
            nav.catalog
                .entry_at(i)
                .and_then(|e| Path::new(e.path()).parent().map(Path::to_path_buf))
        };
        let start = self.current.unwrap_or(0);
        let directory = parent(self, start);
        let step = count.signum();
        let mut remaining = count.unsigned_abs();
        let mut crossed = false;
        let mut i = start;
        while remaining != 0 {
            i = self.bound(i as isize + step).unwrap_or(0);
            if i == start && !crossed {
                // Only one directory here.
                return;
            }
            if parent(self, i) != directory {
                crossed = true;
                remaining -= 1;
            }
        }
        self.set_current_index(i);
    }

    pub fn back(&mut self) -> bool {
        let Some(front) = self.history.pop_front() else {
            return false;
        };
        self.history.push_back(front);
        self.walk_history()
    }

    pub fn forward(&mut self) -> bool {
        let Some(last) = self.history.pop_back() else {
            return false;
        };
        self.history.push_front(last);
        self.walk_history()
    }

    fn walk_history(&mut self) -> bool {
        let before = self.current;
        if let Some(&target) = self.history.front() {
            self.go_to(target);
        }
        self.current != before
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    fn matches(&self, index: usize, needle: &str) -> bool {
        self.catalog
            .entry_at(index)
            .is_some_and(|e| e.path().to_lowercase().contains(needle))
    }

    /// Case-insensitive substring search forward from the cursor, wrapping
    /// to the start.
    pub fn search_next(&mut self, text: &str) -> SearchResult {
        if text.is_empty() {
            return SearchResult::NotPerformed;
        }
        let needle = text.to_lowercase();
        let n = self.catalog.len();
        let start = self.current.map_or(0, |c| c + 1);
        let found = (start..n)
            .find(|&i| self.matches(i, &needle))
            .or_else(|| (0..n).find(|&i| self.matches(i, &needle)));
        self.finish_search(found)
    }

    /// Like [`Navigator::search_next`], scanning backward and wrapping to
    /// the end.
    pub fn search_previous(&mut self, text: &str) -> SearchResult {
        if text.is_empty() {
            return SearchResult::NotPerformed;
        }
        let needle = text.to_lowercase();
        let n = self.catalog.len();
        let end = self.current.unwrap_or(0);
        let found = (0..end)
            .rev()
            .find(|&i| self.matches(i, &needle))
            .or_else(|| (0..n).rev().find(|&i| self.matches(i, &needle)));
        self.finish_search(found)
    }

    /// Skip ahead a random number of matches, up to a tenth of the catalog.
    pub fn random_search(&mut self, text: &str) -> SearchResult {
        let n = self.catalog.len();
        if n < 2 {
            return SearchResult::NotPerformed;
        }
        let hops = rand::rng().random_range(1..=(n / 10).max(1));
        let mut result = SearchResult::NotPerformed;
        for _ in 0..hops {
            result = self.search_next(text);
            if !matches!(result, SearchResult::Found(_)) {
                break;
            }
        }
        result
    }

    fn finish_search(&mut self, found: Option<usize>) -> SearchResult {
        match found {
            Some(i) => {
                self.set_current_index(i);
                SearchResult::Found(i)
            }
            None => SearchResult::NoMatch,
        }
    }

    /// One slideshow tick: next search hit if `text` is set, else the next
    /// image. Does nothing while the current image is still loading.
    pub fn slideshow_step(&mut self, text: &str) -> bool {
        if let Some(entry) = self.current_entry() {
            if self.loading.contains_key(&entry.id()) {
                return false;
            }
        }
        if self.search_next(text) == SearchResult::NotPerformed {
            self.move_by(1);
        }
        true
    }

    // -----------------------------------------------------------------------
    // Jump by typed number
    // -----------------------------------------------------------------------

    pub fn push_index_digit(&mut self, digit: char, now: Instant) -> bool {
        let count = self.catalog.len();
        self.index_buffer.push_digit(digit, count, now)
    }

    /// Commit the typed position once the user stopped typing. Returns
    /// whether the cursor moved.
    pub fn poll_index_buffer(&mut self, now: Instant) -> bool {
        match self.index_buffer.poll(now) {
            Some(i) if i < self.catalog.len() => {
                let before = self.current;
                self.set_current_index(i);
                before != self.current
            }
            _ => false,
        }
    }

    pub fn index_buffer(&self) -> &str {
        self.index_buffer.as_str()
    }

    pub fn clear_index_buffer(&mut self) {
        self.index_buffer.clear();
    }

    // -----------------------------------------------------------------------
    // Per-entry actions
    // -----------------------------------------------------------------------

    pub fn rotate_right(&mut self) {
        self.rotate_current(90);
    }

    pub fn rotate_left(&mut self) {
        self.rotate_current(270);
    }

    fn rotate_current(&mut self, degrees: u16) {
        let Some(cur) = self.current else { return };
        let Some(entry) = self.catalog.entry_at_mut(cur) else {
            return;
        };
        entry.rotation = (entry.rotation + degrees) % 360;
        let id = entry.id();
        let rotated = match entry.decoded_mut() {
            Some(img) => {
                Arc::make_mut(img).rotate(degrees);
                true
            }
            None => false,
        };

        // A request already issued carries the old rotation.
        if self.loading.remove(&id).is_some() {
            entry.status_mut().remove(EntryStatus::LOADING);
            if self.queue.cancel(id) {
                self.load(cur);
            } else {
                self.abandoned.insert(id);
            }
        }
        if rotated {
            self.emit(CoreEvent::EntryUpdated(cur));
        }
    }

    /// The display layer has shown the failure placeholder for `index`.
    pub fn mark_seen(&mut self, index: usize) {
        if let Some(entry) = self.catalog.entry_at_mut(index) {
            if entry.is_failed() {
                entry.status_mut().insert(EntryStatus::SEEN);
            }
        }
    }

    /// Flag the current image for deletion, or unflag it. Network images
    /// cannot be flagged. Returns whether it is flagged afterwards.
    pub fn toggle_mark_current(&mut self) -> bool {
        let Some(entry) = self.current_entry() else {
            return false;
        };
        if entry.is_network() {
            return false;
        }
        let id = entry.id();
        if !self.marked.remove(&id) {
            self.marked.insert(id);
        }
        self.emit(CoreEvent::EntryUpdated(self.current.unwrap_or(0)));
        self.marked.contains(&id)
    }

    pub fn mark_current(&mut self) {
        if let Some(entry) = self.current_entry() {
            if !entry.is_network() && !self.marked.contains(&entry.id()) {
                self.toggle_mark_current();
            }
        }
    }

    pub fn unmark_current(&mut self) {
        if let Some(entry) = self.current_entry() {
            if self.marked.contains(&entry.id()) {
                self.toggle_mark_current();
            }
        }
    }

    pub fn is_marked(&self, index: usize) -> bool {
        self.catalog
            .entry_at(index)
            .is_some_and(|e| self.marked.contains(&e.id()))
    }

    /// Paths flagged for deletion, in catalog order.
    pub fn marked_paths(&self) -> Vec<String> {
        self.catalog
            .iter()
            .filter(|e| self.marked.contains(&e.id()))
            .map(|e| e.path().to_string())
            .collect()
    }

    /// Remove every flagged entry from the catalog and return their paths;
    /// deleting the files is up to the caller.
    pub fn purge_marked(&mut self) -> Vec<String> {
        let ids: Vec<EntryId> = self.marked.iter().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.remove_id(id))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Window maintenance
    // -----------------------------------------------------------------------

    /// Recompute the target set, evict and cancel what fell out of it, then
    /// request what is missing.
    pub fn refresh_window(&mut self) {
        if self.catalog.is_empty() {
            if !self.window.is_empty() {
                self.window.clear();
                self.emit(CoreEvent::WindowChanged);
            }
            return;
        }

        let target = prefetch_window(self.current, self.catalog.len(), self.config.max_resident);
        let keep: HashSet<EntryId> = target
            .iter()
            .filter_map(|&i| self.catalog.entry_at(i))
            .map(CatalogEntry::id)
            .collect();
        let stale: HashSet<EntryId> = self
            .resident
            .iter()
            .chain(self.loading.keys())
            .filter(|id| !keep.contains(id))
            .copied()
            .collect();
        for id in stale {
            self.evict(id);
        }

        if self.first_image {
            // Get the first picture on screen before anything else.
            if let Some(cur) = self.current {
                self.load(cur);
            }
            let waiting = self
                .current_entry()
                .is_some_and(|e| self.loading.contains_key(&e.id()));
            if !waiting {
                self.first_image = false;
            }
        }

        if !self.first_image {
            let (high, normal): (Vec<usize>, Vec<usize>) = target
                .iter()
                .partition(|&&i| self.priority_for(i) == Priority::High);
            for i in normal {
                self.load(i);
            }
            // Each high priority push becomes the new head: push the
            // current image last so it is decoded first.
            for i in high.into_iter().rev() {
                self.load(i);
            }
        }

        if target != self.window {
            self.window = target;
            self.emit(CoreEvent::WindowChanged);
        }
    }

    fn evict(&mut self, id: EntryId) {
        let Some(index) = self.catalog.index_of(id) else {
            self.loading.remove(&id);
            self.resident.remove(&id);
            return;
        };
        let Some(entry) = self.catalog.entry_at_mut(index) else {
            return;
        };
        if entry.is_network() {
            return;
        }
        if self.loading.remove(&id).is_some() {
            entry.status_mut().remove(EntryStatus::LOADING);
            if !self.queue.cancel(id) {
                self.abandoned.insert(id);
            }
        }
        if entry.clear_image() {
            self.resident.remove(&id);
            log::debug!("evicted {} {}", index, entry.path());
            self.emit(CoreEvent::EntryUpdated(index));
        }
    }

    fn load(&mut self, index: usize) {
        let Some(entry) = self.catalog.entry_at(index) else {
            return;
        };
        let id = entry.id();
        if entry.is_failed()
            || entry.is_network()
            || self.loading.contains_key(&id)
            || self.abandoned.contains(&id)
        {
            return;
        }
        let target = self.config.target_size();
        if let Some(img) = entry.decoded() {
            match target {
                Some(viewport) if !right_size(img, viewport) => {}
                _ => return,
            }
        }

        let item = WorkItem::new(
            id,
            entry.as_path().to_path_buf(),
            self.priority_for(index),
            target,
            entry.rotation,
            self.config.no_smooth_scale,
        );
        if let Err(e) = self.queue.push(item) {
            log::debug!("not loading {}: {}", entry.path(), e);
            return;
        }
        self.loading.insert(id, index);
        if let Some(entry) = self.catalog.entry_at_mut(index) {
            entry.status_mut().insert(EntryStatus::LOADING);
        }
    }

    // -----------------------------------------------------------------------
    // Completions
    // -----------------------------------------------------------------------

    /// Apply one worker result.
    pub fn handle_completion(&mut self, done: Completion) {
        let id = done.token;
        if self.abandoned.remove(&id) {
            log::debug!("stale completion for {:?} dropped", id);
            // Wanted again since it was abandoned: ask for a fresh decode.
            if let Some(index) = self.catalog.index_of(id) {
                if self.window.contains(&index) {
                    self.load(index);
                }
            }
            return;
        }
        let Some(hint) = self.loading.remove(&id) else {
            log::debug!("stale completion for {:?} dropped", id);
            return;
        };
        let index = match self.catalog.entry_at(hint) {
            Some(e) if e.id() == id => hint,
            _ => match self.catalog.index_of(id) {
                Some(i) => i,
                None => return,
            },
        };
        let first = std::mem::replace(&mut self.first_image, false);

        let Some(entry) = self.catalog.entry_at_mut(index) else {
            return;
        };
        entry.status_mut().remove(EntryStatus::LOADING);
        match done.result {
            Ok(img) => {
                if entry.set_image(img) && !entry.is_network() {
                    self.resident.insert(id);
                }
                self.emit(CoreEvent::EntryUpdated(index));
                if self.current == Some(index) {
                    // The viewport may have changed while this was decoding.
                    self.load(index);
                }
            }
            Err(err) => {
                log::warn!("Failed to load {}", err);
                if entry.clear_image() {
                    self.resident.remove(&id);
                }
                if self.config.ignore_failed {
                    self.remove_entry(index);
                } else {
                    entry.status_mut().insert(EntryStatus::FAILED);
                    self.emit(CoreEvent::EntryUpdated(index));
                }
            }
        }

        if first {
            self.refresh_window();
        }
    }

    /// Apply every result that has arrived so far. Returns how many load
    /// completions were processed.
    pub fn pump(&mut self) -> usize {
        let mut n = 0;
        while let Ok(done) = self.completions.try_recv() {
            self.handle_completion(done);
            n += 1;
        }
        for done in self.thumbs.drain() {
            let side = done.side;
            let neighbor = self.neighbor_id(side);
            if self.thumbs.complete(done, neighbor) {
                self.emit(CoreEvent::ThumbnailUpdated(side));
            }
        }
        n
    }

    /// Block up to `timeout` for the next load result, then apply
    /// everything pending. Returns false on timeout.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> bool {
        match self.completions.recv_timeout(timeout) {
            Ok(done) => {
                self.handle_completion(done);
                self.pump();
                true
            }
            Err(_) => false,
        }
    }

    // -----------------------------------------------------------------------
    // Thumbnails
    // -----------------------------------------------------------------------

    /// Ask for side thumbnails of the neighbours of the current image at
    /// `width` (raised to the configured minimum).
    pub fn request_thumbnails(&mut self, width: u32) -> usize {
        if !self.config.display_thumbnails || self.catalog.len() < 2 {
            return 0;
        }
        let Some(cur) = self.current else { return 0 };
        let width = width.max(self.config.thumb_min_width);
        let mut started = 0;
        for side in [Side::Left, Side::Right] {
            let Some(idx) = self.bound(cur as isize + side.offset()) else {
                continue;
            };
            let Some(entry) = self.catalog.entry_at(idx) else {
                continue;
            };
            if let Some(img) = entry.decoded() {
                if self.thumbs.request(side, entry.id(), Arc::clone(img), width) {
                    started += 1;
                }
            }
        }
        started
    }

    pub fn thumbnail(&self, side: Side) -> Option<&RgbaImage> {
        self.thumbs.thumbnail(side)
    }

    pub fn shutdown_thumbs(&mut self) {
        self.thumbs.shutdown();
    }

    /// Log the state of every index in the window.
    pub fn dump_window(&self) {
        for &i in &self.window {
            if let Some(e) = self.catalog.entry_at(i) {
                log::debug!(
                    "{} {} {} status {:?}{}",
                    i,
                    e.path(),
                    if e.is_resident() { "has image" } else { "no image" },
                    e.status(),
                    if Some(i) == self.current { " <=" } else { "" }
                );
            }
        }
    }
}
