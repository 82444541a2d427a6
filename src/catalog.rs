use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::fs;
use std::ops::BitOr;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use crate::loader::DecodedImage;

// ---------------------------------------------------------------------------
// Entry identity and status
// ---------------------------------------------------------------------------

/// Stable identity of a catalog entry; survives every insert, remove and
/// reorder. Used as the work queue token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryStatus(u8);

impl EntryStatus {
    pub const NONE: EntryStatus = EntryStatus(0);
    pub const LOADING: EntryStatus = EntryStatus(0x01);
    pub const LOADED: EntryStatus = EntryStatus(0x02);
    /// Never retried.
    pub const FAILED: EntryStatus = EntryStatus(0x04);
    /// The display layer has shown the failure.
    pub const SEEN: EntryStatus = EntryStatus(0x08);
    /// Bytes came from a one-shot fetch; never evicted.
    pub const NETWORK: EntryStatus = EntryStatus(0x10);

    pub fn contains(self, other: EntryStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: EntryStatus) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: EntryStatus) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: EntryStatus) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EntryStatus {
    type Output = EntryStatus;

    fn bitor(self, rhs: EntryStatus) -> EntryStatus {
        EntryStatus(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Sort orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SortOrder {
    /// Discovery order.
    #[default]
    None,
    Alphabetical,
    Natural,
    /// Largest file first.
    Size,
    /// Newest file first.
    CreationDate,
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Run {
    Digits(String),
    Text(String),
}

impl Run {
    fn text(&self) -> &str {
        match self {
            Run::Digits(s) | Run::Text(s) => s,
        }
    }
}

/// Split into alternating runs of ASCII digits and everything else.
fn natural_runs(s: &str) -> Vec<Run> {
    let mut runs = Vec::new();
    let mut current = String::new();
    let mut digits = false;
    for c in s.chars() {
        let is_digit = c.is_ascii_digit();
        if !current.is_empty() && is_digit != digits {
            let done = std::mem::take(&mut current);
            runs.push(if digits { Run::Digits(done) } else { Run::Text(done) });
        }
        digits = is_digit;
        current.push(c);
    }
    if !current.is_empty() {
        runs.push(if digits { Run::Digits(current) } else { Run::Text(current) });
    }
    runs
}

/// Numeric comparison of two digit strings of any length.
fn cmp_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn cmp_runs(left: &[Run], right: &[Run]) -> Ordering {
    for (l, r) in left.iter().zip(right) {
        let ord = match (l, r) {
            (Run::Digits(a), Run::Digits(b)) => cmp_digits(a, b),
            _ => l.text().cmp(r.text()),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

/// Natural order: digit runs compare numerically, other runs
/// lexicographically, and a run sequence that is a prefix of the other
/// sorts first.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    cmp_runs(&natural_runs(a), &natural_runs(b))
}

// ---------------------------------------------------------------------------
// Catalog entries
// ---------------------------------------------------------------------------

pub struct CatalogEntry {
    id: EntryId,
    path: String,
    decoded: Option<Arc<DecodedImage>>,
    pub rotation: u16,
    status: EntryStatus,

    // Sort keys, looked up once: files do not change during a session.
    runs: OnceLock<Vec<Run>>,
    file_size: OnceLock<u64>,
    created: OnceLock<Option<DateTime<Utc>>>,
}

impl CatalogEntry {
    fn new(id: EntryId, path: String) -> Self {
        Self {
            id,
            path,
            decoded: None,
            rotation: 0,
            status: EntryStatus::NONE,
            runs: OnceLock::new(),
            file_size: OnceLock::new(),
            created: OnceLock::new(),
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Path on disk, or the URI of a network entry.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn as_path(&self) -> &Path {
        Path::new(&self.path)
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn status_mut(&mut self) -> &mut EntryStatus {
        &mut self.status
    }

    pub fn is_network(&self) -> bool {
        self.status.contains(EntryStatus::NETWORK)
    }

    pub fn is_failed(&self) -> bool {
        self.status.contains(EntryStatus::FAILED)
    }

    pub fn is_loading(&self) -> bool {
        self.status.contains(EntryStatus::LOADING)
    }

    pub fn decoded(&self) -> Option<&Arc<DecodedImage>> {
        self.decoded.as_ref()
    }

    pub fn decoded_mut(&mut self) -> Option<&mut Arc<DecodedImage>> {
        self.decoded.as_mut()
    }

    pub fn is_resident(&self) -> bool {
        self.decoded.is_some()
    }

    /// Store a decoded image. Returns true if the entry was not resident
    /// before.
    pub fn set_image(&mut self, image: DecodedImage) -> bool {
        let was_empty = self.decoded.is_none();
        self.decoded = Some(Arc::new(image));
        self.status.insert(EntryStatus::LOADED);
        was_empty
    }

    /// Drop the decoded image. Returns true if there was one.
    pub fn clear_image(&mut self) -> bool {
        self.status.remove(EntryStatus::LOADED);
        self.decoded.take().is_some()
    }

    fn runs(&self) -> &[Run] {
        self.runs.get_or_init(|| natural_runs(&self.path))
    }

    pub fn file_size(&self) -> u64 {
        *self
            .file_size
            .get_or_init(|| fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0))
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        *self.created.get_or_init(|| {
            fs::metadata(&self.path)
                .and_then(|m| m.created().or_else(|_| m.modified()))
                .ok()
                .map(DateTime::<Utc>::from)
        })
    }

    fn warm_key(&self, order: SortOrder) {
        match order {
            SortOrder::Natural => {
                self.runs();
            }
            SortOrder::Size => {
                self.file_size();
            }
            SortOrder::CreationDate => {
                self.created();
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for CatalogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogEntry")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("resident", &self.decoded.is_some())
            .field("rotation", &self.rotation)
            .field("status", &self.status)
            .finish()
    }
}

fn compare(order: SortOrder, a: &CatalogEntry, b: &CatalogEntry) -> Ordering {
    match order {
        SortOrder::Alphabetical => a.path.cmp(&b.path),
        SortOrder::Natural => cmp_runs(a.runs(), b.runs()),
        SortOrder::Size => b.file_size().cmp(&a.file_size()),
        SortOrder::CreationDate => b.created().cmp(&a.created()),
        // Ids are handed out in discovery order.
        SortOrder::None | SortOrder::Random => a.id.cmp(&b.id),
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Ordered sequence of entries; owns their lifetime.
#[derive(Debug, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    sort: SortOrder,
    next_id: u64,
}

impl Catalog {
    pub fn new(sort: SortOrder) -> Self {
        Self {
            sort,
            ..Default::default()
        }
    }

    pub fn sort_order(&self) -> SortOrder {
        self.sort
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_at(&self, index: usize) -> Option<&CatalogEntry> {
        self.entries.get(index)
    }

    pub fn entry_at_mut(&mut self, index: usize) -> Option<&mut CatalogEntry> {
        self.entries.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CatalogEntry> {
        self.entries.iter_mut()
    }

    pub fn index_of(&self, id: EntryId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Allocate a fresh entry. It is not part of the catalog until
    /// [`Catalog::insert`] is called.
    pub fn new_entry(&mut self, path: impl Into<String>) -> CatalogEntry {
        self.next_id += 1;
        CatalogEntry::new(EntryId(self.next_id), path.into())
    }

    fn insertion_point(&self, entry: &CatalogEntry) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        match self.sort {
            SortOrder::None => self.entries.len(),
            // Never the tail: the new entry always lands before an existing one.
            SortOrder::Random => rand::rng().random_range(0..self.entries.len()),
            order => self
                .entries
                .partition_point(|e| compare(order, e, entry) == Ordering::Less),
        }
    }

    /// Insert at the position the active order dictates (lower bound:
    /// before entries that compare equal). Returns the new index.
    pub fn insert(&mut self, entry: CatalogEntry) -> usize {
        let index = self.insertion_point(&entry);
        self.entries.insert(index, entry);
        index
    }

    pub fn remove(&mut self, id: EntryId) -> Option<(usize, CatalogEntry)> {
        let index = self.index_of(id)?;
        Some((index, self.entries.remove(index)))
    }

    pub fn remove_at(&mut self, index: usize) -> Option<CatalogEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    /// Switch to `order` and re-sort everything. Returns `moved` such that
    /// the entry previously at `i` is now at `moved[i]`.
    pub fn reorder(&mut self, order: SortOrder) -> Vec<usize> {
        self.sort = order;
        let n = self.entries.len();

        // Stat calls dominate; do them in parallel before the sequential sort.
        self.entries.par_iter().for_each(|e| e.warm_key(order));

        let mut by_new: Vec<usize> = (0..n).collect();
        match order {
            SortOrder::Random => by_new.shuffle(&mut rand::rng()),
            _ => by_new.sort_by(|&a, &b| compare(order, &self.entries[a], &self.entries[b])),
        }

        let mut moved = vec![0; n];
        for (new, &old) in by_new.iter().enumerate() {
            moved[old] = new;
        }

        let mut slots: Vec<Option<CatalogEntry>> = self.entries.drain(..).map(Some).collect();
        self.entries = by_new
            .iter()
            .filter_map(|&old| slots[old].take())
            .collect();
        moved
    }
}
