use crate::thumbs::Side;

/// Notifications from the core to the Controller, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    /// Decoded image at `index` changed, failed or was evicted.
    EntryUpdated(usize),
    /// The resident set changed.
    WindowChanged,
    /// `delta` entries appeared (+) or vanished (-) at `index`; any index
    /// the Controller holds that is >= `index` must be shifted.
    CatalogChanged { index: usize, delta: isize },
    /// Whole catalog was re-sorted; held indices are meaningless.
    CatalogReordered,
    CurrentChanged { old: Option<usize>, new: Option<usize> },
    ThumbnailUpdated(Side),
}
