use std::time::Duration;

use crate::catalog::SortOrder;

/// Viewer-wide options. Owned by the [`crate::navigator::Navigator`]; its
/// setters are the only write path once a session is running.
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// Upper bound on decoded images held in memory (network entries are
    /// not counted).
    pub max_resident: usize,
    /// Decode to fit the viewport instead of at natural size.
    pub auto_zoom: bool,
    /// Drop entries that fail to load instead of keeping a placeholder.
    pub ignore_failed: bool,
    /// Nearest-neighbour scaling after a full decode.
    pub no_smooth_scale: bool,
    pub sort: SortOrder,
    pub viewport: Option<(u32, u32)>,
    pub display_thumbnails: bool,
    pub thumb_min_width: u32,
    pub worker_threads: usize,
    pub index_commit_delay: Duration,
    pub index_clear_delay: Duration,
    pub slideshow_interval: Duration,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            max_resident: 30,
            auto_zoom: true,
            ignore_failed: false,
            no_smooth_scale: false,
            sort: SortOrder::None,
            viewport: None,
            display_thumbnails: true,
            thumb_min_width: 50,
            worker_threads: 1,
            index_commit_delay: Duration::from_millis(300),
            index_clear_delay: Duration::from_millis(2000),
            slideshow_interval: Duration::from_secs(3),
        }
    }
}

impl ViewerConfig {
    /// Box handed to the decoder, if decodes should be scaled at all.
    pub fn target_size(&self) -> Option<(u32, u32)> {
        if self.auto_zoom { self.viewport } else { None }
    }
}
