use crossbeam_channel::{Receiver, Sender, unbounded};
use image::RgbaImage;
use image::imageops::FilterType;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::catalog::EntryId;
use crate::loader::DecodedImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Cursor offset of the neighbour shown on this side.
    pub fn offset(self) -> isize {
        match self {
            Side::Left => -1,
            Side::Right => 1,
        }
    }
}

#[derive(Debug)]
pub struct ThumbCompletion {
    pub side: Side,
    ticket: u64,
    pub image: RgbaImage,
}

struct Pending {
    ticket: u64,
    width: u32,
    neighbor: EntryId,
}

#[derive(Default)]
struct ThumbInfo {
    image: Option<RgbaImage>,
    pending: Option<Pending>,
}

pub fn scale_to_width(img: &RgbaImage, width: u32) -> RgbaImage {
    let (w, h) = img.dimensions();
    let width = width.max(1);
    let height = ((h as u64 * width as u64 + w as u64 / 2) / w.max(1) as u64).max(1) as u32;
    image::imageops::resize(img, width, height, FilterType::Triangle)
}

/// Side thumbnails of the current image, each computed by a one-shot
/// background task. At most one task per side is considered live.
pub struct ThumbWorker {
    left: ThumbInfo,
    right: ThumbInfo,
    next_ticket: u64,
    tx: Sender<ThumbCompletion>,
    rx: Receiver<ThumbCompletion>,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for ThumbWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl ThumbWorker {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            left: ThumbInfo::default(),
            right: ThumbInfo::default(),
            next_ticket: 0,
            tx,
            rx,
            tasks: Vec::new(),
        }
    }

    fn info(&self, side: Side) -> &ThumbInfo {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn info_mut(&mut self, side: Side) -> &mut ThumbInfo {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    pub fn thumbnail(&self, side: Side) -> Option<&RgbaImage> {
        self.info(side).image.as_ref()
    }

    pub fn requested_width(&self, side: Side) -> Option<u32> {
        self.info(side).pending.as_ref().map(|p| p.width)
    }

    /// Forget cached thumbnails and outstanding requests; results of tasks
    /// still running will be ignored.
    pub fn reset(&mut self) {
        self.left = ThumbInfo::default();
        self.right = ThumbInfo::default();
    }

    /// Start scaling `source` to `width` for `side` unless the cached
    /// thumbnail already has that width or a task for that width is
    /// running. Returns whether a task was started.
    pub fn request(
        &mut self,
        side: Side,
        neighbor: EntryId,
        source: Arc<DecodedImage>,
        width: u32,
    ) -> bool {
        let info = self.info(side);
        if info.image.as_ref().is_some_and(|img| img.width() == width) {
            return false;
        }
        if info.pending.as_ref().is_some_and(|p| p.width == width) {
            return false;
        }

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.info_mut(side).pending = Some(Pending {
            ticket,
            width,
            neighbor,
        });

        self.reap();
        let tx = self.tx.clone();
        self.tasks.push(thread::spawn(move || {
            let image = scale_to_width(&source.pixels, width);
            let _ = tx.send(ThumbCompletion {
                side,
                ticket,
                image,
            });
        }));
        true
    }

    /// Results that arrived since the last call, not yet validated.
    pub fn drain(&self) -> Vec<ThumbCompletion> {
        self.rx.try_iter().collect()
    }

    /// Accept `done` if it answers the latest request for its side and the
    /// neighbour on that side is still `neighbor`.
    pub fn complete(&mut self, done: ThumbCompletion, neighbor: Option<EntryId>) -> bool {
        let info = self.info_mut(done.side);
        let live = info
            .pending
            .as_ref()
            .is_some_and(|p| p.ticket == done.ticket && Some(p.neighbor) == neighbor);
        if !live {
            log::debug!("[thumb] stale {:?} thumbnail dropped", done.side);
            return false;
        }
        info.image = Some(done.image);
        info.pending = None;
        true
    }

    fn reap(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.tasks.drain(..).partition(|t| t.is_finished());
        self.tasks = running;
        for t in finished {
            let _ = t.join();
        }
    }

    pub fn shutdown(&mut self) {
        for t in self.tasks.drain(..) {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn decoded(w: u32, h: u32) -> Arc<DecodedImage> {
        Arc::new(DecodedImage {
            pixels: RgbaImage::new(w, h),
            natural_width: w,
            natural_height: h,
            file_size: 0,
            format_name: "PNG".into(),
        })
    }

    fn wait_one(worker: &ThumbWorker) -> ThumbCompletion {
        for _ in 0..500 {
            if let Some(c) = worker.drain().into_iter().next() {
                return c;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("thumbnail task never finished");
    }

    #[test]
    fn scale_keeps_aspect() {
        let img = RgbaImage::new(200, 100);
        assert_eq!(scale_to_width(&img, 50).dimensions(), (50, 25));
        assert_eq!(scale_to_width(&RgbaImage::new(300, 1), 10).dimensions(), (10, 1));
    }

    #[test]
    fn completion_updates_side() {
        let mut w = ThumbWorker::new();
        assert!(w.request(Side::Right, EntryId(7), decoded(200, 100), 40));
        assert_eq!(w.requested_width(Side::Right), Some(40));
        let done = wait_one(&w);
        assert!(w.complete(done, Some(EntryId(7))));
        assert_eq!(w.thumbnail(Side::Right).unwrap().dimensions(), (40, 20));
        assert!(w.thumbnail(Side::Left).is_none());

        // Same width again: nothing to do.
        assert!(!w.request(Side::Right, EntryId(7), decoded(200, 100), 40));
        w.shutdown();
    }

    #[test]
    fn same_width_request_does_not_queue() {
        let mut w = ThumbWorker::new();
        assert!(w.request(Side::Left, EntryId(1), decoded(100, 100), 30));
        assert!(!w.request(Side::Left, EntryId(1), decoded(100, 100), 30));
        w.shutdown();
    }

    #[test]
    fn new_width_supersedes_old_request() {
        let mut w = ThumbWorker::new();
        assert!(w.request(Side::Left, EntryId(1), decoded(100, 100), 30));
        assert!(w.request(Side::Left, EntryId(1), decoded(100, 100), 60));
        w.shutdown();

        let mut results = w.drain();
        assert_eq!(results.len(), 2);
        results.sort_by_key(|c| c.image.width());
        let newer = results.pop().unwrap();
        let older = results.pop().unwrap();
        assert!(!w.complete(older, Some(EntryId(1))));
        assert!(w.complete(newer, Some(EntryId(1))));
        assert_eq!(w.thumbnail(Side::Left).unwrap().width(), 60);
    }

    #[test]
    fn moved_neighbor_makes_result_stale() {
        let mut w = ThumbWorker::new();
        assert!(w.request(Side::Right, EntryId(3), decoded(100, 50), 20));
        let done = wait_one(&w);
        assert!(!w.complete(done, Some(EntryId(4))));
        assert!(w.thumbnail(Side::Right).is_none());

        assert!(w.request(Side::Right, EntryId(4), decoded(100, 50), 20));
        w.reset();
        let done = wait_one(&w);
        assert!(!w.complete(done, Some(EntryId(4))));
    }
}
