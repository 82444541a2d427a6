use crossbeam_channel::Sender;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader, RgbaImage};
use std::fs;
use std::io::{BufRead, BufReader, Cursor, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::catalog::EntryId;
use crate::error::LoadError;
use crate::queue::{WorkItem, WorkQueue};

// ---------------------------------------------------------------------------
// Decoded image data
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DecodedImage {
    pub pixels: RgbaImage,
    /// Size of the source at full resolution, in the displayed orientation.
    pub natural_width: u32,
    pub natural_height: u32,
    pub file_size: u64,
    pub format_name: String,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    /// Rotates the buffer in place by a multiple of 90 degrees (clockwise).
    pub fn rotate(&mut self, degrees: u16) {
        self.pixels = match degrees % 360 {
            90 => image::imageops::rotate90(&self.pixels),
            180 => image::imageops::rotate180(&self.pixels),
            270 => image::imageops::rotate270(&self.pixels),
            _ => return,
        };
        if degrees % 180 == 90 {
            std::mem::swap(&mut self.natural_width, &mut self.natural_height);
        }
    }
}

impl std::fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedImage")
            .field("size", &self.dimensions())
            .field("natural", &(self.natural_width, self.natural_height))
            .field("format", &self.format_name)
            .finish()
    }
}

/// Largest size with the same aspect ratio as `(w, h)` that fits in
/// `(max_w, max_h)`. Never scales up.
pub fn fit_within(w: u32, h: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if w == 0 || h == 0 || max_w == 0 || max_h == 0 {
        return (w, h);
    }
    let scale = (max_w as f64 / w as f64).min(max_h as f64 / h as f64);
    if scale >= 1.0 {
        return (w, h);
    }
    let fw = ((w as f64 * scale).round() as u32).clamp(1, max_w);
    let fh = ((h as f64 * scale).round() as u32).clamp(1, max_h);
    (fw, fh)
}

/// Clockwise rotation requested by the EXIF orientation tag, 0 if absent.
fn exif_rotation<R: BufRead + Seek>(reader: &mut R) -> u16 {
    let Ok(exif) = exif::Reader::new().read_from_container(reader) else {
        return 0;
    };
    match exif
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
    {
        Some(6) => 90,
        Some(3) => 180,
        Some(8) => 270,
        _ => 0,
    }
}

fn format_label(path: &Path, reader_format: Option<image::ImageFormat>) -> String {
    reader_format
        .and_then(|f| f.extensions_str().first().copied())
        .or_else(|| path.extension().and_then(|e| e.to_str()))
        .unwrap_or("unknown")
        .to_uppercase()
}

/// Scale-to-fit and rotate a freshly decoded image.
///
/// With `no_smooth_scale` the image is resized with nearest-neighbour
/// sampling after a full-resolution decode; otherwise the faster
/// area-averaging thumbnail path is used.
fn finish(
    img: DynamicImage,
    target_size: Option<(u32, u32)>,
    rotation: u16,
    no_smooth_scale: bool,
    file_size: u64,
    format_name: String,
) -> DecodedImage {
    let (w, h) = img.dimensions();
    let quarter = rotation % 180 == 90;

    let scaled = match target_size {
        Some((tw, th)) => {
            let (tw, th) = if quarter { (th, tw) } else { (tw, th) };
            let (fw, fh) = fit_within(w, h, tw, th);
            if (fw, fh) == (w, h) {
                img
            } else if no_smooth_scale {
                img.resize_exact(fw, fh, FilterType::Nearest)
            } else {
                img.thumbnail_exact(fw, fh)
            }
        }
        None => img,
    };

    let mut decoded = DecodedImage {
        pixels: scaled.to_rgba8(),
        natural_width: w,
        natural_height: h,
        file_size,
        format_name,
    };
    decoded.rotate(rotation);
    decoded
}

/// Decode `path`, honouring the EXIF orientation plus `rotation`.
pub fn decode_image(
    path: &Path,
    target_size: Option<(u32, u32)>,
    rotation: u16,
    no_smooth_scale: bool,
) -> Result<DecodedImage, LoadError> {
    let unavailable = |source| LoadError::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    };

    let file_size = fs::metadata(path).map_err(unavailable)?.len();
    let exif = fs::File::open(path)
        .map(|f| exif_rotation(&mut BufReader::new(f)))
        .unwrap_or(0);

    let reader = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(unavailable)?;
    let format_name = format_label(path, reader.format());
    let img = reader
        .decode()
        .map_err(|e| LoadError::from_image(path.to_path_buf(), e))?;

    Ok(finish(
        img,
        target_size,
        (exif + rotation) % 360,
        no_smooth_scale,
        file_size,
        format_name,
    ))
}

/// Decode an in-memory blob (a finished network fetch) exactly like a file.
pub fn decode_bytes(
    uri: &str,
    bytes: &[u8],
    target_size: Option<(u32, u32)>,
    no_smooth_scale: bool,
) -> Result<DecodedImage, LoadError> {
    let origin = PathBuf::from(uri);
    let exif = exif_rotation(&mut Cursor::new(bytes));
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|source| LoadError::SourceUnavailable {
            path: origin.clone(),
            source,
        })?;
    let format_name = format_label(&origin, reader.format());
    let img = reader
        .decode()
        .map_err(|e| LoadError::from_image(origin, e))?;
    Ok(finish(
        img,
        target_size,
        exif,
        no_smooth_scale,
        bytes.len() as u64,
        format_name,
    ))
}

// ---------------------------------------------------------------------------
// Completion messages (worker -> owner)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Completion {
    pub token: EntryId,
    pub result: Result<DecodedImage, LoadError>,
}

// ---------------------------------------------------------------------------
// Background decode workers
// ---------------------------------------------------------------------------

fn process(item: &WorkItem) -> Result<DecodedImage, LoadError> {
    decode_image(
        &item.path,
        item.target_size,
        item.rotation,
        item.no_smooth_scale,
    )
}

/// Long-lived loader threads draining a shared [`WorkQueue`].
pub struct LoaderPool {
    queue: Arc<WorkQueue>,
    workers: Vec<JoinHandle<()>>,
}

pub fn spawn_decode_workers(
    queue: Arc<WorkQueue>,
    completions: Sender<Completion>,
    num_threads: usize,
) -> LoaderPool {
    let workers = (0..num_threads.max(1))
        .map(|n| {
            let queue = Arc::clone(&queue);
            let completions = completions.clone();
            thread::spawn(move || {
                log::debug!("[loader {}] started", n);
                while let Some(item) = queue.pop() {
                    let result = process(&item);
                    if let Err(ref e) = result {
                        log::debug!("[loader {}] {}", n, e);
                    }
                    let done = Completion {
                        token: item.token,
                        result,
                    };
                    if completions.send(done).is_err() {
                        // Owner is gone; nobody will read further results.
                        break;
                    }
                }
                log::debug!("[loader {}] exiting", n);
            })
        })
        .collect();

    LoaderPool { queue, workers }
}

impl LoaderPool {
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Abort the queue, drop what is still pending and join every worker.
    /// In-flight decodes run to completion first.
    pub fn shutdown(&mut self) {
        self.queue.abort();
        let dropped = self.queue.clear();
        if dropped > 0 {
            log::debug!("dropped {} pending load requests", dropped);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("loader thread panicked");
            }
        }
    }
}

impl Drop for LoaderPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Priority;
    use crate::test_support::{fixture_dir, png_bytes, write_png};
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    #[test]
    fn fit_within_keeps_aspect_and_never_upscales() {
        assert_eq!(fit_within(400, 200, 100, 100), (100, 50));
        assert_eq!(fit_within(200, 400, 100, 100), (50, 100));
        assert_eq!(fit_within(50, 20, 100, 100), (50, 20));
        assert_eq!(fit_within(1000, 1, 10, 10), (10, 1));
    }

    #[test]
    fn decode_scales_to_target() {
        let dir = fixture_dir("loader_scale");
        let path = write_png(&dir, "wide.png", 400, 200);

        let img = decode_image(&path, Some((100, 100)), 0, false).unwrap();
        assert_eq!(img.dimensions(), (100, 50));
        assert_eq!((img.natural_width, img.natural_height), (400, 200));
        assert_eq!(img.format_name, "PNG");

        let img = decode_image(&path, Some((100, 100)), 0, true).unwrap();
        assert_eq!(img.dimensions(), (100, 50));

        let img = decode_image(&path, None, 0, false).unwrap();
        assert_eq!(img.dimensions(), (400, 200));
    }

    #[test]
    fn quarter_rotation_swaps_dimensions() {
        let dir = fixture_dir("loader_rotate");
        let path = write_png(&dir, "wide.png", 400, 200);

        let img = decode_image(&path, Some((100, 100)), 90, false).unwrap();
        assert_eq!(img.dimensions(), (50, 100));
        assert_eq!((img.natural_width, img.natural_height), (200, 400));

        let img = decode_image(&path, None, 180, false).unwrap();
        assert_eq!(img.dimensions(), (400, 200));
    }

    #[test]
    fn missing_and_corrupt_sources_fail() {
        let dir = fixture_dir("loader_fail");
        let missing = dir.join("missing.png");
        assert!(matches!(
            decode_image(&missing, None, 0, false),
            Err(LoadError::SourceUnavailable { .. })
        ));

        let corrupt = dir.join("corrupt.png");
        fs::write(&corrupt, b"this is not an image at all").unwrap();
        assert!(matches!(
            decode_image(&corrupt, None, 0, false),
            Err(LoadError::Decode { .. })
        ));
    }

    #[test]
    fn decode_bytes_matches_file_decode() {
        let bytes = png_bytes(64, 32);
        let img = decode_bytes("http://example.org/x.png", &bytes, Some((32, 32)), false).unwrap();
        assert_eq!(img.dimensions(), (32, 16));
        assert_eq!(img.file_size, bytes.len() as u64);

        assert!(decode_bytes("http://example.org/y", b"garbage", None, false).is_err());
    }

    #[test]
    fn workers_report_success_and_failure() {
        let dir = fixture_dir("loader_pool");
        let good = write_png(&dir, "good.png", 20, 10);
        let bad = dir.join("bad.png");

        let queue = Arc::new(WorkQueue::new());
        let (tx, rx) = unbounded();
        let mut pool = spawn_decode_workers(Arc::clone(&queue), tx, 2);
        assert_eq!(pool.worker_count(), 2);

        queue
            .push(WorkItem::new(EntryId(1), good, Priority::Normal, None, 0, false))
            .unwrap();
        queue
            .push(WorkItem::new(EntryId(2), bad, Priority::Normal, None, 0, false))
            .unwrap();

        let mut got = Vec::new();
        for _ in 0..2 {
            let c = rx.recv_timeout(Duration::from_secs(10)).unwrap();
            got.push((c.token, c.result.is_ok()));
        }
        got.sort_by_key(|(t, _)| *t);
        assert_eq!(got, vec![(EntryId(1), true), (EntryId(2), false)]);

        pool.shutdown();
        assert!(queue.is_aborted());
    }
}
