use crossbeam_channel::Sender;
use image::ImageReader;
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tga", "tiff", "tif", "webp", "ico", "pnm", "pbm",
    "pgm", "ppm", "pam", "dds", "hdr", "exr", "ff", "qoi",
];

/// Path that stands for standard input in file lists and on the command line.
pub const STDIN_PATH: &str = "-";

/// Entries between two checks of the abort flag.
const ABORT_CHECK_INTERVAL: usize = 10;

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Whether the content of `path` looks like a format the decoder knows,
/// whatever its name.
pub fn sniff_image_file(path: &Path) -> bool {
    // `ImageReader::open` would fall back to the extension.
    fs::File::open(path)
        .and_then(|f| ImageReader::new(io::BufReader::new(f)).with_guessed_format())
        .is_ok_and(|r| r.format().is_some())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found(PathBuf),
    /// Last event of a scan; `count` is the number of `Found` events sent.
    Finished { count: usize },
}

// ---------------------------------------------------------------------------
// Admission filter
// ---------------------------------------------------------------------------

/// Decides which discovered files make it into the catalog.
#[derive(Debug, Clone, Default)]
pub struct Admission {
    matching: Option<Regex>,
    ignoring: Option<Regex>,
    /// Inclusive bounds in KiB.
    min_kib: Option<u64>,
    max_kib: Option<u64>,
    /// Judge files by content instead of extension.
    detect_filetype: bool,
}

impl Admission {
    pub fn new(
        matching: Option<&str>,
        ignoring: Option<&str>,
        case_insensitive: bool,
        min_kib: Option<u64>,
        max_kib: Option<u64>,
    ) -> Result<Self, regex::Error> {
        let build = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(case_insensitive)
                .build()
        };
        Ok(Self {
            matching: matching.map(build).transpose()?,
            ignoring: ignoring.map(build).transpose()?,
            min_kib,
            max_kib,
            detect_filetype: false,
        })
    }

    pub fn with_detect_filetype(mut self, on: bool) -> Self {
        self.detect_filetype = on;
        self
    }

    fn is_candidate(&self, path: &Path) -> bool {
        if self.detect_filetype {
            sniff_image_file(path)
        } else {
            is_image_file(path)
        }
    }

    /// Patterns are searched anywhere in the full path.
    pub fn admits(&self, path: &Path) -> bool {
        let name = path.to_string_lossy();
        if self.matching.as_ref().is_some_and(|re| !re.is_match(&name)) {
            return false;
        }
        if self.ignoring.as_ref().is_some_and(|re| re.is_match(&name)) {
            return false;
        }
        if !self.is_candidate(path) {
            return false;
        }
        if self.min_kib.is_none() && self.max_kib.is_none() {
            return true;
        }
        let Ok(meta) = fs::metadata(path) else {
            return false;
        };
        let len = meta.len();
        self.min_kib.is_none_or(|min| len >= min.saturating_mul(1024))
            && self.max_kib.is_none_or(|max| len <= max.saturating_mul(1024))
    }
}

// ---------------------------------------------------------------------------
// Background scanner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub recursive: bool,
    pub follow_links: bool,
    /// Text file listing one path per line; `-` reads standard input.
    pub file_list: Option<PathBuf>,
}

/// Running scan thread. Dropping the handle does not stop it; call
/// [`Scanner::abort`].
pub struct Scanner {
    abort: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Scanner {
    pub fn abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Walk<'a> {
    options: &'a ScanOptions,
    admission: &'a Admission,
    tx: &'a Sender<DiscoveryEvent>,
    abort: &'a AtomicBool,
    seen: usize,
    count: usize,
    /// Canonical forms of the directories walked so far.
    visited: HashSet<PathBuf>,
}

impl Walk<'_> {
    /// False once the scan should stop (aborted or nobody listening).
    fn tick(&mut self) -> bool {
        self.seen += 1;
        !(self.seen % ABORT_CHECK_INTERVAL == 0 && self.abort.load(Ordering::Relaxed))
    }

    fn emit(&mut self, path: PathBuf) -> bool {
        if !self.admission.admits(&path) {
            return true;
        }
        if self.tx.send(DiscoveryEvent::Found(path)).is_err() {
            return false;
        }
        self.count += 1;
        true
    }

    fn skip_link(&self, path: &Path) -> bool {
        !self.options.follow_links
            && fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
    }

    fn path(&mut self, path: PathBuf) -> bool {
        if path.as_os_str() == STDIN_PATH {
            return self.lines(io::stdin().lock());
        }
        if self.skip_link(&path) {
            return true;
        }
        if path.is_dir() {
            self.dir(&path)
        } else if path.is_file() {
            self.tick() && self.emit(path)
        } else {
            true
        }
    }

    fn dir(&mut self, dir: &Path) -> bool {
        // Symlinked directories can lead back to an ancestor.
        let canonical = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        if !self.visited.insert(canonical) {
            log::debug!("skipping {}: already scanned", dir.display());
            return true;
        }
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("cannot read {}: {}", dir.display(), e);
                return true;
            }
        };
        let mut files = Vec::new();
        let mut subdirs = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let Ok(ft) = entry.file_type() else { continue };
            if ft.is_symlink() && !self.options.follow_links {
                continue;
            }
            let p = entry.path();
            if p.is_file() {
                files.push(p);
            } else if self.options.recursive && p.is_dir() {
                subdirs.push(p);
            }
        }

        files.sort();
        let before = self.count;
        for p in files {
            if !(self.tick() && self.emit(p)) {
                return false;
            }
        }
        if self.count > before {
            log::info!("Scanning {:?}... (total {} images)", dir, self.count);
        }

        subdirs.sort();
        for sub in subdirs {
            if !self.dir(&sub) {
                return false;
            }
        }
        true
    }

    fn list(&mut self, list: &Path) -> bool {
        if list.as_os_str() == STDIN_PATH {
            return self.lines(io::stdin().lock());
        }
        match fs::File::open(list) {
            Ok(file) => self.lines(io::BufReader::new(file)),
            Err(e) => {
                log::warn!("cannot open file list {}: {}", list.display(), e);
                true
            }
        }
    }

    fn lines(&mut self, reader: impl BufRead) -> bool {
        for line in reader.lines().map_while(Result::ok) {
            let trimmed = line.trim();
            if !trimmed.is_empty() && !self.path(PathBuf::from(trimmed)) {
                return false;
            }
        }
        true
    }
}

/// Walk `paths` on a background thread, sending a `Found` event for every
/// admitted file and a final `Finished`. Files inside one directory come out
/// sorted by name.
pub fn spawn_file_scanner(
    paths: Vec<PathBuf>,
    options: ScanOptions,
    admission: Admission,
    tx: Sender<DiscoveryEvent>,
) -> Scanner {
    let abort = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&abort);
    let handle = thread::spawn(move || {
        log::info!("Starting background image scan...");
        let start_time = Instant::now();
        let mut walk = Walk {
            options: &options,
            admission: &admission,
            tx: &tx,
            abort: &flag,
            seen: 0,
            count: 0,
            visited: HashSet::new(),
        };

        let mut running = match &options.file_list {
            Some(list) => walk.list(list),
            None => true,
        };
        for path in paths {
            if !running {
                break;
            }
            running = walk.path(path);
        }

        let count = walk.count;
        let _ = tx.send(DiscoveryEvent::Finished { count });
        log::info!(
            "Scan {} in {:.2}s. Found {} images.",
            if running { "complete" } else { "aborted" },
            start_time.elapsed().as_secs_f64(),
            count
        );
    });
    Scanner {
        abort,
        handle: Some(handle),
    }
}
