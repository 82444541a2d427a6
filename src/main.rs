use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pv::cli::{Cli, default_max_resident, default_memory_budget, parse_memory_budget};
use pv::config::ViewerConfig;
use pv::events::CoreEvent;
use pv::files::{Admission, DiscoveryEvent, ScanOptions, spawn_file_scanner};
use pv::loader::spawn_decode_workers;
use pv::navigator::Navigator;
use pv::queue::WorkQueue;

const LOAD_TIMEOUT: Duration = Duration::from_secs(10);
const THUMB_WIDTH: u32 = 120;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let max_resident = cli.max_resident.unwrap_or_else(|| {
        let budget = match &cli.memory {
            Some(s) => parse_memory_budget(s),
            None => default_memory_budget(),
        };
        default_max_resident(budget)
    });

    let admission = match Admission::new(
        cli.match_pattern.as_deref(),
        cli.ignore_pattern.as_deref(),
        cli.ignore_case,
        cli.min_size,
        cli.max_size,
    ) {
        Ok(a) => a.with_detect_filetype(cli.detect_filetype),
        Err(e) => {
            log::error!("invalid pattern: {}", e);
            return;
        }
    };

    let defaults = ViewerConfig::default();
    let config = ViewerConfig {
        max_resident,
        auto_zoom: !cli.no_autozoom,
        ignore_failed: cli.ignore_failed,
        no_smooth_scale: cli.no_smooth_scale,
        sort: cli.sort,
        viewport: cli.viewport,
        worker_threads: cli.threads.max(1),
        slideshow_interval: cli
            .interval
            .map(Duration::from_millis)
            .unwrap_or(defaults.slideshow_interval),
        ..defaults
    };
    log::info!(
        "max {} resident images, {} loader thread(s)",
        config.max_resident,
        config.worker_threads
    );

    let queue = Arc::new(WorkQueue::new());
    let (done_tx, done_rx) = unbounded();
    let (event_tx, event_rx) = unbounded();
    let mut pool = spawn_decode_workers(Arc::clone(&queue), done_tx, config.worker_threads);
    let mut nav = Navigator::new(config, Arc::clone(&queue), done_rx, event_tx);

    let (found_tx, found_rx) = unbounded();
    let options = ScanOptions {
        recursive: cli.recursive,
        follow_links: cli.follow_links,
        file_list: cli.file_list.clone(),
    };
    let mut scanner = spawn_file_scanner(cli.paths.clone(), options, admission, found_tx);

    // Admit files as they are discovered; the first one starts loading
    // right away.
    loop {
        match found_rx.recv_timeout(Duration::from_millis(20)) {
            Ok(DiscoveryEvent::Found(path)) => {
                nav.insert_path(path.to_string_lossy());
            }
            Ok(DiscoveryEvent::Finished { count }) => {
                log::info!("{} images admitted", count);
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        nav.pump();
        drain_events(&event_rx);
    }
    scanner.join();

    if nav.catalog().is_empty() {
        log::error!("No image files found.");
        pool.shutdown();
        return;
    }

    let interval = nav.config().slideshow_interval;
    for _ in 0..cli.steps {
        let shown_at = Instant::now();
        wait_for_current(&mut nav);
        report_current(&mut nav);
        nav.request_thumbnails(THUMB_WIDTH);
        nav.pump();
        drain_events(&event_rx);
        linger(&mut nav, &event_rx, shown_at + interval);
        if !nav.slideshow_step(&cli.search) {
            log::warn!("current image still loading, stopping");
            break;
        }
    }
    wait_for_current(&mut nav);
    report_current(&mut nav);
    nav.dump_window();

    nav.shutdown_thumbs();
    pool.shutdown();
    nav.pump();
    drain_events(&event_rx);
}

fn wait_for_current(nav: &mut Navigator) {
    while nav.current_entry().is_some_and(|e| e.is_loading()) {
        if !nav.wait_for_completion(LOAD_TIMEOUT) {
            log::warn!("gave up waiting for the current image");
            return;
        }
    }
}

/// Keep applying completions until `deadline`, so prefetching continues
/// while the current image is on screen.
fn linger(nav: &mut Navigator, events: &Receiver<CoreEvent>, deadline: Instant) {
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return;
        }
        nav.wait_for_completion(left);
        nav.pump();
        drain_events(events);
    }
}

fn report_current(nav: &mut Navigator) {
    let Some(index) = nav.current_index() else {
        return;
    };
    let count = nav.catalog().len();
    let Some(entry) = nav.current_entry() else {
        return;
    };
    match entry.decoded() {
        Some(img) => println!(
            "{}/{} {} {}x{} ({}x{} {}, {} bytes)",
            index + 1,
            count,
            entry.path(),
            img.width(),
            img.height(),
            img.natural_width,
            img.natural_height,
            img.format_name,
            img.file_size
        ),
        None if entry.is_failed() => {
            println!("{}/{} {} failed to load", index + 1, count, entry.path());
            nav.mark_seen(index);
        }
        None => println!("{}/{} {} not loaded", index + 1, count, entry.path()),
    }
    log::debug!(
        "{} resident, {} loading, {} queued",
        nav.resident_count(),
        nav.loading_count(),
        nav.pending()
    );
}

fn drain_events(events: &Receiver<CoreEvent>) {
    for event in events.try_iter() {
        log::trace!("[event] {:?}", event);
    }
}
