use clap::Parser;
use std::path::PathBuf;

use crate::catalog::SortOrder;

/// Average decoded image assumed when turning a memory budget into a
/// resident image count.
const AVERAGE_IMAGE_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "pv", about = "Prefetching image browser core (headless driver)")]
pub struct Cli {
    /// Files or directories to view; - reads paths from stdin
    #[arg(required_unless_present = "file_list")]
    pub paths: Vec<PathBuf>,

    /// Load file list from a text file (one path per line), or - for stdin
    #[arg(short = 'L', long, value_name = "FILE")]
    pub file_list: Option<PathBuf>,

    /// Recurse into subdirectories
    #[arg(short, long)]
    pub recursive: bool,

    /// Follow symbolic links (default: false)
    #[arg(long)]
    pub follow_links: bool,

    /// Catalog order
    #[arg(short, long, value_enum, default_value_t = SortOrder::None)]
    pub sort: SortOrder,

    /// Maximum number of decoded images kept in memory. Default: derived from --memory.
    #[arg(long, value_name = "N")]
    pub max_resident: Option<usize>,

    /// Memory budget for decoded images (e.g. 512MB, 2GB). Default: 10% of RAM.
    #[arg(short, long)]
    pub memory: Option<String>,

    /// Number of loader threads
    #[arg(short, long, default_value = "1")]
    pub threads: usize,

    /// Drop images that fail to load instead of keeping a placeholder
    #[arg(long)]
    pub ignore_failed: bool,

    /// Nearest-neighbour scaling
    #[arg(long)]
    pub no_smooth_scale: bool,

    /// Decode at natural size instead of fitting the viewport
    #[arg(long)]
    pub no_autozoom: bool,

    /// Viewport to fit images into, e.g. 1920x1080
    #[arg(long, value_name = "WxH", value_parser = parse_viewport)]
    pub viewport: Option<(u32, u32)>,

    /// Only admit paths matching this regex
    #[arg(long = "match", value_name = "REGEX")]
    pub match_pattern: Option<String>,

    /// Skip paths matching this regex
    #[arg(long = "ignore", value_name = "REGEX")]
    pub ignore_pattern: Option<String>,

    /// Make --match and --ignore case insensitive
    #[arg(short = 'i', long)]
    pub ignore_case: bool,

    /// Only admit files of at least this many KiB
    #[arg(long, value_name = "KIB")]
    pub min_size: Option<u64>,

    /// Only admit files of at most this many KiB
    #[arg(long, value_name = "KIB")]
    pub max_size: Option<u64>,

    /// Recognise images by content rather than file extension (slower)
    #[arg(long)]
    pub detect_filetype: bool,

    /// Milliseconds between slideshow steps. Default: 3000.
    #[arg(long, value_name = "MS")]
    pub interval: Option<u64>,

    /// Number of slideshow steps to walk before exiting
    #[arg(long, default_value = "10")]
    pub steps: usize,

    /// Slideshow jumps to the next path containing this text
    #[arg(long, value_name = "TEXT", default_value = "")]
    pub search: String,
}

pub fn parse_memory_budget(s: &str) -> u64 {
    let s = s.trim().to_uppercase();
    if let Some(num) = s.strip_suffix("GB") {
        (num.trim().parse::<f64>().unwrap_or(1.0) * 1024.0 * 1024.0 * 1024.0) as u64
    } else if let Some(num) = s.strip_suffix("MB") {
        (num.trim().parse::<f64>().unwrap_or(512.0) * 1024.0 * 1024.0) as u64
    } else {
        (s.parse::<f64>().unwrap_or(512.0) * 1024.0 * 1024.0) as u64
    }
}

pub fn default_memory_budget() -> u64 {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory() / 10
}

pub fn default_max_resident(budget: u64) -> usize {
    (budget / AVERAGE_IMAGE_BYTES).clamp(3, 30) as usize
}

pub fn parse_viewport(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got '{s}'"))?;
    let w: u32 = w.trim().parse().map_err(|e| format!("bad width '{w}': {e}"))?;
    let h: u32 = h.trim().parse().map_err(|e| format!("bad height '{h}': {e}"))?;
    if w == 0 || h == 0 {
        return Err(format!("viewport must not be empty, got '{s}'"));
    }
    Ok((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_budget_suffixes() {
        assert_eq!(parse_memory_budget("2GB"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_budget(" 512mb "), 512 * 1024 * 1024);
        assert_eq!(parse_memory_budget("1.5GB"), 1536 * 1024 * 1024);
        assert_eq!(parse_memory_budget("64"), 64 * 1024 * 1024);
    }

    #[test]
    fn resident_budget_is_clamped() {
        assert_eq!(default_max_resident(0), 3);
        assert_eq!(default_max_resident(80 * 1024 * 1024), 10);
        assert_eq!(default_max_resident(u64::MAX), 30);
    }

    #[test]
    fn viewport_parsing() {
        assert_eq!(parse_viewport("1920x1080"), Ok((1920, 1080)));
        assert_eq!(parse_viewport("800X600"), Ok((800, 600)));
        assert!(parse_viewport("800").is_err());
        assert!(parse_viewport("0x600").is_err());
        assert!(parse_viewport("axb").is_err());
    }

    #[test]
    fn flags() {
        let cli = Cli::try_parse_from([
            "pv",
            "--sort",
            "natural",
            "--viewport",
            "640x480",
            "--match",
            "cat",
            "--no-autozoom",
            "pics",
        ])
        .unwrap();
        assert_eq!(cli.sort, SortOrder::Natural);
        assert_eq!(cli.viewport, Some((640, 480)));
        assert_eq!(cli.match_pattern.as_deref(), Some("cat"));
        assert!(cli.no_autozoom);
        assert_eq!(cli.threads, 1);
        assert_eq!(cli.paths, vec![PathBuf::from("pics")]);

        assert!(!cli.detect_filetype);
        assert_eq!(cli.interval, None);

        assert!(Cli::try_parse_from(["pv"]).is_err());
        assert!(Cli::try_parse_from(["pv", "-L", "list.txt"]).is_ok());
    }

    #[test]
    fn stdin_lists_and_scan_flags() {
        let cli = Cli::try_parse_from(["pv", "-L", "-", "--detect-filetype", "--interval", "500"])
            .unwrap();
        assert_eq!(cli.file_list, Some(PathBuf::from("-")));
        assert!(cli.paths.is_empty());
        assert!(cli.detect_filetype);
        assert_eq!(cli.interval, Some(500));

        let cli = Cli::try_parse_from(["pv", "-"]).unwrap();
        assert_eq!(cli.paths, vec![PathBuf::from("-")]);
    }
}
