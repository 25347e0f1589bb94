use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, CommandFactory, ErrorKind, Parser, Subcommand};

use needle::audio;

#[derive(clap::ValueEnum, Clone, Debug)]
enum HasherKind {
    Spectral,
    #[cfg(feature = "chromaprint")]
    Chromaprint,
}

impl HasherKind {
    fn build(&self) -> Arc<dyn audio::Hasher> {
        match self {
            HasherKind::Spectral => Arc::new(audio::SpectralHasher::new()),
            #[cfg(feature = "chromaprint")]
            HasherKind::Chromaprint => Arc::new(audio::ChromaprintHasher::new()),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[clap(after_help = "Displays info about needle and its dependencies.")]
    Info,

    #[clap(
        arg_required_else_help = true,
        after_help = "Decode one or more video files into audio fingerprints. The fingerprint of each video is written to disk alongside it (or to --cache-dir), and is used by the 'search' command."
    )]
    Analyze {
        #[clap(
            required = true,
            multiple_values = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Video files or directories to analyze."
        )]
        paths: Vec<PathBuf>,

        #[clap(
            long,
            default_value_t = audio::DEFAULT_HASH_PERIOD,
            value_parser = clap::value_parser!(f32),
            help = "Period between hashes, in seconds. For example, if set to 0.3, a hash will be generated for every 300 ms of audio. Lowering this number can improve the accuracy of the result, at the cost of performance."
        )]
        hash_period: f32,

        #[clap(
            long,
            default_value_t = audio::DEFAULT_HASH_DURATION,
            value_parser = clap::value_parser!(f32),
            help = "Duration of audio to hash, in seconds.",
        )]
        hash_duration: f32,

        #[clap(
            long,
            default_value_t = audio::DEFAULT_OPENING_SEARCH_PERCENTAGE,
            value_parser = clap::value_parser!(f32),
            help = "Portion of the start of each video to decode when endings are not included."
        )]
        opening_search_percentage: f32,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Decode each video in full so that endings can be searched for."
        )]
        include_endings: bool,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Enable multi-threaded decoding in FFmpeg."
        )]
        threaded_decoding: bool,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Re-analyze all videos and ignore any existing fingerprints on disk."
        )]
        force: bool,
    },

    #[clap(
        arg_required_else_help = true,
        after_help = "Search for openings and endings among a group of videos using their audio fingerprints. Fingerprints can either be pre-computed using the 'analyze' command, or generated as part of the search by specifying the --analyze flag."
    )]
    Search {
        #[clap(
            required = true,
            multiple_values = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Video files or directories to search for openings and endings in."
        )]
        paths: Vec<PathBuf>,

        #[clap(
            long,
            default_value_t = audio::DEFAULT_HASH_MATCH_THRESHOLD,
            value_parser = clap::value_parser!(u16),
            help = "Threshold to use when comparing hashes. The range is 0 (exact match) to 32 (no match).",
        )]
        hash_match_threshold: u16,

        #[clap(
            long,
            default_value_t = audio::DEFAULT_OPENING_SEARCH_PERCENTAGE,
            value_parser = clap::value_parser!(f32),
            help = "Specifies which portion of the start of the video the opening should be in. For example, if set to 0.25, only matches found in the first 25% of the video will be considered."
        )]
        opening_search_percentage: f32,

        #[clap(
            long,
            default_value_t = audio::DEFAULT_ENDING_SEARCH_PERCENTAGE,
            value_parser = clap::value_parser!(f32),
            help = "Specifies which portion of the end of the video the ending should be in. For example, if set to 0.25, only matches found in the last 25% of the video will be considered."
        )]
        ending_search_percentage: f32,

        #[clap(
            long,
            default_value_t = audio::DEFAULT_MIN_OPENING_DURATION,
            value_parser = clap::value_parser!(u16),
            help = "Minimum opening duration, in seconds. Setting a value that is close to the actual length helps reduce false positives."
        )]
        min_opening_duration: u16,

        #[clap(
            long,
            default_value_t = audio::DEFAULT_MIN_ENDING_DURATION,
            value_parser = clap::value_parser!(u16),
            help = "Minimum ending duration, in seconds. Setting a value that is close to the actual length helps reduce false positives."
        )]
        min_ending_duration: u16,

        #[clap(
            long,
            default_value_t = audio::DEFAULT_OPENING_AND_ENDING_TIME_PADDING,
            value_parser = clap::value_parser!(f32),
            help = "Amount of time (in seconds) to add to detected opening/ending start time and deduct from detected opening/ending end time."
        )]
        time_padding: f32,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Search for endings as well as openings."
        )]
        include_endings: bool,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Run the analysis step in-place instead of looking for pre-computed fingerprints."
        )]
        analyze: bool,

        #[clap(
            long,
            default_value_t = audio::DEFAULT_HASH_PERIOD,
            value_parser = clap::value_parser!(f32),
            help = "Period between hashes, in seconds. Only used with --analyze."
        )]
        hash_period: f32,

        #[clap(
            long,
            default_value_t = audio::DEFAULT_HASH_DURATION,
            value_parser = clap::value_parser!(f32),
            help = "Duration of audio to hash, in seconds. Only used with --analyze."
        )]
        hash_duration: f32,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Enable multi-threaded decoding in FFmpeg. Only used with --analyze."
        )]
        threaded_decoding: bool,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Ignore skip files on disk. These are JSON files that store the result of the search for each video. Without this flag, videos with an up-to-date skip file reuse it, and pairs of such videos are not searched again."
        )]
        ignore_skip_files: bool,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Do not write skip files to disk after the search is completed. Skip files are central to how incremental search works."
        )]
        no_write_skip_files: bool,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Do not display results of the search in stdout."
        )]
        no_display: bool,
    },
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[cfg_attr(
    not(feature = "ffmpeg"),
    clap(
        after_help = "This build has no FFmpeg support, so 'analyze' and 'search --analyze' cannot decode videos. Rebuild with `--features ffmpeg`."
    )
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        global = true,
        default_value = "false",
        action(ArgAction::SetTrue),
        help = "By default, video files are validated using FFmpeg (if available), which is extremely accurate. Setting this flag will switch to just checking file headers."
    )]
    file_headers_only: bool,

    #[clap(
        long,
        global = true,
        value_parser = clap::value_parser!(PathBuf),
        help = "Directory to store fingerprints and skip files in, instead of alongside each video."
    )]
    cache_dir: Option<PathBuf>,

    #[clap(
        long,
        global = true,
        value_enum,
        default_value_t = HasherKind::Spectral,
        help = "Audio hasher used to build fingerprints. Fingerprints built with different hashers cannot be compared."
    )]
    hasher: HasherKind,

    #[clap(
        short,
        long,
        global = true,
        action(ArgAction::Count),
        help = "Increase logging verbosity. Can be repeated."
    )]
    verbose: u64,
}

impl Cli {
    fn validate(&self) {
        if let Commands::Search { time_padding, .. } = self.command {
            if !time_padding.is_finite() || time_padding < 0.0 {
                Self::exit_with_error("time_padding must be a non-negative number");
            }
        }
    }

    fn exit_with_error(message: impl std::fmt::Display) -> ! {
        let mut cmd = Cli::command();
        cmd.error(ErrorKind::InvalidValue, message).exit();
    }

    fn find_video_files(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        match needle::util::find_video_files(paths, !self.file_headers_only, true) {
            Err(e) => Self::exit_with_error(e),
            Ok(v) => v,
        }
    }

    fn fingerprint_store(&self) -> audio::FingerprintStore {
        match &self.cache_dir {
            Some(dir) => audio::FingerprintStore::new().with_cache_dir(dir),
            None => audio::FingerprintStore::new(),
        }
    }

    fn skip_store(&self) -> audio::SkipStore {
        match &self.cache_dir {
            Some(dir) => audio::SkipStore::new().with_cache_dir(dir),
            None => audio::SkipStore::new(),
        }
    }

    fn log_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}

fn print_info() {
    println!("needle version: {}", env!("CARGO_PKG_VERSION"));

    #[cfg(feature = "ffmpeg")]
    println!("FFmpeg version: {}", needle::util::ffmpeg_version_string());
    #[cfg(not(feature = "ffmpeg"))]
    println!("FFmpeg support not compiled in: videos cannot be decoded (rebuild with `--features ffmpeg`)");

    let hashers: &[&str] = if cfg!(feature = "chromaprint") {
        &["spectral", "chromaprint"]
    } else {
        &["spectral"]
    };
    println!("Hashers: {}", hashers.join(", "));
}

fn main() -> needle::Result<()> {
    let args = Cli::parse();
    args.validate();

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(args.log_level())
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set up logging: {}", e);
    }

    match args.command {
        Commands::Analyze {
            hash_period,
            hash_duration,
            opening_search_percentage,
            include_endings,
            threaded_decoding,
            force,
            ref paths,
        } => {
            let videos = args.find_video_files(paths);
            let mut analyzer = audio::Analyzer::from_files(videos, threaded_decoding, force)
                .with_opening_search_percentage(opening_search_percentage)
                .with_include_endings(include_endings)
                .with_hasher(args.hasher.build())
                .with_store(args.fingerprint_store());
            if let Err(e) = analyzer.validate() {
                Cli::exit_with_error(e);
            }
            let frame_hashes = analyzer.run(hash_period, hash_duration, true, true)?;
            tracing::info!(num_videos = frame_hashes.len(), "analysis complete");
        }
        Commands::Search {
            hash_match_threshold,
            opening_search_percentage,
            ending_search_percentage,
            min_opening_duration,
            min_ending_duration,
            time_padding,
            include_endings,
            analyze,
            hash_period,
            hash_duration,
            threaded_decoding,
            ignore_skip_files,
            no_write_skip_files,
            no_display,
            ref paths,
        } => {
            let videos = args.find_video_files(paths);
            if videos.len() < 2 {
                Cli::exit_with_error(format!(
                    "need at least 2 valid video files, but only found {} in provided video paths",
                    videos.len()
                ));
            }

            let comparator = audio::Comparator::from_files(videos)
                .with_hash_match_threshold(hash_match_threshold as u32)
                .with_opening_search_percentage(opening_search_percentage)
                .with_ending_search_percentage(ending_search_percentage)
                .with_min_opening_duration(Duration::from_secs(min_opening_duration.into()))
                .with_min_ending_duration(Duration::from_secs(min_ending_duration.into()))
                .with_time_padding(Duration::from_secs_f32(time_padding))
                .with_include_endings(include_endings)
                .with_hash_period(hash_period)
                .with_hash_duration(hash_duration)
                .with_threaded_decoding(threaded_decoding)
                .with_hasher(args.hasher.build())
                .with_store(args.fingerprint_store())
                .with_skip_store(args.skip_store());
            if let Err(e) = comparator.validate() {
                Cli::exit_with_error(e);
            }

            comparator.run(
                analyze,
                !no_display,
                !ignore_skip_files,
                !no_write_skip_files,
                true,
            )?;
        }
        Commands::Info => print_info(),
    }

    Ok(())
}
