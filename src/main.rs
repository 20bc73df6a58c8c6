use std::path::PathBuf;

use clap::{ArgAction, CommandFactory, ErrorKind, Parser, Subcommand};

use clipseek::{FingerprintStore, Sampler, Searcher};

#[derive(Debug, Subcommand)]
enum Commands {
    #[clap(after_help = "Displays info about clipseek and its dependencies.")]
    Info,

    #[clap(
        arg_required_else_help = true,
        after_help = "Fingerprint one or more video files and add them to the catalogue. Each ingest creates a new catalogue entry, even if the same file was ingested before (see --skip-duplicates)."
    )]
    Ingest {
        #[clap(
            required = true,
            multiple_values = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Video files or directories to ingest."
        )]
        paths: Vec<PathBuf>,

        #[clap(
            long,
            help = "Display name of the video. Defaults to the file name. Only valid when ingesting a single file."
        )]
        name: Option<String>,

        #[clap(
            long,
            default_value_t = clipseek::DEFAULT_TARGET_FPS,
            value_parser = clap::value_parser!(f64),
            help = "Number of frames per second to fingerprint. Queries must be extracted at the same rate to be found."
        )]
        target_fps: f64,

        #[clap(
            long,
            default_value_t = clipseek::DEFAULT_TARGET_SIZE.0,
            value_parser = clap::value_parser!(u32),
            help = "Width frames are resized to before fingerprinting."
        )]
        width: u32,

        #[clap(
            long,
            default_value_t = clipseek::DEFAULT_TARGET_SIZE.1,
            value_parser = clap::value_parser!(u32),
            help = "Height frames are resized to before fingerprinting."
        )]
        height: u32,

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
            help = "Skip files whose header checksum matches a video already in the catalogue."
        )]
        skip_duplicates: bool,
    },

    #[clap(after_help = "Lists all videos in the catalogue.")]
    List,

    #[clap(
        arg_required_else_help = true,
        after_help = "Find where a short clip appears in the catalogue. Prints the best matching video and the offset of the clip within it."
    )]
    Search {
        #[clap(
            required = true,
            value_parser = clap::value_parser!(PathBuf),
            help = "Query clip."
        )]
        query: PathBuf,

        #[clap(
            long,
            default_value_t = clipseek::DEFAULT_MATCH_THRESHOLD,
            value_parser = clap::value_parser!(f64),
            help = "Only report a match whose score is below this value. Scores are mean squared differences, so 0 is an exact match."
        )]
        threshold: f64,

        #[clap(
            long,
            default_value_t = clipseek::DEFAULT_TARGET_FPS,
            value_parser = clap::value_parser!(f64),
            help = "Number of frames per second to fingerprint the query at. Videos ingested at another rate are skipped."
        )]
        target_fps: f64,

        #[clap(
            long,
            default_value_t = clipseek::DEFAULT_TARGET_SIZE.0,
            value_parser = clap::value_parser!(u32),
            help = "Width query frames are resized to. Videos ingested at another size are skipped."
        )]
        width: u32,

        #[clap(
            long,
            default_value_t = clipseek::DEFAULT_TARGET_SIZE.1,
            value_parser = clap::value_parser!(u32),
            help = "Height query frames are resized to. Videos ingested at another size are skipped."
        )]
        height: u32,

        #[clap(
            long,
            default_value = "false",
            action(ArgAction::SetTrue),
            help = "Scan catalogue videos in parallel. If several videos contain an equally good match, which one is reported may vary between runs."
        )]
        threading: bool,
    },

    #[clap(
        arg_required_else_help = true,
        after_help = "Remove a video from the catalogue and delete its fingerprints."
    )]
    Remove {
        #[clap(required = true, help = "Id of the video, as shown by 'list'.")]
        id: String,
    },

    #[clap(
        after_help = "Delete fingerprint files that have no catalogue entry. These can be left behind by an interrupted ingest or remove."
    )]
    Prune,
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        global = true,
        default_value = "./data/video_db",
        value_parser = clap::value_parser!(PathBuf),
        help = "Directory holding the catalogue and fingerprint files."
    )]
    db: PathBuf,

    #[clap(
        short,
        long,
        global = true,
        default_value = "false",
        action(ArgAction::SetTrue),
        help = "Enable debug logging."
    )]
    verbose: bool,

    #[clap(
        long,
        global = true,
        default_value = "false",
        action(ArgAction::SetTrue),
        help = "By default, video files found in directories are validated using FFmpeg, which is extremely accurate. Setting this flag will switch to just checking file headers."
    )]
    file_headers_only: bool,
}

impl Cli {
    fn validate(&self) {
        let mut cmd = Cli::command();
        match self.command {
            Commands::Ingest {
                target_fps,
                width,
                height,
                ref name,
                ref paths,
                ..
            } => {
                if let Err(e) = Sampler::default()
                    .with_target_fps(target_fps)
                    .with_target_size((width, height))
                    .validate()
                {
                    cmd.error(ErrorKind::InvalidValue, e.to_string()).exit();
                }
                if name.is_some() && (paths.len() > 1 || paths[0].is_dir()) {
                    cmd.error(
                        ErrorKind::ArgumentConflict,
                        "--name can only be used when ingesting a single file",
                    )
                    .exit();
                }
            }
            Commands::Search {
                threshold,
                target_fps,
                width,
                height,
                ..
            } => {
                if threshold.is_nan() || threshold <= 0.0 {
                    cmd.error(
                        ErrorKind::InvalidValue,
                        "threshold must be a positive number",
                    )
                    .exit();
                }
                if let Err(e) = Sampler::default()
                    .with_target_fps(target_fps)
                    .with_target_size((width, height))
                    .validate()
                {
                    cmd.error(ErrorKind::InvalidValue, e.to_string()).exit();
                }
            }
            Commands::Info | Commands::List | Commands::Remove { .. } | Commands::Prune => (),
        }
    }

    fn open_store(&self, sampler: Sampler) -> clipseek::Result<FingerprintStore> {
        Ok(FingerprintStore::open(&self.db)?.with_sampler(sampler))
    }
}

fn main() -> clipseek::Result<()> {
    let args = Cli::parse();
    args.validate();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    ffmpeg_next::init()?;

    match args.command {
        Commands::Info => {
            println!("clipseek version: {}", env!("CARGO_PKG_VERSION"));
            println!("FFmpeg version: {}", clipseek::util::ffmpeg_version_string());
        }
        Commands::Ingest {
            ref paths,
            ref name,
            target_fps,
            width,
            height,
            threaded_decoding,
            skip_duplicates,
        } => {
            let sampler = Sampler::default()
                .with_target_fps(target_fps)
                .with_target_size((width, height))
                .with_threaded_decoding(threaded_decoding);
            let store = args.open_store(sampler)?;

            let videos = clipseek::util::find_video_files(paths, !args.file_headers_only);
            if videos.is_empty() {
                let mut cmd = Cli::command();
                cmd.error(
                    ErrorKind::InvalidValue,
                    "no valid video files found in provided paths",
                )
                .exit();
            }

            let mut failed = 0;
            for video in &videos {
                if skip_duplicates {
                    let existing = clipseek::util::compute_header_md5sum(video)
                        .ok()
                        .and_then(|md5| store.find_by_md5(&md5));
                    if let Some((id, record)) = existing {
                        println!(
                            "Skipping {}, already catalogued as {} ({})",
                            video.display(),
                            record.name,
                            id
                        );
                        continue;
                    }
                }

                match store.ingest(video, name.as_deref()) {
                    Ok(id) => {
                        let record = store.get(&id);
                        let frames = record.as_ref().map_or(0, |r| r.frame_count);
                        println!("{}  {} ({} frames)", id, video.display(), frames);
                    }
                    Err(e) => {
                        tracing::error!("failed to ingest {}: {}", video.display(), e);
                        failed += 1;
                    }
                }
            }

            if failed > 0 {
                println!("{} of {} videos failed to ingest", failed, videos.len());
            }
        }
        Commands::List => {
            let store = args.open_store(Sampler::default())?;
            for (id, record) in store.get_catalogue() {
                println!(
                    "{}  {}  {} frames  {}  {}",
                    id,
                    record.name,
                    record.frame_count,
                    clipseek::util::format_seconds(record.duration_sec),
                    record.original_path
                );
            }
        }
        Commands::Search {
            ref query,
            threshold,
            target_fps,
            width,
            height,
            threading,
        } => {
            let sampler = Sampler::default()
                .with_target_fps(target_fps)
                .with_target_size((width, height));
            let store = args.open_store(sampler)?;
            let query = store.extract_query(query)?;
            let result = Searcher::default()
                .with_threshold(threshold)
                .with_threading(threading)
                .with_sampler(store.sampler())
                .search(&store, &query)?;
            match result {
                Some(m) => println!("Match found: {} [{}]", m, m.video_id),
                None => println!("No match found."),
            }
        }
        Commands::Remove { ref id } => {
            let store = args.open_store(Sampler::default())?;
            let record = store.remove(id)?;
            println!("Removed {} ({})", record.name, id);
        }
        Commands::Prune => {
            let store = args.open_store(Sampler::default())?;
            let removed = store.prune_orphans()?;
            println!("Deleted {} orphaned files", removed);
        }
    }

    Ok(())
}
