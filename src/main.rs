use clap::{Args, Parser, Subcommand};
use dedarc::archive::{append_archive, begin_archive, open_archive, open_archive_recovering};
use dedarc::codec::CodecId;
use dedarc::config::{log_filter_for, ArchiveConfig, HashKind, LargePages, Method, Password, TwoPass};
use dedarc::recovery::scanner;
use dedarc::ArchiveWriter;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "dedarc", version, about = "Content-defined dedup archiver")]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack files and directories into a new archive
    Pack {
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        opts: PackFlags,
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// Add files to an existing archive as a new session
    Append {
        archive: PathBuf,
        #[command(flatten)]
        opts: PackFlags,
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
    },
    /// Extract every entry
    Unpack {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
        /// Fall back to an earlier session if the newest footer is missing
        #[arg(long)]
        recover: bool,
    },
    /// List archive contents
    List {
        input: PathBuf,
        /// Emit entries as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show archive metadata and session history
    Info {
        input: PathBuf,
    },
    /// Walk the block stream without the directory
    Scan {
        input: PathBuf,
        /// Write every decodable data block into a new archive
        #[arg(long)]
        salvage: Option<PathBuf>,
        #[arg(short, long)]
        password: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Decode every block and check every entry CRC
    Verify {
        input: PathBuf,
        #[arg(short, long)]
        password: Option<String>,
    },
}

/// Flags mirroring `ArchiveConfig`; unset flags keep the config-file value.
#[derive(Args)]
struct PackFlags {
    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
    /// Dedup method 0-5
    #[arg(short, long)]
    method: Option<u8>,
    /// Codec: zstd, lz4, brotli, lzma, none
    #[arg(short, long)]
    codec: Option<String>,
    #[arg(short, long)]
    level: Option<i32>,
    /// Dedup window in KiB (default: whole solid block)
    #[arg(long)]
    dict_size: Option<u64>,
    /// I/O buffer in KiB
    #[arg(long)]
    buf_size: Option<usize>,
    #[arg(long)]
    accel: Option<u8>,
    #[arg(long)]
    min_match: Option<usize>,
    /// Target chunk size in bytes
    #[arg(long)]
    chunk_size: Option<usize>,
    #[arg(long)]
    max_chunk: Option<usize>,
    #[arg(short = 'j', long)]
    threads: Option<usize>,
    /// Solid block size in KiB
    #[arg(long)]
    solid_size: Option<usize>,
    /// Seal a solid block after this many files
    #[arg(long)]
    solid_files: Option<usize>,
    /// futurelz or indexlz
    #[arg(long)]
    two_pass: Option<String>,
    /// blake3 or crc32
    #[arg(long)]
    hash: Option<String>,
    /// disable, try or force
    #[arg(long)]
    large_pages: Option<String>,
    /// Read inputs with read() instead of mmap
    #[arg(long)]
    no_mmap: bool,
    #[arg(long)]
    temp_dir: Option<PathBuf>,
    #[arg(long)]
    vm_file: Option<PathBuf>,
    /// Memory budget in MiB
    #[arg(long)]
    max_memory: Option<u64>,
    /// Encrypt with AES-256-GCM (Argon2id key derivation)
    #[arg(short, long)]
    password: Option<String>,
    #[arg(long)]
    kdf_iterations: Option<u32>,
    #[arg(long)]
    kdf_memory: Option<u32>,
    #[arg(long)]
    comment: Option<String>,
    /// Refuse later appends
    #[arg(long)]
    lock: bool,
    #[arg(long)]
    recovery: Option<String>,
}

impl PackFlags {
    fn into_config(self, verbosity: u8) -> Result<ArchiveConfig, Box<dyn std::error::Error>> {
        let mut cfg = match &self.config {
            Some(path) => ArchiveConfig::from_json_file(path)?,
            None => ArchiveConfig::default(),
        };
        cfg.verbosity = cfg.verbosity.max(verbosity);
        if let Some(m) = self.method {
            cfg.method = Method::try_from(m)?;
        }
        if let Some(name) = &self.codec {
            let codec = CodecId::from_name(name).ok_or_else(|| format!("unknown codec '{name}'"))?;
            cfg = cfg.with_codec(codec, self.level);
        } else if let Some(level) = self.level {
            cfg.level = level;
        }
        if let Some(kib) = self.dict_size {
            cfg.dict_size = Some(kib * 1024);
        }
        if let Some(kib) = self.buf_size {
            cfg.buf_size = kib * 1024;
        }
        if let Some(a) = self.accel {
            cfg.accel = a;
        }
        if let Some(n) = self.min_match {
            cfg.min_match = n;
        }
        if let Some(n) = self.chunk_size {
            cfg.chunk_size = n;
        }
        if let Some(n) = self.max_chunk {
            cfg.max_chunk = n;
        }
        if let Some(n) = self.threads {
            cfg.threads = n;
        }
        if let Some(kib) = self.solid_size {
            cfg.solid_block_size = kib * 1024;
        }
        if self.solid_files.is_some() {
            cfg.solid_block_files = self.solid_files;
        }
        if let Some(name) = &self.two_pass {
            cfg.two_pass = Some(TwoPass::from_name(name).ok_or_else(|| format!("unknown two-pass mode '{name}'"))?);
        }
        if let Some(name) = &self.hash {
            cfg.hash = HashKind::from_name(name).ok_or_else(|| format!("unknown hash '{name}'"))?;
        }
        if let Some(name) = &self.large_pages {
            cfg.large_pages = LargePages::from_name(name).ok_or_else(|| format!("unknown large-page mode '{name}'"))?;
        }
        if self.no_mmap {
            cfg.use_mmap = false;
        }
        if self.temp_dir.is_some() {
            cfg.temp_dir = self.temp_dir;
        }
        if self.vm_file.is_some() {
            cfg.vm_file = self.vm_file;
        }
        if let Some(mib) = self.max_memory {
            cfg.max_memory = Some(mib << 20);
        }
        if let Some(p) = self.password {
            cfg.password = Some(Password::new(p));
        }
        if let Some(n) = self.kdf_iterations {
            cfg.kdf_iterations = n;
        }
        if let Some(kib) = self.kdf_memory {
            cfg.kdf_memory_kib = kib;
        }
        if let Some(c) = self.comment {
            cfg.comment = c;
        }
        if self.lock {
            cfg.locked = true;
        }
        if let Some(r) = self.recovery {
            cfg.recovery = r;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::new().filter_level(level).parse_default_env().init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    // Writing sessions take their level from the config, which may raise it.
    if !matches!(cli.command, Commands::Pack { .. } | Commands::Append { .. }) {
        init_logging(log_filter_for(cli.verbose));
    }

    match cli.command {

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { output, opts, input } => {
            let cfg = opts.into_config(cli.verbose)?;
            init_logging(cfg.log_filter());
            let mut w = begin_archive(&output, cfg)?;
            add_inputs(&mut w, &input)?;
            w.finalize()?;
            println!("Created: {}", output.display());
        }

        // ── Append ───────────────────────────────────────────────────────────
        Commands::Append { archive, opts, input } => {
            let cfg = opts.into_config(cli.verbose)?;
            init_logging(cfg.log_filter());
            let mut w = append_archive(&archive, cfg)?;
            add_inputs(&mut w, &input)?;
            w.finalize()?;
            println!("Appended to: {}", archive.display());
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, output_dir, password, recover } => {
            let mut ar = if recover {
                open_archive_recovering(&input, password.as_deref())?
            } else {
                open_archive(&input, password.as_deref())?
            };
            let report = ar.extract_all(&output_dir)?;
            for (name, err) in &report.failed {
                eprintln!("  FAILED  {name}: {err}");
            }
            println!(
                "Unpacked {} of {} entries to: {}",
                report.extracted.len(),
                report.extracted.len() + report.failed.len(),
                output_dir.display()
            );
            if !report.is_clean() {
                std::process::exit(1);
            }
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, json } => {
            let ar = open_archive(&input, None)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ar.list())?);
                return Ok(());
            }
            println!("Archive: {}", input.display());
            println!("{:<40} {:>12} {:>8}  {:<19}", "Name", "Size", "CRC32", "Modified");
            for e in ar.list() {
                println!("{:<40} {:>12} {:08x}  {}", e.name, e.size, e.crc32, format_mtime(e.mtime));
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let mut ar = open_archive(&input, None)?;
            let sessions = ar.sessions()?;
            let dir = ar.directory();
            let total = dir.total_size();
            let packed = dir.total_compressed();

            println!("── dedarc archive ───────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Entries        {}", dir.entries.len());
            println!("  Blocks         {}", dir.blocks.len());
            println!("  Original       {total} B");
            println!("  Packed         {packed} B ({:.1}%)", ratio(packed, total));
            println!("  Locked         {}", dir.locked);
            if !dir.recovery.is_empty() {
                println!("  Recovery       {}", dir.recovery);
            }
            if !dir.comment.is_empty() {
                println!("  Comment        {}", dir.comment);
            }
            println!("  Sessions ({}):", sessions.len());
            for (i, f) in sessions.iter().enumerate() {
                println!("    #{:<3} directory at {}", sessions.len() - i, f.directory_offset);
            }
        }

        // ── Scan ─────────────────────────────────────────────────────────────
        Commands::Scan { input, salvage, password, json } => {
            let report = match salvage {
                Some(out) => {
                    let mut src = File::open(&input)?;
                    let (report, _) = scanner::extract_recoverable(
                        &mut src,
                        File::create(&out)?,
                        password.as_deref(),
                        ArchiveConfig::default(),
                    )?;
                    println!("Salvaged into: {}", out.display());
                    report
                }
                None => scanner::scan_file(&input)?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for sb in report.block_log.iter().filter(|sb| !sb.is_usable()) {
                    println!("  offset {:>12}  {:?}", sb.offset, sb.health);
                }
                println!("{}", report.summary());
            }
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input, password } => {
            let mut ar = open_archive(&input, password.as_deref())?;
            let report = ar.verify();
            for (index, err) in &report.bad_blocks {
                eprintln!("  block {index}: {err}");
            }
            for (name, err) in &report.bad_entries {
                eprintln!("  {name}: {err}");
            }
            println!(
                "{} blocks ok, {} bad; {} entries ok, {} bad",
                report.blocks_ok,
                report.bad_blocks.len(),
                report.entries_ok,
                report.bad_entries.len()
            );
            if !report.is_clean() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn add_inputs(w: &mut ArchiveWriter<File>, inputs: &[PathBuf]) -> Result<(), Box<dyn std::error::Error>> {
    for path in inputs {
        for e in w.add_path(Path::new(path))? {
            println!("  packed  {} ({} B)", e.name, e.size);
        }
    }
    Ok(())
}

fn format_mtime(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into())
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 100.0;
    }
    part as f64 / whole as f64 * 100.0
}
