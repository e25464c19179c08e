use clap::{Parser, Subcommand};
use env_logger::Env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracefile::{open_trace, BlobStore, ReadStatus, ReaderOptions, RecordBatch, RecordKind, RecordStream};

#[derive(Parser)]
#[command(name = "tracefile", about = "Inspect graphics API trace files")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory of loose blob files (default: next to the trace)
    #[arg(long, global = true)]
    loose_dir: Option<PathBuf>,

    /// Ignore a precomputed frame offset index
    #[arg(long, global = true)]
    no_frame_index: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the start-of-file descriptor and frame count
    Info {
        input: PathBuf,
    },
    /// Show the record count and size of every frame
    Frames {
        input: PathBuf,
    },
    /// Print the records of a range of frames
    Dump {
        input: PathBuf,
        #[arg(short, long, default_value = "0")]
        frame: u32,
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,
        /// Payload bytes to show per record
        #[arg(long, default_value = "16")]
        bytes: usize,
    },
    /// Read every record and report the first corruption, if any
    Verify {
        input: PathBuf,
    },
    /// List blob ids served for the trace
    Blobs {
        input: PathBuf,
    },
    /// Extract one blob
    Blob {
        input: PathBuf,
        id: String,
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let mut options = ReaderOptions::default().with_frame_index(!cli.no_frame_index);
    if let Some(dir) = &cli.loose_dir {
        options = options.with_loose_file_path(dir);
    }

    match cli.command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let mut trace = open_trace(&input, &options)?;
            let max_frame = trace.max_frame_index()?;
            let sof = trace.sof().clone();

            println!("── Trace ────────────────────────────────────────────────");
            println!("  Path           {}", trace.path().display());
            println!("  Format         {}", trace.format().name());
            println!("  Version        0x{:04X}", sof.version);
            println!("  Pointer size   {}", sof.pointer_sizes);
            println!("  UUID           {}", sof.uuid);
            if sof.has_archive() {
                println!("  Archive        {} B at offset {}", sof.archive_size, sof.archive_offset);
            }
            println!("  Fast seek      {}", trace.can_quickly_seek_forward());
            println!("  Frames         {}", max_frame as u64 + 1);
            println!("  Blob stores    {}", trace.blobs().stores().len());
            for store in trace.blobs().stores() {
                println!("    {}", store.describe());
            }
        }

        // ── Frames ───────────────────────────────────────────────────────────
        Commands::Frames { input } => {
            let mut trace = open_trace(&input, &options)?;
            let max_frame = trace.max_frame_index()?;
            let mut batch = RecordBatch::new();
            println!("{:>8} {:>10} {:>12}", "Frame", "Records", "Bytes");
            for frame in 0..=max_frame {
                trace.read_frame_records(frame, 1, &mut batch)?;
                let bytes: usize = batch.iter().map(|r| r.size() as usize).sum();
                println!("{:>8} {:>10} {:>12}", frame, batch.len(), bytes);
            }
        }

        // ── Dump ─────────────────────────────────────────────────────────────
        Commands::Dump { input, frame, count, bytes } => {
            let mut trace = open_trace(&input, &options)?;
            let mut batch = RecordBatch::new();
            let frames_read = trace.read_frame_records(frame, count, &mut batch)?;

            let mut cur = frame;
            for record in batch.iter() {
                let payload = record.payload();
                let shown = &payload[..payload.len().min(bytes)];
                println!(
                    "  [{cur:>6}] {:<14} flags={:02x} size={:<8} {}{}",
                    record.kind().name(),
                    record.flags(),
                    record.size(),
                    hex::encode(shown),
                    if payload.len() > shown.len() { "…" } else { "" }
                );
                if record.kind() == RecordKind::FrameBoundary {
                    cur += 1;
                }
            }
            println!("{} record(s), {frames_read} frame(s)", batch.len());
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input } => {
            let mut trace = open_trace(&input, &options)?;
            let mut records = 0u64;
            loop {
                match trace.read_next_record() {
                    Ok(ReadStatus::Eof) => break,
                    Ok(ReadStatus::Ok) => {
                        records += 1;
                        if trace.record().is_end() {
                            break;
                        }
                    }
                    Err(e) => {
                        eprintln!("FAILED after {records} record(s) in frame {}: {e}", trace.cur_frame());
                        return Ok(ExitCode::FAILURE);
                    }
                }
            }
            println!("OK  {records} record(s), {} frame boundaries", trace.cur_frame());
        }

        // ── Blobs ────────────────────────────────────────────────────────────
        Commands::Blobs { input } => {
            let trace = open_trace(&input, &options)?;
            let blobs = trace.blobs();
            println!("{:<60} {:>12}", "Id", "Size");
            for id in blobs.list()? {
                let size = blobs.size(&id)?;
                println!("{id:<60} {size:>12}");
            }
        }

        // ── Blob ─────────────────────────────────────────────────────────────
        Commands::Blob { input, id, output } => {
            let trace = open_trace(&input, &options)?;
            let data = trace.blobs().get(&id)?;
            std::fs::write(&output, &data)?;
            println!("Wrote {} B → {}", data.len(), output.display());
        }
    }

    Ok(ExitCode::SUCCESS)
}
