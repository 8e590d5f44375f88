use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use logdex_core::{Config, Environment};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The store path to operate on.
    #[arg(long, default_value = "data.logdex/")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lists the segments registered to an index and their document counts.
    ListSegments {
        #[arg(long)]
        index_name: String,
    },

    /// Lists the fields known to an index's schema.
    ListFields {
        #[arg(long)]
        index_name: String,
    },

    /// Prints a single document's stored body to stdout.
    DumpDocument {
        #[arg(long)]
        index_name: String,
        #[arg(long)]
        segment_name: String,
        #[arg(long)]
        doc_id: u64,
    },

    /// Prints aggregate index statistics (segment count, document count).
    Stats {
        #[arg(long)]
        index_name: String,
    },

    /// Drains and prints whatever is currently buffered on the log channel.
    ///
    /// Exits once the channel is empty rather than following new entries,
    /// since there is no running writer to generate them in this process.
    DrainLog,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env = Environment::open(&cli.db_path, Config::default())
        .with_context(|| format!("opening store at {}", cli.db_path.display()))?;

    match cli.command {
        Command::ListSegments { index_name } => {
            let txn = env.begin_txn()?;
            let index = env.open_index(&txn, &index_name)?;
            for seg_name in index.iter_segments(&txn)? {
                let segment = index.open_segment(&txn, &seg_name)?;
                let docs = segment.doc_count(&txn)?;
                let deleted = segment.is_deleted(&txn)?;
                println!("{seg_name}\tdocs={docs}\tdeleted={deleted}");
            }
            txn.abort()?;
        }
        Command::ListFields { index_name } => {
            let txn = env.begin_txn()?;
            let index = env.open_index(&txn, &index_name)?;
            for field in index.list_fields() {
                let id = index.field_id(&field).unwrap_or_default();
                println!("{id}\t{field}");
            }
            txn.abort()?;
        }
        Command::DumpDocument { index_name, segment_name, doc_id } => {
            let txn = env.begin_txn()?;
            let index = env.open_index(&txn, &index_name)?;
            let segment = index.open_segment(&txn, &segment_name)?;
            match segment.get_doc(&txn, doc_id)? {
                Some(body) => std::io::Write::write_all(&mut std::io::stdout(), &body)?,
                None => bail!("document {doc_id} not found in segment {segment_name}"),
            }
            txn.abort()?;
        }
        Command::Stats { index_name } => {
            let txn = env.begin_txn()?;
            let index = env.open_index(&txn, &index_name)?;
            let stats = index.stats(&txn)?;
            println!(
                "segments={} documents={} fields={}",
                stats.segment_count, stats.total_docs, stats.field_count
            );
            txn.abort()?;
        }
        Command::DrainLog => {
            let reader = env.log_reader();
            for line in reader.try_iter() {
                print!("{line}");
            }
        }
    }

    Ok(())
}
