use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use serde_json::json;

use tradebus::{Journal, JournalConfig, ReplayOptions};

fn usage() -> ! {
    eprintln!("usage: journal_inspect <dir> [from] [to]");
    std::process::exit(2);
}

fn parse_seq(arg: Option<String>, name: &str) -> Result<Option<u64>> {
    match arg {
        Some(v) => Ok(Some(v.parse().with_context(|| format!("bad {} sequence: {}", name, v))?)),
        None => Ok(None),
    }
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(dir) = args.next() else { usage() };
    let from = parse_seq(args.next(), "from")?.unwrap_or(1);
    let to = parse_seq(args.next(), "to")?;
    if !std::path::Path::new(&dir).is_dir() {
        bail!("not a directory: {}", dir);
    }

    // Opening runs startup recovery, so a torn tail is truncated here too.
    let mut cfg = JournalConfig::new(&dir);
    cfg.checkpoint_interval = std::time::Duration::ZERO;
    cfg.sync_interval = std::time::Duration::ZERO;
    let journal = Journal::open(cfg)?;

    let stats = journal.stats();
    eprintln!("{}", json!({"stats": stats}));
    for seg in journal.segments() {
        eprintln!(
            "  {} [{}..{}] entries={} bytes={}{}",
            seg.segment_id,
            seg.start_sequence,
            seg.end_sequence,
            seg.entry_count,
            seg.file_size,
            if seg.is_open { " (open)" } else { "" }
        );
    }
    for cp in journal.checkpoints() {
        let usable = cp.is_usable(journal.dir());
        eprintln!(
            "  {} seq={} snapshot={} usable={}",
            cp.checkpoint_id,
            cp.sequence,
            cp.snapshot_path.as_deref().unwrap_or("-"),
            usable
        );
    }

    match journal.verify_integrity() {
        Ok(report) => eprintln!("{}", json!({"integrity": "ok", "report": report})),
        Err(e) => {
            eprintln!("{}", json!({"integrity": "failed", "error": e.to_string()}));
            std::process::exit(1);
        }
    }

    let mut options = ReplayOptions::from_sequence(from);
    if let Some(to) = to {
        options = options.to(to);
    }
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut iter = journal.replay_iter(&options)?;
    for entry in iter.by_ref() {
        let entry = entry?;
        writeln!(out, "{}", serde_json::to_string(&entry)?)?;
    }
    let progress = iter.progress();
    drop(iter);
    eprintln!("{}", json!({"replayed": progress.processed, "last": progress.current_sequence}));

    journal.close()?;
    Ok(())
}
