//! # CLI -- list file pack/inspect tool
//!
//! A small command-line front end over the `listfile` crate. Reads records
//! from stdin (newline-delimited) into a list file, dumps them back out, and
//! prints header metadata and frame statistics.
//!
//! ## Commands
//!
//! ```text
//! driftlog pack <file>    Read newline-delimited records from stdin
//! driftlog cat <file>     Print every record to stdout
//! driftlog meta <file>    Print the header metadata map
//! driftlog stats <file>   Record/byte/corruption counts
//! ```
//!
//! ## Configuration
//!
//! All settings are controlled via environment variables:
//!
//! ```text
//! DRIFTLOG_BLOCK_MULT  Block size in 64 KiB units      (default: 1)
//! DRIFTLOG_COMPRESS    none | zlib | snappy | lz4      (default: none)
//! DRIFTLOG_LEVEL       Compression level for zlib      (default: 1)
//! DRIFTLOG_APPEND      Append to an existing file      (default: "false")
//! ```
//!
//! ## Example
//!
//! ```text
//! $ printf 'alpha\nbeta\n' | driftlog pack records.lst
//! packed 2 records
//! $ driftlog cat records.lst
//! alpha
//! beta
//! ```

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use listfile::compress::Method;
use listfile::{ListReader, ListWriter, WriterOptions};

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn options_from_env() -> Result<WriterOptions> {
    let multiplier: u8 = env_or("DRIFTLOG_BLOCK_MULT", "1")
        .parse()
        .context("DRIFTLOG_BLOCK_MULT must be a number in 1..=100")?;
    let compress_method = match env_or("DRIFTLOG_COMPRESS", "none").as_str() {
        "none" => None,
        "zlib" => Some(Method::Zlib),
        "snappy" => Some(Method::Snappy),
        "lz4" => Some(Method::Lz4),
        other => bail!("unknown compression method {:?}", other),
    };
    let compress_level: u8 = env_or("DRIFTLOG_LEVEL", "1").parse().unwrap_or(1);
    let append: bool = env_or("DRIFTLOG_APPEND", "false").parse().unwrap_or(false);

    Ok(WriterOptions {
        block_size_multiplier: multiplier,
        compress_method,
        compress_level,
        append,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();
    codecs::register_builtin();

    let args: Vec<String> = std::env::args().collect();
    let (command, path) = match (args.get(1), args.get(2)) {
        (Some(c), Some(p)) => (c.as_str(), p.as_str()),
        _ => {
            eprintln!("usage: driftlog <pack|cat|meta|stats> <file>");
            std::process::exit(2);
        }
    };

    match command {
        "pack" => pack(path),
        "cat" => cat(path),
        "meta" => meta(path),
        "stats" => stats(path),
        other => bail!("unknown command {:?}", other),
    }
}

fn pack(path: &str) -> Result<()> {
    let options = options_from_env()?;
    let mut writer = ListWriter::open(path, options).context("opening output")?;
    writer.init()?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        writer.add_record(line.as_bytes())?;
    }

    let count = writer.records_added();
    writer.close()?;
    println!("packed {} records", count);
    Ok(())
}

fn cat(path: &str) -> Result<()> {
    let mut reader = ListReader::open(path, true, None).context("opening input")?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut scratch = Vec::new();
    while let Some(record) = reader.read_record(&mut scratch) {
        out.write_all(record)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

fn meta(path: &str) -> Result<()> {
    let mut reader = ListReader::open(path, true, None).context("opening input")?;
    let meta = reader.get_metadata().context("reading header")?;
    if meta.is_empty() {
        println!("(no metadata)");
        return Ok(());
    }
    for (key, value) in meta {
        println!(
            "{} = {}",
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(value)
        );
    }
    Ok(())
}

fn stats(path: &str) -> Result<()> {
    let corruption = std::rc::Rc::new(std::cell::RefCell::new((0usize, 0usize)));
    let sink = corruption.clone();
    let reporter = Box::new(move |bytes: usize, _reason: &str| {
        let mut c = sink.borrow_mut();
        c.0 += 1;
        c.1 += bytes;
    });

    let mut reader = ListReader::open(path, true, Some(reporter)).context("opening input")?;
    let mut scratch = Vec::new();
    let mut records: u64 = 0;
    while reader.read_record(&mut scratch).is_some() {
        records += 1;
    }

    println!("records:          {}", records);
    println!("data bytes:       {}", reader.data_bytes());
    println!("framing overhead: {}", reader.header_bytes());
    let (events, bytes_lost) = *corruption.borrow();
    println!("corruption:       {} events, {} bytes lost", events, bytes_lost);
    Ok(())
}
