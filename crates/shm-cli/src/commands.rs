use std::collections::VecDeque;
use std::path::Path;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, Context};
use colored::Colorize;
use shm_mutable::MutableError;
use shm_store::{ObjectStore, StatsSnapshot, StoreConfig};
use shm_types::{ClientId, ObjectId};
use tracing::debug;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Config(args) => cmd_config(args, cli.format),
        Command::Stress(args) => cmd_stress(args, cli.format),
        Command::Channel(args) => cmd_channel(args, cli.format),
    }
}

fn load_config(file: Option<&Path>) -> anyhow::Result<StoreConfig> {
    match file {
        Some(path) => StoreConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(StoreConfig::default()),
    }
}

fn cmd_config(args: ConfigArgs, format: OutputFormat) -> anyhow::Result<()> {
    let config = load_config(args.file.as_deref())?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Text => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}

fn cmd_stress(args: StressArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut config = load_config(args.file.as_deref())?;
    if let Some(capacity) = args.capacity {
        config.primary_capacity = capacity;
    }
    if let Some(dir) = args.fallback_dir {
        config = config.with_fallback(dir, args.fallback_capacity);
    }
    let store = ObjectStore::open(config).context("failed to open object store")?;
    let client = ClientId::next();

    let mut payload = vec![0u8; args.size];
    let mut held = VecDeque::with_capacity(args.hold + 1);
    let mut rejected = 0usize;
    let started = Instant::now();

    for i in 0..args.objects {
        payload.fill(i as u8);
        let id = ObjectId::random();
        match store.put(client, id, &payload, &[]) {
            Ok(_) => held.push_back(id),
            Err(err) if err.is_capacity() => {
                debug!(%id, error = %err, "object rejected");
                rejected += 1;
            }
            Err(err) => return Err(err).with_context(|| format!("object #{i} failed")),
        }
        while held.len() > args.hold {
            if let Some(oldest) = held.pop_front() {
                store.release(client, &oldest)?;
            }
        }
    }

    let elapsed = started.elapsed();
    let stats = store.stats();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => {
            println!(
                "{} {} objects of {} bytes in {:.2?}",
                "✓".green().bold(),
                args.objects,
                args.size,
                elapsed
            );
            if rejected > 0 {
                println!("  {} {} rejected: store full", "!".yellow().bold(), rejected);
            }
            print_stats(&stats);
        }
    }
    Ok(())
}

fn print_stats(stats: &StatsSnapshot) {
    println!(
        "  Primary:   {} / {} bytes",
        stats.primary_used.to_string().bold(),
        stats.primary_capacity
    );
    println!(
        "  Fallback:  {} / {} bytes ({} allocations)",
        stats.fallback_used.to_string().bold(),
        stats.fallback_capacity,
        stats.fallback_allocations
    );
    println!(
        "  Objects:   {} live, {} evictable",
        stats.objects_live.to_string().bold(),
        stats.objects_evictable
    );
    println!(
        "  Lifecycle: {} created, {} sealed, {} deleted, {} aborted",
        stats.objects_created, stats.objects_sealed, stats.objects_deleted, stats.objects_aborted
    );
    println!(
        "  Evicted:   {} objects, {} bytes",
        stats.objects_evicted.to_string().cyan(),
        stats.bytes_evicted
    );
    if stats.creates_failed > 0 {
        println!("  Failed:    {}", stats.creates_failed.to_string().red());
    }
}

fn cmd_channel(args: ChannelArgs, format: OutputFormat) -> anyhow::Result<()> {
    let config = load_config(args.file.as_deref())?;
    let store = ObjectStore::open(config).context("failed to open object store")?;
    let timeout = Some(store.config().mutable_timeout());
    let id = ObjectId::random();
    store
        .create_mutable(id, args.capacity, args.readers)
        .context("failed to create mutable object")?;
    let mutable = store.mutable();

    let rounds = args.rounds;
    let started = Instant::now();
    thread::scope(|s| -> anyhow::Result<()> {
        let readers: Vec<_> = (0..args.readers)
            .map(|_| {
                s.spawn(move || -> Result<u64, MutableError> {
                    let mut seen = 0;
                    while seen < rounds {
                        let lease = mutable.read_acquire(&id, seen, timeout)?;
                        seen = lease.version();
                        lease.release()?;
                    }
                    Ok(seen)
                })
            })
            .collect();

        for round in 1..=rounds {
            let message = format!("round {round}");
            mutable.write(&id, message.as_bytes(), &[], timeout)?;
        }
        for reader in readers {
            reader.join().map_err(|_| anyhow!("reader thread panicked"))??;
        }
        Ok(())
    })?;

    let elapsed = started.elapsed();
    let header = mutable.header(&id)?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "object": id.to_hex(),
                "version": header.version,
                "readers": header.subscriber_count,
                "elapsed_ms": elapsed.as_millis() as u64,
            })
        ),
        OutputFormat::Text => {
            println!(
                "{} {} versions to {} readers in {:.2?}",
                "✓".green().bold(),
                header.version,
                header.subscriber_count,
                elapsed
            );
            println!("  Object: {}", id.to_hex().yellow());
        }
    }
    Ok(())
}
