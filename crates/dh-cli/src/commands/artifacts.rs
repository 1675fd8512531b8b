use std::io::Write;
use std::path::Path;

use anyhow::Context;
use dh_core::config::Config;
use uuid::Uuid;

use super::open_artifacts;

/// List one task's artifacts, or every task that has any.
pub fn list(cfg: &Config, task: Option<Uuid>) -> anyhow::Result<()> {
    let store = open_artifacts(cfg);
    let Some(task_id) = task else {
        for task_id in store.list_tasks()? {
            let count = store.list(task_id)?.len();
            println!("{task_id}  {count} artifact(s)");
        }
        return Ok(());
    };

    let metas = store.list(task_id)?;
    if metas.is_empty() {
        println!("no artifacts for task {task_id}");
    }
    for meta in metas {
        println!(
            "{}  {:<40} {:>10} bytes  {}",
            meta.id,
            meta.original_name,
            meta.size_bytes,
            meta.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Decrypt an artifact into `out`, or to stdout when no path is given.
pub fn get(cfg: &Config, id: Uuid, out: Option<&Path>) -> anyhow::Result<()> {
    let store = open_artifacts(cfg);
    let bytes = store.load(id).with_context(|| format!("reading artifact {id}"))?;
    match out {
        Some(path) => {
            std::fs::write(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
            eprintln!("wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

pub fn delete(cfg: &Config, id: Uuid) -> anyhow::Result<()> {
    open_artifacts(cfg).delete(id)?;
    println!("deleted {id}");
    Ok(())
}
