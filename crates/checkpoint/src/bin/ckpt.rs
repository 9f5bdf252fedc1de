//! Checkpoint directory inspection tool
//!
//! ```text
//! ckpt list  <dir> [prefix]
//! ckpt show  <dir> [step] [prefix]
//! ckpt prune <dir> <keep> [prefix]
//! ```

use checkpoint::CheckpointManager;
use checkpoint_core::{CheckpointConfig, Tree};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: ckpt <list|show|prune> <dir> [args] [prefix]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "checkpoint=info,ckpt=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (Some(command), Some(dir)) = (args.first(), args.get(1)) else {
        return Err(USAGE.into());
    };

    match command.as_str() {
        "list" => {
            let manager = open(dir, args.get(2)).await?;
            for step in manager.available_steps().await? {
                let info = manager.snapshot_info(step).await?;
                println!(
                    "{:>10}  {:>12} bytes  {}  {}",
                    info.step,
                    info.payload_bytes,
                    info.created_at.to_rfc3339(),
                    info.path.display()
                );
            }
        }
        "show" => {
            // A non-numeric third argument is the prefix
            let (step, prefix) = match args.get(2).map(|s| s.parse::<u64>()) {
                Some(Ok(step)) => (Some(step), args.get(3)),
                Some(Err(_)) => (None, args.get(2)),
                None => (None, None),
            };
            let manager = open(dir, prefix).await?;
            let tree = manager.restore(step, None).await?;
            print_outline(&tree, "", 0);
        }
        "prune" => {
            let keep: usize = args
                .get(2)
                .ok_or(USAGE)?
                .parse()
                .map_err(|e| format!("invalid keep count: {}", e))?;
            let manager = open(dir, args.get(3)).await?;
            let evicted = manager.prune(keep).await?;
            tracing::info!(count = evicted.len(), "Pruned snapshots");
            for step in evicted {
                println!("removed {}", step);
            }
        }
        other => return Err(format!("unknown command {:?}\n{}", other, USAGE).into()),
    }

    Ok(())
}

async fn open(
    dir: &str,
    prefix: Option<&String>,
) -> Result<CheckpointManager, Box<dyn std::error::Error + Send + Sync>> {
    let mut config = CheckpointConfig::new(dir);
    if let Some(prefix) = prefix {
        config.prefix = prefix.clone();
    }
    Ok(CheckpointManager::open_existing(config).await?)
}

fn print_outline(tree: &Tree, key: &str, depth: usize) {
    let indent = "  ".repeat(depth);
    let label = if key.is_empty() { "<root>" } else { key };
    match tree {
        Tree::Map(fields) => {
            println!("{}{}: map ({} keys)", indent, label, fields.len());
            for (k, v) in fields {
                print_outline(v, k, depth + 1);
            }
        }
        Tree::Seq(items) => {
            println!("{}{}: seq ({} items)", indent, label, items.len());
            for (i, v) in items.iter().enumerate() {
                print_outline(v, &i.to_string(), depth + 1);
            }
        }
        Tree::Array(a) => println!("{}{}: array {} {:?}", indent, label, a.dtype(), a.shape()),
        Tree::Sharded(s) => println!(
            "{}{}: sharded {} {:?} mesh {:?}",
            indent,
            label,
            s.array.dtype(),
            s.array.shape(),
            s.mesh.axes
        ),
        Tree::Scalar(s) => println!("{}{}: scalar {:?}", indent, label, s),
        Tree::String(s) => println!("{}{}: string {:?}", indent, label, s),
    }
}
