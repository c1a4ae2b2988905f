use pagesync_core::config::ConfigStore;
use pagesync_core::{PageSource, SyncEngine};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: pagesync [--config <path>] pull <page-id>\n       pagesync [--config <path>] push <page-id> <file>";

#[derive(Debug, PartialEq)]
enum Command {
    Pull { page_id: String },
    Push { page_id: String, file: PathBuf },
}

#[derive(Debug, PartialEq)]
struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut config_path: Option<PathBuf> = None;
    let mut positional: Vec<&str> = Vec::new();

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let value = iter.next().ok_or_else(|| "Missing --config value".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "--help" | "-h" => return Err(String::new()),
            flag if flag.starts_with("--") => return Err(format!("Unknown argument: {flag}")),
            value => positional.push(value),
        }
    }

    let command = match positional.as_slice() {
        ["pull", page_id] => Command::Pull {
            page_id: page_id.to_string(),
        },
        ["push", page_id, file] => Command::Push {
            page_id: page_id.to_string(),
            file: PathBuf::from(file),
        },
        [] => return Err("Missing command".to_string()),
        [name, ..] if *name != "pull" && *name != "push" => {
            return Err(format!("Unknown command: {name}"))
        }
        _ => return Err("Wrong number of arguments".to_string()),
    };

    Ok(Args {
        config_path,
        command,
    })
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pagesync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let raw = std::env::args().collect::<Vec<_>>();
    let args = match parse_args(&raw) {
        Ok(value) => value,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("{message}");
            }
            fail(USAGE);
        }
    };

    let store = match &args.config_path {
        Some(path) => ConfigStore::new(path.clone()),
        None => ConfigStore::default_store().unwrap_or_else(|err| fail(err)),
    };
    let config = store.load().unwrap_or_else(|err| fail(err));
    let engine = SyncEngine::from_config(&config).unwrap_or_else(|err| fail(err));

    match args.command {
        Command::Pull { page_id } => {
            let opened = engine
                .open_page(&page_id)
                .await
                .unwrap_or_else(|err| fail(format!("Failed to open {page_id}: {err}")));
            let lines = engine.lines(opened.handle).unwrap_or_else(|err| fail(err));
            for line in lines {
                println!("{line}");
            }
            engine.close(opened.handle);
        }
        Command::Push { page_id, file } => {
            let contents = std::fs::read_to_string(&file)
                .unwrap_or_else(|err| fail(format!("Failed to read {}: {err}", file.display())));
            let opened = engine
                .open_page(&page_id)
                .await
                .unwrap_or_else(|err| fail(format!("Failed to open {page_id}: {err}")));
            // Diff against what the remote holds now, not a cached copy.
            if opened.source == PageSource::Cache {
                engine
                    .reload(opened.handle)
                    .await
                    .unwrap_or_else(|err| fail(format!("Failed to refresh {page_id}: {err}")));
            }

            let lines = contents.lines().map(str::to_string).collect();
            let reverted = engine
                .set_lines(opened.handle, lines)
                .unwrap_or_else(|err| fail(err));
            for id in reverted {
                eprintln!("Kept read-only block {id} unchanged");
            }

            let plan = engine.plan(opened.handle).unwrap_or_else(|err| fail(err));
            for entry in &plan.unmatched {
                eprintln!(
                    "Skipped ambiguous block at position {} (matches {})",
                    entry.position,
                    entry.candidates.join(", ")
                );
            }
            let outcome = engine.execute(opened.handle, plan).await;
            engine.close(opened.handle);
            for id in &outcome.misplaced {
                eprintln!("Block {id} is out of order on the remote page");
            }
            if !outcome.ok {
                for error in &outcome.errors {
                    eprintln!("{error}");
                }
                std::process::exit(1);
            }
            println!(
                "Synced {page_id} ({})",
                outcome.content_hash.as_deref().unwrap_or("no changes")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        std::iter::once("pagesync")
            .chain(values.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parses_pull_and_push() {
        assert_eq!(
            parse_args(&args(&["pull", "abc"])).expect("pull").command,
            Command::Pull {
                page_id: "abc".to_string()
            }
        );
        let push = parse_args(&args(&["--config", "c.json", "push", "abc", "page.txt"]))
            .expect("push");
        assert_eq!(push.config_path, Some(PathBuf::from("c.json")));
        assert_eq!(
            push.command,
            Command::Push {
                page_id: "abc".to_string(),
                file: PathBuf::from("page.txt")
            }
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&args(&[])).is_err());
        assert_eq!(
            parse_args(&args(&["sync", "abc"])).unwrap_err(),
            "Unknown command: sync"
        );
        assert!(parse_args(&args(&["push", "abc"])).is_err());
        assert!(parse_args(&args(&["--config"])).is_err());
        assert_eq!(parse_args(&args(&["--help"])).unwrap_err(), "");
    }
}
