//! Point d'entrée du moteur de politique SuriBrows.
//!
//! Usage :
//!   suribrows-policy [--data-dir <DOSSIER>] [--write-config]
//!
//! `--write-config` écrit la configuration effective dans le dossier de
//! configuration de la plateforme puis quitte.
//!
//! Le processus hôte (moteur de rendu) nous lance, écrit ses événements en
//! JSON ligne par ligne sur stdin et lit nos réponses sur stdout. Les logs
//! partent sur stderr, filtrés par `RUST_LOG`.
//!
//! Exemples :
//!   cargo run                                  → config par défaut
//!   RUST_LOG=debug cargo run -- --data-dir /tmp/policy

use std::env;
use std::error::Error;
use std::path::PathBuf;

use suribrows_policy::config::Config;

fn main() -> Result<(), Box<dyn Error>> {
    // ── 1. Provider crypto TLS ─────────────────────────────────────────
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| "Échec de l'installation du provider crypto rustls")?;

    // ── 2. Logging / Tracing (stdout est réservé au protocole) ─────────
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // ── 3. Configuration ───────────────────────────────────────────────
    let args = parse_args(env::args().skip(1));
    let mut config = Config::load();
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir;
    }
    if args.write_config {
        config.save()?;
        return Ok(());
    }

    // ── 4. Boucle d'événements mono-thread ─────────────────────────────
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, suribrows_policy::protocol::run(config))?;

    Ok(())
}

#[derive(Debug, Default, PartialEq)]
struct Args {
    data_dir: Option<PathBuf>,
    write_config: bool,
}

/// `--data-dir <DOSSIER>`, `--data-dir=<DOSSIER>` et `--write-config`.
/// Les arguments inconnus sont ignorés.
fn parse_args(args: impl IntoIterator<Item = String>) -> Args {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--write-config" {
            parsed.write_config = true;
        } else if arg == "--data-dir" {
            parsed.data_dir = args.next().map(PathBuf::from);
        } else if let Some(dir) = arg.strip_prefix("--data-dir=") {
            parsed.data_dir = Some(PathBuf::from(dir));
        }
    }
    parsed
}
