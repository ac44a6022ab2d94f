//! `kubectl mft`: pack Kubernetes manifests into OCI artifacts, sign them,
//! and move them between the local store and OCI registries.

use std::{
    io::{BufRead, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use mft::{digest::format_size, Config, CopyOptions, ManifestInfo, Repository};
use mft_sign::{
    ops, KeyInfo, KeyKind, KeyStore, PackOptions, PullOptions, DEFAULT_KEY_NAME,
};

/// kubectl-mft
#[derive(Debug, Parser)]
#[clap(name = "kubectl-mft", version)]
struct App {
    /// Root of the local manifest store (default: $KUBECTL_MFT_STORAGE_DIR
    /// or ~/.local/share/kubectl-mft/manifests)
    #[clap(long, global = true)]
    storage_dir: Option<PathBuf>,
    /// Directory holding signing keys (default: $KUBECTL_MFT_KEY_DIR
    /// or ~/.local/share/kubectl-mft/keys)
    #[clap(long, global = true)]
    key_dir: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    /// Generate an ECDSA P-256 key pair
    Generate {
        /// Name of the key pair
        #[clap(long, default_value = DEFAULT_KEY_NAME)]
        name: String,
        /// Overwrite an existing key pair
        #[clap(long, short = 'f')]
        force: bool,
    },
    /// Import a PEM public key for verification
    Import {
        /// The PEM file to import
        file: PathBuf,
        /// Name to store the key under (default: the file name without extension)
        #[clap(long)]
        name: Option<String>,
        /// Overwrite an existing public key
        #[clap(long, short = 'f')]
        force: bool,
    },
    /// Write a public key to stdout
    Export {
        #[clap(long, default_value = DEFAULT_KEY_NAME)]
        name: String,
    },
    /// List all keys in the key directory
    List,
    /// Delete a public key, or the private key with --private
    Delete {
        name: String,
        /// Delete the private key instead of the public key
        #[clap(long)]
        private: bool,
    },
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store a manifest file under a tag and sign it
    Pack {
        /// Reference to store the manifest as, e.g. registry.example.com/team/app:v1
        tag: String,
        /// Path to the manifest file
        #[clap(long, short = 'f')]
        file: PathBuf,
        /// Store without signing
        #[clap(long)]
        skip_sign: bool,
        /// Name of the private key to sign with
        #[clap(long, default_value = DEFAULT_KEY_NAME)]
        key: String,
    },
    /// Upload a stored manifest and its signatures to its registry
    Push {
        #[clap(long, short = 't')]
        tag: String,
    },
    /// Download a manifest and its signatures, then verify it
    Pull {
        tag: String,
        /// Keep the manifest without verifying its signature
        #[clap(long)]
        skip_verify: bool,
    },
    /// Copy a stored manifest and its signatures to another tag
    Cp { source: String, destination: String },
    /// Delete a stored manifest and any blobs nothing else uses
    Delete {
        #[clap(long, short = 't')]
        tag: String,
        /// Do not ask for confirmation
        #[clap(long, short = 'f')]
        force: bool,
    },
    /// Write the content of a stored manifest
    Dump {
        #[clap(long, short = 't')]
        tag: String,
        /// Write to this file instead of stdout
        #[clap(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Print the on-disk path of a stored manifest's content
    Path {
        #[clap(long, short = 't')]
        tag: String,
    },
    /// List stored manifests
    List {
        #[clap(long, short = 'o', value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Sign a stored manifest
    Sign {
        tag: String,
        /// Name of the private key to sign with
        #[clap(long, default_value = DEFAULT_KEY_NAME)]
        key: String,
    },
    /// Check a stored manifest's signatures against the public keys
    Verify { tag: String },
    /// Manage signing and verification keys
    Key {
        #[clap(subcommand)]
        cmd: KeyCommand,
    },
}

fn load_config(args: &App) -> Result<Config> {
    let mut config = Config::from_env().context("Resolving storage locations")?;
    if let Some(dir) = &args.storage_dir {
        config = config.with_storage_dir(dir);
    }
    if let Some(dir) = &args.key_dir {
        config = config.with_key_dir(dir);
    }
    log::debug!("using {config:?}");
    Ok(config)
}

/// A token cancelled on the first ^C.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::debug!("interrupted, cancelling transfers");
            cancel.cancel();
        }
    });
    token
}

/// Prints `rows` left aligned with three spaces between columns.
fn print_table<const N: usize>(header: [&str; N], rows: &[[String; N]]) {
    let mut widths = header.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }
    let line = |cells: [&str; N]| {
        let mut out = String::new();
        for (i, cell) in cells.iter().enumerate() {
            if i + 1 == N {
                out.push_str(cell);
            } else {
                out.push_str(&format!("{cell:<width$}   ", width = widths[i]));
            }
        }
        println!("{}", out.trim_end());
    };
    line(header);
    for row in rows {
        line(row.each_ref().map(String::as_str));
    }
}

fn print_manifests(infos: &[ManifestInfo], output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(infos)?);
        }
        OutputFormat::Table if infos.is_empty() => println!("No manifests found"),
        OutputFormat::Table => {
            let rows: Vec<_> = infos
                .iter()
                .map(|info| {
                    [
                        info.repository.clone(),
                        info.tag.clone(),
                        format_size(info.size),
                        info.created
                            .with_timezone(&chrono::Local)
                            .format("%Y-%m-%d %H:%M:%S")
                            .to_string(),
                    ]
                })
                .collect();
            print_table(["REPOSITORY", "TAG", "SIZE", "CREATED"], &rows);
        }
    }
    Ok(())
}

fn print_keys(keys: &KeyStore, infos: &[KeyInfo]) -> Result<()> {
    if infos.is_empty() {
        println!("No keys found");
        return Ok(());
    }
    let mut rows = Vec::new();
    for info in infos {
        for (present, kind, label) in [
            (info.has_private, KeyKind::Private, "private"),
            (info.has_public, KeyKind::Public, "public"),
        ] {
            if present {
                let path = keys.key_path(&info.name, kind)?;
                rows.push([
                    info.name.clone(),
                    label.to_string(),
                    path.display().to_string(),
                ]);
            }
        }
    }
    print_table(["NAME", "TYPE", "PATH"], &rows);
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} (y/N): ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

fn run_key_cmd(keys: &KeyStore, cmd: KeyCommand) -> Result<()> {
    match cmd {
        KeyCommand::Generate { name, force } => {
            keys.generate(&name, force)?;
            println!("Generated key pair {name:?}");
            println!("private {}", keys.key_path(&name, KeyKind::Private)?.display());
            println!("public  {}", keys.key_path(&name, KeyKind::Public)?.display());
        }
        KeyCommand::Import { file, name, force } => {
            let name = keys
                .import_public(&file, name.as_deref(), force)
                .with_context(|| format!("Importing {}", file.display()))?;
            println!("Imported public key {name:?}");
        }
        KeyCommand::Export { name } => {
            print!("{}", keys.export_public(&name)?);
        }
        KeyCommand::List => print_keys(keys, &keys.list()?)?,
        KeyCommand::Delete { name, private } => {
            if private {
                keys.delete(&name, KeyKind::Private)?;
                println!("Private key {name:?} deleted");
            } else {
                keys.delete(&name, KeyKind::Public)?;
                println!("Public key {name:?} deleted");
            }
        }
    }
    Ok(())
}

async fn run_cmd(config: Config, cmd: Command) -> Result<()> {
    let keys = KeyStore::from_config(&config);
    let copy_options = || CopyOptions {
        with_referrers: true,
        cancel: cancel_on_interrupt(),
    };

    match cmd {
        Command::Pack {
            tag,
            file,
            skip_sign,
            key,
        } => {
            let repo = Repository::new(&config, &tag)?;
            let options = PackOptions {
                key_name: key,
                skip_sign,
            };
            let packed = ops::pack(&repo, &keys, &file, &options)
                .await
                .with_context(|| format!("Packing {} as {}", file.display(), repo.display()))?;
            println!("manifest  {}", packed.manifest.digest());
            if let Some(signature) = packed.signature {
                println!("signature {}", signature.digest);
            }
            println!("tagged    {}", repo.display());
        }
        Command::Push { tag } => {
            let repo = Repository::new(&config, &tag)?;
            let result = repo
                .push(&copy_options())
                .await
                .with_context(|| format!("Pushing {}", repo.display()))?;
            log::debug!("{} copied, {} skipped", result.copied, result.skipped);
            println!("Pushed {} ({})", repo.display(), result.root.digest());
        }
        Command::Pull { tag, skip_verify } => {
            let repo = Repository::new(&config, &tag)?;
            let options = PullOptions {
                skip_verify,
                copy: copy_options(),
            };
            let pulled = mft_sign::pull(&repo, &keys, &options)
                .await
                .with_context(|| format!("Pulling {}", repo.display()))?;
            println!("Pulled {} ({})", repo.display(), pulled.copy.root.digest());
            match pulled.verified {
                Some(verified) => println!("Verified with key {:?}", verified.key),
                None => println!("Signature verification skipped"),
            }
        }
        Command::Cp {
            source,
            destination,
        } => {
            let src = Repository::new(&config, &source)?;
            let dest = Repository::new(&config, &destination)?;
            src.copy_to(&dest, &copy_options())
                .await
                .with_context(|| format!("Copying {} to {}", src.display(), dest.display()))?;
            println!("Copied {} to {}", src.display(), dest.display());
        }
        Command::Delete { tag, force } => {
            let repo = Repository::new(&config, &tag)?;
            if !repo.exists().await? {
                println!("Warning: manifest {} not found locally", repo.display());
                return Ok(());
            }
            if !force && !confirm(&format!("Delete manifest {}?", repo.display()))? {
                println!("Cancelled");
                return Ok(());
            }
            match repo.delete().await? {
                Some(deleted) => println!(
                    "Deleted {}:{} ({}, {} blobs removed)",
                    deleted.repository,
                    deleted.tag,
                    format_size(deleted.size),
                    deleted.removed_blobs.len()
                ),
                None => println!("Warning: manifest {} not found locally", repo.display()),
            }
        }
        Command::Dump { tag, output } => {
            let repo = Repository::new(&config, &tag)?;
            let content = repo.dump().await?;
            match output {
                Some(path) => tokio::fs::write(&path, &content)
                    .await
                    .with_context(|| format!("Writing {}", path.display()))?,
                None => std::io::stdout().write_all(&content)?,
            }
        }
        Command::Path { tag } => {
            let repo = Repository::new(&config, &tag)?;
            println!("{}", repo.path().await?.display());
        }
        Command::List { output } => {
            let infos = mft::list(&config).await?;
            print_manifests(&infos, output)?;
        }
        Command::Sign { tag, key } => {
            let repo = Repository::new(&config, &tag)?;
            let signed = ops::sign(&repo, &keys, &key).await?;
            println!(
                "Signed {} (signature digest: {})",
                repo.display(),
                signed.digest
            );
        }
        Command::Verify { tag } => {
            let repo = Repository::new(&config, &tag)?;
            ops::verify(&repo, &keys).await?;
            println!("Verified {}: signature is valid", repo.display());
        }
        Command::Key { cmd } => run_key_cmd(&keys, cmd)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();
    let config = load_config(&args)?;
    run_cmd(config, args.cmd).await
}
