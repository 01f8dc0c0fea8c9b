//! CLI tool for managing proxy entries and certificates
//!
//! Usage:
//!   domain-proxy-admin add <host> [--target <url> | --redirect-url <url>] [--https] [--cors]
//!   domain-proxy-admin update <host> [options]
//!   domain-proxy-admin remove <host> [--target <url>]
//!   domain-proxy-admin list [--json]
//!   domain-proxy-admin domains
//!   domain-proxy-admin cert-add <domain> <cert.pem> <key.pem>
//!   domain-proxy-admin cert-remove <domain>
//!   domain-proxy-admin cert-self-signed <domain>
//!
//! A running proxy picks up changes on SIGHUP.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use domain_proxy::certificate;
use domain_proxy::config::DEFAULT_CERTS_DIR;
use domain_proxy::entry::split_host;
use domain_proxy::{EntrySpec, EntryStore, ProxyEntry, SqliteStore};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

/// CLI tool for managing domain-proxy entries
#[derive(Parser, Debug)]
#[command(name = "domain-proxy-admin")]
#[command(version = "1.0.0")]
#[command(about = "Manage entries and certificates for domain-proxy")]
struct Args {
    /// Database path
    #[arg(long, env = "DB_PATH", default_value = "./data/proxy.db")]
    db_path: PathBuf,

    /// Directory holding one certificate folder per root domain
    #[arg(long, env = "CERTS_DIR", default_value = DEFAULT_CERTS_DIR)]
    certs_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a new entry
    Add {
        /// Domain, optionally with a path prefix (e.g., api.example.com/v1)
        host: String,

        /// Backend base URL (e.g., http://127.0.0.1:3000)
        #[arg(short = 't', long)]
        target: Option<String>,

        /// Redirect every request to this URL instead of forwarding
        #[arg(short = 'r', long)]
        redirect_url: Option<String>,

        /// Upgrade plaintext requests to HTTPS
        #[arg(long)]
        https: bool,

        /// Add CORS headers and answer preflight requests
        #[arg(long)]
        cors: bool,
    },

    /// Update an existing entry, keeping fields that are not given
    Update {
        /// Domain, optionally with a path prefix
        host: String,

        /// Backend base URL
        #[arg(short = 't', long)]
        target: Option<String>,

        /// Redirect URL
        #[arg(short = 'r', long)]
        redirect_url: Option<String>,

        /// Upgrade plaintext requests to HTTPS
        #[arg(long)]
        https: Option<bool>,

        /// Add CORS headers
        #[arg(long)]
        cors: Option<bool>,
    },

    /// Remove entries for a domain (or domain/path)
    Remove {
        host: String,

        /// Only remove the entry pointing at this target
        #[arg(short = 't', long)]
        target: Option<String>,
    },

    /// List all entries
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List configured domains
    Domains,

    /// Install a PEM certificate chain and key for a root domain
    CertAdd {
        domain: String,
        certificate: PathBuf,
        key: PathBuf,
    },

    /// Remove the certificate for a root domain
    CertRemove { domain: String },

    /// Generate a self-signed certificate covering a domain and its subdomains
    CertSelfSigned { domain: String },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Add {
            host,
            target,
            redirect_url,
            https,
            cors,
        } => {
            let db = SqliteStore::open(&args.db_path)?;
            let entry = ProxyEntry::try_from(EntrySpec {
                domain: host,
                path: None,
                target,
                redirect_url,
                redirect: https,
                cors,
            })?;

            db.insert(&entry)?;

            println!("Added entry:");
            print_entry(&entry);
        }

        Commands::Update {
            host,
            target,
            redirect_url,
            https,
            cors,
        } => {
            let db = SqliteStore::open(&args.db_path)?;
            let (_, path) = split_host(&host);
            let path = path.trim_matches('/');
            let existing = db.find(&host)?;

            let current = match existing.into_iter().find(|e| e.path() == path) {
                Some(entry) => EntrySpec::from(entry),
                None => bail!("No entry found for {}", host),
            };

            let redirect = https.unwrap_or(current.redirect);
            let cors = cors.unwrap_or(current.cors);

            // A new target replaces a redirect URL and vice versa
            let entry = match (target, redirect_url) {
                (None, None) => ProxyEntry::from_record(EntrySpec {
                    redirect,
                    cors,
                    ..current
                })?,
                (target, redirect_url) => ProxyEntry::try_from(EntrySpec {
                    target,
                    redirect_url,
                    redirect,
                    cors,
                    ..current
                })?,
            };

            db.upsert(&entry)?;
            println!("Updated entry for {}", entry.host_key());
        }

        Commands::Remove { host, target } => {
            let db = SqliteStore::open(&args.db_path)?;
            let removed = db.remove(&host, target.as_deref())?;

            if removed == 0 {
                bail!("No entries found for {}", host);
            }
            println!("Removed {} entr{} for {}", removed, if removed == 1 { "y" } else { "ies" }, host);
        }

        Commands::List { json } => {
            let db = SqliteStore::open(&args.db_path)?;
            let entries = db.list()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                return Ok(());
            }

            if entries.is_empty() {
                println!("No entries found");
                return Ok(());
            }

            println!("{:<40} {:<45} {:<6} {:<5}", "HOST", "TARGET", "HTTPS", "CORS");
            println!("{}", "-".repeat(99));

            for entry in &entries {
                let destination = match (entry.target(), entry.redirect_url()) {
                    (Some(target), _) => target.to_string(),
                    (None, Some(url)) => format!("-> {}", url),
                    (None, None) => String::new(),
                };
                println!(
                    "{:<40} {:<45} {:<6} {:<5}",
                    entry.host_key(),
                    destination,
                    entry.redirect(),
                    entry.cors()
                );
            }

            println!("\nTotal: {} entries", entries.len());
        }

        Commands::Domains => {
            let db = SqliteStore::open(&args.db_path)?;
            let domains: BTreeSet<String> =
                db.list()?.iter().map(|e| e.domain().to_string()).collect();

            for domain in domains {
                println!("{}", domain);
            }
        }

        Commands::CertAdd {
            domain,
            certificate: cert_path,
            key: key_path,
        } => {
            let cert_pem = fs::read_to_string(&cert_path)
                .with_context(|| format!("reading {}", cert_path.display()))?;
            let key_pem = fs::read_to_string(&key_path)
                .with_context(|| format!("reading {}", key_path.display()))?;

            let dir = certificate::install_certificate(&args.certs_dir, &domain, &cert_pem, &key_pem)?;
            println!("Installed certificate for {} in {}", domain, dir.display());
        }

        Commands::CertRemove { domain } => {
            if !certificate::remove_certificate(&args.certs_dir, &domain)? {
                bail!("No certificate found for {}", domain);
            }
            println!("Removed certificate for {}", domain);
        }

        Commands::CertSelfSigned { domain } => {
            let dir = certificate::generate_self_signed(&args.certs_dir, &domain)?;
            println!("Generated self-signed certificate for {} in {}", domain, dir.display());
        }
    }

    Ok(())
}

fn print_entry(entry: &ProxyEntry) {
    println!("  Domain:        {}", entry.domain());
    if !entry.path().is_empty() {
        println!("  Path:          /{}", entry.path());
    }
    if let Some(target) = entry.target() {
        println!("  Target:        {}", target);
    }
    if let Some(url) = entry.redirect_url() {
        println!("  Redirect URL:  {}", url);
    }
    println!("  HTTPS upgrade: {}", entry.redirect());
    println!("  CORS:          {}", entry.cors());
}
