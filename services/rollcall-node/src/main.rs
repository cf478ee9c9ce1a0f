//! rollcall-node: operator and device front end for Rollcall.
//!
//! Every subcommand opens the configured store, performs one operation and
//! prints its result as JSON on stdout. Logs go to stderr.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rollcall_checkin::{CheckinGateway, CheckinRequest, CheckinStateMachine};
use rollcall_core::store::{IdentityStore, Session, SessionDirectory, TimeSlot};
use rollcall_core::time::{now_utc, parse_wire};
use rollcall_core::{logging, Config, SqliteStore};
use rollcall_crypto::SigningKeyPair;
use rollcall_identity::{
    CertificateAuthority, CertificateWire, IssueRequest, IssuedCertificate, Provisioner,
};
use serde::Serialize;
use tracing::{info, warn};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[derive(Parser)]
#[command(name = "rollcall-node")]
#[command(about = "Device certificates and attendance check-ins")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "ROLLCALL_CONFIG", default_value = "rollcall.toml")]
    config: PathBuf,

    /// Print version information as JSON and exit
    #[arg(long)]
    version_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Generate the CA signing key
    InitCa {
        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },
    /// Create a pending identity and print its one-time token
    Provision {
        #[arg(long)]
        id: String,
        #[arg(long)]
        employee: i64,
        /// Use this token instead of generating one
        #[arg(long)]
        token: Option<String>,
    },
    /// Act as a device: generate a key pair and redeem a token for a certificate
    Issue {
        #[arg(long)]
        id: String,
        #[arg(long)]
        token: String,
        /// Where to write the device private key
        #[arg(long)]
        key_out: PathBuf,
        /// Where to write the certificate (stdout if omitted)
        #[arg(long)]
        cert_out: Option<PathBuf>,
    },
    /// Check a certificate against the CA key
    Verify {
        #[arg(long)]
        cert: PathBuf,
    },
    /// Add a roster entry
    AddSession {
        #[arg(long)]
        session_id: i64,
        /// YYYY-MM-DD
        #[arg(long)]
        date: String,
        /// morning, afternoon or evening
        #[arg(long)]
        slot: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        employee: Option<i64>,
    },
    /// Record a check-in for the holder of a certificate
    Checkin {
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        session_id: i64,
        /// Event time as "YYYY-MM-DD HH:MM:SS" UTC (defaults to now)
        #[arg(long)]
        at: Option<String>,
    },
    /// List an employee's attendance records
    History {
        #[arg(long)]
        employee: i64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.version_json {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let (config, base) = load_config(&cli.config)?;
    logging::init_from_config(&config.logging);

    let Some(command) = cli.command else {
        bail!("no subcommand given; see --help");
    };

    match command {
        Command::InitCa { force } => init_ca(&config, &base, force),
        Command::Provision { id, employee, token } => {
            let store = open_store(&config, &base)?;
            let provisioned = Provisioner::new(&store).provision(&id, employee, token)?;
            print_json(&serde_json::json!({
                "id": provisioned.identity_id,
                "token": provisioned.one_time_token,
                "employee_id": provisioned.employee_id,
            }))
        }
        Command::Issue {
            id,
            token,
            key_out,
            cert_out,
        } => {
            let store = open_store(&config, &base)?;
            let ca = CertificateAuthority::from_config(load_ca_key(&config, &base)?, store, &config.ca)?;
            let issued = issue_device(&ca, id, token, &key_out, now_utc())?;

            let wire = serde_json::to_string_pretty(&issued.to_wire())?;
            match cert_out {
                Some(path) => {
                    if let Err(e) = std::fs::write(&path, &wire) {
                        // The token is spent; keep the certificate reachable.
                        println!("{}", wire);
                        return Err(e)
                            .with_context(|| format!("writing certificate to {}", path.display()));
                    }
                }
                None => println!("{}", wire),
            }
            Ok(())
        }
        Command::Verify { cert } => {
            let ca_key = load_ca_key(&config, &base)?;
            let issued = read_certificate(&cert)?;
            let result = issued.check(&ca_key.public_key(), now_utc());
            print_json(&serde_json::json!({
                "id": issued.certificate.identity_id,
                "valid": result.is_ok(),
                "error": result.err().map(|e| e.to_string()),
            }))
        }
        Command::AddSession {
            session_id,
            date,
            slot,
            role,
            employee,
        } => {
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .with_context(|| format!("invalid date {:?}", date))?;
            let Some(time_slot) = TimeSlot::parse(&slot) else {
                bail!("invalid slot {:?}: expected morning, afternoon or evening", slot);
            };
            let store = open_store(&config, &base)?;
            let session = Session {
                session_id,
                date,
                time_slot,
                role,
                employee_id: employee,
            };
            store.insert_session(session.clone())?;
            print_json(&session)
        }
        Command::Checkin {
            cert,
            session_id,
            at,
        } => {
            let now = match at {
                Some(at) => parse_event_time(&at)?,
                None => now_utc(),
            };
            let ca_key = load_ca_key(&config, &base)?;
            let store = Arc::new(open_store(&config, &base)?);
            let machine = CheckinStateMachine::from_config(
                Arc::clone(&store),
                Arc::clone(&store),
                &config.checkin,
            );
            let gateway = CheckinGateway::new(store, ca_key.public_key(), machine);

            let certificate: CertificateWire = serde_json::from_str(
                &std::fs::read_to_string(&cert)
                    .with_context(|| format!("reading certificate {}", cert.display()))?,
            )?;
            let outcome = gateway.check_in(
                &CheckinRequest {
                    certificate,
                    session_id,
                },
                now,
            )?;
            print_json(&outcome)
        }
        Command::History { employee } => {
            let store = Arc::new(open_store(&config, &base)?);
            let machine =
                CheckinStateMachine::from_config(Arc::clone(&store), store, &config.checkin);
            print_json(&machine.history(employee)?)
        }
    }
}

/// Load the config file, or defaults when it does not exist. Relative paths
/// in the config resolve against the file's directory.
fn load_config(path: &Path) -> anyhow::Result<(Config, PathBuf)> {
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    if path.exists() {
        let config = Config::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?;
        Ok((config, base))
    } else {
        Ok((Config::default_config(), base))
    }
}

fn open_store(config: &Config, base: &Path) -> anyhow::Result<SqliteStore> {
    let path = Config::resolve_path(base, &config.store.path);
    SqliteStore::open(&path).with_context(|| format!("opening store {}", path.display()))
}

fn load_ca_key(config: &Config, base: &Path) -> anyhow::Result<Arc<SigningKeyPair>> {
    let path = Config::resolve_path(base, &config.ca.key_path);
    let pem = std::fs::read_to_string(&path)
        .with_context(|| format!("reading CA key {} (run init-ca first)", path.display()))?;
    Ok(Arc::new(SigningKeyPair::from_pem(&pem)?))
}

fn init_ca(config: &Config, base: &Path, force: bool) -> anyhow::Result<()> {
    let path = Config::resolve_path(base, &config.ca.key_path);
    if path.exists() && !force {
        bail!("{} already exists; pass --force to replace it", path.display());
    }
    let key = SigningKeyPair::generate();
    let staged = staging_path(&path);
    write_private_pem(&staged, &key.to_pem()?)?;
    std::fs::rename(&staged, &path)
        .with_context(|| format!("installing CA key at {}", path.display()))?;
    info!(path = %path.display(), "CA key generated");
    print_json(&serde_json::json!({ "ca_pub": key.public_key().to_hex() }))
}

/// Generate a device key, redeem the token for it and install the key at
/// `key_out`. The key is written before the token is spent, so a bad
/// destination fails without consuming the identity.
fn issue_device<S: IdentityStore>(
    ca: &CertificateAuthority<S>,
    id: String,
    token: String,
    key_out: &Path,
    now: DateTime<Utc>,
) -> anyhow::Result<IssuedCertificate> {
    let device = SigningKeyPair::generate();
    let request = IssueRequest::new(id, token, device.public_key().as_bytes())?;

    let staged = staging_path(key_out);
    write_private_pem(&staged, &device.to_pem()?)?;

    let issued = match ca.issue_at(&request, now) {
        Ok(issued) => issued,
        Err(e) => {
            let _ = std::fs::remove_file(&staged);
            return Err(e.into());
        }
    };
    if let Err(e) = std::fs::rename(&staged, key_out) {
        warn!(staged = %staged.display(), "Device key left at staging path");
        return Err(e).with_context(|| format!("installing device key at {}", key_out.display()));
    }
    Ok(issued)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Create `path` readable by the owner only and write `pem` into it. An
/// existing file is never overwritten.
fn write_private_pem(path: &Path, pem: &str) -> anyhow::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("creating key file {}", path.display()))?;
    file.write_all(pem.as_bytes())
        .and_then(|_| file.sync_all())
        .with_context(|| format!("writing key file {}", path.display()))
}

fn read_certificate(path: &Path) -> anyhow::Result<IssuedCertificate> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading certificate {}", path.display()))?;
    let wire: CertificateWire = serde_json::from_str(&raw)?;
    Ok(IssuedCertificate::from_wire(&wire)?)
}

fn parse_event_time(s: &str) -> anyhow::Result<DateTime<Utc>> {
    parse_wire(s).with_context(|| format!("invalid time {:?}: expected YYYY-MM-DD HH:MM:SS", s))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
