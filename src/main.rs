//! tls-certificates - operator tool for the TLS certificates interface
//!
//! Creates keys, CSRs, CAs and certificates with the same helpers the
//! relation library uses, and checks relation payloads by hand.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::Engine;
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};

use config::{LogFormat, LogTarget, LoggingConfig};
use tls_certificates_interface::services::x509::{self, CsrBuilder};
use tls_certificates_interface::utils::validation::{
    validate_provider_payload, validate_requirer_payload,
};
use tls_certificates_interface::{config, AppConfig};

const CONFIG_HELP: &str = "\
Environment:
    TLS_CERTIFICATES_CONFIG     Path to configuration file
    RUST_LOG                    Log filter (default: from configuration)

Configuration files are searched in this order:
    1. Path specified by TLS_CERTIFICATES_CONFIG
    2. ./tls-certificates.yaml
    3. ./config/tls-certificates.yaml
    4. /etc/tls-certificates/config.yaml";

/// Operator tool for the TLS certificates relation
#[derive(Parser, Debug)]
#[command(name = "tls-certificates", version, after_help = CONFIG_HELP)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an RSA private key
    GenerateKey(GenerateKeyArgs),
    /// Generate a certificate signing request
    GenerateCsr(GenerateCsrArgs),
    /// Generate a self-signed CA certificate
    GenerateCa(GenerateCaArgs),
    /// Sign a CSR with a CA
    Sign(SignArgs),
    /// Package a certificate and key as PKCS#12 (base64 on stdout without --out)
    Pfx(PfxArgs),
    /// Check that a certificate was issued for a CSR
    Match(MatchArgs),
    /// Print a certificate summary as JSON
    Inspect(InspectArgs),
    /// Check a relation payload against its schema
    Validate(ValidateArgs),
}

/// Output file, stdout when omitted
#[derive(Args, Debug)]
struct OutputArgs {
    #[arg(long, value_name = "FILE")]
    out: Option<PathBuf>,
}

impl OutputArgs {
    fn emit(&self, contents: &[u8]) -> Result<()> {
        match &self.out {
            Some(path) => write_output(path, contents),
            None => {
                print!("{}", String::from_utf8_lossy(contents));
                Ok(())
            }
        }
    }
}

#[derive(Args, Debug)]
struct GenerateKeyArgs {
    /// Encrypt the key with this password
    #[arg(long)]
    password: Option<String>,
    /// Key size in bits (default: from configuration)
    #[arg(long)]
    key_size: Option<u32>,
    /// RSA public exponent (default: from configuration)
    #[arg(long)]
    public_exponent: Option<u32>,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct GenerateCsrArgs {
    /// Private key PEM file
    #[arg(long, value_name = "FILE")]
    key: PathBuf,
    /// Common name
    #[arg(long)]
    subject: String,
    #[arg(long)]
    key_password: Option<String>,
    #[arg(long)]
    organization: Option<String>,
    #[arg(long)]
    email: Option<String>,
    /// Two-letter country code (default: from configuration)
    #[arg(long)]
    country: Option<String>,
    #[arg(long = "san-dns", value_name = "NAME")]
    sans_dns: Vec<String>,
    #[arg(long = "san-ip", value_name = "ADDR")]
    sans_ip: Vec<String>,
    #[arg(long = "san-oid", value_name = "OID")]
    sans_oid: Vec<String>,
    /// Leave out the x500UniqueIdentifier attribute
    #[arg(long)]
    no_unique_id: bool,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct GenerateCaArgs {
    /// CA private key PEM file
    #[arg(long, value_name = "FILE")]
    key: PathBuf,
    /// Common name
    #[arg(long)]
    subject: String,
    #[arg(long)]
    key_password: Option<String>,
    #[arg(long)]
    validity_days: Option<u32>,
    #[arg(long)]
    country: Option<String>,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct SignArgs {
    #[arg(long, value_name = "FILE")]
    csr: PathBuf,
    /// CA certificate PEM file
    #[arg(long, value_name = "FILE")]
    ca: PathBuf,
    /// CA private key PEM file
    #[arg(long, value_name = "FILE")]
    ca_key: PathBuf,
    #[arg(long)]
    ca_key_password: Option<String>,
    #[arg(long)]
    validity_days: Option<u32>,
    /// Extra subject alternative name, repeatable
    #[arg(long = "alt-name", value_name = "NAME")]
    alt_names: Vec<String>,
    /// Issue a CA certificate
    #[arg(long)]
    is_ca: bool,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct PfxArgs {
    #[arg(long, value_name = "FILE")]
    cert: PathBuf,
    #[arg(long, value_name = "FILE")]
    key: PathBuf,
    /// Package password
    #[arg(long)]
    password: String,
    #[arg(long)]
    key_password: Option<String>,
    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct MatchArgs {
    #[arg(long, value_name = "FILE")]
    csr: PathBuf,
    #[arg(long, value_name = "FILE")]
    cert: PathBuf,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[arg(long, value_name = "FILE")]
    cert: PathBuf,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// JSON payload file
    #[arg(long, value_name = "FILE")]
    file: PathBuf,
    /// Validate as a requirer unit payload (default)
    #[arg(long, conflicts_with = "provider")]
    requirer: bool,
    /// Validate as a provider application payload
    #[arg(long)]
    provider: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load().context("Failed to load configuration")?;

    // Flushes file logs on drop
    let _log_guard = init_logging(&config.logging);

    debug!(command = ?cli.command, "Running command");

    match &cli.command {
        Command::GenerateKey(args) => generate_key(args, &config),
        Command::GenerateCsr(args) => generate_csr(args, &config),
        Command::GenerateCa(args) => generate_ca(args, &config),
        Command::Sign(args) => sign(args, &config),
        Command::Pfx(args) => pfx(args),
        Command::Match(args) => match_csr(args),
        Command::Inspect(args) => inspect(args),
        Command::Validate(args) => validate(args),
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
}

fn write_output(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    std::fs::write(path, contents).with_context(|| format!("Failed to write {:?}", path))?;
    info!(path = ?path, "Wrote output");
    Ok(())
}

fn generate_key(args: &GenerateKeyArgs, config: &AppConfig) -> Result<()> {
    let key = x509::generate_private_key(
        args.password.as_deref().map(str::as_bytes),
        args.key_size.unwrap_or(config.keys.key_size),
        args.public_exponent.unwrap_or(config.keys.public_exponent),
    )
    .context("Failed to generate private key")?;
    args.output.emit(key.as_bytes())
}

fn generate_csr(args: &GenerateCsrArgs, config: &AppConfig) -> Result<()> {
    let key = read_file(&args.key)?;
    let mut builder = CsrBuilder::new(&key, &args.subject)
        .add_unique_id(!args.no_unique_id)
        .sans_dns(args.sans_dns.clone())
        .sans_ip(args.sans_ip.clone())
        .sans_oid(args.sans_oid.clone());
    if let Some(password) = &args.key_password {
        builder = builder.private_key_password(password.as_bytes());
    }
    if let Some(organization) = &args.organization {
        builder = builder.organization(organization);
    }
    if let Some(email) = &args.email {
        builder = builder.email_address(email);
    }
    let country = args.country.as_deref().unwrap_or(config.keys.country.as_str());
    builder = builder.country_name(country);

    let csr = builder.build().context("Failed to generate CSR")?;
    args.output.emit(csr.as_bytes())
}

fn generate_ca(args: &GenerateCaArgs, config: &AppConfig) -> Result<()> {
    let key = read_file(&args.key)?;
    let ca = x509::generate_ca(
        &key,
        &args.subject,
        args.key_password.as_deref().map(str::as_bytes),
        args.validity_days.unwrap_or(config.keys.validity_days),
        args.country.as_deref().unwrap_or(config.keys.country.as_str()),
    )
    .context("Failed to generate CA certificate")?;
    args.output.emit(ca.as_bytes())
}

fn sign(args: &SignArgs, config: &AppConfig) -> Result<()> {
    let csr = read_file(&args.csr)?;
    let ca = read_file(&args.ca)?;
    let ca_key = read_file(&args.ca_key)?;
    let certificate = x509::generate_certificate(
        &csr,
        &ca,
        &ca_key,
        args.ca_key_password.as_deref().map(str::as_bytes),
        args.validity_days.unwrap_or(config.keys.validity_days),
        &args.alt_names,
        args.is_ca,
    )
    .context("Failed to sign certificate")?;
    args.output.emit(certificate.as_bytes())
}

fn pfx(args: &PfxArgs) -> Result<()> {
    let certificate = read_file(&args.cert)?;
    let key = read_file(&args.key)?;
    let package = x509::generate_pfx_package(
        &certificate,
        &key,
        &args.password,
        args.key_password.as_deref().map(str::as_bytes),
    )
    .context("Failed to build PKCS#12 package")?;

    match &args.output.out {
        Some(path) => write_output(path, &package),
        None => {
            println!("{}", base64::engine::general_purpose::STANDARD.encode(&package));
            Ok(())
        }
    }
}

fn match_csr(args: &MatchArgs) -> Result<()> {
    let csr = read_file(&args.csr)?;
    let certificate = read_file(&args.cert)?;
    if x509::csr_matches_certificate(&csr, &certificate) {
        println!("match");
        Ok(())
    } else {
        bail!("Certificate was not issued for this CSR")
    }
}

fn inspect(args: &InspectArgs) -> Result<()> {
    let certificate = read_file(&args.cert)?;
    let info = x509::describe_certificate(&certificate).context("Failed to read certificate")?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn validate(args: &ValidateArgs) -> Result<()> {
    let contents = read_file(&args.file)?;
    let payload: serde_json::Value =
        serde_json::from_str(&contents).context("Payload is not valid JSON")?;

    let valid = if args.provider {
        validate_provider_payload(&payload)
    } else {
        validate_requirer_payload(&payload)
    };
    if !valid {
        bail!("Payload does not match the relation schema");
    }
    println!("valid");
    Ok(())
}

/// Initialize logging based on configuration
///
/// Returns the appender guard when logging to files.
fn init_logging(log_config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{prelude::*, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_config.level));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match &log_config.target {
        LogTarget::Console => {
            init_console_logging(subscriber, &log_config.format);
            None
        }
        LogTarget::File => {
            let (writer, guard) = create_file_writer(log_config);
            init_file_logging(subscriber, &log_config.format, writer);
            Some(guard)
        }
        LogTarget::Both => {
            let (writer, guard) = create_file_writer(log_config);
            init_both_logging(subscriber, &log_config.format, writer);
            Some(guard)
        }
    }
}

/// Create a file writer with optional daily rotation
fn create_file_writer(
    log_config: &LoggingConfig,
) -> (
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
) {
    if let Err(e) = std::fs::create_dir_all(&log_config.log_dir) {
        eprintln!(
            "Warning: Failed to create log directory {:?}: {}",
            log_config.log_dir, e
        );
    }

    let file_appender = if log_config.daily_rotation {
        tracing_appender::rolling::daily(&log_config.log_dir, &log_config.log_prefix)
    } else {
        tracing_appender::rolling::never(&log_config.log_dir, &log_config.log_prefix)
    };

    tracing_appender::non_blocking(file_appender)
}

/// Console logging goes to stderr so command output stays clean on stdout
fn init_console_logging<S>(subscriber: S, format: &LogFormat)
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
{
    use tracing_subscriber::{fmt, prelude::*};

    match format {
        LogFormat::Json => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Compact => {
            subscriber
                .with(
                    fmt::layer()
                        .compact()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        LogFormat::Pretty => {
            subscriber
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_file(false)
                        .with_line_number(false)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
    }
}

fn init_file_logging<S>(
    subscriber: S,
    format: &LogFormat,
    writer: tracing_appender::non_blocking::NonBlocking,
) where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
{
    use tracing_subscriber::{fmt, prelude::*};

    match format {
        LogFormat::Json => {
            subscriber
                .with(fmt::layer().json().with_writer(writer))
                .init();
        }
        LogFormat::Compact => {
            subscriber
                .with(fmt::layer().compact().with_ansi(false).with_writer(writer))
                .init();
        }
        LogFormat::Pretty => {
            subscriber
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
        }
    }
}

fn init_both_logging<S>(
    subscriber: S,
    format: &LogFormat,
    writer: tracing_appender::non_blocking::NonBlocking,
) where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
{
    use tracing_subscriber::{fmt, prelude::*};

    match format {
        LogFormat::Json => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stderr)) // Console
                .with(fmt::layer().json().with_writer(writer)) // File
                .init();
        }
        LogFormat::Compact => {
            subscriber
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .with(fmt::layer().compact().with_ansi(false).with_writer(writer))
                .init();
        }
        LogFormat::Pretty => {
            subscriber
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
        }
    }
}
