#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::Engine;
use clap::{ArgAction, Args, Parser, Subcommand};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{error, info, warn, Level};

use wvlicense::device::DeviceIdentity;
use wvlicense::key::ContentKey;
use wvlicense::license_protocol::license::key_container::KeyType;
use wvlicense::license_protocol::LicenseType;
use wvlicense::mpd;
use wvlicense::pssh::ProtectionHeader;
use wvlicense::request::{
    LicenseRequestBuilder, COMMON_PRIVACY_CERT, SERVICE_CERTIFICATE_CHALLENGE,
    STAGING_PRIVACY_CERT,
};
use wvlicense::session::Session;

#[derive(Parser)]
#[command(name = "wvlicense", version, disable_version_flag = true, about = "Widevine license client")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a license and print the content keys.
    ///
    /// The license server must accept the raw challenge bytes and return the
    /// raw license bytes.
    License {
        #[command(flatten)]
        device: DeviceArgs,
        #[command(flatten)]
        header: HeaderArgs,
        /// License server URL.
        #[arg(short = 's', long = "server")]
        server: String,
        #[arg(short = 't', long = "type", default_value = "STREAMING")]
        license_type: String,
        /// Encrypt the client identification under a service certificate.
        #[arg(short = 'p', long = "privacy", action = ArgAction::SetTrue)]
        privacy: bool,
        /// Service certificate file, or `common` / `staging`. Fetched from the
        /// license server when omitted.
        #[arg(short = 'c', long = "certificate")]
        certificate: Option<String>,
        /// Require the service certificate to be signed by the Widevine root.
        #[arg(long = "verify-certificate", action = ArgAction::SetTrue)]
        verify_certificate: bool,
    },
    /// Run a license request against the public Shaka test server.
    Test {
        #[command(flatten)]
        device: DeviceArgs,
        #[arg(short = 'p', long = "privacy", action = ArgAction::SetTrue)]
        privacy: bool,
    },
    /// Locate and describe the Widevine protection header.
    Pssh {
        #[command(flatten)]
        header: HeaderArgs,
    },
}

#[derive(Args)]
struct DeviceArgs {
    /// `.wvd` device file.
    #[arg(short = 'w', long = "wvd", conflicts_with_all = ["key", "client_id"])]
    wvd: Option<PathBuf>,
    /// Device private key (PEM or DER, PKCS#1 or PKCS#8).
    #[arg(short = 'k', long = "key", requires = "client_id")]
    key: Option<PathBuf>,
    /// Serialized ClientIdentification blob.
    #[arg(long = "client-id", requires = "key")]
    client_id: Option<PathBuf>,
}

#[derive(Args)]
struct HeaderArgs {
    /// Base64 protection header (pssh box or WidevinePsshData).
    #[arg(long = "pssh", conflicts_with = "mpd")]
    pssh: Option<String>,
    /// DASH manifest file or URL.
    #[arg(long = "mpd")]
    mpd: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    info!("wvlicense version {}", env!("CARGO_PKG_VERSION"));

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::License {
            device,
            header,
            server,
            license_type,
            privacy,
            certificate,
            verify_certificate,
        }) => {
            let header = load_header(&header)?;
            run_license(
                &device,
                &header,
                &server,
                &license_type,
                privacy,
                certificate.as_deref(),
                verify_certificate,
            )
        }
        Some(Commands::Test { device, privacy }) => run_test(&device, privacy),
        Some(Commands::Pssh { header }) => run_pssh(&header),
        None => Ok(()),
    }
}

fn run_license(
    device: &DeviceArgs,
    header: &ProtectionHeader,
    server: &str,
    license_type: &str,
    privacy: bool,
    certificate: Option<&str>,
    verify_certificate: bool,
) -> anyhow::Result<()> {
    let mut identity = load_identity(device)?;
    match identity.system_id() {
        Some(system_id) => info!("[+] Loaded Device ({})", system_id),
        None => info!("[+] Loaded Device"),
    }

    let license_type = LicenseType::from_str_name(&license_type.to_uppercase())
        .with_context(|| format!("Unknown license type {}", license_type))?;

    let client = reqwest::blocking::Client::new();

    if privacy {
        let cert_bytes = match certificate {
            Some("common") => base64::engine::general_purpose::STANDARD.decode(COMMON_PRIVACY_CERT)?,
            Some("staging") => {
                base64::engine::general_purpose::STANDARD.decode(STAGING_PRIVACY_CERT)?
            }
            Some(path) => std::fs::read(path)
                .with_context(|| format!("Failed to read certificate {}", path))?,
            None => {
                let response = certificate_request(&client, server)
                    .send()
                    .context("Failed to request service certificate")?;
                let response = ensure_success(response, "get Service Privacy Certificate")?;
                response.bytes().context("Failed to read certificate")?.to_vec()
            }
        };
        let service_id = if verify_certificate {
            identity.install_verified_service_certificate(&cert_bytes)
        } else {
            identity.install_service_certificate(&cert_bytes)
        }
        .context("Failed to install service certificate")?;
        info!("[+] Set Service Privacy Certificate: {}", service_id);
    } else if certificate.is_some() || verify_certificate {
        warn!("[!] --certificate and --verify-certificate have no effect without --privacy");
    }

    let session = Session::new();
    info!(
        "[+] Opened Session: {}",
        String::from_utf8_lossy(session.id())
    );

    let challenge = LicenseRequestBuilder::new(&identity)
        .license_type(license_type)
        .privacy_mode(privacy)
        .build(header, &session)?;
    info!("[+] Created License Request Message (Challenge)");

    let license_res = client
        .post(server)
        .body(challenge.signed().to_vec())
        .send()
        .context("Failed to send challenge")?;
    let license_res = ensure_success(license_res, "send challenge")?;
    let license_bytes = license_res.bytes().context("Failed to read license")?;
    info!("[+] Got License Message");

    let keys = challenge.extract_keys(&license_bytes, &identity)?;
    info!("[+] License Parsed Successfully");

    for key in keys.iter() {
        info!("[{}] {}", key.key_type.as_str_name(), key);
    }

    if let Some(command) = mp4decrypt_command(&keys) {
        println!("{}", command);
    }

    Ok(())
}

fn run_test(device: &DeviceArgs, privacy: bool) -> anyhow::Result<()> {
    let pssh = "AAAAW3Bzc2gAAAAA7e+LqXnWSs6jyCfc1R0h7QAAADsIARIQ62dqu8s0Xpa7z2FmMPGj2hoNd2lkZXZpbmVfdGVzdCIQZmtqM2xqYVNkZmFsa3IzaioCSEQyAA==";
    let license_server = "https://cwip-shaka-proxy.appspot.com/no_auth";
    let header = ProtectionHeader::from_base64(pssh)?;
    run_license(device, &header, license_server, "STREAMING", privacy, None, false)
}

fn run_pssh(args: &HeaderArgs) -> anyhow::Result<()> {
    if let Some(source) = args.mpd.as_deref() {
        let manifest = read_manifest(source)?;
        let headers = mpd::locate_all_protection_headers(&manifest)
            .context("Failed to locate protection header")?;
        info!("[+] Found {} Widevine protection header(s)", headers.len());
        for (index, bytes) in headers.iter().enumerate() {
            info!("[{}] {}", index, base64::engine::general_purpose::STANDARD.encode(bytes));
            describe(&ProtectionHeader::from_bytes(bytes)?);
        }
        return Ok(());
    }

    describe(&load_header(args)?);
    Ok(())
}

fn describe(header: &ProtectionHeader) {
    let data = header.data();
    info!("    version: {}, flags: {}", header.version(), header.flags());
    for kid in header.key_ids() {
        info!("    key id: {}", kid.as_simple());
    }
    if let Some(provider) = data.provider.as_deref() {
        info!("    provider: {}", provider);
    }
    if let Some(content_id) = data.content_id.as_deref() {
        info!("    content id: {}", hex::encode(content_id));
    }
    info!("    init data: {} bytes", header.init_data().len());
}

fn load_header(args: &HeaderArgs) -> anyhow::Result<ProtectionHeader> {
    match (args.pssh.as_deref(), args.mpd.as_deref()) {
        (Some(pssh), _) => ProtectionHeader::from_base64(pssh).context("Invalid PSSH"),
        (None, Some(source)) => {
            let manifest = read_manifest(source)?;
            let bytes = mpd::locate_protection_header(&manifest)
                .context("Failed to locate protection header")?;
            ProtectionHeader::from_bytes(&bytes).context("Invalid protection header in manifest")
        }
        (None, None) => anyhow::bail!("Either --pssh or --mpd is required"),
    }
}

/// The service certificate request: the bare challenge, form-encoded.
fn certificate_request(
    client: &reqwest::blocking::Client,
    server: &str,
) -> reqwest::blocking::RequestBuilder {
    client
        .post(server)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(SERVICE_CERTIFICATE_CHALLENGE)
}

fn ensure_success(
    response: reqwest::blocking::Response,
    action: &str,
) -> anyhow::Result<reqwest::blocking::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(status_error(action, status, &body))
}

fn status_error(action: &str, status: StatusCode, body: &str) -> anyhow::Error {
    error!("[-] Failed to {}: [{}] {}", action, status, body);
    anyhow::anyhow!("Failed to {}: HTTP {}", action, status)
}

fn read_manifest(source: &str) -> anyhow::Result<String> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = reqwest::blocking::get(source)
            .with_context(|| format!("Failed to fetch manifest {}", source))?
            .error_for_status()?;
        return response.text().context("Failed to read manifest");
    }

    std::fs::read_to_string(source).with_context(|| format!("Failed to read manifest {}", source))
}

fn load_identity(args: &DeviceArgs) -> anyhow::Result<DeviceIdentity> {
    if let Some(wvd) = args.wvd.as_deref() {
        return DeviceIdentity::from_wvd_path(wvd).context("Failed to load device");
    }

    match (args.key.as_deref(), args.client_id.as_deref()) {
        (Some(key), Some(client_id)) => {
            let key_bytes = read(key)?;
            let client_id = read(client_id)?;
            DeviceIdentity::from_pem(&key_bytes, client_id.clone())
                .or_else(|_| DeviceIdentity::from_der(&key_bytes, client_id))
                .context("Failed to load private key")
        }
        _ => anyhow::bail!("Either --wvd or --key with --client-id is required"),
    }
}

fn read(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn mp4decrypt_command(keys: &[ContentKey]) -> Option<String> {
    let args: Vec<String> = keys
        .iter()
        .filter(|k| k.key_type == KeyType::Content)
        .map(|k| format!("--key {}", k))
        .collect();
    if args.is_empty() {
        return None;
    }
    Some(format!("mp4decrypt {} <input> <output>", args.join(" ")))
}
