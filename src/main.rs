use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use acme_dns_issuer::config::{
    parse_directory_url, DnsCredentials, DEFAULT_DATA_ROOT, LETS_ENCRYPT_STAGING_URL,
};
use acme_dns_issuer::{
    new_provider, DirectoryConnector, DnsSettings, EmailAddress, IssueConfig, IssueError, Issued,
    Issuer, KeyType, ProviderKind,
};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("acme-dns-issuer")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Shazz Amin <me@shazz.me>")
        .about("Issue an ACME (Let's Encrypt) certificate for one or more domains through DNS validation")
        .arg(Arg::new("domains")
            .value_name("DOMAINS")
            .help("Comma-separated domains to cover; e.g.: example.com,*.example.com")
            .required(true))
        .arg(Arg::new("email")
            .short('e')
            .long("email")
            .value_name("EMAIL")
            .help("E-mail address for the new account; e.g.: hello@example.com")
            .required(true))
        .arg(Arg::new("email-template")
            .long("email-template")
            .action(ArgAction::SetTrue)
            .help("Replace %v in the e-mail address with the current Unix timestamp"))
        .arg(Arg::new("user")
            .short('u')
            .long("user")
            .value_name("ACCOUNT")
            .env("DNSIMPLE_USER")
            .help("DNS provider account; looked up from the API key when omitted"))
        .arg(Arg::new("api-key")
            .short('k')
            .long("api-key")
            .value_name("TOKEN")
            .env("DNSIMPLE_API_KEY")
            .hide_env_values(true)
            .help("DNS provider API key"))
        .arg(Arg::new("url")
            .long("url")
            .value_name("URL")
            .default_value(LETS_ENCRYPT_STAGING_URL)
            .value_parser(|url: &str| parse_directory_url(url).map_err(|e| e.to_string()))
            .help("ACME directory URL"))
        .arg(Arg::new("path")
            .short('p')
            .long("path")
            .value_name("DIRECTORY")
            .default_value(DEFAULT_DATA_ROOT)
            .value_parser(value_parser!(PathBuf))
            .help("Directory to store account keys and certificates in"))
        .arg(Arg::new("dns")
            .long("dns")
            .value_name("PROVIDER")
            .default_value("dnsimple")
            .value_parser(|kind: &str| kind.parse::<ProviderKind>().map_err(|e| e.to_string()))
            .help("How to publish challenge records: dnsimple or standalone"))
        .arg(Arg::new("dns-api-url")
            .long("dns-api-url")
            .value_name("URL")
            .help("Override the DNS provider API endpoint, e.g. the DNSimple sandbox"))
        .arg(Arg::new("dns-bind")
            .long("dns-bind")
            .value_name("ADDRESS")
            .default_value("0.0.0.0:53")
            .value_parser(value_parser!(SocketAddr))
            .help("Address the standalone DNS server listens on"))
        .arg(Arg::new("key-type")
            .long("key-type")
            .value_name("TYPE")
            .default_value("rsa2048")
            .value_parser(|kind: &str| kind.parse::<KeyType>().map_err(|e| e.to_string()))
            .help("Certificate key: rsa2048, rsa3072, rsa4096, rsa8192, ec256 or ec384"))
        .arg(Arg::new("log-level")
            .long("log-level")
            .value_name("LEVEL")
            .default_value("info")
            .help("Log filter; RUST_LOG takes precedence"))
}

fn settings(args: &ArgMatches) -> (IssueConfig, DnsSettings) {
    let email = args.get_one::<String>("email").cloned().unwrap_or_default();
    let email = if args.get_flag("email-template") {
        EmailAddress::Template(email)
    } else {
        EmailAddress::Exact(email)
    };

    let mut config = IssueConfig::new(email);
    if let Some(url) = args.get_one::<String>("url") {
        config.directory_url = url.clone();
    }
    if let Some(path) = args.get_one::<PathBuf>("path") {
        config.data_root = path.clone();
    }
    if let Some(key_type) = args.get_one::<KeyType>("key-type") {
        config.certificate_key_type = *key_type;
    }

    let credentials = DnsCredentials {
        user: args.get_one::<String>("user").cloned(),
        api_key: args.get_one::<String>("api-key").cloned(),
    };
    let provider = args
        .get_one::<ProviderKind>("dns")
        .copied()
        .unwrap_or(ProviderKind::Dnsimple);
    let mut dns = DnsSettings::new(provider, credentials);
    dns.api_url = args.get_one::<String>("dns-api-url").cloned();
    if let Some(bind) = args.get_one::<SocketAddr>("dns-bind") {
        dns.bind = *bind;
    }

    (config, dns)
}

fn run(args: &ArgMatches) -> Result<Issued, IssueError> {
    let domains = args
        .get_one::<String>("domains")
        .map(String::as_str)
        .unwrap_or_default();
    let (config, dns) = settings(args);
    let provider = new_provider(&dns)?;

    info!(
        domains = %domains,
        directory = %config.directory_url,
        provider = %dns.provider,
        "Ordering certificate"
    );

    let connector = DirectoryConnector::default();
    Issuer::new(config, &connector).issue(domains, provider)
}

fn main() -> ExitCode {
    let args = cli().get_matches();

    let level = args
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(&args) {
        Ok(issued) => {
            info!(
                email = %issued.email,
                account = %issued.account_dir.display(),
                certificate = %issued.certificate_dir.display(),
                "Order successful"
            );
            if let Ok(days) = issued.bundle.days_until_expiry() {
                info!("Certificate will expire in {} days", days);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Issuance failed");
            ExitCode::from(e.exit_code())
        }
    }
}
