use certbridge::reexports::log;
use certbridge::{
    authorize, CbError, DecodedCsr, HttpCaClient, HttpDeviceRegistry, HttpKeyDirectory,
    IssuerBackend, ProvisioningConfig, Provisioner, RequestEnvelope,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::{crate_description, crate_name, crate_version, Arg, ArgAction, Command};
use std::fs;

/// Read a CSR file and return its transport (base64) encoding.
///
/// Accepts either a PEM file or a file that is already base64-encoded PEM.
fn read_csr_transport(path: &str) -> Result<String, CbError> {
    let content = fs::read_to_string(path)?;
    let trimmed = content.trim();

    if trimmed.starts_with("-----BEGIN") {
        Ok(BASE64.encode(trimmed.as_bytes()))
    } else {
        Ok(trimmed.to_string())
    }
}

fn start() -> Result<(), CbError> {
    let matches = Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Verbose output"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("Prints debugging information"),
        )
        .subcommand(
            Command::new("decode")
                .about("Decode a CSR and print the claimed device identity")
                .arg(
                    Arg::new("csr")
                        .value_name("csr_file")
                        .long("csr-file")
                        .short('c')
                        .required(true)
                        .help("CSR file (PEM, or base64-encoded PEM)"),
                ),
        )
        .subcommand(
            Command::new("authorize")
                .about("Check a CSR against the registered-key directory")
                .arg(
                    Arg::new("csr")
                        .value_name("csr_file")
                        .long("csr-file")
                        .short('c')
                        .required(true)
                        .help("CSR file (PEM, or base64-encoded PEM)"),
                )
                .arg(
                    Arg::new("directory_url")
                        .value_name("url")
                        .long("directory-url")
                        .required(true)
                        .help("Base URL of the registered-key directory"),
                )
                .arg(
                    Arg::new("method_arn")
                        .value_name("arn")
                        .long("method-arn")
                        .required(true)
                        .help("Method ARN of the API method under evaluation"),
                ),
        )
        .subcommand(
            Command::new("provision")
                .about("Run the full provisioning workflow for a CSR")
                .arg(
                    Arg::new("csr")
                        .value_name("csr_file")
                        .long("csr-file")
                        .short('c')
                        .required(true)
                        .help("CSR file (PEM, or base64-encoded PEM)"),
                )
                .arg(
                    Arg::new("ca_url")
                        .value_name("url")
                        .long("ca-url")
                        .help("Base URL of the certificate authority service"),
                )
                .arg(
                    Arg::new("registry_url")
                        .value_name("url")
                        .long("registry-url")
                        .required(true)
                        .help("Base URL of the device registry service"),
                ),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let debug = matches.get_flag("debug");

    env_logger::builder()
        .format_timestamp(None)
        .format_level(false)
        .format_module_path(false)
        .format_target(false)
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else if verbose {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Warn
        })
        .init();

    match matches.subcommand() {
        Some(("decode", sub)) => {
            let csr_file = sub.get_one::<String>("csr").expect("required arg");
            let encoded = read_csr_transport(csr_file)?;
            let csr = DecodedCsr::from_transport(&encoded)?;

            println!("Device identity: {}", csr.identity());
            println!("Key algorithm:   {:?}", csr.key_algorithm());
            println!("{}", csr.public_key_pem());
            Ok(())
        }
        Some(("authorize", sub)) => {
            let csr_file = sub.get_one::<String>("csr").expect("required arg");
            let directory_url = sub.get_one::<String>("directory_url").expect("required arg");
            let method_arn = sub.get_one::<String>("method_arn").expect("required arg");

            let envelope = RequestEnvelope::new()
                .with_header(RequestEnvelope::CSR_HEADER, read_csr_transport(csr_file)?)
                .with_method_arn(method_arn.as_str());

            let directory = HttpKeyDirectory::new(directory_url.as_str());
            let allowed_paths = certbridge::config::allowed_paths_from_env();

            let response = authorize(&directory, &envelope, &allowed_paths)?;
            let json = serde_json::to_string_pretty(&response)
                .map_err(|e| CbError::ConfigError(format!("failed to format response: {}", e)))?;
            println!("{}", json);
            Ok(())
        }
        Some(("provision", sub)) => {
            let csr_file = sub.get_one::<String>("csr").expect("required arg");
            let registry_url = sub.get_one::<String>("registry_url").expect("required arg");
            let ca_url = sub.get_one::<String>("ca_url").map(String::as_str);

            let envelope = RequestEnvelope::new()
                .with_header(RequestEnvelope::CSR_HEADER, read_csr_transport(csr_file)?);

            let config = ProvisioningConfig::from_env()?;

            if config.issuer_backend == IssuerBackend::ManagedCa && ca_url.is_none() {
                return Err(CbError::ConfigError(
                    "--ca-url is required for the managed CA backend".to_string(),
                ));
            }

            // Unused by the registry-signed backend.
            let authority = HttpCaClient::new(ca_url.unwrap_or_default());
            let registry = HttpDeviceRegistry::new(registry_url.as_str());

            let provisioner = Provisioner::new(config, &authority, &registry);
            let response = provisioner.handle(&envelope)?;

            let json = serde_json::to_string_pretty(&response)
                .map_err(|e| CbError::ConfigError(format!("failed to format response: {}", e)))?;
            println!("{}", json);
            Ok(())
        }
        _ => Err(CbError::ConfigError(
            "no subcommand given; try --help".to_string(),
        )),
    }
}

fn main() -> Result<(), CbError> {
    let res = start();
    match res {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    Ok(())
}
