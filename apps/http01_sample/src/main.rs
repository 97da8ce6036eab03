#[macro_use]
extern crate log;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use http01_acme::*;
use http01_challenger::*;
use tokio::sync::mpsc;

fn build_command() -> Command {
    Command::new("HTTP01 Sample")
        .about("Serve HTTP-01 challenges and order a certificate for the given domains")
        .arg(
            Arg::new("domain")
                .long("domain")
                .short('d')
                .help("domain to put in the certificate, repeat for more names")
                .action(ArgAction::Append)
                .required(true),
        )
        .arg(
            Arg::new("endpoint")
                .long("endpoint")
                .help("acme endpoint: production, staging or a directory url")
                .required(false),
        )
        .arg(
            Arg::new("email")
                .long("email")
                .help("contact email of the acme account")
                .required(false),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .help("port serving the challenges")
                .value_parser(clap::value_parser!(u16))
                .default_value("8080"),
        )
        .arg(
            Arg::new("probe_path")
                .long("probe_path")
                .help("health probe path of the challenge server")
                .default_value("/healthz"),
        )
        .arg(
            Arg::new("output_dir")
                .long("output_dir")
                .short('o')
                .help("where tls.crt and tls.key are written")
                .default_value("."),
        )
        .arg(
            Arg::new("wait_secs")
                .long("wait_secs")
                .help("how long to wait for the certificate")
                .value_parser(clap::value_parser!(u64))
                .default_value("60"),
        )
        .arg(
            Arg::new("config_file")
                .long("config_file")
                .help("order manager config file with json format content")
                .required(false),
        )
}

async fn load_config(matches: &ArgMatches) -> Result<OrderManagerConfig> {
    let mut config = match matches.get_one::<String>("config_file") {
        Some(path) => {
            info!("load order manager config from {}", path);
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| anyhow!("read config file {} failed, {}", path, e))?;
            serde_json::from_str::<OrderManagerConfig>(&content)
                .map_err(|e| anyhow!("parse config file {} failed, {}", path, e))?
        }
        None => OrderManagerConfig::default(),
    };

    if let Some(endpoint) = matches.get_one::<String>("endpoint") {
        config.endpoint = AcmeEndpoint::parse(endpoint);
    }
    if let Some(email) = matches.get_one::<String>("email") {
        config.account_email = Some(email.clone());
    }
    Ok(config)
}

async fn save_bundle(bundle: &CertBundle, output_dir: &Path) -> Result<()> {
    let secret = make_secret_data(bundle)?;
    tokio::fs::create_dir_all(output_dir).await?;
    for (name, data) in secret.iter() {
        let path = output_dir.join(name);
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| anyhow!("write {} failed, {}", path.display(), e))?;
        info!("saved {}", path.display());
    }
    Ok(())
}

async fn sample_main(matches: ArgMatches) -> Result<()> {
    let domains: Vec<String> = matches
        .get_many::<String>("domain")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let port = *matches.get_one::<u16>("port").unwrap_or(&8080);
    let wait = Duration::from_secs(*matches.get_one::<u64>("wait_secs").unwrap_or(&60));
    let output_dir = PathBuf::from(matches.get_one::<String>("output_dir").map(|s| s.as_str()).unwrap_or("."));
    let probe_path = matches
        .get_one::<String>("probe_path")
        .cloned()
        .unwrap_or_else(|| "/healthz".to_string());
    let config = load_config(&matches).await?;

    let directory = Arc::new(ChallengeDirectory::new());
    let server = Arc::new(ChallengeServer::with_config(
        directory.clone(),
        ChallengeServerConfig { probe_path },
    ));
    let runner = ChallengeRunner::new(port, server);
    let listener = runner.bind().await?;
    tokio::spawn(async move {
        if let Err(e) = runner.serve(listener).await {
            error!("challenge server stopped, {}", e);
        }
    });

    info!("use acme directory {}", config.endpoint);
    let client = AcmeClient::from_config(&config).await?;
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
    let manager = OrderManager::with_ready_notifier(config, Arc::new(client), directory.clone(), ready_tx);

    let outcome = manager.order(&domains, None).await?;
    let bundle = match outcome.bundle {
        Some(bundle) => bundle,
        None => {
            for url in outcome.challenge_urls.iter() {
                info!("serving challenge {}", url);
            }

            let ready = tokio::time::timeout(wait, ready_rx.recv())
                .await
                .map_err(|_| anyhow!("certificate not ready after {:?}", wait))?;
            if ready.is_none() {
                return Err(anyhow!("order manager stopped before the certificate was ready"));
            }
            info!("certificate should be ready!");

            manager
                .order(&domains, None)
                .await?
                .bundle
                .ok_or_else(|| anyhow!("certificate missing after ready signal"))?
        }
    };

    info!("got certificate for {:?}, not after {}", bundle.dns_names(), bundle.not_after());
    save_bundle(&bundle, &output_dir).await?;
    manager.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = build_command().get_matches();
    if let Err(e) = sample_main(matches).await {
        error!("http01 sample failed, {}", e);
        std::process::exit(1);
    }
}
