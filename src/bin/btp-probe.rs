// Check a BTP endpoint: wait for the IUT, list its services and register some.
use std::process::ExitCode;
use std::sync::Arc;

use log::*;
use trouble_autopts::btp::protocol::core::{parse_supported_services, CoreCommand};
use trouble_autopts::btp::{BtpClient, Endpoint, Error, EventSink, ServiceId};
use trouble_autopts::config::ClientConfig;
use trouble_autopts::stack::Stack;

async fn probe(endpoint: Endpoint, services: Vec<ServiceId>) -> Result<(), Error> {
    let config = ClientConfig::default();
    let stack = Arc::new(Stack::new());
    let sink: Arc<dyn EventSink> = stack.clone();
    let client = BtpClient::connect(&endpoint, sink, config.clone()).await?;
    info!("Connected to {}", endpoint);

    stack.wait_iut_ready(config.iut_ready_timeout).await?;
    info!("IUT ready");

    let rsp = client.send(&CoreCommand::ReadSupportedServices).await?;
    let supported = parse_supported_services(&rsp);
    for service in &supported {
        info!("Supported: {}", service);
    }

    for service in services {
        if !supported.contains(&service) {
            warn!("{} is not advertised as supported", service);
        }
        stack.register_service(&client, service).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_nanos()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(endpoint) = args.first() else {
        println!("Usage: btp-probe ENDPOINT [SERVICE...]");
        println!("ENDPOINT is tcp:HOST:PORT, unix[:PATH] or serial:PATH[@BAUD]");
        return ExitCode::FAILURE;
    };
    let endpoint: Endpoint = match endpoint.parse() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut services = Vec::new();
    for name in &args[1..] {
        match ServiceId::from_name(name) {
            Some(service) => services.push(service),
            None => {
                error!("Unknown service {}", name);
                return ExitCode::FAILURE;
            }
        }
    }

    match probe(endpoint, services).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Probe failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
