mod command;

use std::sync::Arc;

use bthid_bus::loopback::LoopbackTransport;
use bthid_bus::{Bus, DispatchOutcome, IoCompletion, IoRequest};
use bthid_common::config::{self, BusSettings};
use bthid_common::events::ChannelKind;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::command::{Command, HELP};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("RUST_LOG")
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();
    let cancel_token = CancellationToken::new();
    tokio::spawn({
        let cancel_token = cancel_token.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
                return;
            }
            cancel_token.cancel();
        }
    });

    let settings = match tokio::task::spawn_blocking(config::bus_settings).await? {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load bus settings: {}", e);
            BusSettings::default()
        }
    };

    let (indication_sender, indication_receiver) = mpsc::channel(32);
    let transport = Arc::new(LoopbackTransport::new(indication_sender));
    let (bus, parent_queue) = Bus::new(settings, transport.clone());
    tokio::spawn(log_events(bus.subscribe()));

    let bus_handle = tokio::spawn(bthid_bus::run_bus(
        bus.clone(),
        indication_receiver,
        parent_queue,
        cancel_token.clone(),
    ));

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel_token.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(Command::Quit) => break,
            Ok(command) => {
                if let Err(e) = execute(&bus, &transport, command).await {
                    println!("error: {e:#}");
                }
            }
            Err(e) => println!("error: {e:#}"),
        }
    }

    cancel_token.cancel();
    bus_handle.await?;
    tracing::info!("Hub exited");
    Ok(())
}

async fn execute(
    bus: &Arc<Bus>,
    transport: &Arc<LoopbackTransport>,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Connect {
            address,
            device_type,
            name,
        } => transport.remote_connect(address, device_type, &name).await?,
        Command::Disconnect(address) => transport.remote_disconnect(address).await?,
        Command::Unplug(address) => bus.unplug(address).await?,
        Command::Idle(address) => {
            let device = bus.child(address)?;
            bus.notify_idle(&device).await?;
        }
        Command::Write(address, channel, data) => {
            let outcome = bus.dispatch_to(address, IoRequest::write(channel, data))?;
            report(address, channel, outcome);
        }
        Command::Read(address, channel, len) => {
            let outcome = bus.dispatch_to(address, IoRequest::read(channel, len))?;
            report(address, channel, outcome);
        }
        Command::Inject(address, channel, data) => transport.push_inbound(address, channel, data),
        Command::List => {
            let children = bus.children();
            if children.is_empty() {
                println!("no children");
            }
            for device in children {
                let props = device.properties();
                let record = device.record();
                println!(
                    "{:>3} {} {} {:04x}:{:04x} {:?} control={:?} interrupt={:?}",
                    props.serial,
                    device.address(),
                    props.device_id,
                    props.vendor_id,
                    props.product_id,
                    props.remote_name,
                    record.channel(ChannelKind::Control).state(),
                    record.channel(ChannelKind::Interrupt).state(),
                );
            }
        }
        Command::Quit => {}
    }
    Ok(())
}

/// Print the completion without holding up the prompt; reads wait for data.
fn report(address: bthid_common::RemoteAddress, channel: ChannelKind, outcome: DispatchOutcome) {
    tokio::spawn(async move {
        let IoCompletion {
            status,
            information,
            output,
        } = outcome.wait().await;
        if output.is_empty() {
            println!("{address} {channel}: {status} ({information} bytes)");
        } else {
            println!("{address} {channel}: {status} {}", hex::encode(&output));
        }
    });
}

async fn log_events(mut events: broadcast::Receiver<bthid_common::events::BusEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => tracing::info!("{:?}", event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event log lagged by {} events", n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
