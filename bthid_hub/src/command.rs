use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use bthid_common::events::ChannelKind;
use bthid_common::{DeviceType, RemoteAddress};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect {
        address: RemoteAddress,
        device_type: DeviceType,
        name: String,
    },
    Disconnect(RemoteAddress),
    Unplug(RemoteAddress),
    Idle(RemoteAddress),
    Write(RemoteAddress, ChannelKind, Vec<u8>),
    Read(RemoteAddress, ChannelKind, usize),
    Inject(RemoteAddress, ChannelKind, Vec<u8>),
    List,
    Quit,
}

pub const HELP: &str = "\
connect <addr> [type] [name...]
disconnect <addr>
unplug <addr>
idle <addr>
write <addr> control|interrupt <hex>
read <addr> control|interrupt <len>
inject <addr> control|interrupt <hex>
list
quit";

fn channel(word: Option<&str>) -> anyhow::Result<ChannelKind> {
    match word {
        Some("control") | Some("c") => Ok(ChannelKind::Control),
        Some("interrupt") | Some("i") => Ok(ChannelKind::Interrupt),
        Some(other) => bail!("unknown channel {other:?}"),
        None => bail!("missing channel"),
    }
}

fn address(word: Option<&str>) -> anyhow::Result<RemoteAddress> {
    let word = word.ok_or_else(|| anyhow!("missing address"))?;
    word.parse()
        .with_context(|| format!("bad address {word:?}"))
}

fn payload(word: Option<&str>) -> anyhow::Result<Vec<u8>> {
    let word = word.ok_or_else(|| anyhow!("missing payload"))?;
    hex::decode(word).with_context(|| format!("bad hex payload {word:?}"))
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| anyhow!("empty command"))?;
        let command = match verb {
            "connect" => {
                let address = address(words.next())?;
                let rest: Vec<&str> = words.by_ref().collect();
                let (device_type, name) = match rest.split_first() {
                    Some((first, name)) if DeviceType::from_tag(first).is_some() => {
                        (DeviceType::from_tag(first), name.join(" "))
                    }
                    _ => {
                        let name = rest.join(" ");
                        (DeviceType::from_remote_name(&name), name)
                    }
                };
                let device_type =
                    device_type.ok_or_else(|| anyhow!("cannot tell the device type of {name:?}"))?;
                Command::Connect {
                    address,
                    device_type,
                    name,
                }
            }
            "disconnect" => Command::Disconnect(address(words.next())?),
            "unplug" => Command::Unplug(address(words.next())?),
            "idle" => Command::Idle(address(words.next())?),
            "write" => Command::Write(
                address(words.next())?,
                channel(words.next())?,
                payload(words.next())?,
            ),
            "read" => {
                let address = address(words.next())?;
                let channel = channel(words.next())?;
                let len = words
                    .next()
                    .ok_or_else(|| anyhow!("missing length"))?
                    .parse()
                    .context("bad length")?;
                Command::Read(address, channel, len)
            }
            "inject" => Command::Inject(
                address(words.next())?,
                channel(words.next())?,
                payload(words.next())?,
            ),
            "list" => Command::List,
            "quit" | "exit" => Command::Quit,
            other => bail!("unknown command {other:?}"),
        };
        if let Some(extra) = words.next() {
            bail!("unexpected argument {extra:?}");
        }
        Ok(command)
    }
}
