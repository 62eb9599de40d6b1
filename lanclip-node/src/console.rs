//! Line commands understood by the `lanclip` binary.

use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    List,
    Help,
    Accept(IpAddr),
    Reject(IpAddr),
    Pair(IpAddr),
    Disconnect(IpAddr),
    Remove(IpAddr),
    Send(IpAddr, bool),
    Receive(IpAddr, bool),
    Push(IpAddr),
    Discovery(bool),
    Sync(bool),
    Quit,
}

pub const HELP: &str = "\
commands:
  list                       show known devices
  accept <ip> | reject <ip>  answer a pairing request
  pair <ip>                  send a pairing request
  disconnect <ip>            stop sharing until paired again
  remove <ip>                forget a device
  send <ip> on|off           push local clipboard changes to a device
  receive <ip> on|off        apply clipboard pushes from a device
  push <ip>                  send the current clipboard now
  discovery on|off           broadcast and accept new devices
  sync on|off                clipboard sharing as a whole
  quit";

/// Parses one input line. `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("list" | "ls", []) => Command::List,
        ("help" | "?", []) => Command::Help,
        ("quit" | "exit", []) => Command::Quit,
        ("accept", [ip]) => Command::Accept(address(ip)?),
        ("reject", [ip]) => Command::Reject(address(ip)?),
        ("pair", [ip]) => Command::Pair(address(ip)?),
        ("disconnect", [ip]) => Command::Disconnect(address(ip)?),
        ("remove", [ip]) => Command::Remove(address(ip)?),
        ("push", [ip]) => Command::Push(address(ip)?),
        ("send", [ip, state]) => Command::Send(address(ip)?, switch(state)?),
        ("receive", [ip, state]) => Command::Receive(address(ip)?, switch(state)?),
        ("discovery", [state]) => Command::Discovery(switch(state)?),
        ("sync", [state]) => Command::Sync(switch(state)?),
        (verb, _) => return Err(format!("unrecognized command {verb:?}; type `help`")),
    };
    Ok(Some(command))
}

fn address(raw: &str) -> Result<IpAddr, String> {
    raw.parse()
        .map_err(|_| format!("{raw:?} is not an IP address"))
}

fn switch(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" => Ok(true),
        "off" | "false" | "no" => Ok(false),
        _ => Err(format!("expected on or off, got {raw:?}")),
    }
}
