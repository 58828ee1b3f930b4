// Copyright (c) Facebook, Inc. and its affiliates.
//
// This source code is licensed under the MIT license found in the
// LICENSE file in the root directory of this source tree.

use plasma_client::{ConnectOptions, ObjectId, PlasmaClient};
use std::io::prelude::*;
use std::time::Instant;
use structopt::StructOpt;

// COMMAND LINE ARGUMENTS
// ================================================================================================

#[derive(StructOpt, Debug)]
#[structopt(
    name = "plasma client cli",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = "A simple CLI client for poking at a running Plasma store"
)]
pub struct ClientOptions {
    /// Path to the Plasma store's Unix domain socket
    #[structopt(short, long)]
    store: String,

    /// Path to the Plasma manager's Unix domain socket, if running one
    #[structopt(short, long)]
    manager: Option<String>,
}

// PROGRAM ENTRY POINT
// ================================================================================================

pub fn main() -> plasma_client::Result<()> {
    tracing_subscriber::fmt::init();
    let options = ClientOptions::from_args();

    let mut connect_options = ConnectOptions::new(options.store.clone());
    if let Some(manager) = &options.manager {
        connect_options = connect_options.with_manager(manager.clone());
    }
    let client = PlasmaClient::connect(connect_options)?;
    println!("connected to {}", options.store);

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.unwrap();
        if line.trim().is_empty() {
            continue;
        }
        let now = Instant::now();
        match dispatch(&client, &line) {
            Ok(msg) => println!("> {} ({} ms)", msg, now.elapsed().as_millis()),
            Err(err) => println!("> error: {}", err),
        }
    }

    client.disconnect()
}

// DISPATCH
// ================================================================================================

fn dispatch(client: &PlasmaClient, line: &str) -> Result<String, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (cmd, args) = tokens.split_first().ok_or("empty command")?;

    match cmd.to_lowercase().as_str() {
        "create" => {
            let id = parse_id(args.first().ok_or("usage: create <id> <size>")?)?;
            let size: usize = args
                .get(1)
                .ok_or("usage: create <id> <size>")?
                .parse()
                .map_err(|e| format!("invalid size: {}", e))?;
            let buffer = client
                .create(id, size, &[], 0)
                .map_err(|e| e.to_string())?;
            buffer.seal().map_err(|e| e.to_string())?;
            Ok(format!("created and sealed {}", id))
        }
        "get" => {
            let id = parse_id(args.first().ok_or("usage: get <id> [timeout_ms]")?)?;
            let timeout_ms: i64 = args.get(1).map(|s| s.parse()).transpose().map_err(|e| format!("{}", e))?.unwrap_or(-1);
            let mut results = client.get(&[id], timeout_ms).map_err(|e| e.to_string())?;
            match results.pop().flatten() {
                Some(buf) => Ok(format!("{} bytes", buf.size())),
                None => Ok("not found within timeout".into()),
            }
        }
        "delete" => {
            let id = parse_id(args.first().ok_or("usage: delete <id>")?)?;
            client.delete(&id).map_err(|e| e.to_string())?;
            Ok(format!("deleted {}", id))
        }
        "contains" => {
            let id = parse_id(args.first().ok_or("usage: contains <id>")?)?;
            let present = client.contains(&id).map_err(|e| e.to_string())?;
            Ok(format!("{}", present))
        }
        "evict" => {
            let num_bytes: u64 = args
                .first()
                .ok_or("usage: evict <num_bytes>")?
                .parse()
                .map_err(|e| format!("invalid size: {}", e))?;
            let freed = client.evict(num_bytes).map_err(|e| e.to_string())?;
            Ok(format!("freed {} bytes", freed))
        }
        "capacity" => Ok(format!("{} bytes", client.store_capacity())),
        _ => Err(format!(
            "unrecognized command '{}'; supported: create, get, delete, contains, evict, capacity",
            cmd
        )),
    }
}

fn parse_id(token: &str) -> Result<ObjectId, String> {
    ObjectId::from_hex(token).map_err(|err| format!("object ID '{}' is invalid: {}", token, err))
}
