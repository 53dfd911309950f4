//! Example: Chat and a replicated roster over the in-process transport
//!
//! A server and two clients run in one process on a `LocalTransport` hub.
//! Clients send chat lines to the server, which broadcasts them back, and
//! every client observes a server-owned roster of connected client ids.
//!
//! Run with: `cargo run --example loopback_chat`

use std::sync::{Arc, Mutex};

use blitnet::app::{NetworkApplication, NetworkBehaviour, NetworkContext};
use blitnet::config::NetworkConfig;
use blitnet::protocol::connection::Connection;
use blitnet::sync::{OwnerId, SyncList, SyncMode};
use blitnet::transport::local::LocalTransport;
use blitnet::transport::{DisconnectKind, Peer};
use blitnet::utils::logging::init_logging;

const ROSTER: OwnerId = OwnerId(1);

/// Keeps the roster in step with the connected clients
struct Lobby {
    roster: Arc<SyncList<u32>>,
}

fn client_id(connection: &Connection) -> Option<u32> {
    match connection.peer() {
        Peer::Client(id) => Some(id.0),
        Peer::Server => None,
    }
}

impl NetworkBehaviour for Lobby {
    fn on_server_connect(&mut self, ctx: &NetworkContext, connection: &Arc<Connection>) {
        if let Err(e) = ctx.registry().add_observer(ROSTER, connection.clone()) {
            eprintln!("[server] observer failed: {e}");
        }
        if let Some(id) = client_id(connection) {
            if let Err(e) = self.roster.push(id) {
                eprintln!("[server] roster update failed: {e}");
            }
        }
    }

    fn on_disconnect(&mut self, _ctx: &NetworkContext, connection: &Arc<Connection>, kind: DisconnectKind) {
        println!("[server] {} left ({kind:?})", connection.peer());
        if let Some(id) = client_id(connection) {
            if let Err(e) = self.roster.remove(&id) {
                eprintln!("[server] roster update failed: {e}");
            }
        }
    }
}

fn pump(server: &mut NetworkApplication, clients: &mut [NetworkApplication]) {
    for _ in 0..3 {
        server.tick();
        for client in clients.iter_mut() {
            client.tick();
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = NetworkConfig::default();
    init_logging(&config.logging)?;

    let hub = Arc::new(LocalTransport::new());
    let mut server = NetworkApplication::with_config(hub.clone(), &config);
    server.start_server()?;

    let roster = Arc::new(SyncList::<u32>::new(
        server.registry(),
        ROSTER,
        SyncMode::ServerOwner,
    )?);
    server.add_behaviour(Lobby { roster });

    // Lines are collected during the tick and broadcast afterwards
    let said: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    if let Some(dispatcher) = server.server() {
        let said = said.clone();
        dispatcher.register("Say", move |connection, payload| {
            let line = format!("{}: {}", connection.peer(), String::from_utf8_lossy(&payload));
            said.lock()
                .map_err(|_| blitnet::ProtocolError::Custom("chat log poisoned".to_string()))?
                .push(line);
            Ok(())
        })?;
    }

    let names = ["alice", "bob"];
    let mut clients = Vec::new();
    let mut mirrors = Vec::new();
    for name in names {
        let mut client = NetworkApplication::with_config(Arc::new(hub.endpoint()), &config);
        client.start_client()?;
        if let Some(dispatcher) = client.client() {
            dispatcher.register("Chat", move |_, payload| {
                println!("[{name}] {}", String::from_utf8_lossy(&payload));
                Ok(())
            })?;
        }
        mirrors.push(SyncList::<u32>::new(client.registry(), ROSTER, SyncMode::ServerOwner)?);
        client.connect("local")?;
        clients.push(client);
    }
    pump(&mut server, &mut clients);

    for (name, client) in names.iter().zip(&clients) {
        if let Some(dispatcher) = client.client() {
            dispatcher.send_to_server("Say", format!("hi, I am {name}").as_bytes())?;
        }
    }
    pump(&mut server, &mut clients);

    let lines: Vec<String> = said.lock().map(|mut lines| lines.drain(..).collect()).unwrap_or_default();
    for line in lines {
        server.send_to_clients("Chat", line.as_bytes())?;
    }
    pump(&mut server, &mut clients);

    for (name, mirror) in names.iter().zip(&mirrors) {
        println!("[{name}] roster: {:?}", mirror.to_vec());
    }

    clients[1].disconnect();
    pump(&mut server, &mut clients);
    println!("[alice] roster after bob left: {:?}", mirrors[0].to_vec());

    server.shutdown();
    Ok(())
}
