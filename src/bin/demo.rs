//! camoflow loopback demo
//!
//! Runs a complete client <-> server exchange over the in-memory link:
//! fake handshake, small and fragmented payloads, echo replies. Useful
//! for watching the engine work without touching a real device.
//!
//! Usage: camoflow-demo [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Client-style config file (address fields are
//!                            ignored in the loopback run)
//!   -p, --passphrase <TEXT>  Encrypt the tunnel with a derived key
//!   -h, --help               Print help information

use std::env;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use camoflow::capture::mem::{MemProvider, MemSegment};
use camoflow::capture::{Device, RawConnProvider};
use camoflow::config::ClientConfigFile;
use camoflow::crypto::{Crypt, Key};
use camoflow::tunnel::{AcceptOutcome, Connection, Listener, MAX_MTU};
use camoflow::wire::MacAddr;

const CLIENT_PORT: u16 = 19999;
const SERVER_PORT: u16 = 20000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let mut crypt = Crypt::plain();
    let mut mtu = MAX_MTU;

    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            "-p" | "--passphrase" => {
                let phrase = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("--passphrase requires a value"))?;
                crypt = Crypt::chacha20_poly1305(&Key::from_passphrase(phrase));
                i += 2;
            }
            "-c" | "--config" => {
                let path = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("--config requires a file path"))?;
                let config: ClientConfigFile =
                    serde_json::from_str(&std::fs::read_to_string(path)?)?;
                config.validate().map_err(|e| anyhow::anyhow!(e))?;
                crypt = config.crypt().map_err(|e| anyhow::anyhow!(e))?;
                mtu = config.mtu;
                i += 2;
            }
            other => {
                eprintln!("Unknown option: {}", other);
                print_usage();
                return Ok(());
            }
        }
    }

    let client_dev = Device::new(
        "loop0",
        MacAddr([2, 0, 0, 0, 0, 1]),
        Ipv4Addr::new(10, 99, 0, 1),
    );
    let server_dev = Device::new(
        "loop1",
        MacAddr([2, 0, 0, 0, 0, 2]),
        Ipv4Addr::new(10, 99, 0, 2),
    );
    let server_addr = SocketAddrV4::new(server_dev.ip_addr(), SERVER_PORT);

    let segment = MemSegment::new();
    let provider: Arc<dyn RawConnProvider> = Arc::new(MemProvider::new(Arc::clone(&segment)));

    // Echo server: accept clients off the SYN capture, bounce payloads
    let listener = Listener::bind(
        Arc::clone(&provider),
        &server_dev,
        &client_dev,
        SERVER_PORT,
        crypt.clone(),
        mtu,
    )?;
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(AcceptOutcome::Accepted(conn)) => {
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 65536];
                        loop {
                            match conn.recv_from(&mut buf).await {
                                Ok((0, _)) => continue,
                                Ok((n, addr)) => {
                                    if let Err(err) = conn.send_to(&buf[..n], addr).await {
                                        tracing::error!("echo: {}", err);
                                        break;
                                    }
                                }
                                Err(err) => {
                                    tracing::debug!("client gone: {}", err);
                                    break;
                                }
                            }
                        }
                    });
                }
                Ok(AcceptOutcome::Duplicate(src)) => {
                    tracing::debug!("duplicate SYN from {}", src);
                }
                Err(err) => {
                    tracing::error!("accept: {}", err);
                    break;
                }
            }
        }
    });

    let conn = Connection::dial(
        provider.as_ref(),
        &client_dev,
        &server_dev,
        CLIENT_PORT,
        server_addr,
        crypt,
        mtu,
        None,
    )
    .await?;

    // A small payload plus one large enough to fragment
    let big: Vec<u8> = (0..=255u8).cycle().take(4 * 1024).collect();
    let payloads: Vec<&[u8]> = vec![
        &b"hello over the fake flow"[..],
        &b"second message"[..],
        &big[..],
    ];

    let mut buf = vec![0u8; 65536];
    for payload in payloads {
        conn.send(payload).await?;

        // Zero-length reads are handshake traffic; loop past them
        loop {
            let (n, addr) = conn.recv_from(&mut buf).await?;
            if n == 0 {
                continue;
            }
            anyhow::ensure!(&buf[..n] == payload, "echo mismatch from {}", addr);
            tracing::info!("echoed {} bytes from {}", n, addr);
            break;
        }
    }

    conn.close()?;
    tracing::info!("demo complete");
    Ok(())
}

fn print_usage() {
    println!(
        r#"camoflow loopback demo

USAGE:
    camoflow-demo [OPTIONS]

OPTIONS:
    -c, --config <FILE>      Client-style config file (address fields are
                             ignored in the loopback run)
    -p, --passphrase <TEXT>  Encrypt the tunnel with a derived key
    -h, --help               Print help information
"#
    );
}
