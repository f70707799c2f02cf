//! Interactive command shell over stdin.
//!
//! Commands:
//!
//! ```text
//! put <key> <value>    store a value on the network
//! get <key>            retrieve a value
//! ping <addr>          ping a peer by address
//! peers                list routing-table contacts
//! id                   print the local identifier and address
//! quit | exit          shut down
//! ```

use tokio::io::{AsyncBufReadExt, BufReader};

use lodestone_dht::node::Node;

/// Run the shell until EOF or an explicit quit.
pub async fn run(node: &Node) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    println!("lodestone shell ready; `put`, `get`, `ping`, `peers`, `id`, `quit`");

    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("put") => match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => {
                    match node.put(key.as_bytes(), value.as_bytes()).await {
                        Ok(count) => println!("stored on {count} node(s)"),
                        Err(e) => println!("put failed: {e}"),
                    }
                }
                _ => println!("usage: put <key> <value>"),
            },
            Some("get") => match parts.next() {
                Some(key) => match node.get(key.as_bytes()).await {
                    Ok(Some(value)) => {
                        println!("{}", String::from_utf8_lossy(&value));
                    }
                    Ok(None) => println!("not found"),
                    Err(e) => println!("get failed: {e}"),
                },
                None => println!("usage: get <key>"),
            },
            Some("ping") => match parts.next().and_then(|s| s.parse::<std::net::SocketAddr>().ok()) {
                Some(addr) => match node.ping(addr, None).await {
                    Ok(id) => println!("pong from {id}"),
                    Err(e) => println!("ping failed: {e}"),
                },
                None => println!("usage: ping <ip:port>"),
            },
            Some("peers") => {
                let peers = node.known_peers();
                println!("{} peer(s)", peers.len());
                for peer in peers {
                    println!("  {} @ {}", peer.id, peer.addr);
                }
            }
            Some("id") => {
                println!("{} @ {}", node.local_id(), node.local_addr());
            }
            Some("quit") | Some("exit") => break,
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }

    Ok(())
}
