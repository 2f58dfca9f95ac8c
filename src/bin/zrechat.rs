//! Terminal group chat over the LAN.
//!
//! Starts a node, joins a group (first CLI argument, default `chat`), and
//! relays: lines typed on stdin are shouted to the group, events from the
//! cluster are printed. Ctrl-D leaves cleanly, farewell beacon included.

use anyhow::Result;
use log::LevelFilter;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use tokio::io::{AsyncBufReadExt, BufReader};
use zre_node::{Event, Node, NodeConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::load()?;

    let level = if config.verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    let log_config = ConfigBuilder::new().build();
    TermLogger::init(level, log_config, TerminalMode::Mixed, ColorChoice::Auto).ok();

    let group = std::env::args().nth(1).unwrap_or_else(|| "chat".to_string());

    let (node, mut events) = Node::spawn(config);
    let endpoint = node.start().await?;
    let name = node.name().await?;
    println!("# {} listening at {}, group {:?}", name, endpoint, group);

    node.join(&group).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    Event::Enter { name, endpoint, .. } => {
                        println!("# {} entered ({})", name, endpoint);
                    }
                    Event::Exit { name, .. } => {
                        println!("# {} left", name);
                    }
                    Event::Evasive { name, .. } => {
                        println!("# {} is not answering", name);
                    }
                    Event::Join { name, group, .. } => {
                        println!("# {} joined {:?}", name, group);
                    }
                    Event::Leave { name, group, .. } => {
                        println!("# {} left {:?}", name, group);
                    }
                    Event::Shout { name, payload, .. } | Event::Whisper { name, payload, .. } => {
                        for frame in payload {
                            println!("{}: {}", name, String::from_utf8_lossy(&frame));
                        }
                    }
                    Event::Stop => break,
                }
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) if !line.is_empty() => {
                        node.shout(&group, vec![line.into_bytes()]).await?;
                    }
                    Some(_) => {}
                    // Ctrl-D: announce departure and shut down.
                    None => {
                        node.stop().await?;
                        node.terminate().await?;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
